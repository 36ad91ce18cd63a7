use std::{sync::Arc, time::Duration};

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{
        Method, StatusCode,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

#[derive(Clone)]
struct AppState {
    http_client: reqwest::Client,
    rapidapi_key: Option<String>,
    strategies: Arc<Vec<Strategy>>,
}

const STRATEGY_TIMEOUT_SECONDS: u64 = 15;

const RAPIDAPI_ENDPOINT: &str = "https://tiktok-video-no-watermark2.p.rapidapi.com/";
const RAPIDAPI_HOST: &str = "tiktok-video-no-watermark2.p.rapidapi.com";
const TIKWM_ENDPOINT: &str = "https://www.tikwm.com/api/";
const TIKMATE_ENDPOINT: &str = "https://tikmate.online/download";
const DEMO_RAPIDAPI_KEY: &str = "demo_key";

const DEFAULT_TITLE: &str = "TikTok Video";
const DEFAULT_AUTHOR: &str = "Unknown";
const EXHAUSTED_ERROR: &str = "All download methods failed. TikTok may be blocking requests.";
const EXHAUSTED_SUGGESTION: &str = "Try using a paid API service for reliable downloads.";

const DEFAULT_STRATEGIES: [Strategy; 3] = [Strategy::RapidApi, Strategy::TikWm, Strategy::TikMate];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Platform {
    TikTok,
    Instagram,
    Facebook,
}

impl Platform {
    fn label(self) -> &'static str {
        match self {
            Platform::TikTok => "TikTok",
            Platform::Instagram => "Instagram",
            Platform::Facebook => "Facebook",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Strategy {
    RapidApi,
    TikWm,
    TikMate,
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Serialize)]
struct VideoInfo {
    title: String,
    author: String,
    duration: u64,
    view_count: u64,
    like_count: u64,
    share_count: u64,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum DownloadResponse {
    Resolved {
        success: bool,
        download_url: Option<String>,
        video_info: VideoInfo,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Unavailable {
        success: bool,
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        suggestion: Option<String>,
    },
    Rejected {
        error: String,
    },
}

impl DownloadResponse {
    fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            error: message.into(),
        }
    }

    fn server_error(detail: impl std::fmt::Display) -> Self {
        Self::Rejected {
            error: format!("Server error: {detail}"),
        }
    }

    fn coming_soon(platform: Platform) -> Self {
        Self::Unavailable {
            success: false,
            error: format!("{} support coming soon!", platform.label()),
            suggestion: None,
        }
    }

    fn exhausted() -> Self {
        Self::Unavailable {
            success: false,
            error: EXHAUSTED_ERROR.to_string(),
            suggestion: Some(EXHAUSTED_SUGGESTION.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum StrategyError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("service answered with status {0}")]
    Status(StatusCode),
    #[error("service reported failure")]
    Rejected,
}

// Both JSON services speak the tikwm field vocabulary; only the envelopes
// around the video payload differ.
#[derive(Debug, Default, Deserialize)]
struct ProviderVideo {
    hdplay: Option<String>,
    play: Option<String>,
    title: Option<String>,
    author: Option<ProviderAuthor>,
    duration: Option<u64>,
    play_count: Option<u64>,
    digg_count: Option<u64>,
    share_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ProviderAuthor {
    nickname: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RapidApiEnvelope {
    #[serde(default)]
    success: bool,
    data: Option<ProviderVideo>,
}

#[derive(Debug, Deserialize)]
struct TikWmEnvelope {
    code: Option<i64>,
    data: Option<ProviderVideo>,
}

impl ProviderVideo {
    fn into_resolved(self) -> DownloadResponse {
        DownloadResponse::Resolved {
            success: true,
            download_url: self.hdplay.or(self.play),
            video_info: VideoInfo {
                title: self.title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
                author: self
                    .author
                    .and_then(|author| author.nickname)
                    .unwrap_or_else(|| DEFAULT_AUTHOR.to_string()),
                duration: self.duration.unwrap_or(0),
                view_count: self.play_count.unwrap_or(0),
                like_count: self.digg_count.unwrap_or(0),
                share_count: self.share_count.unwrap_or(0),
            },
            message: None,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "tikreel_backend=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Config::from_env();

    if config.rapidapi_key.is_none() {
        warn!(
            "RAPIDAPI_KEY not configured. Running in demo mode: the {DEMO_RAPIDAPI_KEY} placeholder is sent instead and the RapidAPI service will reject it."
        );
    }

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(STRATEGY_TIMEOUT_SECONDS))
        .build()?;

    let state = AppState {
        http_client,
        rapidapi_key: config.rapidapi_key,
        strategies: Arc::new(DEFAULT_STRATEGIES.to_vec()),
    };

    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!("Backend listening on http://{}", config.bind_addr);

    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION]);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/download", post(download).options(preflight))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let strategies = state
        .strategies
        .iter()
        .map(|strategy| strategy.name())
        .collect::<Vec<_>>();

    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "strategies": strategies,
    }))
}

async fn preflight() -> StatusCode {
    StatusCode::OK
}

// Application failures are signaled in the body, never through the HTTP
// status; existing clients inspect the JSON only.
async fn download(State(state): State<AppState>, body: Bytes) -> Json<DownloadResponse> {
    let payload: DownloadRequest = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(error) => return Json(DownloadResponse::server_error(error)),
    };

    let Some(url) = payload.url.filter(|url| !url.is_empty()) else {
        return Json(DownloadResponse::rejected("URL is required"));
    };

    let Some(platform) = detect_platform(&url) else {
        info!("no known platform fragment in {url}");
        return Json(DownloadResponse::rejected("Unsupported platform"));
    };

    info!("processing {} url {url}", platform.label());

    let outcome = match platform {
        Platform::TikTok => resolve_tiktok(&state, &url).await,
        unimplemented => DownloadResponse::coming_soon(unimplemented),
    };

    Json(outcome)
}

// Ordered substring checks, first fragment wins. Matching anywhere in the
// string (query parameters included) is the accepted contract for share links.
fn detect_platform(url: &str) -> Option<Platform> {
    if url.contains("tiktok.com") {
        Some(Platform::TikTok)
    } else if url.contains("instagram.com") {
        Some(Platform::Instagram)
    } else if url.contains("facebook.com") || url.contains("fb.watch") {
        Some(Platform::Facebook)
    } else {
        None
    }
}

async fn resolve_tiktok(state: &AppState, url: &str) -> DownloadResponse {
    let api_key = state.rapidapi_key.as_deref().unwrap_or(DEMO_RAPIDAPI_KEY);

    for strategy in state.strategies.iter().copied() {
        match strategy.attempt(&state.http_client, api_key, url).await {
            Ok(resolved) => {
                info!("{} strategy resolved {url}", strategy.name());
                return resolved;
            }
            Err(error) => warn!("{} strategy failed for {url}: {error}", strategy.name()),
        }
    }

    DownloadResponse::exhausted()
}

impl Strategy {
    fn name(self) -> &'static str {
        match self {
            Strategy::RapidApi => "rapidapi",
            Strategy::TikWm => "tikwm",
            Strategy::TikMate => "tikmate",
        }
    }

    async fn attempt(
        self,
        client: &reqwest::Client,
        rapidapi_key: &str,
        url: &str,
    ) -> Result<DownloadResponse, StrategyError> {
        match self {
            Strategy::RapidApi => attempt_rapidapi(client, rapidapi_key, url).await,
            Strategy::TikWm => attempt_tikwm(client, url).await,
            Strategy::TikMate => attempt_tikmate(client, url).await,
        }
    }
}

async fn attempt_rapidapi(
    client: &reqwest::Client,
    api_key: &str,
    url: &str,
) -> Result<DownloadResponse, StrategyError> {
    let response = client
        .post(RAPIDAPI_ENDPOINT)
        .header("X-RapidAPI-Key", api_key)
        .header("X-RapidAPI-Host", RAPIDAPI_HOST)
        .json(&serde_json::json!({ "url": url, "hd": "1" }))
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(StrategyError::Status(response.status()));
    }

    normalize_rapidapi(response.json().await?)
}

fn normalize_rapidapi(envelope: RapidApiEnvelope) -> Result<DownloadResponse, StrategyError> {
    if !envelope.success {
        return Err(StrategyError::Rejected);
    }

    Ok(envelope.data.unwrap_or_default().into_resolved())
}

async fn attempt_tikwm(
    client: &reqwest::Client,
    url: &str,
) -> Result<DownloadResponse, StrategyError> {
    let response = client
        .post(TIKWM_ENDPOINT)
        .json(&serde_json::json!({ "url": url, "hd": 1 }))
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(StrategyError::Status(response.status()));
    }

    normalize_tikwm(response.json().await?)
}

fn normalize_tikwm(envelope: TikWmEnvelope) -> Result<DownloadResponse, StrategyError> {
    if envelope.code != Some(0) {
        return Err(StrategyError::Rejected);
    }

    Ok(envelope.data.unwrap_or_default().into_resolved())
}

/// Liveness probe only: the service answering at all counts as success and the
/// input URL is echoed back as a placeholder link, flagged through the
/// `message` field. Remove the variant from `DEFAULT_STRATEGIES` to drop the
/// behavior.
async fn attempt_tikmate(
    client: &reqwest::Client,
    url: &str,
) -> Result<DownloadResponse, StrategyError> {
    let response = client
        .post(TIKMATE_ENDPOINT)
        .form(&[("url", url)])
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(StrategyError::Status(response.status()));
    }

    Ok(tikmate_placeholder(url))
}

fn tikmate_placeholder(url: &str) -> DownloadResponse {
    DownloadResponse::Resolved {
        success: true,
        download_url: Some(url.to_string()),
        video_info: VideoInfo {
            title: "TikTok Video (Processing)".to_string(),
            author: "TikTok User".to_string(),
            duration: 0,
            view_count: 0,
            like_count: 0,
            share_count: 0,
        },
        message: Some("Download processed - check the link".to_string()),
    }
}

struct Config {
    bind_addr: String,
    rapidapi_key: Option<String>,
}

impl Config {
    fn from_env() -> Self {
        let rapidapi_key = std::env::var("RAPIDAPI_KEY")
            .ok()
            .and_then(|value| non_empty(&value).map(ToString::to_string));

        Self {
            bind_addr: resolve_bind_addr(),
            rapidapi_key,
        }
    }
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    "127.0.0.1:3000".to_string()
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
