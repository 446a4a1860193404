use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{ConnectInfo, DefaultBodyLimit, State},
    http::{header::HOST, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use std::{net::SocketAddr, sync::Arc};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod content;
mod fetch;
mod handler;
mod metrics;

use config::RelayConfig;
use fetch::ReqwestFetcher;
use handler::{CarrierRequest, RelayHandler};
use metrics::{Metrics, RetryCause};

#[derive(Clone)]
pub struct AppState {
    handler: Arc<RelayHandler<ReqwestFetcher>>,
    metrics: Metrics,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gtunnel_relay=info")),
        )
        .init();

    let config = RelayConfig::from_env();
    let metrics = Metrics::new();
    let fetcher = ReqwestFetcher::new()?;
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let body_limit = config.max_request_body;

    let state = AppState {
        handler: Arc::new(RelayHandler::new(fetcher, config, metrics.clone())),
        metrics,
    };

    let app = Router::new()
        .route("/g", any(relay))
        .route("/_gh/", any(relay))
        .route("/_gh/*rest", any(relay))
        .route("/favicon.ico", get(|| async { StatusCode::OK }))
        .route("/robots.txt", get(robots))
        .route("/metrics", get(metrics_handler))
        .route("/", get(root))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state);

    info!("GTunnel Relay on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}

async fn relay(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let host = headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
        .to_string();
    // the hosting platform terminates TLS in front of us
    let tls = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("https"));

    let carrier = CarrierRequest {
        remote_addr: Some(remote),
        tls,
        host,
        body,
    };
    state.handler.handle(carrier).await
}

async fn robots() -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        "User-agent: *\nDisallow: /\n",
    )
}

async fn root(State(state): State<AppState>) -> impl IntoResponse {
    let version = &state.handler.config().version;
    Json(serde_json::json!({
        "server": format!(
            "gtunnel-relay {} ({}/{})",
            version,
            std::env::consts::OS,
            std::env::consts::ARCH
        ),
        "version": version,
        "exchanges": state.metrics.exchanges(),
        "retries": {
            "too_large": state.metrics.retries(RetryCause::TooLarge),
            "over_quota": state.metrics.retries(RetryCause::OverQuota),
            "closed": state.metrics.retries(RetryCause::Closed),
        },
        "message": "relay is up",
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.to_prometheus().await
}
