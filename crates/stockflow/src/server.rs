//! HTTP server for health, readiness, and metrics endpoints

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::metrics::encode_metrics;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub ingest_running: bool,
    pub subscriber_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_persisted_secs_ago: Option<u64>,
}

/// Shared state for health endpoints
#[derive(Clone)]
pub struct ServerState {
    pub ingest_running: Arc<AtomicBool>,
    pub subscriber_running: Arc<AtomicBool>,
    /// Unix timestamp (seconds) of last persisted record, 0 if none
    pub last_persisted_epoch_secs: Arc<AtomicU64>,
}

impl ServerState {
    pub fn new(
        ingest_running: Arc<AtomicBool>,
        subscriber_running: Arc<AtomicBool>,
        last_persisted_epoch_secs: Arc<AtomicU64>,
    ) -> Self {
        Self {
            ingest_running,
            subscriber_running,
            last_persisted_epoch_secs,
        }
    }

    fn response(&self, status: &str) -> HealthResponse {
        HealthResponse {
            status: status.to_string(),
            ingest_running: self.ingest_running.load(Ordering::SeqCst),
            subscriber_running: self.subscriber_running.load(Ordering::SeqCst),
            last_persisted_secs_ago: self.last_persisted_secs_ago(),
        }
    }

    fn last_persisted_secs_ago(&self) -> Option<u64> {
        let last = self.last_persisted_epoch_secs.load(Ordering::SeqCst);
        if last == 0 {
            return None;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Some(now.saturating_sub(last))
    }
}

/// Health endpoint - the process is up and serving
async fn health(State(state): State<ServerState>) -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(state.response("ok")))
}

/// Ready endpoint - 200 only while both loops are running
async fn ready(State(state): State<ServerState>) -> (StatusCode, Json<HealthResponse>) {
    let response = state.response("ready");
    if response.ingest_running && response.subscriber_running {
        (StatusCode::OK, Json(response))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "not_ready".to_string(),
                ..response
            }),
        )
    }
}

/// Metrics endpoint - returns Prometheus text format
async fn metrics() -> impl IntoResponse {
    match encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {}", e),
        ),
    }
}

pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve until `shutdown` is cancelled
pub async fn run_server(
    addr: SocketAddr,
    state: ServerState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = create_router(state);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
