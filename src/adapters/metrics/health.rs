//! Health Check Server - Liveness, Readiness, Status and Metrics
//!
//! Exposes /live, /ready, /status and /metrics via axum 0.7. Readiness
//! fails as soon as any supervised service has an open circuit.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

use super::prometheus::MetricsRegistry;
use crate::domain::ServiceStatus;
use crate::ports::status::StatusSource;

/// State shared with every handler.
#[derive(Clone)]
pub struct HealthState {
    /// Live service status.
    pub source: Arc<dyn StatusSource>,
    /// Gauges refreshed on each scrape.
    pub metrics: Arc<MetricsRegistry>,
}

impl HealthState {
    pub fn new(source: Arc<dyn StatusSource>, metrics: Arc<MetricsRegistry>) -> Self {
        Self { source, metrics }
    }

    /// Ready when no service is `failed`.
    pub fn is_ready(&self) -> bool {
        self.source
            .service_status()
            .values()
            .all(|s| s.status != ServiceStatus::Failed)
    }
}

/// Axum-based health and metrics HTTP server.
pub struct HealthServer {
    state: HealthState,
    bind_address: String,
}

impl HealthServer {
    pub fn new(state: HealthState, bind_address: impl Into<String>) -> Self {
        Self {
            state,
            bind_address: bind_address.into(),
        }
    }

    /// Routes served by this server.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/live", get(liveness))
            .route("/ready", get(readiness))
            .route("/status", get(status))
            .route("/metrics", get(metrics))
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown_rx` fires.
    #[instrument(skip(self, shutdown_rx), fields(address = %self.bind_address))]
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let app = self.router();
        let listener = tokio::net::TcpListener::bind(&self.bind_address).await?;

        info!(address = %self.bind_address, "Health server started");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        Ok(())
    }
}

/// Liveness probe: always returns 200 if the process is running.
async fn liveness() -> Response {
    (StatusCode::OK, "OK").into_response()
}

async fn readiness(State(state): State<HealthState>) -> Response {
    if state.is_ready() {
        (StatusCode::OK, "READY").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY").into_response()
    }
}

async fn status(State(state): State<HealthState>) -> Response {
    Json(json!({
        "ready": state.is_ready(),
        "services": state.source.service_status(),
        "stats": state.source.service_stats(),
    }))
    .into_response()
}

async fn metrics(State(state): State<HealthState>) -> Response {
    state
        .metrics
        .observe(&state.source.service_status(), &state.source.service_stats());
    match state.metrics.render() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
