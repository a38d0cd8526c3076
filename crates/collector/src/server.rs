use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::health::OrchestratorHealth;
use crate::metrics::encode_metrics;
use crate::orchestrator::HealthView;

/// Aggregated collector health, always 200 while the process is up
async fn health(State(view): State<HealthView>) -> Json<OrchestratorHealth> {
    Json(view.snapshot())
}

/// 200 once at least one collector is running
async fn ready(State(view): State<HealthView>) -> (StatusCode, Json<OrchestratorHealth>) {
    let snapshot = view.snapshot();
    let status = if snapshot.running_collectors > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(snapshot))
}

/// Prometheus text exposition
pub async fn metrics() -> impl IntoResponse {
    match encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub fn create_router(view: HealthView) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .with_state(view)
}

/// Serve the health routes until `shutdown` is cancelled
pub async fn run_server(
    addr: SocketAddr,
    view: HealthView,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = create_router(view);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
