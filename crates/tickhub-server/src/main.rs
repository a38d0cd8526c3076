//! tickhub-server: live market data streaming
//!
//! Listens for store change notifications and fans enriched records out to
//! WebSocket clients on `/ws`.

use anyhow::Context;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tickhub_bridge::ChangeBridge;
use tickhub_hub::{encode_metrics, ws_router, BroadcastHub, WsState};
use tickhub_metadata::Environment;
use tickhub_store::{create_pool, PgStore};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "tickhub-server")]
#[command(about = "Live market data streaming server for tickhub")]
struct Args {
    /// Path to environment configuration file; defaults apply when omitted
    #[arg(short, long, env = "TICKHUB_CONFIG")]
    config: Option<PathBuf>,

    /// PostgreSQL connection string, also used for the LISTEN connection
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    #[arg(long, env = "TICKHUB_LISTEN_ADDR", default_value = "0.0.0.0:8000")]
    listen_addr: SocketAddr,

    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[derive(Clone)]
struct ServerState {
    hub: BroadcastHub,
    bridge_listening: Arc<AtomicBool>,
}

#[derive(Debug, Serialize)]
struct ServerHealth {
    status: &'static str,
    connections: usize,
    max_connections: usize,
    topics: usize,
    bridge_listening: bool,
}

impl ServerState {
    fn health(&self) -> ServerHealth {
        let listening = self.bridge_listening.load(Ordering::SeqCst);
        ServerHealth {
            status: if listening { "healthy" } else { "degraded" },
            connections: self.hub.connection_count(),
            max_connections: self.hub.max_connections(),
            topics: self.hub.topic_count(),
            bridge_listening: listening,
        }
    }
}

async fn health(State(state): State<ServerState>) -> Json<ServerHealth> {
    Json(state.health())
}

/// 200 while the change listener is connected
async fn ready(State(state): State<ServerState>) -> (StatusCode, Json<ServerHealth>) {
    let health = state.health();
    let status = if health.bridge_listening {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

async fn metrics() -> impl IntoResponse {
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

fn create_router(state: ServerState, ws: WsState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .with_state(state)
        .merge(ws_router(ws))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let env = match args.config {
        Some(ref path) => Environment::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Environment::default(),
    };
    info!(env = %env.name, "Loaded environment configuration");

    let pool = create_pool(&args.database_url, env.store.pool_size)?;
    pool.get()
        .await
        .context("database unreachable")?
        .simple_query("SELECT 1")
        .await
        .context("database ping failed")?;
    let store = Arc::new(PgStore::new(pool, env.store.query_timeout()));

    let hub = BroadcastHub::new(env.hub.max_connections, env.hub.heartbeat_interval());
    let bridge = ChangeBridge::new(
        args.database_url.clone(),
        env.bridge.clone(),
        hub.clone(),
        store.clone(),
    );
    let state = ServerState {
        hub: hub.clone(),
        bridge_listening: bridge.listening(),
    };

    let shutdown = CancellationToken::new();
    let bridge_task = tokio::spawn(bridge.run(shutdown.clone()));

    let app = create_router(
        state,
        WsState {
            hub: hub.clone(),
            history: store,
            max_history: env.hub.max_history,
        },
    );
    let listener = TcpListener::bind(args.listen_addr).await?;
    info!(
        addr = %args.listen_addr,
        max_connections = env.hub.max_connections,
        "Streaming server listening"
    );

    let server_shutdown = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Received shutdown signal");
            server_shutdown.cancel();
        })
        .await;

    // Also reached when serve fails on its own
    shutdown.cancel();
    hub.close_all();
    if tokio::time::timeout(Duration::from_secs(10), bridge_task)
        .await
        .is_err()
    {
        warn!("Change bridge did not stop in time");
    }

    served?;
    info!("Streaming server stopped");
    Ok(())
}

/// Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tickhub_store::MemoryStore;
    use tower::ServiceExt;

    fn app(listening: bool) -> Router {
        let hub = BroadcastHub::new(100, Duration::from_secs(30));
        let state = ServerState {
            hub: hub.clone(),
            bridge_listening: Arc::new(AtomicBool::new(listening)),
        };
        create_router(
            state,
            WsState {
                hub,
                history: Arc::new(MemoryStore::new()),
                max_history: 1000,
            },
        )
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_reports_hub_and_bridge() {
        let (status, body) = get_json(app(false), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["max_connections"], 100);
        assert_eq!(body["bridge_listening"], false);
    }

    #[tokio::test]
    async fn test_ready_follows_bridge() {
        let (status, _) = get_json(app(false), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let (status, body) = get_json(app(true), "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let response = app(true)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
