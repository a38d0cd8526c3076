//! tickhub-collector: exchange stream collection service
//!
//! Runs one supervised collector per enabled entry in the environment file
//! and writes validated records to PostgreSQL.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tickhub_collector_lib::{
    run_server, CollectorRunner, HyperliquidAssetContexts, HyperliquidCandles, Orchestrator,
    RetryPolicy, StreamAdapter,
};
use tickhub_metadata::{CollectorKind, CollectorSpec, Environment, HYPERLIQUID_WS_URL};
use tickhub_store::{create_pool, PgStore, RecordWriter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "tickhub-collector")]
#[command(about = "Exchange market data collector for tickhub")]
struct Args {
    /// Path to environment configuration file; defaults apply when omitted
    #[arg(short, long, env = "TICKHUB_CONFIG")]
    config: Option<PathBuf>,

    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Health server bind address
    #[arg(long, env = "TICKHUB_HEALTH_ADDR", default_value = "0.0.0.0:8080")]
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let env = match args.config {
        Some(ref path) => Environment::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Environment::default(),
    };
    info!(env = %env.name, collectors = env.collectors.enabled.len(), "Loaded environment configuration");

    let pool = create_pool(&args.database_url, env.store.pool_size)?;
    pool.get()
        .await
        .context("database unreachable")?
        .simple_query("SELECT 1")
        .await
        .context("database ping failed")?;
    let store = Arc::new(PgStore::new(pool, env.store.query_timeout()));
    info!("Connected to database");

    let policy = RetryPolicy {
        max_retries: env.collectors.max_retries,
        restart_delay: env.collectors.restart_delay(),
    };
    let mut orchestrator = Orchestrator::new().with_stop_timeout(env.collectors.stop_timeout());
    for spec in &env.collectors.enabled {
        let adapter = build_adapter(spec, store.clone());
        info!(collector = %spec.name, kind = ?spec.kind, exchange = %spec.exchange, "Registering collector");
        orchestrator.register(CollectorRunner::new(
            spec.name.clone(),
            adapter,
            store.clone(),
            policy,
        ));
    }

    let started = orchestrator.start_all().await;
    if started == 0 {
        warn!("No collectors started");
    }

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(run_server(
        args.listen_addr,
        orchestrator.health_view(),
        shutdown.clone(),
    ));
    info!(addr = %args.listen_addr, "Health server listening");

    shutdown_signal().await;
    info!("Received shutdown signal");

    orchestrator.stop_all().await;
    shutdown.cancel();
    match tokio::time::timeout(Duration::from_secs(5), server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!(error = %e, "Health server failed"),
        Ok(Err(e)) => error!(error = %e, "Health server task panicked"),
        Err(_) => warn!("Health server did not stop in time"),
    }

    info!("Collector service stopped");
    Ok(())
}

fn build_adapter(spec: &CollectorSpec, writer: Arc<dyn RecordWriter>) -> Box<dyn StreamAdapter> {
    let url = spec
        .ws_url
        .clone()
        .unwrap_or_else(|| HYPERLIQUID_WS_URL.to_string());
    match spec.kind {
        CollectorKind::HyperliquidCandles => Box::new(HyperliquidCandles::new(
            spec.name.clone(),
            spec.exchange.clone(),
            url,
            writer,
        )),
        CollectorKind::HyperliquidAssetCtx => Box::new(HyperliquidAssetContexts::new(
            spec.name.clone(),
            spec.exchange.clone(),
            url,
            writer,
        )),
    }
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
