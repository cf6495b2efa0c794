//! API Sentinel collector
//!
//! Receives telemetry batches from exporters, runs anomaly detection and
//! dispatches alerts to the configured channels.

use anyhow::Result;
use clap::Parser;
use sentinel_collector::{api, config::CollectorConfig, pipeline::Pipeline};
use sentinel_lib::{health::HealthRegistry, observability::StructuredLogger};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const COLLECTOR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "sentinel-collector", version, about)]
struct Args {
    /// Collector configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "SENTINEL_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let args = Args::parse();
    let config = CollectorConfig::load(args.config.as_deref())?;
    info!(
        instance = %config.instance,
        port = config.port,
        projects = %config.projects_path.display(),
        "Collector configured"
    );

    let health_registry = HealthRegistry::new();
    let logger = StructuredLogger::new(&config.instance);

    let pipeline = Pipeline::start(&config, health_registry.clone(), logger.clone()).await?;
    logger.log_startup(COLLECTOR_VERSION, pipeline.projects().len());

    let app_state = Arc::new(api::AppState::new(
        pipeline.gateway(),
        health_registry.clone(),
    ));
    let listener = api::bind(config.port).await?;
    pipeline.mark_ready().await;

    axum::serve(listener, api::create_router(app_state))
        .with_graceful_shutdown(shutdown_signal(logger.clone()))
        .await?;

    info!("Draining pipeline");
    pipeline.shutdown(config.shutdown_grace()).await;

    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on unix
async fn shutdown_signal(logger: StructuredLogger) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let reason = tokio::select! {
        _ = ctrl_c => "SIGINT received",
        _ = terminate => "SIGTERM received",
    };
    logger.log_shutdown(reason);
}
