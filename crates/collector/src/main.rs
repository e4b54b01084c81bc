//! Newsloom Collector Service
//!
//! Runs the collection scheduler until Ctrl+C or SIGTERM, then drains
//! in-flight work within the shutdown timeout.

use anyhow::Context;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use newsloom_collector::{FetcherDeps, Scheduler, SchedulerSettings};
use newsloom_common::{
    config::{AppConfig, ObservabilityConfig},
    db::DbPool,
    metrics::{self, METRICS_PREFIX, SOURCE_RUN_BUCKETS},
    Repository, VERSION,
};
use std::net::SocketAddr;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Configuration first so the log level can come from it
    let config = AppConfig::load().context("failed to load configuration")?;
    init_tracing(&config.observability);

    info!("Starting Newsloom Collector v{}", VERSION);

    if config.observability.metrics_port > 0 {
        install_metrics_exporter(config.observability.metrics_port)?;
    }
    metrics::register_metrics();

    info!(path = %config.database.path, "Opening database...");
    let db = DbPool::new(&config.database).await?;
    let repo = Repository::new(db.clone());

    let deps = FetcherDeps::from_config(&config)?;
    let scheduler = Scheduler::new(repo, deps, SchedulerSettings::from_config(&config));
    scheduler.start().await?;

    match scheduler.get_schedule().await {
        Ok(entry) => info!(next_run = %entry.next_run, "Next collection scheduled"),
        Err(e) => error!(error = %e, "Failed to compute next run"),
    }

    shutdown_signal().await;

    if let Err(e) = scheduler.stop(config.shutdown_timeout()).await {
        error!(error = %e, "Scheduler did not stop cleanly");
    }
    db.close().await;

    info!("Collector shutdown complete");
    Ok(())
}

fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if config.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn install_metrics_exporter(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full(format!("{}_source_run_duration_seconds", METRICS_PREFIX)),
            SOURCE_RUN_BUCKETS,
        )?
        .install()
        .context("failed to install Prometheus exporter")?;

    info!("Metrics exporter listening on {}", addr);
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}
