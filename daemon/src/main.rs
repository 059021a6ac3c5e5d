//! SMS retry daemon
//!
//! Runs the retry engine against a local state directory:
//!
//! 1. Load configuration from the environment
//! 2. Start the Prometheus listener
//! 3. Recover pending messages from `SMS_STATE_DIR`
//! 4. Serve the HTTP API on `HTTP_ADDR`
//! 5. Call `wakeup` on every tick until Ctrl+C or SIGTERM
//! 6. Stop the HTTP API, then shut the engine down, flushing persistence
//!
//! ```bash
//! SMS_STATE_DIR=/var/lib/sms RUST_LOG=sms_retry=debug cargo run -p sms-retry-daemon
//! ```

mod api;
mod config;

use anyhow::Context;
use config::{DaemonConfig, GatewayConfig};
use sms_retry_core::SendGateway;
use sms_retry_runtime::metrics::MetricsServer;
use sms_retry_runtime::{
    EngineEnvironment, FileSystemObjectStore, HttpSendGateway, RandomSendGateway, RetryEngine,
};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sms_retry=info,sms_retry_runtime=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting SMS retry daemon");

    let config = DaemonConfig::from_env();
    info!(
        state_dir = %config.state_dir.display(),
        shards = config.engine.shards,
        workers_per_shard = config.engine.workers_per_shard,
        tick_ms = config.engine.tick_interval.as_millis(),
        gateway = ?config.gateway,
        "Configuration loaded"
    );

    let mut metrics = MetricsServer::new(config.metrics_addr);
    if let Err(err) = metrics.start() {
        warn!(error = %err, "Metrics listener not started");
    }

    let gateway: Arc<dyn SendGateway> = match &config.gateway {
        GatewayConfig::Http { url } => Arc::new(
            HttpSendGateway::new(url.clone()).context("Failed to build HTTP gateway")?,
        ),
        GatewayConfig::Random { success_rate } => Arc::new(RandomSendGateway::new(*success_rate)),
    };
    let objects = Arc::new(FileSystemObjectStore::new(&config.state_dir));

    let engine = Arc::new(
        RetryEngine::new(
            config.engine.clone(),
            EngineEnvironment::new(gateway, objects),
        )
        .context("Failed to start retry engine")?,
    );

    let report = engine
        .recover()
        .await
        .context("Failed to recover pending messages")?;
    info!(
        recovered = report.recovered,
        skipped_terminal = report.skipped_terminal,
        malformed = report.malformed,
        "State recovered"
    );

    let listener = tokio::net::TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {}", config.http_addr))?;
    let (stop_http, mut http_stopped) = watch::channel(false);
    let app = api::router(Arc::clone(&engine));
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = http_stopped.changed().await;
            })
            .await
    });
    info!(addr = %config.http_addr, "HTTP API listening");

    let mut ticks = tokio::time::interval(config.engine.tick_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut status = tokio::time::interval(config.status_interval);
    status.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => break,
            _ = ticks.tick() => {
                engine.wakeup();
            },
            _ = status.tick() => log_status(&engine),
        }
    }

    info!(timeout_secs = config.shutdown_timeout.as_secs(), "Shutting down");
    let _ = stop_http.send(true);
    match tokio::time::timeout(config.shutdown_timeout, server).await {
        Ok(Ok(Ok(()))) => info!("HTTP API stopped"),
        Ok(Ok(Err(err))) => error!(error = %err, "HTTP API failed"),
        Ok(Err(err)) => error!(error = %err, "HTTP API task failed"),
        Err(_) => warn!("HTTP API did not stop in time"),
    }

    engine
        .shutdown(config.shutdown_timeout)
        .await
        .context("Graceful shutdown did not complete")?;

    info!("Shutdown complete");
    Ok(())
}

/// Log engine health and give dead letters another chance.
fn log_status(engine: &RetryEngine) {
    let report = engine.health();
    for check in &report.checks {
        let reason = check.message.as_deref().unwrap_or("");
        if check.status.is_unhealthy() {
            error!(component = %check.component, reason, details = ?check.metadata, "Status");
        } else if check.status.is_degraded() {
            warn!(component = %check.component, reason, details = ?check.metadata, "Status");
        } else {
            info!(component = %check.component, details = ?check.metadata, "Status");
        }
    }

    if !engine.dead_letters().is_empty() {
        let replayed = engine.replay_dead_letters();
        warn!(replayed, "Replaying dead-lettered state updates");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C"),
        () = terminate => info!("Received SIGTERM"),
    }
}
