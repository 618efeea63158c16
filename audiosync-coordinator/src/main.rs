//! AudioSync Coordinator - Main entry point
//!
//! Accepts receiver WebSocket sessions and streams audio to all of them
//! against a shared sync instant.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use audiosync_common::SystemClock;
use audiosync_coordinator::source::tone_factory;
use audiosync_coordinator::{AppState, Coordinator, CoordinatorConfig};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter};

/// Command-line arguments for audiosync-coordinator
#[derive(Parser, Debug)]
#[command(name = "audiosync-coordinator")]
#[command(about = "Synchronized multi-receiver audio streaming coordinator")]
#[command(version)]
struct Args {
    /// Path to TOML config file
    #[arg(short, long, env = "AUDIOSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "AUDIOSYNC_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG wins; otherwise the configured level replaces "info" once loaded
    let env_filter = EnvFilter::try_from_default_env().ok();
    let filter_from_env = env_filter.is_some();
    let (filter, filter_handle) =
        reload::Layer::new(env_filter.unwrap_or_else(|| EnvFilter::new("info")));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = CoordinatorConfig::load(args.config.as_deref())
        .context("Failed to load coordinator configuration")?;
    if let Some(port) = args.port {
        config.port = port;
    }

    if !filter_from_env {
        if let Err(e) = filter_handle.reload(EnvFilter::new(&config.logging.level)) {
            warn!("Could not apply log level {}: {}", config.logging.level, e);
        }
    }

    info!(
        "Starting AudioSync Coordinator v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );
    info!(
        "Stream format {} Hz x {} ch, {} frames per chunk, lead time {:.1}s",
        config.sample_rate, config.channels, config.chunk_frames, config.lead_time_secs
    );

    let coordinator = Arc::new(Coordinator::new(
        &config,
        Arc::new(SystemClock),
        tone_factory(&config),
    ));

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let monitor = tokio::spawn(
        Arc::clone(&coordinator).run_health_monitor(config.monitor_interval(), shutdown.clone()),
    );

    let result = audiosync_coordinator::serve(
        config.port,
        AppState::new(Arc::clone(&coordinator), shutdown.clone()),
    )
    .await
    .context("HTTP server failed");

    shutdown.cancel();
    coordinator.stop_streaming().await;
    if let Err(e) = monitor.await {
        error!("Health monitor task failed: {}", e);
    }

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result?;

    info!("Coordinator shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
