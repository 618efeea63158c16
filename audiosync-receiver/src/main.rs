//! AudioSync Receiver - Main entry point
//!
//! Connects to a coordinator, announces this device and plays each stream at
//! the coordinator's sync instant.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use audiosync_common::SystemClock;
use audiosync_receiver::playback::NullSink;
use audiosync_receiver::session::SessionSettings;
use audiosync_receiver::transport::{self, TransportOptions};
use audiosync_receiver::ReceiverConfig;
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter};

/// Command-line arguments for audiosync-receiver
#[derive(Parser, Debug)]
#[command(name = "audiosync-receiver")]
#[command(about = "Synchronized audio playback receiver")]
#[command(version)]
struct Args {
    /// Path to TOML config file
    #[arg(short, long, env = "AUDIOSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Coordinator WebSocket URL (e.g. ws://host:8765/ws)
    #[arg(short, long, env = "AUDIOSYNC_SERVER_URL")]
    server_url: Option<String>,

    /// Device name announced to the coordinator
    #[arg(short, long, env = "AUDIOSYNC_DEVICE_NAME")]
    name: Option<String>,
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

    let mut config = ReceiverConfig::load(args.config.as_deref())
        .context("Failed to load receiver configuration")?;
    if let Some(url) = args.server_url {
        config.server_url = url;
    }
    if let Some(name) = args.name {
        config.device_name = name;
    }

    if !filter_from_env {
        if let Err(e) = filter_handle.reload(EnvFilter::new(&config.logging.level)) {
            warn!("Could not apply log level {}: {}", config.logging.level, e);
        }
    }

    // Build identification
    info!(
        "Starting AudioSync Receiver v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );
    info!("Device: {} ({})", config.device_name, config.platform);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let options = TransportOptions {
        server_url: config.server_url.clone(),
        sync_interval: config.sync_interval(),
    };
    let result = transport::run(
        options,
        SessionSettings::from(&config),
        Arc::new(SystemClock),
        Arc::new(NullSink::new()),
        None,
        shutdown,
    )
    .await
    .context("Receiver session failed");

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result?;

    info!("Receiver shutdown complete");
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
