//! postage-gateway CLI entry point.

mod cli;

use clap::Parser;
use cli::Cli;
use postage_gateway::gateway::{self, Gateway};
use postage_gateway::stamp::{BeeStampRepository, StampManager, StampMetrics};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let config = cli.into_config()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.server.log_level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("postage-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("Forwarding to node at {}", config.bee.api_url);

    let metrics = StampMetrics::new();
    let manager = match config.stamp.to_mode()? {
        Some(mode) => {
            let repository = Arc::new(BeeStampRepository::new(&config.bee.api_url)?);
            let manager = Arc::new(StampManager::new(repository, metrics.clone()));
            manager.start(mode).await?;
            Some(manager)
        }
        None => {
            info!("Postage stamp management disabled");
            None
        }
    };

    let router = Gateway::new(&config, manager.clone(), metrics)?.router();
    let listener =
        TcpListener::bind((config.server.hostname.as_str(), config.server.port)).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(gateway::serve(listener, router, shutdown_rx));

    wait_for_shutdown().await?;

    if let Some(manager) = &manager {
        manager.stop();
    }
    if let Err(e) = shutdown_tx.send(true) {
        warn!("Failed to send shutdown signal: {e}");
    }
    server.await??;

    info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl-C), initiating shutdown");
            result
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, initiating shutdown");
            Ok(())
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C, initiating shutdown");
    Ok(())
}
