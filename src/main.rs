//! Source Bridge - module host binary
//!
//! Loads configuration, initializes logging, brings the bridge up on the
//! native runtime and keeps it running until Ctrl+C or SIGTERM.

use source_bridge::bridge::{BridgeHost, BridgeManager, NativeRuntime};
use source_bridge::core;

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration (handles CLI args, env vars, and config file)
    let config = match core::config::Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            // Print error to stderr since logging isn't initialized yet
            eprintln!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    // Initialize logging system based on configuration
    let _logger = match core::Logger::init(&config.logging) {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return Err(e);
        }
    };

    info!("Starting Source Bridge v{}", env!("CARGO_PKG_VERSION"));
    info!(
        working_dir = ?config.bridge.working_dir,
        temp_dir = ?config.bridge.temp_dir,
        module_format = %config.bridge.module_format,
        "Bridge configuration"
    );
    info!(
        initial = config.repositories.initial.len(),
        request_timeout = config.repositories.request_timeout,
        "Repository configuration"
    );

    let manager = Arc::new(BridgeManager::from_config(&config, Arc::new(NativeRuntime::new()))?);
    let host = BridgeHost::new(manager, config.bridge.idle_interval());

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    host.run(token).await?;
    info!("Source Bridge stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }

    info!("Initiating graceful shutdown...");
}
