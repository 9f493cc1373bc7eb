//! # TaskPulse Server
//!
//! Thin wrapper binary running the progress/telemetry core as a standalone
//! server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default configuration
//! cargo run --bin taskpulse-server
//!
//! # Point at a specific store and bind address
//! TASKPULSE_STORE__URL=redis://cache:6379/0 \
//! TASKPULSE_HTTP__BIND_ADDR=0.0.0.0:8090 \
//! cargo run --bin taskpulse-server
//! ```

use tracing::{error, info};

use taskpulse_realtime::Bootstrap;
use taskpulse_shared::logging;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_tracing();

    info!("Starting TaskPulse server...");
    info!("   Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        "   Build Mode: {}",
        if cfg!(debug_assertions) {
            "Debug"
        } else {
            "Release"
        }
    );

    let handle = Bootstrap::start()
        .await
        .map_err(|e| format!("failed to bootstrap: {e}"))?;

    info!("TaskPulse started successfully");
    info!("   HTTP API: http://{}", handle.local_addr);
    info!("   WebSocket: ws://{}/ws/progress", handle.local_addr);
    info!("   Press Ctrl+C to shutdown gracefully");

    shutdown_signal().await;
    info!("Shutdown signal received, initiating graceful shutdown...");

    if let Err(e) = handle.stop().await {
        error!("Failed to stop cleanly: {e}");
    }

    info!("TaskPulse server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}
