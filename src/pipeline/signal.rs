//! Signal handling for graceful shutdown.

use std::io;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wait for a shutdown signal (SIGINT, SIGTERM, or SIGQUIT on Unix).
#[cfg(unix)]
pub async fn shutdown_signal() -> io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = sigint.recv() => {
            info!(message = "Signal received.", signal = "SIGINT");
        }
        _ = sigterm.recv() => {
            info!(message = "Signal received.", signal = "SIGTERM");
        }
        _ = sigquit.recv() => {
            info!(message = "Signal received.", signal = "SIGQUIT");
        }
    }
    Ok(())
}

/// Wait for Ctrl-C.
#[cfg(not(unix))]
pub async fn shutdown_signal() -> io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!(message = "Signal received.", signal = "ctrl-c");
    Ok(())
}

/// Cancel `token` when a shutdown signal arrives.
pub async fn cancel_on_signal(token: CancellationToken) {
    match shutdown_signal().await {
        Ok(()) => token.cancel(),
        Err(e) => warn!("Failed to install signal handlers, shutdown by signal is disabled: {}", e),
    }
}
