//! Shutdown signal handling.

use tokio::signal;
use tracing::info;

/// Returns once a termination signal is received.
///
/// SIGINT and SIGTERM on Unix, Ctrl+C elsewhere.
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => info!("📡 Received SIGINT"),
            _ = sigterm.recv() => info!("📡 Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("📡 Received Ctrl+C");
    }

    Ok(())
}
