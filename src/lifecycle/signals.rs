//! OS signal handling.

use crate::lifecycle::Shutdown;

/// Wait for Ctrl-C, then fire `shutdown`.
pub async fn shutdown_on_ctrl_c(shutdown: &Shutdown) {
    let mut stopped = shutdown.subscribe();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => {
                    tracing::info!("Received Ctrl-C, shutting down");
                    shutdown.trigger();
                }
                Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl-C"),
            }
        }
        _ = stopped.recv() => {}
    }
}
