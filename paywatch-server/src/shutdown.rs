//! Signal handling for graceful shutdown.

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;

/// Completes on SIGTERM or SIGINT (Ctrl+C).
///
/// If a handler cannot be installed the other signal still works; if
/// neither can, this never completes.
pub async fn wait_for_signal() {
    let sigterm = signal(SignalKind::terminate())
        .inspect_err(|e| tracing::error!(error = %e, "Failed to install SIGTERM handler"))
        .ok();
    let sigint = signal(SignalKind::interrupt())
        .inspect_err(|e| tracing::error!(error = %e, "Failed to install SIGINT handler"))
        .ok();

    let terminate = async {
        match sigterm {
            Some(mut s) => {
                s.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };
    let interrupt = async {
        match sigint {
            Some(mut s) => {
                s.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
        _ = interrupt => {
            tracing::info!("Received SIGINT, initiating graceful shutdown");
        }
    }
}

/// Wait for a signal, then tell every background worker to stop.
pub async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    wait_for_signal().await;
    shutdown_tx.send_replace(true);
}
