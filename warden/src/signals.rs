//! Turning shutdown signals into cancellation

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Cancels `cancel` when the process is asked to shut down
///
/// On unix that is `SIGTERM` or `SIGINT`; elsewhere, ctrl-c. The task also
/// ends quietly if `cancel` fires for some other reason first.
pub fn cancel_on_shutdown(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            signal = shutdown_signal() => {
                tracing::info!(signal, "received shutdown signal");
                cancel.cancel();
            }
            _ = cancel.cancelled() => {}
        }
    })
}

#[cfg(unix)]
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|error| {
            tracing::warn!(
                error = &error as &dyn std::error::Error,
                "unable to listen for SIGTERM"
            )
        })
        .ok();
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|error| {
            tracing::warn!(
                error = &error as &dyn std::error::Error,
                "unable to listen for SIGINT"
            )
        })
        .ok();

    tokio::select! {
        _ = async {
            match sigterm.as_mut() {
                Some(s) => s.recv().await,
                None => std::future::pending().await,
            }
        } => "SIGTERM",
        _ = async {
            match sigint.as_mut() {
                Some(s) => s.recv().await,
                None => std::future::pending().await,
            }
        } => "SIGINT",
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "ctrl-c",
        Err(error) => {
            tracing::warn!(
                error = &error as &dyn std::error::Error,
                "unable to listen for ctrl-c"
            );
            std::future::pending().await
        }
    }
}
