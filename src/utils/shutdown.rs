//! Termination signals for an in-flight run.

use std::future::Future;
use tokio::signal;
use tracing::warn;

/// Resolves with the signal name once SIGINT or SIGTERM arrives.
///
/// If a handler cannot be installed that signal is simply never reported.
pub async fn wait_for_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
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
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}

/// Runs `work` until it completes or `shutdown` resolves first. On shutdown `work` is
/// dropped, along with any guards and child processes it owns, and the signal name
/// is returned as the error.
pub async fn until_shutdown<F, S>(work: F, shutdown: S) -> Result<F::Output, &'static str>
where
    F: Future,
    S: Future<Output = &'static str>,
{
    tokio::select! {
        output = work => Ok(output),
        signal = shutdown => Err(signal),
    }
}
