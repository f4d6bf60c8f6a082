use log::{debug, error, info};
use std::{future::Future, time::Duration};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Cancels `root` when `signal` resolves, then waits `grace` so the rest of
/// the process can wind down. Returns early without cancelling anything once
/// `exit` is cancelled.
pub async fn handle_sys_signal<S>(
    signal: S,
    exit: CancellationToken,
    root: CancellationToken,
    grace: Duration,
) where
    S: Future<Output = ()>,
{
    tokio::select! {
        _ = signal => {
            info!("data watcher got signal, exit!");
            root.cancel();
            sleep(grace).await;
        }
        _ = exit.cancelled() => {
            debug!("signal handler asked to exit");
        }
    }
}

/// Resolves on the first SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
