//! Signal handling for graceful shutdown.

use tokio::signal;

/// Wait for SIGINT or SIGTERM and name the one received.
pub(super) async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = signal::ctrl_c() => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}
