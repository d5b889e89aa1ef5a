use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Detects signals sent to the process, and returns early when something else already asked
/// the daemon to stop (for example the host closing its channel).
pub async fn detect_shutdown(cancelation: CancellationToken) {
    select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt, shutting down");
            cancelation.cancel();
        },
        _ = terminate() => {
            info!("Received terminate, shutting down");
            cancelation.cancel();
        },
        _ = cancelation.cancelled() => {},
    };
}

async fn terminate() {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(_) => std::future::pending::<()>().await,
            }
        } else {
            std::future::pending::<()>().await
        }
    }
}
