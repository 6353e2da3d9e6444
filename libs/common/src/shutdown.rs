//! Graceful shutdown on Ctrl+C or SIGTERM

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Resolve once Ctrl+C (or SIGTERM on Unix) is received
///
/// ```ignore
/// tokio::select! {
///     _ = common::shutdown::wait_for_shutdown() => info!("Shutdown signal received"),
///     _ = serve() => {},
/// }
/// ```
pub async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let term_signal = match signal(SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}. Only Ctrl+C will stop the process", e);
                None
            },
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                match term_signal {
                    Some(mut sig) => {
                        sig.recv().await;
                    },
                    None => std::future::pending::<()>().await,
                }
            } => {},
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

/// Token cancelled on the first shutdown signal
///
/// Must be called inside a tokio runtime.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = wait_for_shutdown() => {
                info!("Shutdown signal received");
                trigger.cancel();
            },
            _ = trigger.cancelled() => {},
        }
    });
    token
}
