//! OS signal handling

use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Cancels a token on SIGINT or SIGTERM
#[derive(Debug)]
pub(crate) struct SignalHandler {
    token: CancellationToken,
}

impl SignalHandler {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Wait for a shutdown signal, or for the token to be cancelled elsewhere
    pub(crate) async fn run(self) {
        tokio::select! {
            _ = self.token.cancelled() => {}
            received = wait_for_signal() => {
                if let Some(name) = received {
                    tracing::info!("Received {}", name);
                }
                self.token.cancel();
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> Option<&'static str> {
    use signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(err), _) | (_, Err(err)) => {
                tracing::error!("Failed to set up signal handlers: {}", err);
                return ctrl_c().await;
            }
        };

    tokio::select! {
        _ = sigterm.recv() => Some("SIGTERM"),
        _ = sigint.recv() => Some("SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Option<&'static str> {
    ctrl_c().await
}

async fn ctrl_c() -> Option<&'static str> {
    match signal::ctrl_c().await {
        Ok(()) => Some("Ctrl+C"),
        Err(err) => {
            tracing::error!("Failed to listen for Ctrl+C: {}", err);
            // Without a signal source, only an external cancel ends the run.
            std::future::pending().await
        }
    }
}
