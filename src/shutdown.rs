use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a handler that turns SIGTERM or SIGINT into job cancellation.
///
/// The returned token is handed to the supervisor, which forwards the abort
/// to every node and stops local roles within the grace period.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::error!(error = %e, "Failed to install signal handlers");
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::warn!("Received SIGTERM, aborting job");
            }
            _ = sigint.recv() => {
                tracing::warn!("Received SIGINT, aborting job");
            }
        }

        token_clone.cancel();
    });

    token
}
