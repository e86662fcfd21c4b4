use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Install a handler that cancels the returned token on SIGTERM or SIGINT.
///
/// The build driver aborts running commands and reports the build as
/// interrupted; a slave stops serving its master.
pub fn install_shutdown_handler() -> Result<CancellationToken> {
    let token = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, interrupting");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, interrupting");
            }
        }
        cancel.cancel();
    });

    Ok(token)
}
