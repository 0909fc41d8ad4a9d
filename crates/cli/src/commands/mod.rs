//! CLI command implementations

mod acceptor;
mod worker;

pub use acceptor::{apply_acceptor_overrides, cmd_acceptor};
pub use worker::{apply_worker_overrides, cmd_worker};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cancel `cancel` on ctrl-c.
fn cancel_on_ctrl_c(cancel: &CancellationToken) {
  let cancel = cancel.clone();
  tokio::spawn(async move {
    if let Err(e) = tokio::signal::ctrl_c().await {
      warn!("Failed to listen for ctrl-c: {}", e);
      return;
    }
    info!("Received ctrl-c, shutting down...");
    cancel.cancel();
  });
}
