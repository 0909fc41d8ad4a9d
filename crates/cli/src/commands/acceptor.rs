//! Acceptor command

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use fdhandoff::{Acceptor, config::AcceptorSettings};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::cancel_on_ctrl_c;

/// Accept public connections and hand each one to the worker.
///
/// # Arguments
/// * `settings` - `[acceptor]` section with CLI overrides already applied
pub async fn cmd_acceptor(settings: &AcceptorSettings) -> Result<()> {
  let config = settings.to_config();
  info!(
    listen = %config.listen,
    worker = ?config.worker_path,
    timeout = ?config.transfer_timeout,
    "Starting acceptor"
  );

  let cancel = CancellationToken::new();
  cancel_on_ctrl_c(&cancel);

  Acceptor::new(config)
    .run(cancel)
    .await
    .context("Acceptor stopped")?;

  info!("Acceptor shutdown complete");
  Ok(())
}

/// Apply command-line overrides to the `[acceptor]` section.
pub fn apply_acceptor_overrides(
  settings: &mut AcceptorSettings,
  listen: Option<String>,
  worker: Option<PathBuf>,
  transfer_timeout: Option<Duration>,
) {
  if let Some(listen) = listen {
    settings.listen = listen;
  }
  if let Some(worker) = worker {
    settings.worker_path = worker;
  }
  if let Some(timeout) = transfer_timeout {
    settings.transfer_timeout_ms = timeout.as_millis() as u64;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_overrides_replace_only_given_values() {
    let mut settings = AcceptorSettings::default();
    apply_acceptor_overrides(&mut settings, Some(":9090".into()), None, Some(Duration::from_millis(750)));

    assert_eq!(settings.listen, ":9090");
    assert_eq!(settings.worker_path, PathBuf::from("/tmp/worker.sock"));
    assert_eq!(settings.transfer_timeout_ms, 750);
  }
}
