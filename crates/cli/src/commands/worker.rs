//! Worker command

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use fdhandoff::{Heartbeat, Worker, WorkerConfig, config::WorkerSettings};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::cancel_on_ctrl_c;

/// Publish the rendezvous endpoint and run the heartbeat on every handed-off connection.
///
/// Bootstrap failures end the process with an error.
pub async fn cmd_worker(settings: &WorkerSettings) -> Result<()> {
  info!(
    path = ?settings.path,
    interval = ?settings.heartbeat_interval(),
    pid = std::process::id(),
    "Starting worker"
  );

  let worker = Worker::new(WorkerConfig {
    rendezvous: settings.rendezvous_config(),
    handler: Arc::new(Heartbeat::new(settings.heartbeat_interval())),
  });

  let cancel = CancellationToken::new();
  cancel_on_ctrl_c(&cancel);

  worker.run(cancel).await.context("Worker stopped")?;

  info!("Worker shutdown complete");
  Ok(())
}

/// Apply command-line overrides to the `[worker]` section.
pub fn apply_worker_overrides(settings: &mut WorkerSettings, path: Option<PathBuf>, interval: Option<Duration>) {
  if let Some(path) = path {
    settings.path = path;
  }
  if let Some(interval) = interval {
    settings.heartbeat_interval_ms = interval.as_millis() as u64;
  }
}
