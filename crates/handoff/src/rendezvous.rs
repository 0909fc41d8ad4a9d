//! Rendezvous bootstrap: publish the worker's endpoint atomically.
//!
//! The endpoint is bound at a private staging path and then renamed onto the
//! well-known path. A transmitter that finds a file at the well-known path is
//! therefore always looking at a bound socket, never one mid-setup.

use std::{
  io::ErrorKind,
  path::{Path, PathBuf},
};

use tokio::net::UnixDatagram;
use tracing::{debug, info, warn};

use crate::{
  error::BootstrapError,
  listener::{DescriptorListener, FileIdentity, ListenerConfig},
};

/// Where and as whom to publish the endpoint.
#[derive(Debug, Clone)]
pub struct RendezvousConfig {
  /// Well-known path transmitters dial.
  pub path: PathBuf,
  /// Distinguishes staging paths of instances starting at the same time.
  /// Defaults to the process id.
  pub instance: u32,
  pub listener: ListenerConfig,
}

impl RendezvousConfig {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      instance: std::process::id(),
      listener: ListenerConfig::default(),
    }
  }
}

/// Private path the endpoint is bound at before publication.
///
/// Lives next to the well-known path so the rename stays on one filesystem.
pub fn staging_path(path: &Path, instance: u32) -> PathBuf {
  let name = path
    .file_name()
    .map(|name| name.to_string_lossy().into_owned())
    .unwrap_or_else(|| "rendezvous".to_string());
  path.with_file_name(format!(".{name}.{instance}.tmp"))
}

/// Bind the endpoint and publish it at `config.path`.
///
/// 1. Removes leftovers at the well-known and staging paths (best effort)
/// 2. Creates the parent directory if needed
/// 3. Binds at the staging path
/// 4. Renames the staging path onto the well-known path
///
/// Any failure is fatal to the worker; nothing is left at the well-known path
/// by a failed call.
pub async fn bind(config: RendezvousConfig) -> Result<DescriptorListener, BootstrapError> {
  let staging = staging_path(&config.path, config.instance);

  remove_stale(&config.path).await;
  remove_stale(&staging).await;

  if let Some(parent) = config.path.parent()
    && !parent.as_os_str().is_empty()
  {
    tokio::fs::create_dir_all(parent)
      .await
      .map_err(|source| BootstrapError::Bind {
        path: parent.to_path_buf(),
        source,
      })?;
  }

  let socket = UnixDatagram::bind(&staging).map_err(|source| BootstrapError::Bind {
    path: staging.clone(),
    source,
  })?;
  let identity = FileIdentity::of(&staging);

  if let Err(source) = tokio::fs::rename(&staging, &config.path).await {
    let _ = tokio::fs::remove_file(&staging).await;
    return Err(BootstrapError::Rename {
      from: staging,
      to: config.path,
      source,
    });
  }

  info!(path = ?config.path, instance = config.instance, "Rendezvous endpoint published");
  Ok(DescriptorListener::new(socket, config.path, identity, config.listener))
}

/// Remove a socket file left behind by a previous instance.
async fn remove_stale(path: &Path) {
  match tokio::fs::remove_file(path).await {
    Ok(()) => debug!(?path, "Removed stale socket file"),
    Err(e) if e.kind() == ErrorKind::NotFound => {}
    Err(e) => warn!(?path, error = %e, "Failed to remove stale socket file"),
  }
}
