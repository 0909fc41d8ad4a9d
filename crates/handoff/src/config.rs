//! Configuration file for both processes.
//!
//! Priority: `--config FILE` > user config (`~/.config/fdhandoff/config.toml`) > defaults.
//! Command-line flags are applied on top by the binary.

use std::{
  path::{Path, PathBuf},
  time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
  acceptor::AcceptorConfig,
  dirs,
  error::ConfigError,
  listener::ListenerConfig,
  rendezvous::RendezvousConfig,
  wire::DEFAULT_DATAGRAM_BUFFER,
};

// ============================================================================
// Acceptor Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceptorSettings {
  /// Public TCP address to accept on
  /// Default: ":8080"
  pub listen: String,

  /// Rendezvous path of the worker to hand connections to
  /// Default: "/tmp/worker.sock"
  pub worker_path: PathBuf,

  /// Deadline for a single handoff in milliseconds
  /// Default: 5000
  pub transfer_timeout_ms: u64,

  /// Maximum handoffs in flight
  /// Default: 64
  pub max_pending_transfers: usize,

  /// Pause after a transient accept error in milliseconds
  /// Default: 100
  pub accept_backoff_ms: u64,
}

impl Default for AcceptorSettings {
  fn default() -> Self {
    Self {
      listen: ":8080".to_string(),
      worker_path: dirs::default_worker_path(),
      transfer_timeout_ms: 5000,
      max_pending_transfers: 64,
      accept_backoff_ms: 100,
    }
  }
}

impl AcceptorSettings {
  pub fn to_config(&self) -> AcceptorConfig {
    AcceptorConfig {
      listen: self.listen.clone(),
      worker_path: self.worker_path.clone(),
      transfer_timeout: Duration::from_millis(self.transfer_timeout_ms),
      max_pending_transfers: self.max_pending_transfers,
      accept_backoff: Duration::from_millis(self.accept_backoff_ms),
    }
  }
}

// ============================================================================
// Worker Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
  /// Well-known rendezvous path to publish
  /// Default: "/tmp/worker.sock"
  pub path: PathBuf,

  /// Heartbeat interval in milliseconds
  /// Default: 1000
  pub heartbeat_interval_ms: u64,

  /// Receive buffer bound for transfer datagrams
  /// Default: 4096
  pub datagram_buffer_size: usize,
}

impl Default for WorkerSettings {
  fn default() -> Self {
    Self {
      path: dirs::default_worker_path(),
      heartbeat_interval_ms: 1000,
      datagram_buffer_size: DEFAULT_DATAGRAM_BUFFER,
    }
  }
}

impl WorkerSettings {
  pub fn heartbeat_interval(&self) -> Duration {
    Duration::from_millis(self.heartbeat_interval_ms)
  }

  pub fn rendezvous_config(&self) -> RendezvousConfig {
    let mut config = RendezvousConfig::new(&self.path);
    config.listener = ListenerConfig {
      datagram_buffer_size: self.datagram_buffer_size,
    };
    config
  }
}

// ============================================================================
// Logging Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
  /// Log level: "off", "error", "warn", "info", "debug", "trace"
  /// Default: "info"
  pub level: String,

  /// Write logs to files in this directory instead of the console
  pub directory: Option<PathBuf>,

  /// Log file rotation: "daily", "hourly", "never"
  /// Default: "daily"
  pub rotation: String,
}

impl Default for LogSettings {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
      rotation: "daily".to_string(),
    }
  }
}

// ============================================================================
// Root
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub acceptor: AcceptorSettings,
  pub worker: WorkerSettings,
  pub log: LogSettings,
}

impl Config {
  /// Load from `explicit` if given, else the user config if present, else defaults.
  ///
  /// An explicit path that cannot be read or parsed is an error; so is a user
  /// config that exists but does not parse.
  pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
    if let Some(path) = explicit {
      return Self::from_file(path);
    }

    if let Some(path) = dirs::user_config_path()
      && path.exists()
    {
      return Self::from_file(&path);
    }

    debug!("No config file found, using defaults");
    Ok(Self::default())
  }

  pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;

    let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })?;
    debug!("Loaded config from {:?}", path);
    Ok(config)
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;
  use tempfile::TempDir;

  use super::*;

  #[test]
  fn test_defaults_match_documented_endpoints() {
    let config = Config::default();
    assert_eq!(config.acceptor.listen, ":8080");
    assert_eq!(config.acceptor.worker_path, PathBuf::from("/tmp/worker.sock"));
    assert_eq!(config.worker.path, config.acceptor.worker_path);
    assert_eq!(config.worker.heartbeat_interval(), Duration::from_secs(1));
    assert_eq!(config.worker.datagram_buffer_size, 4096);
    assert_eq!(config.log.level, "info");
  }

  #[test]
  fn test_partial_file_keeps_defaults() {
    let toml_content = r#"
[acceptor]
listen = "127.0.0.1:9000"
transfer_timeout_ms = 250

[worker]
path = "/run/app/worker.sock"
"#;
    let config: Config = toml::from_str(toml_content).unwrap();

    assert_eq!(config.acceptor.listen, "127.0.0.1:9000");
    assert_eq!(config.acceptor.max_pending_transfers, 64);
    assert_eq!(config.worker.path, PathBuf::from("/run/app/worker.sock"));
    assert_eq!(config.worker.heartbeat_interval_ms, 1000);

    let acceptor = config.acceptor.to_config();
    assert_eq!(acceptor.transfer_timeout, Duration::from_millis(250));
    assert_eq!(acceptor.worker_path, PathBuf::from("/tmp/worker.sock"));
  }

  #[test]
  fn test_rendezvous_config_carries_buffer_size() {
    let settings = WorkerSettings {
      datagram_buffer_size: 512,
      ..Default::default()
    };
    let rendezvous = settings.rendezvous_config();
    assert_eq!(rendezvous.path, settings.path);
    assert_eq!(rendezvous.listener.datagram_buffer_size, 512);
    assert_eq!(rendezvous.instance, std::process::id());
  }

  #[test]
  fn test_explicit_file_errors() {
    let dir = TempDir::new().expect("temp dir");

    let missing = dir.path().join("missing.toml");
    assert!(matches!(Config::load(Some(&missing)), Err(ConfigError::Read { .. })));

    let broken = dir.path().join("broken.toml");
    std::fs::write(&broken, "[acceptor\nlisten = 1").expect("write");
    assert!(matches!(Config::load(Some(&broken)), Err(ConfigError::Parse { .. })));
  }

  #[test]
  fn test_explicit_file_is_loaded() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[log]\nlevel = \"debug\"\n").expect("write");

    let config = Config::load(Some(&path)).expect("load");
    assert_eq!(config.log.level, "debug");
    assert_eq!(config.log.rotation, "daily");
  }
}
