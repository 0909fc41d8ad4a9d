use std::path::PathBuf;

/// Default well-known path of the worker's rendezvous endpoint.
pub fn default_worker_path() -> PathBuf {
  PathBuf::from("/tmp/worker.sock")
}

/// Get the default config directory
///
/// Respects the following environment variables (in order of precedence):
/// 1. CONFIG_DIR - explicit config directory override
/// 2. XDG_CONFIG_HOME - standard XDG config home directory
/// 3. dirs::config_dir() - platform default
pub fn default_config_dir() -> Option<PathBuf> {
  if let Ok(dir) = std::env::var("CONFIG_DIR") {
    return Some(PathBuf::from(dir));
  }

  if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
    return Some(PathBuf::from(xdg_config).join("fdhandoff"));
  }

  dirs::config_dir().map(|dir| dir.join("fdhandoff"))
}

/// Get the user-level config file path
pub fn user_config_path() -> Option<PathBuf> {
  default_config_dir().map(|dir| dir.join("config.toml"))
}

