//! Logging setup for the acceptor and worker processes

use fdhandoff::config::LogSettings;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

/// Parse log level from config string
fn parse_log_level(level: &str) -> LevelFilter {
  match level.to_lowercase().as_str() {
    "off" => LevelFilter::OFF,
    "error" => LevelFilter::ERROR,
    "warn" => LevelFilter::WARN,
    "info" => LevelFilter::INFO,
    "debug" => LevelFilter::DEBUG,
    "trace" => LevelFilter::TRACE,
    _ => LevelFilter::INFO,
  }
}

/// Initialize logging from the `[log]` config section.
///
/// Without a log directory: console only with colors.
/// With one: rolling files named after the process role (no ANSI).
///
/// Returns the guard that must be kept alive for the duration of the program
pub fn init_logging(settings: &LogSettings, role: &str) -> Option<WorkerGuard> {
  let level = parse_log_level(&settings.level);

  // Build env filter (allows RUST_LOG override)
  let env_filter = EnvFilter::builder()
    .with_default_directive(level.into())
    .from_env_lossy();

  let Some(log_dir) = settings.directory.as_ref() else {
    tracing_subscriber::fmt()
      .with_env_filter(env_filter)
      .with_target(true)
      .with_ansi(true)
      .init();
    return None;
  };

  if std::fs::create_dir_all(log_dir).is_err() {
    // Fall back to console-only logging
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    return None;
  }

  let file_name = format!("{role}.log");
  let file_appender = match settings.rotation.as_str() {
    "hourly" => tracing_appender::rolling::hourly(log_dir, &file_name),
    "never" => tracing_appender::rolling::never(log_dir, &file_name),
    _ => tracing_appender::rolling::daily(log_dir, &file_name),
  };

  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_target(true)
    .with_ansi(false)
    .with_writer(file_writer)
    .init();

  Some(guard)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_log_level() {
    assert_eq!(parse_log_level("DEBUG"), LevelFilter::DEBUG);
    assert_eq!(parse_log_level("error"), LevelFilter::ERROR);
    assert_eq!(parse_log_level("nonsense"), LevelFilter::INFO);
  }

  #[test]
  fn test_off_disables_logging() {
    assert_eq!(parse_log_level("off"), LevelFilter::OFF);
    assert_eq!(parse_log_level("OFF"), LevelFilter::OFF);
  }
}
