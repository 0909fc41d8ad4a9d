//! Error types for every stage of a handoff.
//!
//! Errors are split by who owns the failure: the sending side
//! ([`TransferError`]), the receiving side ([`ReceiveError`]), worker startup
//! ([`BootstrapError`]) and the long-running loops ([`ServeError`]).

use std::{io, path::PathBuf, time::Duration};

/// Failure to hand a descriptor to the worker.
///
/// Local to a single connection; the acceptor logs it and moves on.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
  #[error("worker endpoint {path:?} unavailable: {source}")]
  DestinationUnavailable {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
  #[error("failed to send descriptor: {0}")]
  TransferFailed(#[source] io::Error),
  #[error("transfer timed out after {0:?}")]
  TimedOut(Duration),
}

/// Failure to receive a descriptor from a datagram.
#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
  /// The datagram or its ancillary data had the wrong size or was truncated.
  #[error(
    "invalid size: payload {payload} bytes, control {control} bytes (expected {expected_control}), truncated: {truncated}"
  )]
  InvalidSize {
    payload: usize,
    control: usize,
    expected_control: usize,
    /// The kernel reported `MSG_TRUNC` or `MSG_CTRUNC`.
    truncated: bool,
  },
  /// The ancillary data did not hold exactly one rights record with exactly one descriptor.
  #[error("invalid message: {0}")]
  InvalidMessage(&'static str),
  /// A well-formed transfer whose descriptor could not be turned into a connection.
  #[error("failed to adopt received descriptor: {0}")]
  Descriptor(#[source] io::Error),
  #[error("IO error: {0}")]
  Io(#[from] io::Error),
}

impl ReceiveError {
  /// Whether the error comes from the endpoint itself rather than one bad datagram.
  pub fn is_fatal(&self) -> bool {
    matches!(self, ReceiveError::Io(_))
  }
}

/// Failure to publish the rendezvous endpoint. Fatal to the worker.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
  #[error("failed to bind {path:?}: {source}")]
  Bind {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
  #[error("failed to publish {from:?} as {to:?}: {source}")]
  Rename {
    from: PathBuf,
    to: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Failure that ends an acceptor or worker loop.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
  #[error("failed to listen on {addr}: {source}")]
  Bind {
    addr: String,
    #[source]
    source: io::Error,
  },
  #[error("unrecoverable accept error: {0}")]
  Accept(#[source] io::Error),
  #[error(transparent)]
  Bootstrap(#[from] BootstrapError),
  #[error("rendezvous endpoint failed: {0}")]
  Receive(#[source] ReceiveError),
}

/// Failure to load the configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("failed to read config {path:?}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
  #[error("failed to parse config {path:?}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },
}
