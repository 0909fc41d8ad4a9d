//! Acceptor loop: owns the public listener and hands every connection to the worker.
//!
//! # Design
//!
//! - Each accepted connection is handed off in its own task with a deadline,
//!   so a slow or missing worker never stalls `accept`
//! - In-flight handoffs are capped by a semaphore; the loop waits for a permit
//!   before accepting, leaving excess clients in the kernel backlog
//! - Accept errors are classified: transient ones are retried after a short
//!   backoff, anything else ends the loop
//!
//! # Example
//!
//! ```ignore
//! let acceptor = Acceptor::new(AcceptorConfig {
//!     listen: ":8080".into(),
//!     worker_path: PathBuf::from("/tmp/worker.sock"),
//!     ..Default::default()
//! });
//! acceptor.run(cancel_token).await?;
//! ```

use std::{
  io::{self, ErrorKind},
  net::SocketAddr,
  os::fd::OwnedFd,
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};

use tokio::{
  net::{TcpListener, TcpStream},
  sync::{OwnedSemaphorePermit, Semaphore},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
  dirs,
  error::{ServeError, TransferError},
  transmitter,
};

// ============================================================================
// Configuration
// ============================================================================

/// Acceptor configuration. Immutable once the acceptor is built.
#[derive(Debug, Clone)]
pub struct AcceptorConfig {
  /// Public TCP address; `:PORT` means every interface, IPv6 and IPv4.
  pub listen: String,
  /// Well-known path of the worker's rendezvous endpoint.
  pub worker_path: PathBuf,
  /// Deadline for one handoff (connect + send).
  pub transfer_timeout: Duration,
  /// Maximum handoffs in flight at once.
  pub max_pending_transfers: usize,
  /// Pause before retrying after a transient accept error.
  pub accept_backoff: Duration,
}

impl Default for AcceptorConfig {
  fn default() -> Self {
    Self {
      listen: ":8080".to_string(),
      worker_path: dirs::default_worker_path(),
      transfer_timeout: Duration::from_secs(5),
      max_pending_transfers: 64,
      accept_backoff: Duration::from_millis(100),
    }
  }
}

/// Addresses to try for `listen`, in order.
///
/// `:PORT` expands to the IPv6 wildcard, which also accepts IPv4 on
/// dual-stack hosts, followed by the IPv4 wildcard for hosts without IPv6.
/// Anything else is used as given.
pub fn listen_addrs(listen: &str) -> Vec<String> {
  match listen.strip_prefix(':') {
    Some(port) => vec![format!("[::]:{port}"), format!("0.0.0.0:{port}")],
    None => vec![listen.to_string()],
  }
}

// ============================================================================
// Accept error classification
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptDecision {
  Retry,
  Terminate,
}

/// Decide whether an `accept` failure is worth retrying.
///
/// Aborted handshakes, interrupted calls, descriptor or memory exhaustion and
/// the network errors accept(2) says to treat like `EAGAIN` are transient.
/// Everything else (a closed or invalid listener) is not.
pub fn classify_accept_error(err: &io::Error) -> AcceptDecision {
  if matches!(
    err.kind(),
    ErrorKind::ConnectionAborted
      | ErrorKind::ConnectionReset
      | ErrorKind::Interrupted
      | ErrorKind::WouldBlock
      | ErrorKind::TimedOut
  ) {
    return AcceptDecision::Retry;
  }

  match err.raw_os_error() {
    Some(
      libc::EMFILE
      | libc::ENFILE
      | libc::ENOBUFS
      | libc::ENOMEM
      | libc::EPROTO
      | libc::ENOPROTOOPT
      | libc::ENETDOWN
      | libc::ENETUNREACH
      | libc::EHOSTDOWN
      | libc::EHOSTUNREACH
      | libc::EOPNOTSUPP
      | libc::EPERM,
    ) => AcceptDecision::Retry,
    _ => AcceptDecision::Terminate,
  }
}

// ============================================================================
// Acceptor
// ============================================================================

pub struct Acceptor {
  config: AcceptorConfig,
}

impl Acceptor {
  pub fn new(config: AcceptorConfig) -> Self {
    Self { config }
  }

  /// Bind the public listener on the first address that works. Failure is fatal.
  pub async fn bind(&self) -> Result<TcpListener, ServeError> {
    let mut last = None;
    for addr in listen_addrs(&self.config.listen) {
      match TcpListener::bind(&addr).await {
        Ok(listener) => return Ok(listener),
        Err(source) => {
          debug!(%addr, error = %source, "Bind failed");
          last = Some(ServeError::Bind { addr, source });
        }
      }
    }
    Err(last.unwrap_or_else(|| ServeError::Bind {
      addr: self.config.listen.clone(),
      source: io::Error::new(ErrorKind::InvalidInput, "no address to listen on"),
    }))
  }

  /// Bind and serve until cancelled or an unrecoverable accept error.
  pub async fn run(&self, cancel: CancellationToken) -> Result<(), ServeError> {
    let listener = self.bind().await?;
    self.serve(listener, cancel).await
  }

  /// Serve on an already bound listener.
  ///
  /// On return no handoff is still in flight.
  pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> Result<(), ServeError> {
    if let Ok(addr) = listener.local_addr() {
      info!("Acceptor listening on {}", addr);
    }
    info!("Handing connections to {:?}", self.config.worker_path);

    let permits = Arc::new(Semaphore::new(self.config.max_pending_transfers.max(1)));
    let tracker = TaskTracker::new();

    let result = loop {
      let permit = tokio::select! {
        biased;

        _ = cancel.cancelled() => break Ok(()),

        permit = Arc::clone(&permits).acquire_owned() => match permit {
          Ok(permit) => permit,
          Err(_) => break Ok(()),
        },
      };

      tokio::select! {
        biased;

        _ = cancel.cancelled() => break Ok(()),

        result = listener.accept() => match result {
          Ok((stream, peer)) => {
            tracker.spawn(pass_connection(
              stream,
              peer,
              self.config.worker_path.clone(),
              self.config.transfer_timeout,
              permit,
            ));
          }
          Err(e) => match classify_accept_error(&e) {
            AcceptDecision::Retry => {
              warn!(error = %e, "Transient accept error, retrying");
              tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = tokio::time::sleep(self.config.accept_backoff) => {}
              }
            }
            AcceptDecision::Terminate => {
              error!(error = %e, "Accept failed");
              break Err(ServeError::Accept(e));
            }
          },
        },
      }
    };

    info!("Acceptor shutting down");
    tracker.close();
    tracker.wait().await;
    result
  }
}

async fn pass_connection(
  stream: TcpStream,
  peer: SocketAddr,
  worker_path: PathBuf,
  deadline: Duration,
  _permit: OwnedSemaphorePermit,
) {
  match hand_off(stream, &worker_path, deadline).await {
    Ok(()) => info!("Connection passed: {}", peer),
    Err(e) => warn!(%peer, error = %e, "Error passing connection"),
  }
}

/// Transfer one accepted connection to the worker within `deadline`.
///
/// The acceptor's copy of the connection is closed on return, so a failed
/// handoff shows up to the client as a plain close.
pub async fn hand_off(stream: TcpStream, worker_path: &Path, deadline: Duration) -> Result<(), TransferError> {
  let fd = OwnedFd::from(stream.into_std().map_err(TransferError::TransferFailed)?);

  match tokio::time::timeout(deadline, transmitter::transfer(fd, worker_path)).await {
    Ok(result) => result,
    Err(_) => {
      debug!(?deadline, "Handoff deadline exceeded");
      Err(TransferError::TimedOut(deadline))
    }
  }
}
