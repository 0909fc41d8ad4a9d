//! Worker loop: receive handed-off connections and run the handler on each.
//!
//! # Lifecycle
//!
//! 1. `Worker::run()` publishes the rendezvous endpoint (fatal on failure)
//! 2. Each valid transfer spawns a handler task that owns the connection
//! 3. Malformed datagrams are logged and skipped
//! 4. On cancellation: stop receiving, cancel handlers, wait for them,
//!    unpublish the endpoint

use std::sync::Arc;

use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
  error::ServeError,
  handler::ConnectionHandler,
  listener::DescriptorListener,
  rendezvous::{self, RendezvousConfig},
};

/// Everything the worker needs, passed up front.
pub struct WorkerConfig {
  pub rendezvous: RendezvousConfig,
  /// Work to run on each handed-off connection.
  pub handler: Arc<dyn ConnectionHandler>,
}

pub struct Worker {
  config: WorkerConfig,
}

impl Worker {
  pub fn new(config: WorkerConfig) -> Self {
    Self { config }
  }

  /// Publish the endpoint and serve until cancelled or the endpoint fails.
  pub async fn run(&self, cancel: CancellationToken) -> Result<(), ServeError> {
    let listener = rendezvous::bind(self.config.rendezvous.clone()).await?;
    self.serve(listener, cancel).await
  }

  /// Serve on an already published endpoint. Closes it on return.
  pub async fn serve(&self, listener: DescriptorListener, cancel: CancellationToken) -> Result<(), ServeError> {
    info!("Worker listening on {:?}", listener.local_path());

    let handlers = cancel.child_token();
    let tracker = TaskTracker::new();
    let mut accepted = 0u64;

    let result = loop {
      tokio::select! {
        biased;

        _ = cancel.cancelled() => {
          info!("Worker shutting down (cancelled)");
          break Ok(());
        }

        result = listener.accept() => match result {
          Ok(conn) => {
            accepted += 1;
            let handler = Arc::clone(&self.config.handler);
            let cancel = handlers.child_token();
            tracker.spawn(async move { handler.handle(conn, cancel).await });
          }
          Err(e) if e.is_fatal() => {
            error!(error = %e, "Rendezvous endpoint failed");
            break Err(ServeError::Receive(e));
          }
          Err(e) => warn!(error = %e, "Rejected transfer datagram"),
        },
      }
    };

    handlers.cancel();
    tracker.close();
    tracker.wait().await;
    listener.close().await;

    debug!(connections = accepted, "Worker stopped");
    result
  }
}

#[cfg(test)]
mod tests {
  use std::{
    os::fd::{AsFd, AsRawFd},
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
  };

  use async_trait::async_trait;
  use tempfile::TempDir;
  use tokio::net::TcpStream;

  use super::*;
  use crate::wire;

  #[derive(Default)]
  struct Counting {
    seen: AtomicUsize,
  }

  #[async_trait]
  impl ConnectionHandler for Counting {
    async fn handle(&self, _conn: TcpStream, _cancel: CancellationToken) {
      self.seen.fetch_add(1, Ordering::SeqCst);
    }
  }

  #[tokio::test]
  async fn test_worker_skips_invalid_datagrams_and_unpublishes_on_cancel() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("worker.sock");
    let counting = Arc::new(Counting::default());

    let worker = Worker::new(WorkerConfig {
      rendezvous: RendezvousConfig::new(&path),
      handler: counting.clone(),
    });
    let listener = rendezvous::bind(RendezvousConfig::new(&path)).await.expect("bind");

    let cancel = CancellationToken::new();
    let task = {
      let cancel = cancel.clone();
      tokio::spawn(async move { worker.serve(listener, cancel).await })
    };

    let tx = std::os::unix::net::UnixDatagram::unbound().expect("unbound");
    tx.connect(&path).expect("connect");

    // Bare tag, no descriptor: rejected, loop keeps going.
    wire::send_rights(tx.as_fd(), &wire::TAG, &[]).expect("send bare");

    let tcp = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind tcp");
    let _client = TcpStream::connect(tcp.local_addr().expect("addr")).await.expect("connect");
    let (server, _) = tcp.accept().await.expect("accept");
    let server = server.into_std().expect("into std");
    wire::send_rights(tx.as_fd(), &wire::TAG, &[server.as_raw_fd()]).expect("send");

    for _ in 0..100 {
      if counting.seen.load(Ordering::SeqCst) == 1 {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(counting.seen.load(Ordering::SeqCst), 1);

    cancel.cancel();
    task.await.expect("join").expect("clean shutdown");
    assert!(!path.exists(), "endpoint should be unpublished");
  }
}
