//! Common test utilities for handoff integration tests
//!
//! Both processes run inside the test process: the worker and acceptor loops
//! are spawned as tasks, and everything talks over real sockets in a temp dir.

use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use fdhandoff::{
  Acceptor, AcceptorConfig, ConnectionHandler, RendezvousConfig, ServeError, Worker, WorkerConfig, rendezvous,
};
use tokio::{
  io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
  net::TcpStream,
  task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// A running loop and the token that stops it.
pub struct Running {
  pub cancel: CancellationToken,
  pub task: JoinHandle<Result<(), ServeError>>,
}

impl Running {
  /// Cancel and wait for a clean exit.
  #[allow(dead_code)]
  pub async fn stop(self) {
    self.cancel.cancel();
    self.task.await.expect("join").expect("clean shutdown");
  }
}

/// Publish a worker endpoint at `path` and serve it with `handler`.
///
/// Returns once the endpoint is published, so transfers can start right away.
#[allow(dead_code)]
pub async fn spawn_worker(path: &Path, instance: u32, handler: Arc<dyn ConnectionHandler>) -> Running {
  let mut rendezvous_config = RendezvousConfig::new(path);
  rendezvous_config.instance = instance;

  let listener = rendezvous::bind(rendezvous_config.clone())
    .await
    .expect("Failed to publish worker endpoint");
  let worker = Worker::new(WorkerConfig {
    rendezvous: rendezvous_config,
    handler,
  });

  let cancel = CancellationToken::new();
  let task = {
    let cancel = cancel.clone();
    tokio::spawn(async move { worker.serve(listener, cancel).await })
  };
  Running { cancel, task }
}

/// Start an acceptor on an ephemeral loopback port handing off to `worker_path`.
#[allow(dead_code)]
pub async fn spawn_acceptor(worker_path: &Path) -> (SocketAddr, Running) {
  let acceptor = Acceptor::new(AcceptorConfig {
    listen: "127.0.0.1:0".to_string(),
    worker_path: worker_path.to_path_buf(),
    transfer_timeout: Duration::from_secs(2),
    ..Default::default()
  });
  let listener = acceptor.bind().await.expect("Failed to bind acceptor");
  let addr = listener.local_addr().expect("acceptor addr");

  let cancel = CancellationToken::new();
  let task = {
    let cancel = cancel.clone();
    tokio::spawn(async move { acceptor.serve(listener, cancel).await })
  };
  (addr, Running { cancel, task })
}

/// Echoes every line back to the sender.
#[allow(dead_code)]
pub struct Echo;

#[async_trait]
impl ConnectionHandler for Echo {
  async fn handle(&self, conn: TcpStream, cancel: CancellationToken) {
    let (read, mut write) = conn.into_split();
    let mut lines = BufReader::new(read).lines();
    loop {
      tokio::select! {
        _ = cancel.cancelled() => return,
        line = lines.next_line() => match line {
          Ok(Some(line)) => {
            if write.write_all(format!("{line}\n").as_bytes()).await.is_err() {
              return;
            }
          }
          _ => return,
        },
      }
    }
  }
}

/// Read one line with a deadline.
#[allow(dead_code)]
pub async fn read_line(reader: &mut BufReader<TcpStream>) -> Option<String> {
  let mut line = String::new();
  match tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut line)).await {
    Ok(Ok(0)) | Ok(Err(_)) | Err(_) => None,
    Ok(Ok(_)) => Some(line),
  }
}
