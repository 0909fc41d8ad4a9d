//! Pseudo-listener over the rendezvous datagram endpoint.
//!
//! Unix datagram sockets have no `accept`. [`DescriptorListener::accept`]
//! gives the worker one anyway: it parks the task until a transfer datagram
//! is readable, validates it, and hands back the connection it carried.
//!
//! # States
//!
//! - awaiting datagram: the listener is alive and `accept` can be called
//! - terminated: the listener was closed or dropped and the socket is gone
//!
//! There is nothing in between; every valid datagram is a complete transfer.

use std::{
  io::ErrorKind,
  os::{
    fd::{AsFd, OwnedFd},
    unix::fs::MetadataExt,
  },
  path::{Path, PathBuf},
};

use futures::Stream;
use tokio::{
  io::Interest,
  net::{TcpStream, UnixDatagram},
};
use tracing::{debug, warn};

use crate::{
  error::ReceiveError,
  wire::{self, DEFAULT_DATAGRAM_BUFFER},
};

/// Receive-side limits.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
  /// Payload buffer size. A datagram whose payload fills it is rejected.
  pub datagram_buffer_size: usize,
}

impl Default for ListenerConfig {
  fn default() -> Self {
    Self {
      datagram_buffer_size: DEFAULT_DATAGRAM_BUFFER,
    }
  }
}

/// Device and inode of the socket file this listener published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FileIdentity {
  dev: u64,
  ino: u64,
}

impl FileIdentity {
  pub(crate) fn of(path: &Path) -> Option<Self> {
    std::fs::symlink_metadata(path).ok().map(|meta| Self {
      dev: meta.dev(),
      ino: meta.ino(),
    })
  }
}

/// Accept-style wrapper around the worker's rendezvous endpoint.
///
/// Built by [`crate::rendezvous::bind`]. Only one task should call `accept`
/// at a time; the endpoint has a single logical reader.
#[derive(Debug)]
pub struct DescriptorListener {
  socket: UnixDatagram,
  path: PathBuf,
  identity: Option<FileIdentity>,
  config: ListenerConfig,
}

impl DescriptorListener {
  pub(crate) fn new(
    socket: UnixDatagram,
    path: PathBuf,
    identity: Option<FileIdentity>,
    config: ListenerConfig,
  ) -> Self {
    Self {
      socket,
      path,
      identity,
      config,
    }
  }

  /// The well-known path this listener was published at.
  pub fn local_path(&self) -> &Path {
    &self.path
  }

  /// Whether the well-known path still refers to this listener's socket.
  pub fn is_published(&self) -> bool {
    self.identity.is_some() && FileIdentity::of(&self.path) == self.identity
  }

  /// Wait for the next handed-off connection.
  pub async fn accept(&self) -> Result<TcpStream, ReceiveError> {
    let fd = self.accept_fd().await?;
    adopt(fd)
  }

  /// Wait for the next transfer datagram and return its descriptor without wrapping it.
  ///
  /// A receive that would block is not an error: readiness is cleared and
  /// the receive retried once the socket is readable again. Any other
  /// failure ends this call.
  pub async fn accept_fd(&self) -> Result<OwnedFd, ReceiveError> {
    let bound = self.config.datagram_buffer_size;
    let mut payload = vec![0u8; bound];

    let datagram = loop {
      self.socket.readable().await?;
      match self.socket.try_io(Interest::READABLE, || {
        wire::recv_datagram(self.socket.as_fd(), &mut payload)
      }) {
        Err(ref e) if e.kind() == ErrorKind::WouldBlock => continue,
        other => break other?,
      }
    };

    datagram.into_descriptor(bound)
  }

  /// Stream of handed-off connections, one `accept` per item.
  pub fn incoming(&self) -> impl Stream<Item = Result<TcpStream, ReceiveError>> + '_ {
    futures::stream::unfold(self, |listener| async move { Some((listener.accept().await, listener)) })
  }

  /// Close the endpoint and remove the well-known path if it is still ours.
  ///
  /// A newer instance that has since published at the same path is left alone.
  pub async fn close(self) {
    if self.is_published() {
      match tokio::fs::remove_file(&self.path).await {
        Ok(()) => debug!(path = ?self.path, "Rendezvous endpoint unpublished"),
        Err(e) => warn!(path = ?self.path, error = %e, "Failed to remove rendezvous endpoint"),
      }
    }
  }
}

/// Turn a received descriptor into an async TCP stream.
///
/// The sender marks descriptors non-blocking before transfer. A descriptor
/// that arrives blocking is fixed up here, since the runtime cannot drive it
/// otherwise.
fn adopt(fd: OwnedFd) -> Result<TcpStream, ReceiveError> {
  // ENOTSOCK from SO_TYPE lands here too.
  if !matches!(wire::is_stream_socket(fd.as_fd()), Ok(true)) {
    return Err(ReceiveError::InvalidMessage("descriptor is not a stream socket"));
  }

  if !wire::is_nonblocking(fd.as_fd()).map_err(ReceiveError::Descriptor)? {
    warn!("Received descriptor in blocking mode, switching to non-blocking");
    wire::set_nonblocking(fd.as_fd()).map_err(ReceiveError::Descriptor)?;
  }

  TcpStream::from_std(std::net::TcpStream::from(fd)).map_err(ReceiveError::Descriptor)
}

#[cfg(test)]
mod tests {
  use std::{
    os::{
      fd::{AsRawFd, IntoRawFd},
      unix::net::UnixDatagram as StdUnixDatagram,
    },
    time::Duration,
  };

  use futures::StreamExt;
  use tempfile::TempDir;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  use super::*;
  use crate::rendezvous::{self, RendezvousConfig};

  async fn bound(dir: &TempDir, config: ListenerConfig) -> DescriptorListener {
    let mut rendezvous = RendezvousConfig::new(dir.path().join("worker.sock"));
    rendezvous.listener = config;
    rendezvous::bind(rendezvous).await.expect("bind rendezvous")
  }

  fn sender(listener: &DescriptorListener) -> StdUnixDatagram {
    let socket = StdUnixDatagram::unbound().expect("unbound");
    socket.connect(listener.local_path()).expect("connect");
    socket
  }

  async fn tcp_pair() -> (TcpStream, std::net::TcpStream) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind tcp");
    let addr = listener.local_addr().expect("addr");
    let client = tokio::task::spawn_blocking(move || std::net::TcpStream::connect(addr).expect("connect"));
    let (server, _) = listener.accept().await.expect("accept");
    (server, client.await.expect("join"))
  }

  #[tokio::test]
  async fn test_accept_returns_transferred_connection() {
    let dir = TempDir::new().expect("temp dir");
    let listener = bound(&dir, ListenerConfig::default()).await;

    let (server, mut client) = tcp_pair().await;
    let peer = server.peer_addr().expect("peer");
    let std_server = server.into_std().expect("into std");
    wire::send_rights(sender(&listener).as_fd(), &wire::TAG, &[std_server.as_raw_fd()]).expect("send");
    drop(std_server);

    let mut conn = listener.accept().await.expect("accept");
    assert_eq!(conn.peer_addr().expect("peer"), peer);

    conn.write_all(b"ping\n").await.expect("write");
    let mut buf = [0u8; 5];
    std::io::Read::read_exact(&mut client, &mut buf).expect("read");
    assert_eq!(&buf, b"ping\n");

    std::io::Write::write_all(&mut client, b"pong").expect("write back");
    let mut back = [0u8; 4];
    conn.read_exact(&mut back).await.expect("read back");
    assert_eq!(&back, b"pong");
  }

  #[tokio::test]
  async fn test_accept_waits_for_a_datagram() {
    let dir = TempDir::new().expect("temp dir");
    let listener = bound(&dir, ListenerConfig::default()).await;

    let pending = tokio::time::timeout(Duration::from_millis(50), listener.accept()).await;
    assert!(pending.is_err(), "accept must block until a datagram arrives");
  }

  #[tokio::test]
  async fn test_invalid_datagram_fails_one_call_only() {
    let dir = TempDir::new().expect("temp dir");
    let listener = bound(&dir, ListenerConfig::default()).await;
    let tx = sender(&listener);

    wire::send_rights(tx.as_fd(), &wire::TAG, &[]).expect("send bare tag");
    assert!(matches!(listener.accept().await, Err(ReceiveError::InvalidSize { .. })));

    let (server, _client) = tcp_pair().await;
    let std_server = server.into_std().expect("into std");
    wire::send_rights(tx.as_fd(), &wire::TAG, &[std_server.as_raw_fd()]).expect("send");
    assert!(listener.accept().await.is_ok());
  }

  #[tokio::test]
  async fn test_payload_at_bound_is_invalid_size() {
    let dir = TempDir::new().expect("temp dir");
    let listener = bound(
      &dir,
      ListenerConfig {
        datagram_buffer_size: 128,
      },
    )
    .await;

    let (server, _client) = tcp_pair().await;
    let std_server = server.into_std().expect("into std");
    wire::send_rights(sender(&listener).as_fd(), &[7u8; 128], &[std_server.as_raw_fd()]).expect("send");

    assert!(matches!(
      listener.accept().await,
      Err(ReceiveError::InvalidSize { payload: 128, .. })
    ));
  }

  #[tokio::test]
  async fn test_non_socket_descriptor_is_rejected() {
    let dir = TempDir::new().expect("temp dir");
    let listener = bound(&dir, ListenerConfig::default()).await;

    let file = std::fs::File::open("/dev/null").expect("open").into_raw_fd();
    wire::send_rights(sender(&listener).as_fd(), &wire::TAG, &[file]).expect("send");
    unsafe { libc::close(file) };

    assert!(matches!(listener.accept().await, Err(ReceiveError::InvalidMessage(_))));
  }

  #[tokio::test]
  async fn test_incoming_yields_each_transfer() {
    let dir = TempDir::new().expect("temp dir");
    let listener = bound(&dir, ListenerConfig::default()).await;
    let tx = sender(&listener);

    let mut peers = Vec::new();
    let mut keep = Vec::new();
    for _ in 0..3 {
      let (server, client) = tcp_pair().await;
      peers.push(server.peer_addr().expect("peer"));
      let std_server = server.into_std().expect("into std");
      wire::send_rights(tx.as_fd(), &wire::TAG, &[std_server.as_raw_fd()]).expect("send");
      keep.push(client);
    }

    let received: Vec<_> = listener
      .incoming()
      .take(3)
      .map(|conn| conn.expect("accept").peer_addr().expect("peer"))
      .collect()
      .await;
    assert_eq!(received, peers);
  }

  #[tokio::test]
  async fn test_close_unpublishes_path() {
    let dir = TempDir::new().expect("temp dir");
    let listener = bound(&dir, ListenerConfig::default()).await;
    let path = listener.local_path().to_path_buf();

    assert!(listener.is_published());
    listener.close().await;
    assert!(!path.exists());
  }
}
