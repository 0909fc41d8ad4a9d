//! Descriptor transmitter, the acceptor's half of a handoff.
//!
//! The transmitter marks the descriptor non-blocking before it leaves the
//! process. The worker relies on that: it wraps the received descriptor in an
//! async stream as-is.

use std::{
  io::{self, ErrorKind},
  os::fd::{AsFd, AsRawFd, OwnedFd},
  path::Path,
};

use tokio::{io::Interest, net::UnixDatagram};
use tracing::trace;

use crate::{
  error::TransferError,
  wire::{self, TAG},
};

/// Hand `descriptor` to the worker listening at `destination`.
///
/// The descriptor and the transient datagram socket are closed when this
/// returns, whatever the outcome. Once this returns `Ok` the worker owns the
/// only live copy.
pub async fn transfer(descriptor: OwnedFd, destination: &Path) -> Result<(), TransferError> {
  wire::set_nonblocking(descriptor.as_fd()).map_err(TransferError::TransferFailed)?;

  let channel = UnixDatagram::unbound().map_err(TransferError::TransferFailed)?;
  channel
    .connect(destination)
    .map_err(|source| TransferError::DestinationUnavailable {
      path: destination.to_path_buf(),
      source,
    })?;

  send_descriptor(&channel, &descriptor)
    .await
    .map_err(TransferError::TransferFailed)?;

  trace!(fd = descriptor.as_raw_fd(), path = ?destination, "Descriptor sent");
  Ok(())
}

/// Send one transfer datagram, waiting for send-buffer space when the socket would block.
async fn send_descriptor(channel: &UnixDatagram, descriptor: &OwnedFd) -> io::Result<()> {
  loop {
    channel.writable().await?;
    match channel.try_io(Interest::WRITABLE, || {
      wire::send_rights(channel.as_fd(), &TAG, &[descriptor.as_raw_fd()])
    }) {
      Err(ref e) if e.kind() == ErrorKind::WouldBlock => continue,
      other => return other,
    }
  }
}
