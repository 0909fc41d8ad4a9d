//! Transfer message format.
//!
//! A transfer is exactly one Unix datagram:
//!
//! ```text
//! payload:   'p' 's' 'w' 0          (4 bytes, not interpreted by the receiver)
//! ancillary: SOL_SOCKET/SCM_RIGHTS  (one record, one descriptor)
//! ```
//!
//! The kernel delivers payload and ancillary data together in one `recvmsg`
//! call, so a datagram is either a complete transfer or garbage. Anything
//! other than one record holding one descriptor is rejected as a whole, and
//! every descriptor that arrived with a rejected datagram is closed.
//!
//! Control buffers are handled as plain byte slices and headers are read with
//! unaligned loads, so no buffer here needs `cmsghdr` alignment.

use std::{
  io, mem,
  os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
  ptr,
};

use crate::error::ReceiveError;

/// Payload carried by every transfer datagram.
pub const TAG: [u8; 4] = *b"psw\0";

/// Default bound on the payload receive buffer.
pub const DEFAULT_DATAGRAM_BUFFER: usize = 4096;

const FD_SIZE: usize = mem::size_of::<RawFd>();

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: libc::c_int = 0;

#[allow(unused_unsafe)]
fn cmsg_space(data_len: usize) -> usize {
  // SAFETY: pure size arithmetic.
  unsafe { libc::CMSG_SPACE(data_len as libc::c_uint) as usize }
}

#[allow(unused_unsafe)]
fn cmsg_len(data_len: usize) -> usize {
  // SAFETY: pure size arithmetic.
  unsafe { libc::CMSG_LEN(data_len as libc::c_uint) as usize }
}

/// Bytes of ancillary space needed for one rights record holding `count` descriptors.
pub fn rights_space(count: usize) -> usize {
  cmsg_space(count * FD_SIZE)
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode one ancillary record with the given level, type and data.
///
/// The result is padded to `CMSG_SPACE(data.len())`, so records can be
/// concatenated into a multi-record control buffer.
pub fn encode_record(level: libc::c_int, kind: libc::c_int, data: &[u8]) -> Vec<u8> {
  let mut buf = vec![0u8; cmsg_space(data.len())];

  // SAFETY: cmsghdr is plain data; zeroed is a valid value (covers private padding fields on some libcs).
  let mut header: libc::cmsghdr = unsafe { mem::zeroed() };
  header.cmsg_len = cmsg_len(data.len()) as _;
  header.cmsg_level = level;
  header.cmsg_type = kind;

  // SAFETY: buf is at least CMSG_SPACE(0) >= size_of::<cmsghdr>() bytes long.
  unsafe { ptr::write_unaligned(buf.as_mut_ptr().cast::<libc::cmsghdr>(), header) };

  let start = cmsg_len(0);
  buf[start..start + data.len()].copy_from_slice(data);
  buf
}

/// Encode a single `SCM_RIGHTS` record carrying `fds`.
pub fn encode_rights(fds: &[RawFd]) -> Vec<u8> {
  let data: Vec<u8> = fds.iter().flat_map(|fd| fd.to_ne_bytes()).collect();
  encode_record(libc::SOL_SOCKET, libc::SCM_RIGHTS, &data)
}

// ============================================================================
// Decoding
// ============================================================================

/// One parsed ancillary record.
#[derive(Debug)]
pub enum ControlRecord {
  /// `SCM_RIGHTS`; the descriptors are owned and closed on drop.
  Rights(Vec<OwnedFd>),
  /// Any other level/type pair.
  Other { level: libc::c_int, kind: libc::c_int },
}

/// The records found in a control buffer.
#[derive(Debug, Default)]
pub struct ControlRecords {
  records: Vec<ControlRecord>,
  malformed: bool,
}

impl ControlRecords {
  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }

  /// Total number of descriptors across all rights records.
  pub fn descriptor_count(&self) -> usize {
    self
      .records
      .iter()
      .map(|record| match record {
        ControlRecord::Rights(fds) => fds.len(),
        ControlRecord::Other { .. } => 0,
      })
      .sum()
  }

  /// Extract the single descriptor of a well-formed transfer.
  ///
  /// Every descriptor not returned is closed, including all of them on error.
  pub fn into_descriptor(self) -> Result<OwnedFd, ReceiveError> {
    if self.malformed {
      return Err(ReceiveError::InvalidMessage("malformed control data"));
    }

    let mut records = self.records;
    if records.len() != 1 {
      return Err(ReceiveError::InvalidMessage("expected exactly one control record"));
    }

    match records.pop() {
      Some(ControlRecord::Rights(fds)) => {
        let mut fds = fds.into_iter();
        match (fds.next(), fds.next()) {
          (Some(fd), None) => Ok(fd),
          (None, _) => Err(ReceiveError::InvalidMessage("rights record carries no descriptor")),
          (Some(_), Some(_)) => Err(ReceiveError::InvalidMessage(
            "rights record carries more than one descriptor",
          )),
        }
      }
      _ => Err(ReceiveError::InvalidMessage("control record is not SCM_RIGHTS")),
    }
  }
}

/// Parse a control buffer into records, taking ownership of every descriptor in it.
///
/// A record whose length runs past the buffer, is shorter than its header, or
/// whose rights data is not a whole number of descriptors marks the buffer as
/// malformed and stops parsing.
///
/// # Safety
///
/// Every descriptor in an `SCM_RIGHTS` record of `control` must be open and
/// owned by the caller, with no other owner that will close it.
pub unsafe fn parse_control(control: &[u8]) -> ControlRecords {
  let header_len = cmsg_len(0);
  let mut parsed = ControlRecords::default();
  let mut offset = 0;

  while offset + mem::size_of::<libc::cmsghdr>() <= control.len() {
    // SAFETY: bounds checked above; read_unaligned has no alignment requirement.
    let header: libc::cmsghdr = unsafe { ptr::read_unaligned(control.as_ptr().add(offset).cast()) };
    let record_len = header.cmsg_len as usize;

    if record_len < header_len || offset + record_len > control.len() {
      parsed.malformed = true;
      break;
    }

    let data = &control[offset + header_len..offset + record_len];

    if header.cmsg_level == libc::SOL_SOCKET && header.cmsg_type == libc::SCM_RIGHTS {
      let chunks = data.chunks_exact(FD_SIZE);
      let ragged = !chunks.remainder().is_empty();
      let fds = chunks
        .map(|chunk| {
          let mut raw = [0u8; FD_SIZE];
          raw.copy_from_slice(chunk);
          // SAFETY: the caller guarantees rights records hold descriptors we own.
          unsafe { OwnedFd::from_raw_fd(RawFd::from_ne_bytes(raw)) }
        })
        .collect();
      parsed.records.push(ControlRecord::Rights(fds));

      if ragged {
        parsed.malformed = true;
        break;
      }
    } else {
      parsed.records.push(ControlRecord::Other {
        level: header.cmsg_level,
        kind: header.cmsg_type,
      });
    }

    offset += cmsg_space(record_len - header_len);
  }

  parsed
}

/// Reject datagrams whose payload or ancillary data do not have transfer shape.
///
/// `payload` reaching `bound` means the datagram may have been cut short;
/// `control` must be exactly one single-descriptor rights record.
pub fn check_sizes(payload: usize, control: usize, flags: libc::c_int, bound: usize) -> Result<(), ReceiveError> {
  let expected_control = rights_space(1);
  let truncated = flags & (libc::MSG_TRUNC | libc::MSG_CTRUNC) != 0;

  if payload >= bound || control != expected_control || truncated {
    return Err(ReceiveError::InvalidSize {
      payload,
      control,
      expected_control,
      truncated,
    });
  }
  Ok(())
}

// ============================================================================
// Socket I/O
// ============================================================================

/// One datagram as returned by `recvmsg`, before validation.
#[derive(Debug)]
pub struct RawDatagram {
  payload_len: usize,
  control: Vec<u8>,
  flags: libc::c_int,
}

impl RawDatagram {
  pub fn payload_len(&self) -> usize {
    self.payload_len
  }

  /// Validate the datagram and take its descriptor.
  ///
  /// On error every descriptor that came with the datagram is closed.
  pub fn into_descriptor(self, bound: usize) -> Result<OwnedFd, ReceiveError> {
    // SAFETY: the control bytes were filled in by recvmsg for this process; the
    // descriptors in them are fresh and have no other owner.
    let records = unsafe { parse_control(&self.control) };
    check_sizes(self.payload_len, self.control.len(), self.flags, bound)?;
    records.into_descriptor()
  }
}

/// Send one datagram with a pre-encoded control buffer on a connected socket.
pub fn send_with_control(socket: BorrowedFd<'_>, payload: &[u8], control: &[u8]) -> io::Result<()> {
  let mut control = control.to_vec();
  let mut iov = libc::iovec {
    iov_base: payload.as_ptr() as *mut libc::c_void,
    iov_len: payload.len(),
  };

  // SAFETY: zeroed msghdr is valid before assigning pointers.
  let mut msg: libc::msghdr = unsafe { mem::zeroed() };
  msg.msg_iov = &mut iov;
  msg.msg_iovlen = 1;
  if !control.is_empty() {
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = control.len() as _;
  }

  // SAFETY: msg points to live iov/control buffers for the duration of the call.
  let n = unsafe { libc::sendmsg(socket.as_raw_fd(), &msg, SEND_FLAGS) };
  if n < 0 {
    return Err(io::Error::last_os_error());
  }
  if n as usize != payload.len() {
    return Err(io::Error::new(
      io::ErrorKind::WriteZero,
      format!("short datagram send: {n} of {} bytes", payload.len()),
    ));
  }
  Ok(())
}

/// Send `payload` with one rights record carrying `fds`.
///
/// The descriptors stay open in the caller; the kernel duplicates them into
/// the receiver when the datagram is read.
pub fn send_rights(socket: BorrowedFd<'_>, payload: &[u8], fds: &[RawFd]) -> io::Result<()> {
  if fds.is_empty() {
    return send_with_control(socket, payload, &[]);
  }
  send_with_control(socket, payload, &encode_rights(fds))
}

/// Receive one datagram with room for exactly one rights record.
///
/// Returns `WouldBlock` untouched so readiness-driven callers can retry.
pub fn recv_datagram(socket: BorrowedFd<'_>, payload: &mut [u8]) -> io::Result<RawDatagram> {
  let mut control = vec![0u8; rights_space(1)];
  let mut iov = libc::iovec {
    iov_base: payload.as_mut_ptr().cast(),
    iov_len: payload.len(),
  };

  // SAFETY: zeroed msghdr is valid before assigning pointers.
  let mut msg: libc::msghdr = unsafe { mem::zeroed() };
  msg.msg_iov = &mut iov;
  msg.msg_iovlen = 1;
  msg.msg_control = control.as_mut_ptr().cast();
  msg.msg_controllen = control.len() as _;

  // SAFETY: msg points to live iov/control buffers for the duration of the call.
  let n = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, RECV_FLAGS) };
  if n < 0 {
    return Err(io::Error::last_os_error());
  }

  control.truncate(msg.msg_controllen as usize);
  Ok(RawDatagram {
    payload_len: n as usize,
    control,
    flags: msg.msg_flags,
  })
}

// ============================================================================
// Descriptor flags
// ============================================================================

/// Put the descriptor in non-blocking mode. A no-op if it already is.
pub fn set_nonblocking(fd: BorrowedFd<'_>) -> io::Result<()> {
  let raw = fd.as_raw_fd();
  // SAFETY: fcntl on a borrowed, open descriptor.
  let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
  if flags < 0 {
    return Err(io::Error::last_os_error());
  }
  if flags & libc::O_NONBLOCK != 0 {
    return Ok(());
  }
  // SAFETY: as above.
  if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
    return Err(io::Error::last_os_error());
  }
  Ok(())
}

pub fn is_nonblocking(fd: BorrowedFd<'_>) -> io::Result<bool> {
  // SAFETY: fcntl on a borrowed, open descriptor.
  let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
  if flags < 0 {
    return Err(io::Error::last_os_error());
  }
  Ok(flags & libc::O_NONBLOCK != 0)
}

/// Whether the descriptor is a connection-oriented stream socket.
pub fn is_stream_socket(fd: BorrowedFd<'_>) -> io::Result<bool> {
  let mut kind: libc::c_int = 0;
  let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
  // SAFETY: getsockopt writes at most `len` bytes into `kind`.
  let rc = unsafe {
    libc::getsockopt(
      fd.as_raw_fd(),
      libc::SOL_SOCKET,
      libc::SO_TYPE,
      (&mut kind as *mut libc::c_int).cast(),
      &mut len,
    )
  };
  if rc < 0 {
    return Err(io::Error::last_os_error());
  }
  Ok(kind == libc::SOCK_STREAM)
}
