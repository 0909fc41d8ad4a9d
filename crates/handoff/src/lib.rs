//! Descriptor handoff between an acceptor process and a worker process.
//!
//! The acceptor owns the public TCP listener. For every connection it accepts,
//! it sends the socket itself (not its bytes) to the worker as `SCM_RIGHTS`
//! ancillary data on a Unix datagram. The worker then talks to the client
//! directly, as if it had accepted the connection.
//!
//! ```text
//! client ──tcp──▶ Acceptor ──transfer()──▶ [datagram + fd] ──▶ DescriptorListener ──▶ ConnectionHandler
//!    ▲                                                                                     │
//!    └────────────────────────────── same socket, now owned by the worker ─────────────────┘
//! ```

#![cfg(unix)]

pub mod acceptor;
pub mod config;
pub mod dirs;
pub mod handler;
pub mod listener;
pub mod rendezvous;
pub mod transmitter;
pub mod wire;
pub mod worker;

mod error;

pub use acceptor::{Acceptor, AcceptorConfig};
pub use config::Config;
pub use error::{BootstrapError, ConfigError, ReceiveError, ServeError, TransferError};
pub use handler::{ConnectionHandler, Heartbeat};
pub use listener::{DescriptorListener, ListenerConfig};
pub use rendezvous::RendezvousConfig;
pub use transmitter::transfer;
pub use worker::{Worker, WorkerConfig};
