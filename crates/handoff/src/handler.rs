//! Per-connection work run by the worker after a handoff.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use tokio::{
  io::{AsyncWrite, AsyncWriteExt},
  net::TcpStream,
  time::{MissedTickBehavior, interval_at},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Work performed on a handed-off connection.
///
/// The handler owns the connection for as long as `handle` runs and closes it
/// by dropping it. Implementations share nothing across connections unless
/// they bring their own synchronization.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
  async fn handle(&self, conn: TcpStream, cancel: CancellationToken);
}

/// Writes `<RFC3339 timestamp> <pid>` once per interval until the peer goes away.
#[derive(Debug, Clone)]
pub struct Heartbeat {
  interval: Duration,
  pid: u32,
}

impl Heartbeat {
  pub fn new(interval: Duration) -> Self {
    Self {
      interval,
      pid: std::process::id(),
    }
  }

  /// Run the heartbeat on any writer. Returns when a write fails or on cancellation.
  ///
  /// The first line is written one interval after the call.
  pub async fn run<W>(&self, writer: &mut W, cancel: &CancellationToken) -> std::io::Result<()>
  where
    W: AsyncWrite + Unpin + Send,
  {
    let start = tokio::time::Instant::now() + self.interval;
    let mut ticker = interval_at(start, self.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        biased;

        _ = cancel.cancelled() => return Ok(()),

        _ = ticker.tick() => {
          let line = heartbeat_line(Utc::now(), self.pid);
          writer.write_all(line.as_bytes()).await?;
          writer.flush().await?;
        }
      }
    }
  }
}

impl Default for Heartbeat {
  fn default() -> Self {
    Self::new(Duration::from_secs(1))
  }
}

#[async_trait]
impl ConnectionHandler for Heartbeat {
  async fn handle(&self, mut conn: TcpStream, cancel: CancellationToken) {
    let peer = conn
      .peer_addr()
      .map(|addr| addr.to_string())
      .unwrap_or_else(|_| "unknown".to_string());
    info!("Connection from {}", peer);

    match self.run(&mut conn, &cancel).await {
      Ok(()) => debug!(%peer, "Heartbeat stopped"),
      Err(e) => info!(%peer, error = %e, "Error sending heartbeat, closing connection"),
    }
  }
}

/// One heartbeat line, e.g. `2024-01-01T00:00:00Z 12345\n`.
pub fn heartbeat_line(now: DateTime<Utc>, pid: u32) -> String {
  format!("{} {}\n", now.to_rfc3339_opts(SecondsFormat::Secs, true), pid)
}
