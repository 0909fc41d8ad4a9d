//! fdhandoff - hand accepted TCP connections from an acceptor to a worker process

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fdhandoff::Config;

mod commands;
mod logging;

use commands::{apply_acceptor_overrides, apply_worker_overrides, cmd_acceptor, cmd_worker};
use logging::init_logging;

#[derive(Parser)]
#[command(name = "fdhandoff")]
#[command(about = "Hand accepted TCP connections to a worker process over SCM_RIGHTS")]
#[command(after_help = "\
QUICK START:
  fdhandoff worker                        # Publish /tmp/worker.sock
  fdhandoff acceptor                      # Accept on :8080, hand off to the worker
  nc localhost 8080                       # Heartbeat lines come from the worker

CONFIG LOCATION:
  ~/.config/fdhandoff/config.toml (or --config FILE)")]
struct Cli {
  /// Config file (default: user config if present)
  #[arg(long, global = true, value_name = "FILE")]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Accept public connections and hand them to the worker
  Acceptor {
    /// Address to listen on, e.g. ":8080" or "127.0.0.1:8080"
    #[arg(long)]
    listen: Option<String>,
    /// Path of the worker's rendezvous socket
    #[arg(long, value_name = "PATH")]
    worker: Option<PathBuf>,
    /// Deadline for a single handoff in milliseconds
    #[arg(long, value_name = "MS")]
    transfer_timeout_ms: Option<u64>,
  },
  /// Receive handed-off connections and serve them
  Worker {
    /// Path to publish the rendezvous socket at
    #[arg(long, value_name = "PATH")]
    worker: Option<PathBuf>,
    /// Heartbeat interval in milliseconds
    #[arg(long, value_name = "MS")]
    interval_ms: Option<u64>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();

  let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

  match cli.command {
    Commands::Acceptor {
      listen,
      worker,
      transfer_timeout_ms,
    } => {
      let _guard = init_logging(&config.log, "acceptor");
      apply_acceptor_overrides(
        &mut config.acceptor,
        listen,
        worker,
        transfer_timeout_ms.map(Duration::from_millis),
      );
      cmd_acceptor(&config.acceptor).await
    }
    Commands::Worker { worker, interval_ms } => {
      let _guard = init_logging(&config.log, "worker");
      apply_worker_overrides(&mut config.worker, worker, interval_ms.map(Duration::from_millis));
      cmd_worker(&config.worker).await
    }
  }
}
