//! devenv CLI library

pub mod commands;
pub mod config;
pub mod error;

pub use error::{Error, Result};

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use devenv_snapshot::alert::{AlertTask, DesktopAlert};

/// devenv - snapshot-based developer environments
#[derive(Parser, Debug)]
#[command(name = "devenv")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate or restore snapshots
    Snapshot(commands::snapshot::SnapshotArgs),
    /// Provision a new developer environment
    Provision(commands::provision::ProvisionArgs),
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Snapshot(args) => match args.command {
                commands::snapshot::SnapshotCommand::Generate(_) => "snapshot generate",
                commands::snapshot::SnapshotCommand::Restore(_) => "snapshot restore",
            },
            Commands::Provision(_) => "provision",
        }
    }
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping");
                on_signal.cancel();
            }
        });

        let name = self.command.name();
        let result = match self.command {
            Commands::Snapshot(args) => commands::snapshot::run(args, &cancel).await,
            Commands::Provision(args) => commands::provision::run(args, &cancel).await,
        };

        let message = match &result {
            Ok(()) => format!("devenv {} finished", name),
            Err(e) => format!("devenv {} failed: {}", name, e),
        };
        let alert = AlertTask::spawn(Arc::new(DesktopAlert), message);
        if cancel.is_cancelled() {
            alert.cancel();
        }
        alert.join().await;
        result
    }
}
