//! `devenv snapshot`: generate and restore snapshots

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use devenv_common::kube_utils::create_client;
use devenv_snapshot::lock::DEFAULT_GENERATE_CHANNEL;
use devenv_snapshot::post_restore::TemplateValues;
use devenv_snapshot::{
    GenerateOptions, S3Store, SnapshotGenerateConfig, SnapshotGenerator, SnapshotProvisioner,
};

use super::environment::LocalEnvironment;
use super::provision::provision_clients;
use super::{runtime_registry, CommandErrorExt};
use crate::config::DevenvConfig;
use crate::{Error, Result};

/// Generate or restore snapshots
#[derive(Args, Debug)]
pub struct SnapshotArgs {
    #[command(subcommand)]
    pub command: SnapshotCommand,
}

#[derive(Subcommand, Debug)]
pub enum SnapshotCommand {
    /// Generate a snapshot for every target in the config file
    Generate(GenerateArgs),
    /// Restore the snapshot already staged in the running cluster
    Restore(RestoreArgs),
}

/// Arguments for `devenv snapshot generate`
#[derive(Args, Debug)]
pub struct GenerateArgs {
    /// Create backups without uploading or publishing them
    #[arg(long)]
    pub skip_upload: bool,

    /// Channel the snapshots are published to
    #[arg(long, default_value = DEFAULT_GENERATE_CHANNEL)]
    pub channel: String,

    /// Snapshot targets file
    #[arg(long, default_value = "snapshots.yaml")]
    pub config: PathBuf,

    /// Runtime the snapshot clusters are created on
    #[arg(long, default_value = "kind")]
    pub kubernetes_runtime: String,
}

/// Arguments for `devenv snapshot restore`
#[derive(Args, Debug)]
pub struct RestoreArgs {}

pub async fn run(args: SnapshotArgs, cancel: &CancellationToken) -> Result<()> {
    match args.command {
        SnapshotCommand::Generate(args) => generate(args, cancel).await,
        SnapshotCommand::Restore(_) => restore(cancel).await,
    }
}

/// Directory relative `postRestore` paths in `config_file` resolve against
fn base_dir(config_file: &Path) -> Result<PathBuf> {
    match config_file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => Ok(parent.to_path_buf()),
        _ => std::env::current_dir().cmd_err(),
    }
}

async fn generate(args: GenerateArgs, cancel: &CancellationToken) -> Result<()> {
    let config = DevenvConfig::load()?;
    let contents = tokio::fs::read_to_string(&args.config)
        .await
        .map_err(|e| Error::Config {
            path: args.config.clone(),
            message: e.to_string(),
        })?;
    let targets = SnapshotGenerateConfig::from_yaml(&contents)?;
    if targets.targets.is_empty() {
        return Err(Error::validation(format!(
            "no snapshot targets in {}",
            args.config.display()
        )));
    }

    let runtime = runtime_registry()?.get(&args.kubernetes_runtime)?;
    let remote = S3Store::from_env(
        &config.snapshots.bucket,
        &config.snapshots.region,
        config.snapshots.endpoint.as_deref(),
    )
    .await;
    let env = LocalEnvironment::new(runtime, config, cancel.clone());

    let opts = GenerateOptions {
        channel: args.channel,
        skip_upload: args.skip_upload,
        base_dir: base_dir(&args.config)?,
        ..Default::default()
    };
    let generated = SnapshotGenerator::new(Arc::new(env), Arc::new(remote))
        .generate(&targets, &opts, cancel)
        .await?;

    for snapshot in &generated {
        match &snapshot.published {
            Some(item) => info!(
                snapshot_target = %snapshot.target,
                backup = %snapshot.backup_id,
                uri = %item.uri,
                "Published snapshot"
            ),
            None => info!(
                snapshot_target = %snapshot.target,
                backup = %snapshot.backup_id,
                "Created backup without publishing"
            ),
        }
    }
    Ok(())
}

async fn restore(cancel: &CancellationToken) -> Result<()> {
    let config = DevenvConfig::load()?;
    let runtime = runtime_registry()?
        .running()
        .await
        .ok_or(Error::NoRunningCluster)?;
    let kubeconfig = runtime.kubeconfig().await?;
    let client = create_client(Some(&kubeconfig)).await?;

    let values = TemplateValues::detect(runtime.config()).await?;
    let report = SnapshotProvisioner::new(provision_clients(client, &config.snapshots.stager_image))
        .restore_staged(&values, cancel)
        .await?;
    info!(
        backup = %report.backup,
        phase = %report.phase,
        reinserted = report.reinserted_apps.len(),
        "Snapshot restored"
    );
    Ok(())
}
