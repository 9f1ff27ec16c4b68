//! `devenv provision`: create a cluster and restore a snapshot into it

use std::sync::Arc;

use clap::Args;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;

use devenv_backup::VeleroClient;
use devenv_common::readiness::{wait_for_all_pods_ready, PodListerImpl, ReadinessConfig};
use devenv_snapshot::apps::ConfigMapAppRegistry;
use devenv_snapshot::certs::CertManagerRenewer;
use devenv_snapshot::cleanup::KubePodDeleter;
use devenv_snapshot::handoff::ConfigMapHandoff;
use devenv_snapshot::lock::DEFAULT_PROVISION_CHANNEL;
use devenv_snapshot::post_restore::{KubeApplier, TemplateValues};
use devenv_snapshot::provision::JobStageRunner;
use devenv_snapshot::runtime::ClusterStatus;
use devenv_snapshot::{ProvisionClients, S3Config, SnapshotProvisioner, StageConfig};

use super::environment::create_base_cluster;
use super::runtime_registry;
use crate::config::DevenvConfig;
use crate::{Error, Result};

/// Provision a new developer environment
#[derive(Args, Debug)]
pub struct ProvisionArgs {
    /// Only install the base infrastructure, without a snapshot
    #[arg(long)]
    pub base: bool,

    /// Snapshot target to restore (defaults to the configured target)
    #[arg(long)]
    pub snapshot_target: Option<String>,

    /// Channel the snapshot is taken from
    #[arg(long, default_value = DEFAULT_PROVISION_CHANNEL)]
    pub snapshot_channel: String,

    /// Runtime to create the cluster on
    #[arg(long, default_value = "kind")]
    pub kubernetes_runtime: String,

    /// Access key for the snapshot bucket, handed to the in-cluster stager
    #[arg(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true, default_value = "")]
    pub aws_access_key_id: String,

    /// Secret key for the snapshot bucket
    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true, default_value = "")]
    pub aws_secret_access_key: String,

    /// Session token for the snapshot bucket
    #[arg(long, env = "AWS_SESSION_TOKEN", hide_env_values = true, default_value = "")]
    pub aws_session_token: String,
}

/// Stager configuration for the snapshot selected by `args`
pub fn stage_config(args: &ProvisionArgs, config: &DevenvConfig) -> Result<StageConfig> {
    if args.aws_access_key_id.is_empty() || args.aws_secret_access_key.is_empty() {
        return Err(Error::validation(
            "snapshot bucket credentials are required: set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY",
        ));
    }

    let snapshots = &config.snapshots;
    Ok(StageConfig {
        source: S3Config {
            s3_host: snapshots.endpoint.clone().unwrap_or_default(),
            bucket: snapshots.bucket.clone(),
            snapshot_target: args
                .snapshot_target
                .clone()
                .unwrap_or_else(|| snapshots.default_target.clone()),
            snapshot_channel: args.snapshot_channel.clone(),
            aws_access_key: args.aws_access_key_id.clone(),
            aws_secret_key: args.aws_secret_access_key.clone(),
            aws_session_token: args.aws_session_token.clone(),
            region: snapshots.region.clone(),
            ..Default::default()
        },
        dest: config.minio.restore_destination(),
    })
}

/// Kubernetes-backed collaborators for provisioning
pub fn provision_clients(client: Client, stager_image: &str) -> ProvisionClients {
    ProvisionClients {
        stage: Arc::new(JobStageRunner::new(client.clone(), stager_image)),
        handoff: Arc::new(ConfigMapHandoff::new(client.clone())),
        backups: Arc::new(VeleroClient::new(client.clone())),
        apps: Arc::new(ConfigMapAppRegistry::new(client.clone())),
        applier: Arc::new(KubeApplier::new(client.clone())),
        pods: Arc::new(PodListerImpl::new(client.clone())),
        deleter: Arc::new(KubePodDeleter::new(client.clone())),
        certs: Arc::new(CertManagerRenewer::new(client)),
    }
}

pub async fn run(args: ProvisionArgs, cancel: &CancellationToken) -> Result<()> {
    let config = DevenvConfig::load()?;
    let runtime = runtime_registry()?.get(&args.kubernetes_runtime)?;

    if runtime.status().await == ClusterStatus::Running {
        return Err(Error::validation(
            "a devenv cluster already exists, destroy it before provisioning",
        ));
    }
    // fail on missing credentials before a cluster is created
    let stage = if args.base {
        None
    } else {
        Some(stage_config(&args, &config)?)
    };

    let client = create_base_cluster(runtime.as_ref(), &config.base_manifests).await?;

    let Some(stage) = stage else {
        wait_for_all_pods_ready(
            &PodListerImpl::new(client),
            &ReadinessConfig::default(),
            cancel,
        )
        .await?;
        info!("Base environment provisioned");
        return Ok(());
    };

    let values = TemplateValues::detect(runtime.config()).await?;
    info!(
        snapshot_target = %stage.source.snapshot_target,
        channel = %stage.source.snapshot_channel,
        "Provisioning from snapshot"
    );
    let report = SnapshotProvisioner::new(provision_clients(client, &config.snapshots.stager_image))
        .provision(&stage, &values, cancel)
        .await?;
    info!(
        backup = %report.backup,
        phase = %report.phase,
        reinserted = report.reinserted_apps.len(),
        "Environment provisioned"
    );
    Ok(())
}
