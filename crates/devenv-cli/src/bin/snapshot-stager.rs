//! In-cluster snapshot stager
//!
//! Reads its configuration from the `CONFIG` environment variable, copies
//! the selected snapshot into the cluster's object store and leaves a record
//! for the restore in the `devenv/snapshot` ConfigMap.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use devenv_common::kube_utils::create_client;
use devenv_snapshot::handoff::ConfigMapHandoff;
use devenv_snapshot::{S3Store, SnapshotStager, StageConfig, StageOutcome};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = StageConfig::from_env()?;
    let client = create_client(None).await?;

    let stager = SnapshotStager::new(
        Arc::new(S3Store::from_config(&config.source)),
        Arc::new(S3Store::from_config(&config.dest)),
        Arc::new(ConfigMapHandoff::new(client)),
    );
    match stager.stage(&config.source).await? {
        StageOutcome::AlreadyStaged { digest } => {
            info!(digest = %digest, "Snapshot already staged")
        }
        StageOutcome::Staged { item, objects } => info!(
            backup = %item.backup_id,
            digest = %item.digest,
            objects,
            "Snapshot staged"
        ),
    }
    Ok(())
}
