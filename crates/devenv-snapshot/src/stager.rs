//! Snapshot stager
//!
//! Runs as a Job inside the target cluster. Selects a snapshot from the
//! remote bucket, downloads and verifies it, replaces the contents of the
//! in-cluster Velero bucket with it and leaves a record for the restore side.
//!
//! Steps run strictly in order and a failure is reported with the name of
//! the step that failed. The `current.yaml` marker in the destination bucket
//! is written after every object has been extracted. A rerun with a matching
//! marker skips the download and only writes the record if it is missing.

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use devenv_common::{Error, Result};

use crate::archive::{extract_archive, POST_RESTORE_KEY};
use crate::digest::DigestAccumulator;
use crate::handoff::{HandoffStore, SnapshotRecord};
use crate::lock::{LockRegistry, SnapshotLockListItem};
use crate::s3::S3Config;
use crate::store::ObjectStore;

/// Key of the staging marker in the destination bucket
pub const MARKER_KEY: &str = "current.yaml";

/// Environment variable holding the JSON [`StageConfig`]
pub const CONFIG_ENV: &str = "CONFIG";

/// Prefix under which Velero keeps backup metadata
const VELERO_BACKUPS_PREFIX: &str = "backups/";

/// Contents of the staging marker
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct StagingMarker {
    /// Digest of the staged archive
    pub digest: String,
}

/// Stager configuration, read from [`CONFIG_ENV`]
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct StageConfig {
    /// Remote bucket holding archives and the lock document
    pub source: S3Config,
    /// In-cluster bucket Velero restores from
    pub dest: S3Config,
}

impl StageConfig {
    /// Parse the JSON configuration
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::serialization_for_kind(CONFIG_ENV, e.to_string()))
    }

    /// Read the configuration from the environment
    pub fn from_env() -> Result<Self> {
        let json = std::env::var(CONFIG_ENV).map_err(|_| {
            Error::validation_for_field(CONFIG_ENV, "CONFIG environment variable is not set")
        })?;
        Self::from_json(&json)
    }
}

/// What a staging run did
#[derive(Clone, Debug, PartialEq)]
pub enum StageOutcome {
    /// The destination already held this snapshot
    AlreadyStaged {
        /// Digest of the staged snapshot
        digest: String,
    },
    /// The snapshot was downloaded and extracted
    Staged {
        /// The staged snapshot
        item: SnapshotLockListItem,
        /// Number of objects written to the destination
        objects: usize,
    },
}

/// Stages snapshots from a remote bucket into the in-cluster bucket
pub struct SnapshotStager {
    source: Arc<dyn ObjectStore>,
    dest: Arc<dyn ObjectStore>,
    handoff: Arc<dyn HandoffStore>,
}

impl SnapshotStager {
    /// Create a stager
    pub fn new(
        source: Arc<dyn ObjectStore>,
        dest: Arc<dyn ObjectStore>,
        handoff: Arc<dyn HandoffStore>,
    ) -> Self {
        Self {
            source,
            dest,
            handoff,
        }
    }

    /// Run every step for the snapshot selected by `source`
    pub async fn stage(&self, source: &S3Config) -> Result<StageOutcome> {
        let item = self.discover(source).await.map_err(|e| e.in_step("Discover"))?;

        if self.prepare(&item).await.map_err(|e| e.in_step("Prepare"))? {
            info!(digest = %item.digest, "Using already downloaded snapshot");
            self.resume_hand_off(item.clone())
                .await
                .map_err(|e| e.in_step("HandOff"))?;
            return Ok(StageOutcome::AlreadyStaged {
                digest: item.digest,
            });
        }

        let archive = self
            .download(&item)
            .await
            .map_err(|e| e.in_step("Download"))?;

        let (item, objects) = self
            .extract(item, &archive)
            .await
            .map_err(|e| e.in_step("Extract"))?;

        self.hand_off(&item)
            .await
            .map_err(|e| e.in_step("HandOff"))?;

        Ok(StageOutcome::Staged { item, objects })
    }

    async fn discover(&self, source: &S3Config) -> Result<SnapshotLockListItem> {
        if !source.key.is_empty() {
            info!(key = %source.key, "Using pinned snapshot");
            return Ok(SnapshotLockListItem {
                digest: source.digest.clone(),
                uri: source.key.clone(),
                config: Default::default(),
                backup_id: String::new(),
            });
        }

        info!(
            snapshot_target = %source.snapshot_target,
            channel = %source.snapshot_channel,
            "Discovering snapshots"
        );
        let item = LockRegistry::new(self.source.clone())
            .fetch(&source.snapshot_target, &source.snapshot_channel)
            .await?;
        info!(uri = %item.uri, backup = %item.backup_id, digest = %item.digest, "Using snapshot");
        Ok(item)
    }

    /// `true` if the destination already holds this snapshot
    async fn prepare(&self, item: &SnapshotLockListItem) -> Result<bool> {
        info!("Getting current snapshot information");
        let raw = match self.dest.get(MARKER_KEY).await {
            Ok(raw) => raw,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };
        match serde_yaml::from_slice::<StagingMarker>(&raw) {
            Ok(marker) => Ok(marker.digest == item.digest),
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable staging marker");
                Ok(false)
            }
        }
    }

    async fn download(&self, item: &SnapshotLockListItem) -> Result<NamedTempFile> {
        info!(uri = %item.uri, "Starting download");
        let tmp = tempfile::Builder::new()
            .prefix("devenv-snapshot-")
            .tempfile()?;
        let mut file = tokio::fs::File::from_std(tmp.reopen()?);

        let mut digest = DigestAccumulator::new();
        let mut chunks = self.source.get_stream(&item.uri).await?;
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            digest.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        let actual = digest.finish();
        if actual != item.digest {
            return Err(Error::ChecksumMismatch {
                expected: item.digest.clone(),
                actual,
            });
        }
        info!("Finished downloading snapshot");
        Ok(tmp)
    }

    async fn extract(
        &self,
        mut item: SnapshotLockListItem,
        archive: &NamedTempFile,
    ) -> Result<(SnapshotLockListItem, usize)> {
        info!(bucket = %self.dest.bucket(), "Preparing local storage for snapshot");
        for obj in self.dest.list("").await? {
            self.dest.remove(&obj.key).await?;
        }

        info!("Extracting snapshot into local storage");
        let keys = extract_archive(archive.path(), self.dest.as_ref()).await?;

        if item.backup_id.is_empty() {
            item.backup_id = backup_id_from_keys(&keys).ok_or_else(|| {
                Error::validation(format!("snapshot {} contains no Velero backup", item.uri))
            })?;
        }

        let marker = serde_yaml::to_string(&StagingMarker {
            digest: item.digest.clone(),
        })?;
        self.dest.put(MARKER_KEY, Bytes::from(marker)).await?;
        info!(objects = keys.len(), "Finished extracting snapshot");
        Ok((item, keys.len()))
    }

    /// Write the record for an already extracted snapshot if an earlier run
    /// committed the marker but never got to hand off
    async fn resume_hand_off(&self, mut item: SnapshotLockListItem) -> Result<()> {
        if let Some(record) = self.handoff.read().await? {
            if record.item.digest == item.digest {
                return Ok(());
            }
        }

        warn!(digest = %item.digest, "Staged snapshot has no record, handing off again");
        if item.backup_id.is_empty() {
            let keys: Vec<String> = self
                .dest
                .list(VELERO_BACKUPS_PREFIX)
                .await?
                .into_iter()
                .map(|obj| obj.key)
                .collect();
            item.backup_id = backup_id_from_keys(&keys).ok_or_else(|| {
                Error::validation(format!("snapshot {} contains no Velero backup", item.uri))
            })?;
        }
        self.hand_off(&item).await
    }

    async fn hand_off(&self, item: &SnapshotLockListItem) -> Result<()> {
        let manifests = match self.dest.get(POST_RESTORE_KEY).await {
            Ok(data) => Some(data),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        let record = SnapshotRecord::new(item.clone(), manifests.as_deref())?;
        self.handoff.write(&record).await?;

        if manifests.is_some() {
            info!("Cleaning up post-restore artifacts");
            if let Err(e) = self.dest.remove(POST_RESTORE_KEY).await {
                warn!(error = %e, "Failed to remove post-restore manifests from local storage");
            }
        }
        Ok(())
    }
}

/// Backup name from Velero's `backups/<name>/...` layout
fn backup_id_from_keys(keys: &[String]) -> Option<String> {
    keys.iter()
        .filter_map(|k| k.strip_prefix(VELERO_BACKUPS_PREFIX))
        .filter_map(|rest| rest.split_once('/'))
        .map(|(name, _)| name.to_string())
        .find(|name| !name.is_empty())
}
