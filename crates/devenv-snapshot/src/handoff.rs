//! Staged snapshot hand-off
//!
//! After staging, the selected snapshot's metadata and its compressed
//! post-restore manifests are left in the `devenv/snapshot` ConfigMap for
//! the restore side to pick up.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use devenv_common::{Error, Result, DEVENV_NAMESPACE, FIELD_MANAGER};

use crate::lock::SnapshotLockListItem;

/// Name of the hand-off ConfigMap
pub const SNAPSHOT_CONFIGMAP: &str = "snapshot";

/// Data key holding the serialized lock item
pub const SNAPSHOT_JSON_KEY: &str = "snapshot.json";

/// Data key holding base64(gzip(post-restore manifests))
pub const POST_RESTORE_DATA_KEY: &str = "post-restore.yaml";

/// Metadata of a staged snapshot
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotRecord {
    /// The snapshot that was staged
    pub item: SnapshotLockListItem,
    /// Gzip-compressed post-restore manifest template, if the snapshot had one
    pub post_restore_gz: Option<Vec<u8>>,
}

/// Gzip at best compression; ConfigMaps are limited to 1MiB
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

impl SnapshotRecord {
    /// Build a record, compressing the raw post-restore template
    pub fn new(item: SnapshotLockListItem, post_restore: Option<&[u8]>) -> Result<Self> {
        Ok(Self {
            item,
            post_restore_gz: post_restore.map(compress).transpose()?,
        })
    }

    /// ConfigMap data for this record
    pub fn to_data(&self) -> Result<BTreeMap<String, String>> {
        let mut data = BTreeMap::new();
        data.insert(
            SNAPSHOT_JSON_KEY.to_string(),
            serde_json::to_string(&self.item)?,
        );
        if let Some(gz) = &self.post_restore_gz {
            data.insert(POST_RESTORE_DATA_KEY.to_string(), STANDARD.encode(gz));
        }
        Ok(data)
    }

    /// Parse ConfigMap data
    pub fn from_data(data: &BTreeMap<String, String>) -> Result<Self> {
        let json = data.get(SNAPSHOT_JSON_KEY).ok_or_else(|| {
            Error::validation_for_field(SNAPSHOT_JSON_KEY, "snapshot record has no snapshot.json")
        })?;
        let item = serde_json::from_str(json)?;
        let post_restore_gz = data
            .get(POST_RESTORE_DATA_KEY)
            .map(|encoded| {
                STANDARD
                    .decode(encoded.trim())
                    .map_err(|e| Error::serialization_for_kind("post-restore.yaml", e.to_string()))
            })
            .transpose()?;
        Ok(Self {
            item,
            post_restore_gz,
        })
    }

    /// Decompressed post-restore manifest template
    pub fn post_restore_manifests(&self) -> Result<Option<String>> {
        let Some(gz) = &self.post_restore_gz else {
            return Ok(None);
        };
        let raw = decompress(gz)?;
        String::from_utf8(raw)
            .map(Some)
            .map_err(|e| Error::serialization_for_kind("post-restore.yaml", e.to_string()))
    }
}

/// Where the stager leaves its record for the restore side
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HandoffStore: Send + Sync {
    /// Create or replace the record
    async fn write(&self, record: &SnapshotRecord) -> Result<()>;

    /// Read the record, `None` if nothing has been staged
    async fn read(&self) -> Result<Option<SnapshotRecord>>;
}

/// [`HandoffStore`] backed by the `devenv/snapshot` ConfigMap
pub struct ConfigMapHandoff {
    client: Client,
}

impl ConfigMapHandoff {
    /// Hand-off store in the given cluster
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), DEVENV_NAMESPACE)
    }
}

#[async_trait]
impl HandoffStore for ConfigMapHandoff {
    async fn write(&self, record: &SnapshotRecord) -> Result<()> {
        let cm = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": SNAPSHOT_CONFIGMAP,
                "namespace": DEVENV_NAMESPACE,
            },
            "data": record.to_data()?,
        });
        self.api()
            .patch(
                SNAPSHOT_CONFIGMAP,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&cm),
            )
            .await?;
        info!(backup = %record.item.backup_id, "Wrote snapshot hand-off ConfigMap");
        Ok(())
    }

    async fn read(&self) -> Result<Option<SnapshotRecord>> {
        match self.api().get_opt(SNAPSHOT_CONFIGMAP).await? {
            Some(cm) => Ok(Some(SnapshotRecord::from_data(
                &cm.data.unwrap_or_default(),
            )?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::SnapshotTarget;

    fn item() -> SnapshotLockListItem {
        SnapshotLockListItem {
            digest: "abc==".to_string(),
            uri: "automated-snapshots/v2/flagship/1.tar".to_string(),
            config: SnapshotTarget::default(),
            backup_id: "2026-10-01t00-00-00z".to_string(),
        }
    }

    #[test]
    fn test_record_round_trip_through_configmap_data() {
        let manifests = b"apiVersion: v1\nkind: ConfigMap\n";
        let record = SnapshotRecord::new(item(), Some(manifests)).unwrap();

        let data = record.to_data().unwrap();
        assert!(data.contains_key(SNAPSHOT_JSON_KEY));
        assert!(data[SNAPSHOT_JSON_KEY].contains("\"backupID\""));

        let parsed = SnapshotRecord::from_data(&data).unwrap();
        assert_eq!(parsed.item, item());
        assert_eq!(
            parsed.post_restore_manifests().unwrap().as_deref(),
            Some("apiVersion: v1\nkind: ConfigMap\n")
        );
    }

    #[test]
    fn test_record_without_manifests() {
        let record = SnapshotRecord::new(item(), None).unwrap();
        let data = record.to_data().unwrap();
        assert!(!data.contains_key(POST_RESTORE_DATA_KEY));
        let parsed = SnapshotRecord::from_data(&data).unwrap();
        assert_eq!(parsed.post_restore_manifests().unwrap(), None);
    }

    #[test]
    fn test_missing_snapshot_json_is_invalid() {
        let err = SnapshotRecord::from_data(&BTreeMap::new()).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn test_compression_shrinks_repetitive_manifests() {
        let manifests = "kind: ConfigMap\n".repeat(1000);
        let gz = compress(manifests.as_bytes()).unwrap();
        assert!(gz.len() < manifests.len() / 10);
    }
}
