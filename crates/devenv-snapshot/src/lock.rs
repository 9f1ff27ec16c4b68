//! Snapshot lock registry
//!
//! A single YAML document in the remote bucket maps every snapshot target
//! and release channel to the snapshots published for it, newest first.
//! Publishing is a read-modify-write of the whole document without a
//! precondition, so two concurrent publishers can lose an update; snapshot
//! generation is expected to run from one place at a time.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use devenv_common::{Error, Result};

use crate::store::ObjectStore;

/// Key of the lock document in the remote bucket
pub const LOCK_KEY: &str = "automated-snapshots/v2/latest.yaml";

/// Prefix under which archives are uploaded
pub const ARCHIVE_PREFIX: &str = "automated-snapshots/v2";

/// Channel used when none is requested at generation time
pub const DEFAULT_GENERATE_CHANNEL: &str = "rc";

/// Channel used when none is requested at provisioning time
pub const DEFAULT_PROVISION_CHANNEL: &str = "stable";

/// How a snapshot target is generated
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotTarget {
    /// Applications deployed before the capture command
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deploy_apps: Vec<String>,
    /// Applications deployed after the capture command
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_deploy_apps: Vec<String>,
    /// Shell command run against the cluster before the backup
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
    /// Local path of a manifest template applied after restore
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub post_restore: String,
    /// Whether the restored environment should be treated as read-only
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
}

/// Contents of `snapshots.yaml`
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SnapshotGenerateConfig {
    /// Targets to generate, by name
    #[serde(default)]
    pub targets: BTreeMap<String, SnapshotTarget>,
}

impl SnapshotGenerateConfig {
    /// Parse a `snapshots.yaml` document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::serialization_for_kind("snapshots.yaml", e.to_string()))
    }
}

/// One published snapshot
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SnapshotLockListItem {
    /// Base64 MD5 of the archive
    pub digest: String,
    /// Object key of the archive in the remote bucket
    pub uri: String,
    /// Generation parameters
    #[serde(default)]
    pub config: SnapshotTarget,
    /// Name of the Velero Backup inside the archive
    #[serde(rename = "backupID", alias = "veleroBackupName")]
    pub backup_id: String,
}

/// Snapshots of one target, by channel
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SnapshotLockList {
    /// Newest-first snapshot lists, by channel
    #[serde(default)]
    pub snapshots: BTreeMap<String, Vec<SnapshotLockListItem>>,
}

/// The lock document
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotLock {
    /// When the document was last published
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
    /// Snapshot lists, by target
    #[serde(default, alias = "targetsV2")]
    pub targets: BTreeMap<String, SnapshotLockList>,
}

impl SnapshotLock {
    /// Parse a lock document
    pub fn from_yaml(yaml: &[u8]) -> Result<Self> {
        serde_yaml::from_slice(yaml)
            .map_err(|e| Error::serialization_for_kind("snapshot lock", e.to_string()))
    }

    /// Serialize the lock document
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Newest snapshot for `(target, channel)`
    pub fn latest(&self, target: &str, channel: &str) -> Result<&SnapshotLockListItem> {
        let list = self
            .targets
            .get(target)
            .ok_or_else(|| Error::UnknownSnapshotTarget {
                target: target.to_string(),
            })?;
        let items = list
            .snapshots
            .get(channel)
            .ok_or_else(|| Error::UnknownSnapshotChannel {
                target: target.to_string(),
                channel: channel.to_string(),
            })?;
        items.first().ok_or_else(|| Error::EmptySnapshotChannel {
            target: target.to_string(),
            channel: channel.to_string(),
        })
    }

    /// Make `item` the newest snapshot for `(target, channel)`
    pub fn prepend(&mut self, target: &str, channel: &str, item: SnapshotLockListItem) {
        self.targets
            .entry(target.to_string())
            .or_default()
            .snapshots
            .entry(channel.to_string())
            .or_default()
            .insert(0, item);
    }
}

/// Read and publish the lock document in a remote bucket
#[derive(Clone)]
pub struct LockRegistry {
    store: Arc<dyn ObjectStore>,
}

impl LockRegistry {
    /// Registry stored in `store`
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Read the current lock document
    pub async fn load(&self) -> Result<SnapshotLock> {
        let raw = self.store.get(LOCK_KEY).await?;
        SnapshotLock::from_yaml(&raw)
    }

    /// Newest snapshot for `(target, channel)`
    pub async fn fetch(&self, target: &str, channel: &str) -> Result<SnapshotLockListItem> {
        let lock = self.load().await?;
        lock.latest(target, channel).cloned()
    }

    /// Prepend `item` to `(target, channel)` and write the document back.
    ///
    /// A missing or unreadable document starts a fresh registry.
    pub async fn publish(
        &self,
        target: &str,
        channel: &str,
        item: SnapshotLockListItem,
    ) -> Result<SnapshotLock> {
        let mut lock = match self.load().await {
            Ok(lock) => lock,
            Err(e) => {
                warn!(error = %e, "Failed to fetch existing snapshot lock, starting a new one");
                SnapshotLock::default()
            }
        };

        info!(snapshot_target = %target, channel = %channel, uri = %item.uri, "Publishing snapshot");
        lock.prepend(target, channel, item);
        lock.generated_at = Some(Utc::now());

        self.store
            .put(LOCK_KEY, Bytes::from(lock.to_yaml()?))
            .await?;
        Ok(lock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn item(digest: &str) -> SnapshotLockListItem {
        SnapshotLockListItem {
            digest: digest.to_string(),
            uri: format!("automated-snapshots/v2/flagship/{}.tar", digest),
            config: SnapshotTarget::default(),
            backup_id: format!("backup-{}", digest),
        }
    }

    fn registry() -> (MemoryStore, LockRegistry) {
        let store = MemoryStore::new("snapshots");
        let registry = LockRegistry::new(Arc::new(store.clone()));
        (store, registry)
    }

    #[test]
    fn test_latest_errors() {
        let mut lock = SnapshotLock::default();
        assert!(matches!(
            lock.latest("flagship", "stable"),
            Err(Error::UnknownSnapshotTarget { .. })
        ));

        lock.prepend("flagship", "rc", item("a"));
        assert!(matches!(
            lock.latest("flagship", "stable"),
            Err(Error::UnknownSnapshotChannel { .. })
        ));

        lock.targets
            .get_mut("flagship")
            .unwrap()
            .snapshots
            .insert("stable".to_string(), vec![]);
        assert!(matches!(
            lock.latest("flagship", "stable"),
            Err(Error::EmptySnapshotChannel { .. })
        ));
    }

    #[test]
    fn test_prepend_keeps_history_newest_first() {
        let mut lock = SnapshotLock::default();
        lock.prepend("flagship", "stable", item("old"));
        lock.prepend("flagship", "stable", item("new"));

        let list = &lock.targets["flagship"].snapshots["stable"];
        assert_eq!(list[0].digest, "new");
        assert_eq!(list[1].digest, "old");
        assert_eq!(lock.latest("flagship", "stable").unwrap().digest, "new");
    }

    #[test]
    fn test_wire_format() {
        let yaml = r#"
generatedAt: 2026-10-01T00:00:00Z
targets:
  flagship:
    snapshots:
      stable:
        - digest: abc==
          uri: automated-snapshots/v2/flagship/1.tar
          backupID: 2026-10-01t00-00-00z
          config:
            deployApps: [flagship]
            postRestore: ./post-restore.yaml
"#;
        let lock = SnapshotLock::from_yaml(yaml.as_bytes()).unwrap();
        let latest = lock.latest("flagship", "stable").unwrap();
        assert_eq!(latest.backup_id, "2026-10-01t00-00-00z");
        assert_eq!(latest.config.deploy_apps, vec!["flagship".to_string()]);

        let rendered = lock.to_yaml().unwrap();
        assert!(rendered.contains("backupID"));
        assert!(rendered.contains("generatedAt"));
    }

    #[test]
    fn test_legacy_backup_name_field() {
        let yaml = "digest: d\nuri: u\nveleroBackupName: legacy\n";
        let item: SnapshotLockListItem = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(item.backup_id, "legacy");
    }

    #[tokio::test]
    async fn test_publish_then_fetch() {
        let (_, registry) = registry();
        registry.publish("flagship", "rc", item("one")).await.unwrap();
        registry.publish("flagship", "rc", item("two")).await.unwrap();

        let latest = registry.fetch("flagship", "rc").await.unwrap();
        assert_eq!(latest.digest, "two");

        let lock = registry.load().await.unwrap();
        assert!(lock.generated_at.is_some());
        assert_eq!(lock.targets["flagship"].snapshots["rc"].len(), 2);
    }

    #[tokio::test]
    async fn test_publish_over_corrupt_document_starts_fresh() {
        let (store, registry) = registry();
        store
            .put(LOCK_KEY, Bytes::from_static(b"targets: [not, a, map]"))
            .await
            .unwrap();

        registry.publish("flagship", "rc", item("one")).await.unwrap();
        assert_eq!(registry.fetch("flagship", "rc").await.unwrap().digest, "one");
    }

    #[tokio::test]
    async fn test_fetch_without_document_is_not_found() {
        let (_, registry) = registry();
        let err = registry.fetch("flagship", "stable").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_generate_config() {
        let config = SnapshotGenerateConfig::from_yaml(
            "targets:\n  flagship:\n    deployApps: [flagship]\n    command: ./seed.sh\n",
        )
        .unwrap();
        assert_eq!(config.targets["flagship"].command, "./seed.sh");
    }
}
