//! Backup system client
//!
//! [`BackupSystem`] is the seam between the snapshot pipelines and Velero.
//! [`VeleroClient`] implements it against the Kubernetes API using dynamic
//! objects, so no Velero CRD types need to be generated.

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use devenv_common::kube_utils::HasApiResource;
use devenv_common::retry::{backoff, BackoffConfig};
use devenv_common::{Error, Result, FIELD_MANAGER, VELERO_NAMESPACE};

use crate::velero::{Backup, BackupStorageLocation, Phase, Restore};
use crate::watch::wait_for_terminal_phase;

/// Operations the snapshot lifecycle needs from the backup system
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BackupSystem: Send + Sync {
    /// Get a backup by name, `None` if it does not exist
    async fn get_backup(&self, name: &str) -> Result<Option<Backup>>;

    /// Create a backup
    async fn create_backup(&self, backup: &Backup) -> Result<()>;

    /// Block until the backup reaches a terminal phase
    async fn wait_for_backup(&self, name: &str, cancel: &CancellationToken) -> Result<Phase>;

    /// Get a restore by name, `None` if it does not exist
    async fn get_restore(&self, name: &str) -> Result<Option<Restore>>;

    /// Create a restore
    async fn create_restore(&self, restore: &Restore) -> Result<()>;

    /// Delete a restore (the object may linger while finalizers run)
    async fn delete_restore(&self, name: &str) -> Result<()>;

    /// Block until the restore reaches a terminal phase
    async fn wait_for_restore(&self, name: &str, cancel: &CancellationToken) -> Result<Phase>;

    /// Create or update a storage location
    async fn apply_storage_location(&self, location: &BackupStorageLocation) -> Result<()>;
}

/// [`BackupSystem`] backed by Velero resources in a Kubernetes cluster
pub struct VeleroClient {
    client: Client,
    namespace: String,
}

impl VeleroClient {
    /// Client for Velero installed in the default `velero` namespace
    pub fn new(client: Client) -> Self {
        Self::with_namespace(client, VELERO_NAMESPACE)
    }

    /// Client for Velero installed in a custom namespace
    pub fn with_namespace(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn api<T: HasApiResource>(&self) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &self.namespace, &T::api_resource())
    }

    async fn get<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: HasApiResource + DeserializeOwned,
    {
        match self.api::<T>().get_opt(name).await? {
            Some(obj) => Ok(Some(serde_json::from_value(serde_json::to_value(obj)?)?)),
            None => Ok(None),
        }
    }

    async fn create<T>(&self, resource: &T, name: &str) -> Result<()>
    where
        T: HasApiResource + Serialize,
    {
        let obj: DynamicObject = serde_json::from_value(serde_json::to_value(resource)?)?;
        self.api::<T>().create(&PostParams::default(), &obj).await?;
        info!(kind = %T::KIND, name = %name, "Created Velero resource");
        Ok(())
    }
}

#[async_trait]
impl BackupSystem for VeleroClient {
    async fn get_backup(&self, name: &str) -> Result<Option<Backup>> {
        self.get::<Backup>(name).await
    }

    async fn create_backup(&self, backup: &Backup) -> Result<()> {
        self.create(backup, &backup.metadata.name).await
    }

    async fn wait_for_backup(&self, name: &str, cancel: &CancellationToken) -> Result<Phase> {
        wait_for_terminal_phase(self.api::<Backup>(), Backup::KIND, name, cancel).await
    }

    async fn get_restore(&self, name: &str) -> Result<Option<Restore>> {
        self.get::<Restore>(name).await
    }

    async fn create_restore(&self, restore: &Restore) -> Result<()> {
        self.create(restore, &restore.metadata.name).await
    }

    async fn delete_restore(&self, name: &str) -> Result<()> {
        match self
            .api::<Restore>()
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(name = %name, "Restore already gone");
                Ok(())
            }
            Err(e) => Err(Error::from(e)),
        }
    }

    async fn wait_for_restore(&self, name: &str, cancel: &CancellationToken) -> Result<Phase> {
        wait_for_terminal_phase(self.api::<Restore>(), Restore::KIND, name, cancel).await
    }

    async fn apply_storage_location(&self, location: &BackupStorageLocation) -> Result<()> {
        let value = serde_json::to_value(location)?;
        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.api::<BackupStorageLocation>()
            .patch(&location.metadata.name, &params, &Patch::Apply(&value))
            .await?;
        info!(name = %location.metadata.name, "Applied BackupStorageLocation");
        Ok(())
    }
}

/// Wait until a backup synced from a storage location becomes visible.
///
/// Velero discovers backups in a new storage location on its own sync
/// period, so the backup may not exist yet right after the location is
/// created.
pub async fn wait_for_backup_visible(
    backups: &dyn BackupSystem,
    name: &str,
    config: &BackoffConfig,
    cancel: &CancellationToken,
) -> Result<Backup> {
    let backup = backoff(config, "wait_for_backup_visible", cancel, || async move {
        backups.get_backup(name).await?.ok_or_else(|| Error::BackupNotFound {
            name: name.to_string(),
        })
    })
    .await?;
    Ok(backup)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fast() -> BackoffConfig {
        BackoffConfig::new(Duration::from_millis(1), 3)
    }

    #[tokio::test]
    async fn test_backup_visible_after_sync() {
        let mut backups = MockBackupSystem::new();
        let mut seq = mockall::Sequence::new();
        backups
            .expect_get_backup()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));
        backups
            .expect_get_backup()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|name| Ok(Some(Backup::for_snapshot(name))));

        let backup = wait_for_backup_visible(&backups, "snap", &fast(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(backup.metadata.name, "snap");
    }

    #[tokio::test]
    async fn test_backup_never_visible() {
        let mut backups = MockBackupSystem::new();
        backups.expect_get_backup().times(3).returning(|_| Ok(None));

        let err = wait_for_backup_visible(&backups, "snap", &fast(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AttemptsExhausted { attempts: 3, .. }));
        assert!(err.is_not_found());
    }
}
