//! Mocks for collaborator traits defined in sibling crates

use k8s_openapi::api::core::v1::Pod;
use mockall::mock;
use tokio_util::sync::CancellationToken;

use devenv_backup::{Backup, BackupStorageLocation, BackupSystem, Phase, Restore};
use devenv_common::readiness::PodLister;
use devenv_common::Result;

mock! {
    pub BackupSystem {}

    #[async_trait::async_trait]
    impl BackupSystem for BackupSystem {
        async fn get_backup(&self, name: &str) -> Result<Option<Backup>>;
        async fn create_backup(&self, backup: &Backup) -> Result<()>;
        async fn wait_for_backup(&self, name: &str, cancel: &CancellationToken) -> Result<Phase>;
        async fn get_restore(&self, name: &str) -> Result<Option<Restore>>;
        async fn create_restore(&self, restore: &Restore) -> Result<()>;
        async fn delete_restore(&self, name: &str) -> Result<()>;
        async fn wait_for_restore(&self, name: &str, cancel: &CancellationToken) -> Result<Phase>;
        async fn apply_storage_location(&self, location: &BackupStorageLocation) -> Result<()>;
    }
}

mock! {
    pub PodLister {}

    #[async_trait::async_trait]
    impl PodLister for PodLister {
        async fn list_pods(&self) -> Result<Vec<Pod>>;
    }
}
