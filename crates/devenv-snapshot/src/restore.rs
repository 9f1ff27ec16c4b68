//! Restore orchestrator
//!
//! Drives a Velero Restore of a staged snapshot to completion. Velero does
//! not know about the application registry, so the registry is captured
//! before the restore and any application the snapshot lacks is put back
//! afterwards.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use devenv_backup::velero::DEFAULT_RESTORE_EXCLUDED_NAMESPACES;
use devenv_backup::{BackupSystem, Phase, Restore};
use devenv_common::kube_utils::poll_until;
use devenv_common::{Error, Result};

use crate::apps::{reconcile, AppRegistry};

/// Delay between checks while a previous Restore is being deleted
pub const DEFAULT_DELETE_POLL: Duration = Duration::from_secs(5);

/// Upper bound on waiting for a previous Restore to disappear
const DELETE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Result of a restore
#[derive(Clone, Debug, PartialEq)]
pub struct RestoreReport {
    /// Backup that was restored
    pub backup: String,
    /// Terminal phase of the Restore
    pub phase: Phase,
    /// Applications re-inserted into the registry
    pub reinserted_apps: Vec<String>,
}

/// Restores a snapshot backup into the current cluster
pub struct RestoreOrchestrator {
    backups: Arc<dyn BackupSystem>,
    apps: Arc<dyn AppRegistry>,
    excluded_namespaces: Vec<String>,
    delete_poll: Duration,
}

impl RestoreOrchestrator {
    /// Orchestrator excluding the default infrastructure namespaces
    pub fn new(backups: Arc<dyn BackupSystem>, apps: Arc<dyn AppRegistry>) -> Self {
        Self {
            backups,
            apps,
            excluded_namespaces: DEFAULT_RESTORE_EXCLUDED_NAMESPACES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            delete_poll: DEFAULT_DELETE_POLL,
        }
    }

    /// Replace the namespaces left out of the restore
    pub fn with_excluded_namespaces(mut self, namespaces: Vec<String>) -> Self {
        self.excluded_namespaces = namespaces;
        self
    }

    /// Change the delay between checks while deleting a previous Restore
    pub fn with_delete_poll(mut self, interval: Duration) -> Self {
        self.delete_poll = interval;
        self
    }

    /// Restore `backup_id` and reconcile the application registry.
    ///
    /// A terminal phase other than `Completed` is logged, not returned as an
    /// error: a partially failed restore still leaves a usable environment.
    pub async fn restore(&self, backup_id: &str, cancel: &CancellationToken) -> Result<RestoreReport> {
        if self.backups.get_backup(backup_id).await?.is_none() {
            return Err(Error::BackupNotFound {
                name: backup_id.to_string(),
            });
        }

        self.clear_previous_restore(backup_id, cancel).await?;

        let before = match self.apps.list().await {
            Ok(apps) => apps,
            Err(e) => {
                warn!(error = %e, "Failed to read application registry, continuing without it");
                Vec::new()
            }
        };
        if let Err(e) = self.apps.reset().await {
            warn!(error = %e, "Failed to reset application registry");
        }

        let restore = Restore::for_snapshot(backup_id, &self.excluded_namespaces);
        info!(backup = %backup_id, "Creating restore");
        self.backups.create_restore(&restore).await?;

        let phase = self
            .backups
            .wait_for_restore(&restore.metadata.name, cancel)
            .await?;
        if phase == Phase::Completed {
            info!(backup = %backup_id, phase = %phase, "Restore finished");
        } else {
            warn!(backup = %backup_id, phase = %phase, "Restore finished with problems");
        }

        let reinserted_apps = reconcile(&before, self.apps.as_ref()).await?;

        Ok(RestoreReport {
            backup: backup_id.to_string(),
            phase,
            reinserted_apps,
        })
    }

    async fn clear_previous_restore(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let Some(existing) = self.backups.get_restore(name).await? else {
            return Ok(());
        };

        let phase = existing.phase();
        if phase == Phase::InProgress {
            return Err(Error::RestoreInProgress {
                name: name.to_string(),
            });
        }

        info!(restore = %name, phase = %phase, "Deleting previous restore");
        self.backups.delete_restore(name).await?;

        poll_until(
            DELETE_TIMEOUT,
            self.delete_poll,
            format!("restore {} to be deleted", name),
            cancel,
            || async move { Ok(self.backups.get_restore(name).await?.is_none()) },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apps::{App, MemoryAppRegistry};
    use crate::mocks::MockBackupSystem;
    use chrono::Utc;
    use devenv_backup::velero::OperationStatus;
    use devenv_backup::Backup;

    fn app(name: &str, version: &str) -> App {
        App {
            name: name.to_string(),
            version: version.to_string(),
            deployed_at: Utc::now(),
        }
    }

    fn restore_in(phase: Phase) -> Restore {
        let mut restore = Restore::for_snapshot("snap", &[]);
        restore.status = Some(OperationStatus {
            phase,
            ..Default::default()
        });
        restore
    }

    fn with_backup(backups: &mut MockBackupSystem) {
        backups
            .expect_get_backup()
            .returning(|name| Ok(Some(Backup::for_snapshot(name))));
    }

    fn orchestrator(backups: MockBackupSystem, apps: MemoryAppRegistry) -> RestoreOrchestrator {
        RestoreOrchestrator::new(Arc::new(backups), Arc::new(apps))
            .with_delete_poll(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_missing_backup_fails() {
        let mut backups = MockBackupSystem::new();
        backups.expect_get_backup().returning(|_| Ok(None));

        let err = orchestrator(backups, MemoryAppRegistry::new())
            .restore("snap", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BackupNotFound { .. }));
    }

    #[tokio::test]
    async fn test_in_progress_restore_is_a_conflict() {
        let mut backups = MockBackupSystem::new();
        with_backup(&mut backups);
        backups
            .expect_get_restore()
            .returning(|_| Ok(Some(restore_in(Phase::InProgress))));
        backups.expect_delete_restore().never();
        backups.expect_create_restore().never();

        let apps = MemoryAppRegistry::new();
        apps.set(&app("app1", "v1")).await.unwrap();

        let err = orchestrator(backups, apps.clone())
            .restore("snap", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RestoreInProgress { .. }));
        // Registry untouched
        assert_eq!(apps.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_completed_restore_is_replaced_and_registry_reconciled() {
        let apps = MemoryAppRegistry::new();
        apps.set(&app("app1", "v1")).await.unwrap();
        apps.set(&app("app2", "v2")).await.unwrap();

        let mut backups = MockBackupSystem::new();
        with_backup(&mut backups);

        let mut seq = mockall::Sequence::new();
        backups
            .expect_get_restore()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(restore_in(Phase::Completed))));
        backups
            .expect_delete_restore()
            .withf(|name| name == "snap")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        backups
            .expect_get_restore()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(restore_in(Phase::Completed))));
        backups
            .expect_get_restore()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));

        // The snapshot carries app1 at a newer version
        let restored = apps.clone();
        backups
            .expect_create_restore()
            .withf(|r| {
                r.spec.backup_name == "snap"
                    && r.spec.excluded_namespaces.contains(&"kube-system".to_string())
                    && r.spec.restore_pvs == Some(true)
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_| {
                futures::executor::block_on(restored.set(&app("app1", "v3")))?;
                Ok(())
            });
        backups
            .expect_wait_for_restore()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(Phase::Completed));

        let report = orchestrator(backups, apps.clone())
            .restore("snap", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.phase, Phase::Completed);
        assert_eq!(report.reinserted_apps, vec!["app2".to_string()]);

        let mut after = apps.list().await.unwrap();
        after.sort_by(|a, b| a.name.cmp(&b.name));
        let versions: Vec<(&str, &str)> = after
            .iter()
            .map(|a| (a.name.as_str(), a.version.as_str()))
            .collect();
        assert_eq!(versions, vec![("app1", "v3"), ("app2", "v2")]);
    }

    #[tokio::test]
    async fn test_partially_failed_restore_still_reconciles() {
        let apps = MemoryAppRegistry::new();
        apps.set(&app("app1", "v1")).await.unwrap();

        let mut backups = MockBackupSystem::new();
        with_backup(&mut backups);
        backups.expect_get_restore().returning(|_| Ok(None));
        backups.expect_create_restore().returning(|_| Ok(()));
        backups
            .expect_wait_for_restore()
            .returning(|_, _| Ok(Phase::PartiallyFailed));

        let report = orchestrator(backups, apps.clone())
            .restore("snap", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.phase, Phase::PartiallyFailed);
        assert_eq!(report.reinserted_apps, vec!["app1".to_string()]);
    }

    #[tokio::test]
    async fn test_watch_failure_is_fatal() {
        let mut backups = MockBackupSystem::new();
        with_backup(&mut backups);
        backups.expect_get_restore().returning(|_| Ok(None));
        backups.expect_create_restore().returning(|_| Ok(()));
        backups.expect_wait_for_restore().returning(|name, _| {
            Err(Error::WatchClosed {
                kind: "Restore".to_string(),
                name: name.to_string(),
            })
        });

        let err = orchestrator(backups, MemoryAppRegistry::new())
            .restore("snap", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WatchClosed { .. }));
    }
}
