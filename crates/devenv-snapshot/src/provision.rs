//! Provisioning from a snapshot
//!
//! Runs the stager as a Job in the new cluster, points Velero at the staged
//! bucket, restores the backup and then finishes the environment: renders
//! the post-restore manifests, removes pods stuck on restored volumes,
//! reissues certificates and waits for every pod to become ready.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec};
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use devenv_backup::{wait_for_backup_visible, BackupStorageLocation, BackupSystem};
use devenv_common::kube_utils::{poll_until, LABEL_MANAGED_BY, LABEL_MANAGED_BY_DEVENV};
use devenv_common::readiness::{wait_for_all_pods_ready, PodLister, ReadinessConfig};
use devenv_common::retry::BackoffConfig;
use devenv_common::{Error, Result, DEVENV_NAMESPACE};

use crate::apps::AppRegistry;
use crate::certs::{renew_certificates, CertificateRenewer, RENEW_RETRY_INTERVAL};
use crate::cleanup::{purge_restic_wait_pods, PodDeleter};
use crate::handoff::HandoffStore;
use crate::post_restore::{apply_post_restore, default_apply_backoff, ManifestApplier, TemplateValues};
use crate::restore::{RestoreOrchestrator, RestoreReport, DEFAULT_DELETE_POLL};
use crate::stager::{StageConfig, CONFIG_ENV};

/// Service account the stage Job runs as
pub const STAGE_SERVICE_ACCOUNT: &str = "snapshot";

/// Path of the stager binary in its image
pub const STAGER_COMMAND: &str = "/usr/local/bin/snapshot-stager";

/// Retries of the stage Job's pod
const STAGE_BACKOFF_LIMIT: i32 = 5;

/// How long staging may take
const STAGE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Runs the stager in the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StageRunner: Send + Sync {
    /// Stage the snapshot selected by `config` and wait for it to finish
    async fn run_stage(&self, config: &StageConfig, cancel: &CancellationToken) -> Result<()>;
}

/// [`StageRunner`] running the stager as a Kubernetes Job
pub struct JobStageRunner {
    client: Client,
    image: String,
    poll_interval: Duration,
}

impl JobStageRunner {
    /// Runner using the given stager image
    pub fn new(client: Client, image: impl Into<String>) -> Self {
        Self {
            client,
            image: image.into(),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// The stage Job for `config`
pub fn stage_job(image: &str, config: &StageConfig) -> Result<Job> {
    let config_json = serde_json::to_string(config)?;
    Ok(Job {
        metadata: ObjectMeta {
            generate_name: Some("snapshot-stage-".to_string()),
            namespace: Some(DEVENV_NAMESPACE.to_string()),
            labels: Some(BTreeMap::from([(
                LABEL_MANAGED_BY.to_string(),
                LABEL_MANAGED_BY_DEVENV.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(STAGE_BACKOFF_LIMIT),
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    service_account_name: Some(STAGE_SERVICE_ACCOUNT.to_string()),
                    restart_policy: Some("OnFailure".to_string()),
                    containers: vec![Container {
                        name: "snapshot-stage".to_string(),
                        image: Some(image.to_string()),
                        command: Some(vec![STAGER_COMMAND.to_string()]),
                        env: Some(vec![EnvVar {
                            name: CONFIG_ENV.to_string(),
                            value: Some(config_json),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

/// `Some(true)` once the Job succeeded, `Some(false)` once it failed
pub fn job_finished(job: &Job) -> Option<bool> {
    let status = job.status.as_ref()?;
    if status.succeeded.unwrap_or(0) > 0 {
        return Some(true);
    }
    let failed = status.conditions.as_ref().is_some_and(|conditions| {
        conditions
            .iter()
            .any(|c| c.type_ == "Failed" && c.status == "True")
    });
    failed.then_some(false)
}

#[async_trait]
impl StageRunner for JobStageRunner {
    async fn run_stage(&self, config: &StageConfig, cancel: &CancellationToken) -> Result<()> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), DEVENV_NAMESPACE);
        let job = api
            .create(&PostParams::default(), &stage_job(&self.image, config)?)
            .await?;
        let name = job
            .metadata
            .name
            .ok_or_else(|| Error::internal_with_context("run_stage", "created Job has no name"))?;
        info!(job = %name, "Waiting for snapshot to be staged");

        let jobs = &api;
        let job_name = name.as_str();
        poll_until(
            STAGE_TIMEOUT,
            self.poll_interval,
            format!("job {} to complete", name),
            cancel,
            || async move { Ok(job_finished(&jobs.get(job_name).await?).is_some()) },
        )
        .await?;

        if job_finished(&api.get(&name).await?) == Some(false) {
            return Err(Error::internal_with_context(
                "run_stage",
                format!("job {} failed, see its pod logs", name),
            ));
        }
        info!(job = %name, "Snapshot staged");
        Ok(())
    }
}

/// Timing of the provisioning steps
#[derive(Clone, Debug)]
pub struct ProvisionSettings {
    /// Waiting for Velero to sync the staged backup
    pub backup_visibility: BackoffConfig,
    /// Applying post-restore manifests
    pub apply: BackoffConfig,
    /// Delay between certificate renewal attempts
    pub renew_interval: Duration,
    /// Delay between checks while deleting a previous restore
    pub delete_poll: Duration,
    /// Final readiness wait
    pub readiness: ReadinessConfig,
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            backup_visibility: BackoffConfig::new(Duration::from_secs(10), 10),
            apply: default_apply_backoff(),
            renew_interval: RENEW_RETRY_INTERVAL,
            delete_poll: DEFAULT_DELETE_POLL,
            readiness: ReadinessConfig::with_timeout(Duration::from_secs(20 * 60)),
        }
    }
}

/// Collaborators used while provisioning
#[derive(Clone)]
pub struct ProvisionClients {
    /// Runs the stager
    pub stage: Arc<dyn StageRunner>,
    /// Reads the stager's record
    pub handoff: Arc<dyn HandoffStore>,
    /// Velero
    pub backups: Arc<dyn BackupSystem>,
    /// Application registry
    pub apps: Arc<dyn AppRegistry>,
    /// Applies post-restore manifests
    pub applier: Arc<dyn ManifestApplier>,
    /// Lists pods
    pub pods: Arc<dyn PodLister>,
    /// Deletes pods
    pub deleter: Arc<dyn PodDeleter>,
    /// Reissues certificates
    pub certs: Arc<dyn CertificateRenewer>,
}

/// Provisions an environment from a snapshot
pub struct SnapshotProvisioner {
    clients: ProvisionClients,
    settings: ProvisionSettings,
}

impl SnapshotProvisioner {
    /// Provisioner with default timings
    pub fn new(clients: ProvisionClients) -> Self {
        Self::with_settings(clients, ProvisionSettings::default())
    }

    /// Provisioner with custom timings
    pub fn with_settings(clients: ProvisionClients, settings: ProvisionSettings) -> Self {
        Self { clients, settings }
    }

    /// Stage the snapshot selected by `stage`, then restore it
    pub async fn provision(
        &self,
        stage: &StageConfig,
        values: &TemplateValues,
        cancel: &CancellationToken,
    ) -> Result<RestoreReport> {
        self.clients
            .stage
            .run_stage(stage, cancel)
            .await
            .map_err(|e| e.in_step("Stage"))?;
        self.restore_staged(values, cancel).await
    }

    /// Restore the snapshot already staged in the cluster
    pub async fn restore_staged(
        &self,
        values: &TemplateValues,
        cancel: &CancellationToken,
    ) -> Result<RestoreReport> {
        let record = self
            .clients
            .handoff
            .read()
            .await
            .and_then(|r| {
                r.ok_or_else(|| Error::validation("no staged snapshot found in the cluster"))
            })
            .map_err(|e| e.in_step("LoadSnapshot"))?;
        let backup_id = record.item.backup_id.as_str();

        info!("Creating snapshot storage location");
        self.clients
            .backups
            .apply_storage_location(&BackupStorageLocation::for_restore())
            .await
            .map_err(|e| e.in_step("CreateStorageLocation"))?;
        wait_for_backup_visible(
            self.clients.backups.as_ref(),
            backup_id,
            &self.settings.backup_visibility,
            cancel,
        )
        .await
        .map_err(|e| e.in_step("WaitForBackup"))?;

        let report = RestoreOrchestrator::new(self.clients.backups.clone(), self.clients.apps.clone())
            .with_delete_poll(self.settings.delete_poll)
            .restore(backup_id, cancel)
            .await
            .map_err(|e| e.in_step("Restore"))?;

        if let Some(template) = record
            .post_restore_manifests()
            .map_err(|e| e.in_step("PostRestore"))?
        {
            apply_post_restore(
                self.clients.applier.as_ref(),
                &template,
                values,
                &self.settings.apply,
                cancel,
            )
            .await
            .map_err(|e| e.in_step("PostRestore"))?;
        }

        purge_restic_wait_pods(self.clients.pods.as_ref(), self.clients.deleter.as_ref()).await;

        renew_certificates(self.clients.certs.as_ref(), self.settings.renew_interval, cancel)
            .await
            .map_err(|e| e.in_step("RenewCertificates"))?;

        if let Err(e) =
            wait_for_all_pods_ready(self.clients.pods.as_ref(), &self.settings.readiness, cancel).await
        {
            warn!(error = %e, "Environment did not become ready");
            return Err(e.in_step("WaitForReady"));
        }

        info!(backup = %backup_id, "Provisioned from snapshot");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apps::MemoryAppRegistry;
    use crate::certs::MockCertificateRenewer;
    use crate::cleanup::MockPodDeleter;
    use crate::handoff::{MockHandoffStore, SnapshotRecord};
    use crate::lock::{SnapshotLockListItem, SnapshotTarget};
    use crate::mocks::{MockBackupSystem, MockPodLister};
    use crate::post_restore::MockManifestApplier;
    use crate::runtime::{RuntimeConfig, RuntimeType};
    use devenv_backup::{Backup, Phase};
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};

    fn values() -> TemplateValues {
        TemplateValues {
            user: "jdoe".to_string(),
            email: "jdoe@example.com".to_string(),
            cluster_runtime: RuntimeConfig {
                name: "kind".to_string(),
                runtime_type: RuntimeType::Local,
            },
        }
    }

    fn record(manifests: Option<&str>) -> SnapshotRecord {
        SnapshotRecord::new(
            SnapshotLockListItem {
                digest: "d".to_string(),
                uri: "automated-snapshots/v2/flagship/1.tar".to_string(),
                config: SnapshotTarget::default(),
                backup_id: "snap-1".to_string(),
            },
            manifests.map(str::as_bytes),
        )
        .unwrap()
    }

    fn settings() -> ProvisionSettings {
        ProvisionSettings {
            backup_visibility: BackoffConfig::new(Duration::from_millis(1), 3),
            apply: BackoffConfig::new(Duration::from_millis(1), 5),
            renew_interval: Duration::from_millis(1),
            delete_poll: Duration::from_millis(1),
            readiness: ReadinessConfig {
                timeout: Duration::from_millis(50),
                interval: Duration::from_millis(1),
                exempt_prefixes: vec![],
            },
        }
    }

    struct Mocks {
        stage: MockStageRunner,
        handoff: MockHandoffStore,
        backups: MockBackupSystem,
        applier: MockManifestApplier,
        pods: MockPodLister,
        deleter: MockPodDeleter,
        certs: MockCertificateRenewer,
    }

    impl Mocks {
        /// Everything succeeds for a staged record
        fn happy(record: SnapshotRecord) -> Self {
            let mut stage = MockStageRunner::new();
            stage.expect_run_stage().returning(|_, _| Ok(()));

            let mut handoff = MockHandoffStore::new();
            handoff
                .expect_read()
                .returning(move || Ok(Some(record.clone())));

            let mut backups = MockBackupSystem::new();
            backups
                .expect_apply_storage_location()
                .withf(|bsl| bsl.spec.object_storage.bucket == "velero-restore")
                .returning(|_| Ok(()));
            backups
                .expect_get_backup()
                .returning(|name| Ok(Some(Backup::for_snapshot(name))));
            backups.expect_get_restore().returning(|_| Ok(None));
            backups
                .expect_create_restore()
                .withf(|r| r.spec.backup_name == "snap-1")
                .returning(|_| Ok(()));
            backups
                .expect_wait_for_restore()
                .returning(|_, _| Ok(Phase::Completed));

            let mut pods = MockPodLister::new();
            pods.expect_list_pods().returning(|| Ok(vec![]));

            let mut certs = MockCertificateRenewer::new();
            certs.expect_renew_all().returning(|| Ok(2));

            Self {
                stage,
                handoff,
                backups,
                applier: MockManifestApplier::new(),
                pods,
                deleter: MockPodDeleter::new(),
                certs,
            }
        }

        fn provisioner(self) -> SnapshotProvisioner {
            SnapshotProvisioner::with_settings(
                ProvisionClients {
                    stage: Arc::new(self.stage),
                    handoff: Arc::new(self.handoff),
                    backups: Arc::new(self.backups),
                    apps: Arc::new(MemoryAppRegistry::new()),
                    applier: Arc::new(self.applier),
                    pods: Arc::new(self.pods),
                    deleter: Arc::new(self.deleter),
                    certs: Arc::new(self.certs),
                },
                settings(),
            )
        }
    }

    #[tokio::test]
    async fn test_provision_restores_staged_backup() {
        let mut mocks = Mocks::happy(record(Some("owner: [[ .Email ]]\n")));
        mocks
            .applier
            .expect_apply()
            .withf(|m| m == "owner: jdoe@example.com\n")
            .times(1)
            .returning(|_| Ok(()));

        let report = mocks
            .provisioner()
            .provision(&StageConfig::default(), &values(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.backup, "snap-1");
        assert_eq!(report.phase, Phase::Completed);
    }

    #[tokio::test]
    async fn test_missing_record_fails() {
        let mut mocks = Mocks::happy(record(None));
        mocks.handoff = MockHandoffStore::new();
        mocks.handoff.expect_read().returning(|| Ok(None));

        let err = mocks
            .provisioner()
            .restore_staged(&values(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.context(), Some("LoadSnapshot"));
    }

    #[tokio::test]
    async fn test_stage_failure_stops_provisioning() {
        let mut mocks = Mocks::happy(record(None));
        mocks.stage = MockStageRunner::new();
        mocks
            .stage
            .expect_run_stage()
            .returning(|_, _| Err(Error::internal("job failed")));
        mocks.handoff = MockHandoffStore::new();
        mocks.handoff.expect_read().never();

        let err = mocks
            .provisioner()
            .provision(&StageConfig::default(), &values(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.context(), Some("Stage"));
    }

    #[tokio::test]
    async fn test_backup_never_synced() {
        let mut mocks = Mocks::happy(record(None));
        mocks.backups = MockBackupSystem::new();
        mocks
            .backups
            .expect_apply_storage_location()
            .returning(|_| Ok(()));
        mocks.backups.expect_get_backup().times(3).returning(|_| Ok(None));
        mocks.backups.expect_create_restore().never();

        let err = mocks
            .provisioner()
            .restore_staged(&values(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.context(), Some("WaitForBackup"));
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_unready_pods_fail_after_timeout() {
        use k8s_openapi::api::core::v1::{Pod, PodStatus};

        let mut mocks = Mocks::happy(record(None));
        mocks.pods = MockPodLister::new();
        mocks.pods.expect_list_pods().returning(|| {
            Ok(vec![Pod {
                metadata: ObjectMeta {
                    name: Some("web-0".to_string()),
                    namespace: Some("apps".to_string()),
                    ..Default::default()
                },
                status: Some(PodStatus {
                    phase: Some("Pending".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }])
        });

        let err = mocks
            .provisioner()
            .restore_staged(&values(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.context(), Some("WaitForReady"));
        assert!(matches!(err.root(), Error::PodsNotReady { .. }));
    }

    #[test]
    fn test_stage_job_shape() {
        let config = StageConfig::default();
        let job = stage_job("devenv/snapshot-stager:latest", &config).unwrap();
        assert_eq!(job.metadata.generate_name.as_deref(), Some("snapshot-stage-"));

        let spec = job.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(5));
        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.service_account_name.as_deref(), Some("snapshot"));
        assert_eq!(pod.restart_policy.as_deref(), Some("OnFailure"));

        let env = pod.containers[0].env.clone().unwrap();
        assert_eq!(env[0].name, "CONFIG");
        let parsed = StageConfig::from_json(env[0].value.as_deref().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_job_finished() {
        let mut job = Job::default();
        assert_eq!(job_finished(&job), None);

        job.status = Some(JobStatus {
            succeeded: Some(1),
            ..Default::default()
        });
        assert_eq!(job_finished(&job), Some(true));

        job.status = Some(JobStatus {
            failed: Some(6),
            conditions: Some(vec![JobCondition {
                type_: "Failed".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert_eq!(job_finished(&job), Some(false));
    }
}
