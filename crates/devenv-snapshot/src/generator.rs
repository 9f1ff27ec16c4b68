//! Snapshot generation
//!
//! For every target in `snapshots.yaml`, builds a throwaway environment,
//! deploys the target's applications, backs the cluster up with Velero and
//! publishes an archive of the Velero bucket to the remote snapshot store.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use devenv_backup::velero::backup_name_at;
use devenv_backup::{Backup, BackupSystem, Phase};
use devenv_common::readiness::{wait_for_all_pods_ready, PodLister, ReadinessConfig};
use devenv_common::{Error, Result};

use crate::archive::build_archive;
use crate::lock::{
    LockRegistry, SnapshotGenerateConfig, SnapshotLockListItem, SnapshotTarget, ARCHIVE_PREFIX,
    DEFAULT_GENERATE_CHANNEL,
};
use crate::store::ObjectStore;

/// Clients for a freshly provisioned cluster
pub struct ClusterHandles {
    /// Velero in the cluster
    pub backups: Arc<dyn BackupSystem>,
    /// Pods in the cluster
    pub pods: Arc<dyn PodLister>,
    /// The bucket Velero writes backups to
    pub local_store: Arc<dyn ObjectStore>,
    /// Held until generation of the target finishes (e.g. a port-forward)
    pub keep_alive: Option<Box<dyn Any + Send + Sync>>,
}

/// The environment snapshots are generated in
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Environment: Send + Sync {
    /// Tear down any existing environment
    async fn destroy(&self) -> Result<()>;

    /// Create a fresh environment with only the base infrastructure
    async fn provision_base(&self) -> Result<()>;

    /// Deploy one application
    async fn deploy_app(&self, app: &str) -> Result<()>;

    /// Run a shell command against the environment
    async fn run_command(&self, command: &str) -> Result<()>;

    /// Connect to the environment's cluster
    async fn connect(&self) -> Result<ClusterHandles>;
}

/// Options for a generation run
#[derive(Clone, Debug)]
pub struct GenerateOptions {
    /// Channel snapshots are published to
    pub channel: String,
    /// Create backups but do not upload or publish them
    pub skip_upload: bool,
    /// Directory relative `postRestore` paths are resolved against
    pub base_dir: PathBuf,
    /// How long to wait for the environment to settle before backing up
    pub readiness: ReadinessConfig,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            channel: DEFAULT_GENERATE_CHANNEL.to_string(),
            skip_upload: false,
            base_dir: PathBuf::from("."),
            readiness: ReadinessConfig::default(),
        }
    }
}

/// One generated snapshot
#[derive(Clone, Debug, PartialEq)]
pub struct GeneratedSnapshot {
    /// Target name
    pub target: String,
    /// Velero Backup name
    pub backup_id: String,
    /// Published item; `None` when uploading was skipped
    pub published: Option<SnapshotLockListItem>,
}

/// Generates and publishes snapshots
pub struct SnapshotGenerator {
    env: Arc<dyn Environment>,
    remote: Arc<dyn ObjectStore>,
    lock: LockRegistry,
    last_key_nanos: AtomicU64,
}

impl SnapshotGenerator {
    /// Generator publishing to `remote`
    pub fn new(env: Arc<dyn Environment>, remote: Arc<dyn ObjectStore>) -> Self {
        Self {
            env,
            lock: LockRegistry::new(remote.clone()),
            remote,
            last_key_nanos: AtomicU64::new(0),
        }
    }

    /// Generate every target, in name order
    pub async fn generate(
        &self,
        config: &SnapshotGenerateConfig,
        opts: &GenerateOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<GeneratedSnapshot>> {
        let mut generated = Vec::with_capacity(config.targets.len());
        for (name, target) in &config.targets {
            info!(snapshot_target = %name, "Generating snapshot");
            let snapshot = self.generate_target(name, target, opts, cancel).await?;
            generated.push(snapshot);
        }
        Ok(generated)
    }

    async fn generate_target(
        &self,
        name: &str,
        target: &SnapshotTarget,
        opts: &GenerateOptions,
        cancel: &CancellationToken,
    ) -> Result<GeneratedSnapshot> {
        if let Err(e) = self.env.destroy().await {
            warn!(error = %e, "Failed to destroy existing environment");
        }

        self.env.provision_base().await?;
        for app in &target.deploy_apps {
            info!(app = %app, "Deploying application");
            self.env.deploy_app(app).await?;
        }
        if !target.command.is_empty() {
            info!(command = %target.command, "Running snapshot command");
            self.env.run_command(&target.command).await?;
        }
        for app in &target.post_deploy_apps {
            info!(app = %app, "Deploying post-command application");
            self.env.deploy_app(app).await?;
        }

        let handles = self.env.connect().await?;
        wait_for_all_pods_ready(handles.pods.as_ref(), &opts.readiness, cancel).await?;

        let backup = Backup::for_snapshot(backup_name_at(Utc::now()));
        let backup_id = backup.metadata.name.clone();
        info!(backup = %backup_id, "Creating backup");
        handles.backups.create_backup(&backup).await?;

        let phase = handles.backups.wait_for_backup(&backup_id, cancel).await?;
        match phase {
            Phase::Completed => info!(backup = %backup_id, "Backup completed"),
            Phase::PartiallyFailed => {
                warn!(backup = %backup_id, phase = %phase, "Backup finished with errors")
            }
            _ => {
                return Err(Error::internal_with_context(
                    "generate_snapshot",
                    format!("backup {} finished in phase {}", backup_id, phase),
                ))
            }
        }

        if opts.skip_upload {
            info!(backup = %backup_id, "Skipping upload");
            return Ok(GeneratedSnapshot {
                target: name.to_string(),
                backup_id,
                published: None,
            });
        }

        let post_restore = (!target.post_restore.is_empty())
            .then(|| resolve(&opts.base_dir, &target.post_restore));
        let archive = build_archive(handles.local_store.as_ref(), post_restore.as_deref()).await?;

        let key = self.next_archive_key(name);
        info!(key = %key, size = archive.size, "Uploading snapshot");
        self.remote
            .put_file(&key, archive.path(), &archive.digest)
            .await?;

        let item = SnapshotLockListItem {
            digest: archive.digest.clone(),
            uri: key,
            config: target.clone(),
            backup_id: backup_id.clone(),
        };
        self.lock.publish(name, &opts.channel, item.clone()).await?;
        drop(handles);

        Ok(GeneratedSnapshot {
            target: name.to_string(),
            backup_id,
            published: Some(item),
        })
    }

    /// `automated-snapshots/v2/<target>/<unix-nanos>.tar`, strictly
    /// increasing within this generator
    fn next_archive_key(&self, target: &str) -> String {
        let now = Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .max(0) as u64;
        let prev = self
            .last_key_nanos
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_default();
        let nanos = now.max(prev + 1);
        format!("{}/{}/{}.tar", ARCHIVE_PREFIX, target, nanos)
    }
}

fn resolve(base: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::content_md5;
    use crate::mocks::{MockBackupSystem, MockPodLister};
    use crate::store::MemoryStore;
    use bytes::Bytes;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;

    fn opts(skip_upload: bool) -> GenerateOptions {
        GenerateOptions {
            skip_upload,
            readiness: ReadinessConfig {
                timeout: Duration::from_secs(1),
                interval: Duration::from_millis(1),
                exempt_prefixes: vec![],
            },
            ..Default::default()
        }
    }

    fn config(target: SnapshotTarget) -> SnapshotGenerateConfig {
        SnapshotGenerateConfig {
            targets: BTreeMap::from([("flagship".to_string(), target)]),
        }
    }

    /// Backup system that records created backup names
    fn backups(created: Arc<Mutex<Vec<String>>>, phase: Phase) -> MockBackupSystem {
        let mut backups = MockBackupSystem::new();
        backups
            .expect_create_backup()
            .withf(|b| {
                b.spec.excluded_namespaces == vec!["velero".to_string(), "minio".to_string()]
                    && b.spec.excluded_resources == vec!["HelmChart".to_string()]
                    && b.spec.include_cluster_resources == Some(true)
            })
            .returning(move |b| {
                created.lock().unwrap().push(b.metadata.name.clone());
                Ok(())
            });
        backups
            .expect_wait_for_backup()
            .returning(move |_, _| Ok(phase.clone()));
        backups
    }

    async fn velero_bucket() -> MemoryStore {
        let store = MemoryStore::new("velero");
        store
            .put("backups/b/velero-backup.json", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        store
    }

    fn connected(env: &mut MockEnvironment, local: MemoryStore, backups: MockBackupSystem) {
        let backups = Arc::new(backups);
        env.expect_connect().times(1).returning(move || {
            let mut pods = MockPodLister::new();
            pods.expect_list_pods().returning(|| Ok(vec![]));
            Ok(ClusterHandles {
                backups: backups.clone(),
                pods: Arc::new(pods),
                local_store: Arc::new(local.clone()),
                keep_alive: None,
            })
        });
    }

    #[tokio::test]
    async fn test_generate_runs_steps_in_order_and_publishes() {
        let mut env = MockEnvironment::new();
        let mut seq = mockall::Sequence::new();
        env.expect_destroy()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(Error::internal("no cluster")));
        env.expect_provision_base()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        for app in ["app1", "app2"] {
            env.expect_deploy_app()
                .withf(move |a| a == app)
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(()));
        }
        env.expect_run_command()
            .withf(|c| c == "./seed.sh")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        env.expect_deploy_app()
            .withf(|a| a == "late")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let created = Arc::new(Mutex::new(Vec::new()));
        connected(
            &mut env,
            velero_bucket().await,
            backups(created.clone(), Phase::Completed),
        );

        let remote = MemoryStore::new("snapshots");
        let generator = SnapshotGenerator::new(Arc::new(env), Arc::new(remote.clone()));
        let target = SnapshotTarget {
            deploy_apps: vec!["app1".to_string(), "app2".to_string()],
            post_deploy_apps: vec!["late".to_string()],
            command: "./seed.sh".to_string(),
            ..Default::default()
        };

        let generated = generator
            .generate(&config(target.clone()), &opts(false), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(generated.len(), 1);
        let item = generated[0].published.clone().unwrap();

        assert_eq!(item.backup_id, created.lock().unwrap()[0]);
        assert_eq!(item.config, target);
        assert!(item.uri.starts_with("automated-snapshots/v2/flagship/"));
        assert!(item.uri.ends_with(".tar"));

        let uploaded = remote.get(&item.uri).await.unwrap();
        assert_eq!(item.digest, content_md5(&uploaded));

        let latest = LockRegistry::new(Arc::new(remote))
            .fetch("flagship", DEFAULT_GENERATE_CHANNEL)
            .await
            .unwrap();
        assert_eq!(latest, item);
    }

    #[tokio::test]
    async fn test_skip_upload_publishes_nothing() {
        let mut env = MockEnvironment::new();
        env.expect_destroy().returning(|| Ok(()));
        env.expect_provision_base().returning(|| Ok(()));
        connected(
            &mut env,
            velero_bucket().await,
            backups(Arc::new(Mutex::new(Vec::new())), Phase::Completed),
        );

        let remote = MemoryStore::new("snapshots");
        let generator = SnapshotGenerator::new(Arc::new(env), Arc::new(remote.clone()));
        let generated = generator
            .generate(
                &config(SnapshotTarget::default()),
                &opts(true),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(generated[0].published.is_none());
        assert!(remote.contents().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_deploy_aborts_before_backup() {
        let mut env = MockEnvironment::new();
        env.expect_destroy().returning(|| Ok(()));
        env.expect_provision_base().returning(|| Ok(()));
        env.expect_deploy_app()
            .returning(|app| Err(Error::command(format!("deploy {}", app), "exit 1")));
        env.expect_connect().never();

        let generator =
            SnapshotGenerator::new(Arc::new(env), Arc::new(MemoryStore::new("snapshots")));
        let target = SnapshotTarget {
            deploy_apps: vec!["broken".to_string()],
            ..Default::default()
        };
        let err = generator
            .generate(&config(target), &opts(false), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Command { .. }));
    }

    #[tokio::test]
    async fn test_failed_backup_is_not_uploaded() {
        let mut env = MockEnvironment::new();
        env.expect_destroy().returning(|| Ok(()));
        env.expect_provision_base().returning(|| Ok(()));
        connected(
            &mut env,
            velero_bucket().await,
            backups(Arc::new(Mutex::new(Vec::new())), Phase::Failed),
        );

        let remote = MemoryStore::new("snapshots");
        let generator = SnapshotGenerator::new(Arc::new(env), Arc::new(remote.clone()));
        assert!(generator
            .generate(
                &config(SnapshotTarget::default()),
                &opts(false),
                &CancellationToken::new()
            )
            .await
            .is_err());
        assert!(remote.contents().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_post_restore_template_is_archived() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("post-restore.yaml"), "kind: ConfigMap\n").unwrap();

        let mut env = MockEnvironment::new();
        env.expect_destroy().returning(|| Ok(()));
        env.expect_provision_base().returning(|| Ok(()));
        connected(
            &mut env,
            velero_bucket().await,
            backups(Arc::new(Mutex::new(Vec::new())), Phase::Completed),
        );

        let remote = MemoryStore::new("snapshots");
        let generator = SnapshotGenerator::new(Arc::new(env), Arc::new(remote.clone()));
        let target = SnapshotTarget {
            post_restore: "./post-restore.yaml".to_string(),
            ..Default::default()
        };
        let opts = GenerateOptions {
            base_dir: dir.path().to_path_buf(),
            ..opts(false)
        };
        let generated = generator
            .generate(&config(target), &opts, &CancellationToken::new())
            .await
            .unwrap();
        let item = generated[0].published.clone().unwrap();

        let archive = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(archive.path(), remote.get(&item.uri).await.unwrap()).unwrap();
        let dest = MemoryStore::new("velero-restore");
        let keys = crate::archive::extract_archive(archive.path(), &dest)
            .await
            .unwrap();
        assert!(keys.contains(&crate::archive::POST_RESTORE_KEY.to_string()));
    }

    #[test]
    fn test_archive_keys_strictly_increase() {
        let generator = SnapshotGenerator::new(
            Arc::new(MockEnvironment::new()),
            Arc::new(MemoryStore::new("snapshots")),
        );
        let keys: Vec<u64> = (0..100)
            .map(|_| {
                let key = generator.next_archive_key("flagship");
                key.trim_start_matches("automated-snapshots/v2/flagship/")
                    .trim_end_matches(".tar")
                    .parse()
                    .unwrap()
            })
            .collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }
}
