//! The local environment snapshots are generated in

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use kube::Client;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::info;

use devenv_backup::VeleroClient;
use devenv_common::kube_utils::{apply_manifests, create_client};
use devenv_common::readiness::PodListerImpl;
use devenv_common::{Error, Result};
use devenv_snapshot::generator::ClusterHandles;
use devenv_snapshot::runtime::ClusterRuntime;
use devenv_snapshot::{Environment, S3Store};

use super::port_forward::PortForward;
use crate::config::DevenvConfig;

/// [`Environment`] backed by a cluster runtime on this machine
pub struct LocalEnvironment {
    runtime: Arc<dyn ClusterRuntime>,
    config: DevenvConfig,
    cancel: CancellationToken,
}

impl LocalEnvironment {
    /// Environment on `runtime`
    pub fn new(runtime: Arc<dyn ClusterRuntime>, config: DevenvConfig, cancel: CancellationToken) -> Self {
        Self {
            runtime,
            config,
            cancel,
        }
    }

    async fn shell(&self, script: &str, args: &[&str]) -> Result<()> {
        let kubeconfig = self.runtime.kubeconfig().await?;
        run_shell(script, args, &kubeconfig).await
    }
}

#[async_trait]
impl Environment for LocalEnvironment {
    async fn destroy(&self) -> Result<()> {
        self.runtime.destroy().await
    }

    async fn provision_base(&self) -> Result<()> {
        create_base_cluster(self.runtime.as_ref(), &self.config.base_manifests).await?;
        Ok(())
    }

    async fn deploy_app(&self, app: &str) -> Result<()> {
        // app name arrives as $1
        let script = format!("{} \"$1\"", self.config.deploy_app_command);
        self.shell(&script, &[app]).await
    }

    async fn run_command(&self, command: &str) -> Result<()> {
        self.shell(command, &[]).await
    }

    async fn connect(&self) -> Result<ClusterHandles> {
        let kubeconfig = self.runtime.kubeconfig().await?;
        let client = create_client(Some(&kubeconfig)).await?;
        let forward = PortForward::minio(&kubeconfig, self.config.minio.local_port, &self.cancel)
            .await
            .map_err(|e| Error::command("kubectl port-forward", e.to_string()))?;

        Ok(ClusterHandles {
            backups: Arc::new(VeleroClient::new(client.clone())),
            pods: Arc::new(PodListerImpl::new(client)),
            local_store: Arc::new(S3Store::from_config(&self.config.minio.local())),
            keep_alive: Some(Box::new(forward)),
        })
    }
}

/// Create a cluster on `runtime` and install the base manifests.
///
/// Returns a client for the new cluster.
pub async fn create_base_cluster(runtime: &dyn ClusterRuntime, manifests_dir: &Path) -> Result<Client> {
    runtime.pre_create().await?;
    runtime.create().await?;
    let kubeconfig = runtime.kubeconfig().await?;
    let client = create_client(Some(&kubeconfig)).await?;
    apply_base_manifests(&client, manifests_dir).await?;
    Ok(client)
}

/// Apply every `*.yaml`/`*.yml` file in `dir`, in file name order
pub async fn apply_base_manifests(client: &Client, dir: &Path) -> Result<usize> {
    let files = manifest_files(dir)?;
    for file in &files {
        info!(manifest = %file.display(), "Applying base manifest");
        let contents = tokio::fs::read_to_string(file).await?;
        apply_manifests(client, &contents).await?;
    }
    Ok(files.len())
}

/// YAML files directly inside `dir`, sorted by name
pub fn manifest_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e == "yaml" || e == "yml")
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Run `script` with `sh -c`, `args` as its positional parameters and
/// `KUBECONFIG` pointing at the environment
pub async fn run_shell(script: &str, args: &[&str], kubeconfig: &Path) -> Result<()> {
    info!(command = %script, "Running command");
    let status = Command::new("sh")
        .arg("-c")
        .arg(script)
        .arg("devenv")
        .args(args)
        .env("KUBECONFIG", kubeconfig)
        .status()
        .await?;
    if !status.success() {
        return Err(Error::command(script, format!("exited with {}", status)));
    }
    Ok(())
}
