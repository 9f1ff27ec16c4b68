//! Kubernetes runtimes
//!
//! A runtime creates and destroys the cluster a devenv runs in. Runtimes are
//! collected into a [`RuntimeRegistry`] built once at startup and passed to
//! whatever needs to pick one.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use devenv_common::{Error, Result};

/// Where a runtime's cluster runs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RuntimeType {
    /// On the developer's machine
    Local,
    /// On shared infrastructure
    Remote,
}

impl fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeType::Local => write!(f, "local"),
            RuntimeType::Remote => write!(f, "remote"),
        }
    }
}

/// Static description of a runtime
#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeConfig {
    /// Runtime name, e.g. `kind`
    pub name: String,
    /// Runtime type
    pub runtime_type: RuntimeType,
}

/// Observed state of a runtime's cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterStatus {
    /// The cluster exists
    Running,
    /// No cluster exists
    Missing,
    /// The runtime could not tell
    Unknown(String),
}

/// Creates and destroys the devenv cluster
#[async_trait]
pub trait ClusterRuntime: Send + Sync {
    /// Name and type of this runtime
    fn config(&self) -> RuntimeConfig;

    /// Current cluster state
    async fn status(&self) -> ClusterStatus;

    /// Check prerequisites before creating a cluster
    async fn pre_create(&self) -> Result<()>;

    /// Create the cluster
    async fn create(&self) -> Result<()>;

    /// Destroy the cluster
    async fn destroy(&self) -> Result<()>;

    /// Write a kubeconfig for the cluster and return its path
    async fn kubeconfig(&self) -> Result<PathBuf>;
}

/// Runtimes known to this process, by name
#[derive(Clone, Default)]
pub struct RuntimeRegistry {
    runtimes: BTreeMap<String, Arc<dyn ClusterRuntime>>,
}

impl RuntimeRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a runtime, replacing any with the same name
    pub fn register(&mut self, runtime: Arc<dyn ClusterRuntime>) {
        let name = runtime.config().name;
        debug!(runtime = %name, "Registered runtime");
        self.runtimes.insert(name, runtime);
    }

    /// Runtime by name
    pub fn get(&self, name: &str) -> Result<Arc<dyn ClusterRuntime>> {
        self.runtimes.get(name).cloned().ok_or_else(|| {
            Error::validation_for_field(
                "kubernetes-runtime",
                format!(
                    "unknown runtime {:?}, expected one of: {}",
                    name,
                    self.runtimes.keys().cloned().collect::<Vec<_>>().join(", ")
                ),
            )
        })
    }

    /// Runtimes of the given type
    pub fn enabled(&self, runtime_type: RuntimeType) -> Vec<Arc<dyn ClusterRuntime>> {
        self.runtimes
            .values()
            .filter(|r| r.config().runtime_type == runtime_type)
            .cloned()
            .collect()
    }

    /// The first runtime whose cluster is running
    pub async fn running(&self) -> Option<Arc<dyn ClusterRuntime>> {
        for runtime in self.runtimes.values() {
            if runtime.status().await == ClusterStatus::Running {
                return Some(runtime.clone());
            }
        }
        None
    }
}

// =============================================================================
// kind
// =============================================================================

/// Default name of the kind cluster
pub const KIND_CLUSTER_NAME: &str = "dev-environment";

/// Cluster config passed to `kind create cluster`
pub const KIND_CONFIG: &str = r#"kind: Cluster
apiVersion: kind.x-k8s.io/v1alpha4
nodes:
- role: control-plane
  kubeadmConfigPatches:
  - |
    kind: InitConfiguration
    nodeRegistration:
      kubeletExtraArgs:
        node-labels: "ingress-ready=true"
  extraPortMappings:
  - containerPort: 80
    hostPort: 80
  - containerPort: 443
    hostPort: 443
"#;

/// Local runtime backed by `kind`
pub struct KindRuntime {
    cluster_name: String,
    kubeconfig_path: PathBuf,
}

impl KindRuntime {
    /// Runtime writing its kubeconfig to `kubeconfig_path`
    pub fn new(kubeconfig_path: impl Into<PathBuf>) -> Self {
        Self {
            cluster_name: KIND_CLUSTER_NAME.to_string(),
            kubeconfig_path: kubeconfig_path.into(),
        }
    }

    /// Use a different cluster name
    pub fn with_cluster_name(mut self, name: impl Into<String>) -> Self {
        self.cluster_name = name.into();
        self
    }

    async fn kind(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("kind").args(args).output().await?;
        if !output.status.success() {
            return Err(Error::command(
                format!("kind {}", args.join(" ")),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn kubeconfig_str(&self) -> Result<&str> {
        path_str(&self.kubeconfig_path)
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| Error::validation("kubeconfig path contains invalid UTF-8"))
}

#[async_trait]
impl ClusterRuntime for KindRuntime {
    fn config(&self) -> RuntimeConfig {
        RuntimeConfig {
            name: "kind".to_string(),
            runtime_type: RuntimeType::Local,
        }
    }

    async fn status(&self) -> ClusterStatus {
        match self.kind(&["get", "clusters"]).await {
            Ok(out) if out.lines().any(|l| l.trim() == self.cluster_name) => ClusterStatus::Running,
            Ok(_) => ClusterStatus::Missing,
            Err(e) => ClusterStatus::Unknown(e.to_string()),
        }
    }

    async fn pre_create(&self) -> Result<()> {
        self.kind(&["version"]).await?;
        let docker = Command::new("docker").arg("info").output().await?;
        if !docker.status.success() {
            return Err(Error::command(
                "docker info",
                "docker is not running; kind needs a running docker daemon",
            ));
        }
        Ok(())
    }

    async fn create(&self) -> Result<()> {
        info!(cluster = %self.cluster_name, "Creating kind cluster");

        let mut child = Command::new("kind")
            .args(["create", "cluster", "--name", &self.cluster_name, "--config", "-"])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(KIND_CONFIG.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(Error::command(
                "kind create cluster",
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        self.kubeconfig().await?;
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        info!(cluster = %self.cluster_name, "Deleting kind cluster");
        self.kind(&["delete", "cluster", "--name", &self.cluster_name])
            .await?;
        Ok(())
    }

    async fn kubeconfig(&self) -> Result<PathBuf> {
        if let Some(parent) = self.kubeconfig_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(error = %e, "Failed to create kubeconfig directory");
            }
        }
        self.kind(&[
            "export",
            "kubeconfig",
            "--name",
            &self.cluster_name,
            "--kubeconfig",
            self.kubeconfig_str()?,
        ])
        .await?;
        Ok(self.kubeconfig_path.clone())
    }
}
