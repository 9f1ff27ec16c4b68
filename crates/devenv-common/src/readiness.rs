//! Cluster-wide pod readiness
//!
//! A cluster is considered settled when every pod has either completed
//! (phase `Succeeded`) or reports the `Ready=True` condition. Pods whose
//! names start with an exempted prefix are ignored. When the wait times
//! out, the error carries per-pod and per-container diagnostics instead of
//! a bare message.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use kube::api::{Api, ListParams};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Pod name prefixes that never gate readiness
pub const DEFAULT_EXEMPT_PREFIXES: &[&str] = &["strimzi-topic-operator"];

/// Lists every pod in the cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodLister: Send + Sync {
    /// List pods in all namespaces
    async fn list_pods(&self) -> Result<Vec<Pod>>;
}

/// [`PodLister`] backed by the Kubernetes API
pub struct PodListerImpl {
    client: Client,
}

impl PodListerImpl {
    /// Create a lister for the given cluster
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodLister for PodListerImpl {
    async fn list_pods(&self) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }
}

/// Timing and exemptions for [`wait_for_all_pods_ready`]
#[derive(Clone, Debug)]
pub struct ReadinessConfig {
    /// How long to wait before giving up
    pub timeout: Duration,
    /// Delay between checks
    pub interval: Duration,
    /// Pod name prefixes to ignore
    pub exempt_prefixes: Vec<String>,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10 * 60),
            interval: Duration::from_secs(30),
            exempt_prefixes: DEFAULT_EXEMPT_PREFIXES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl ReadinessConfig {
    /// Default config with a different timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }
}

/// What a container was doing when last observed
#[derive(Clone, Debug, PartialEq)]
pub enum ContainerStateSummary {
    /// Waiting to start
    Waiting {
        /// Reason reported by the kubelet (e.g. CrashLoopBackOff)
        reason: Option<String>,
    },
    /// Running
    Running,
    /// Exited
    Terminated {
        /// Reason reported by the kubelet
        reason: Option<String>,
        /// Exit code of the last run
        exit_code: i32,
    },
    /// No state reported yet
    Unknown,
}

/// Diagnostics for one container of an unready pod
#[derive(Clone, Debug, PartialEq)]
pub struct ContainerDiagnostic {
    /// Container name
    pub name: String,
    /// Whether the container passes its readiness probe
    pub ready: bool,
    /// Number of restarts
    pub restart_count: i32,
    /// Current state
    pub state: ContainerStateSummary,
}

/// Diagnostics for a pod that is neither ready nor completed
#[derive(Clone, Debug, PartialEq)]
pub struct UnreadyPod {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub name: String,
    /// Pod phase (Pending, Running, Failed, ...)
    pub phase: Option<String>,
    /// Human-readable status message
    pub message: Option<String>,
    /// Per-container diagnostics
    pub containers: Vec<ContainerDiagnostic>,
}

impl fmt::Display for UnreadyPod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} phase={}",
            self.namespace,
            self.name,
            self.phase.as_deref().unwrap_or("Unknown")
        )?;
        if let Some(message) = &self.message {
            write!(f, " message={:?}", message)?;
        }
        for c in &self.containers {
            write!(
                f,
                " [{} ready={} restarts={}",
                c.name, c.ready, c.restart_count
            )?;
            match &c.state {
                ContainerStateSummary::Waiting { reason } => {
                    write!(f, " waiting={}", reason.as_deref().unwrap_or("-"))?
                }
                ContainerStateSummary::Running => write!(f, " running")?,
                ContainerStateSummary::Terminated { reason, exit_code } => write!(
                    f,
                    " terminated={} exit_code={}",
                    reason.as_deref().unwrap_or("-"),
                    exit_code
                )?,
                ContainerStateSummary::Unknown => {}
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

fn summarize_container(status: &ContainerStatus) -> ContainerDiagnostic {
    let state = match &status.state {
        Some(s) if s.waiting.is_some() => ContainerStateSummary::Waiting {
            reason: s.waiting.as_ref().and_then(|w| w.reason.clone()),
        },
        Some(s) if s.running.is_some() => ContainerStateSummary::Running,
        Some(s) => match &s.terminated {
            Some(t) => ContainerStateSummary::Terminated {
                reason: t.reason.clone(),
                exit_code: t.exit_code,
            },
            None => ContainerStateSummary::Unknown,
        },
        None => ContainerStateSummary::Unknown,
    };
    ContainerDiagnostic {
        name: status.name.clone(),
        ready: status.ready,
        restart_count: status.restart_count,
        state,
    }
}

fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Return diagnostics for every pod that is neither completed nor ready.
pub fn find_unready_pods(pods: &[Pod], exempt_prefixes: &[String]) -> Vec<UnreadyPod> {
    pods.iter()
        .filter(|pod| {
            let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
            phase != Some("Succeeded")
        })
        .filter(|pod| {
            let name = pod.metadata.name.as_deref().unwrap_or_default();
            !exempt_prefixes.iter().any(|p| name.starts_with(p.as_str()))
        })
        .filter(|pod| !is_pod_ready(pod))
        .map(|pod| {
            let status = pod.status.as_ref();
            UnreadyPod {
                namespace: pod.metadata.namespace.clone().unwrap_or_default(),
                name: pod.metadata.name.clone().unwrap_or_default(),
                phase: status.and_then(|s| s.phase.clone()),
                message: status.and_then(|s| s.message.clone()),
                containers: status
                    .and_then(|s| s.container_statuses.as_ref())
                    .map(|cs| cs.iter().map(summarize_container).collect())
                    .unwrap_or_default(),
            }
        })
        .collect()
}

/// Wait until every pod in the cluster is ready or completed.
///
/// List failures are treated like unready pods: logged, then retried until
/// the timeout.
pub async fn wait_for_all_pods_ready(
    lister: &dyn PodLister,
    config: &ReadinessConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let start = tokio::time::Instant::now();
    let mut last_unready: Vec<UnreadyPod> = Vec::new();

    loop {
        match lister.list_pods().await {
            Ok(pods) => {
                last_unready = find_unready_pods(&pods, &config.exempt_prefixes);
                if last_unready.is_empty() {
                    info!("All pods are ready");
                    return Ok(());
                }
                info!(unready = last_unready.len(), "Waiting for pods to be ready");
            }
            Err(e) => warn!(error = %e, "Failed to list pods, retrying"),
        }

        if start.elapsed() >= config.timeout {
            for pod in &last_unready {
                warn!(pod = %pod, "Pod not ready");
            }
            if last_unready.is_empty() {
                return Err(Error::timeout("pods to be ready"));
            }
            return Err(Error::PodsNotReady {
                pods: last_unready,
            });
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled("wait_for_all_pods_ready")),
            _ = tokio::time::sleep(config.interval) => {}
        }
    }
}
