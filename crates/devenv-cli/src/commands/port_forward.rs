//! Port-forward to the in-cluster minio.
//!
//! The generator reads Velero's bucket from the local machine, so minio is
//! forwarded to a fixed local port for as long as the [`PortForward`] lives.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use devenv_common::kube_utils::poll_until;

use crate::{Error, Result};

/// Service name of the in-cluster minio
const MINIO_SERVICE: &str = "minio";

/// Namespace of the in-cluster minio
const MINIO_NAMESPACE: &str = "minio";

/// Port minio listens on in the cluster
const MINIO_PORT: u16 = 9000;

/// Maximum time to wait for the forwarded port to accept connections
const STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Delay between connection probes during startup
const STARTUP_PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// A running `kubectl port-forward`; stopped when dropped
pub struct PortForward {
    port: u16,
    child: Child,
}

impl PortForward {
    /// Forward `local_port` to minio and wait until it accepts connections
    pub async fn minio(kubeconfig: &Path, local_port: u16, cancel: &CancellationToken) -> Result<Self> {
        let child = spawn_kubectl(kubeconfig, local_port)?;
        let mut forward = Self {
            port: local_port,
            child,
        };
        forward.wait_ready(cancel).await?;
        info!(port = local_port, "Forwarding minio");
        Ok(forward)
    }

    /// The local port being forwarded
    pub fn port(&self) -> u16 {
        self.port
    }

    async fn wait_ready(&mut self, cancel: &CancellationToken) -> Result<()> {
        let addr = format!("127.0.0.1:{}", self.port);
        let addr = addr.as_str();
        poll_until(
            STARTUP_TIMEOUT,
            STARTUP_PROBE_INTERVAL,
            format!("port-forward on {}", addr),
            cancel,
            || async move {
                match TcpStream::connect(addr).await {
                    Ok(_) => Ok(true),
                    Err(e) => {
                        debug!(error = %e, "Port-forward not ready yet");
                        Ok(false)
                    }
                }
            },
        )
        .await?;

        if let Some(status) = self.child.try_wait()? {
            return Err(Error::command_failed(format!(
                "kubectl port-forward exited with {}",
                status
            )));
        }
        Ok(())
    }
}

impl Drop for PortForward {
    fn drop(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "Port-forward already stopped");
        }
    }
}

fn spawn_kubectl(kubeconfig: &Path, local_port: u16) -> Result<Child> {
    let kubeconfig = kubeconfig
        .to_str()
        .ok_or_else(|| Error::validation("kubeconfig path contains invalid UTF-8"))?;

    Command::new("kubectl")
        .args([
            "--kubeconfig",
            kubeconfig,
            "port-forward",
            "-n",
            MINIO_NAMESPACE,
            &format!("svc/{}", MINIO_SERVICE),
            &format!("{}:{}", local_port, MINIO_PORT),
        ])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::command_failed(format!("failed to spawn port-forward: {}", e)))
}
