//! Post-restore pod cleanup
//!
//! Pods restored with volume data carry Velero's `restic-wait` init
//! container. If such a pod restarts after the restore finished, the init
//! container waits forever for data that will never arrive. Deleting these
//! pods lets their controllers recreate them without it.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams};
use kube::Client;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use devenv_common::readiness::PodLister;
use devenv_common::Result;

/// Init container injected by Velero's file-system restore
pub const RESTIC_WAIT_CONTAINER: &str = "restic-wait";

/// Deletes pods
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodDeleter: Send + Sync {
    /// Delete one pod; a missing pod is not an error
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;
}

/// [`PodDeleter`] backed by the Kubernetes API
pub struct KubePodDeleter {
    client: Client,
}

impl KubePodDeleter {
    /// Deleter for the given cluster
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodDeleter for KubePodDeleter {
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// `(namespace, name)` of every pod with an init container called `container`
pub fn pods_with_init_container(pods: &[Pod], container: &str) -> Vec<(String, String)> {
    pods.iter()
        .filter(|pod| {
            pod.spec
                .as_ref()
                .and_then(|s| s.init_containers.as_ref())
                .is_some_and(|init| init.iter().any(|c| c.name == container))
        })
        .filter_map(|pod| {
            Some((
                pod.metadata.namespace.clone().unwrap_or_default(),
                pod.metadata.name.clone()?,
            ))
        })
        .collect()
}

/// Delete every pod carrying a `restic-wait` init container.
///
/// Best effort: failures are logged and the number of deleted pods is
/// returned.
pub async fn purge_restic_wait_pods(lister: &dyn PodLister, deleter: &dyn PodDeleter) -> usize {
    info!("Cleaning up snapshot restore artifacts");
    let pods = match lister.list_pods().await {
        Ok(pods) => pods,
        Err(e) => {
            warn!(error = %e, "Failed to list pods for cleanup");
            return 0;
        }
    };

    let mut deleted = 0;
    for (namespace, name) in pods_with_init_container(&pods, RESTIC_WAIT_CONTAINER) {
        match deleter.delete_pod(&namespace, &name).await {
            Ok(()) => deleted += 1,
            Err(e) => warn!(namespace = %namespace, pod = %name, error = %e, "Failed to delete pod"),
        }
    }
    info!(deleted, "Removed pods waiting on restored volumes");
    deleted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockPodLister;
    use devenv_common::Error;
    use k8s_openapi::api::core::v1::{Container, PodSpec};
    use kube::api::ObjectMeta;

    fn pod(name: &str, init: &[&str]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("apps".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                init_containers: Some(
                    init.iter()
                        .map(|n| Container {
                            name: n.to_string(),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_selects_only_restic_wait_pods() {
        let pods = vec![
            pod("db-0", &["restic-wait", "init-db"]),
            pod("web-1", &["migrate"]),
            Pod::default(),
        ];
        assert_eq!(
            pods_with_init_container(&pods, RESTIC_WAIT_CONTAINER),
            vec![("apps".to_string(), "db-0".to_string())]
        );
    }

    #[tokio::test]
    async fn test_purge_continues_past_failures() {
        let mut lister = MockPodLister::new();
        lister.expect_list_pods().returning(|| {
            Ok(vec![
                pod("a", &["restic-wait"]),
                pod("b", &["restic-wait"]),
                pod("c", &[]),
            ])
        });

        let mut deleter = MockPodDeleter::new();
        deleter
            .expect_delete_pod()
            .withf(|_, name| name == "a")
            .returning(|_, _| Err(Error::internal("forbidden")));
        deleter
            .expect_delete_pod()
            .withf(|_, name| name == "b")
            .returning(|_, _| Ok(()));

        assert_eq!(purge_restic_wait_pods(&lister, &deleter).await, 1);
    }

    #[tokio::test]
    async fn test_purge_tolerates_list_failure() {
        let mut lister = MockPodLister::new();
        lister
            .expect_list_pods()
            .returning(|| Err(Error::internal("apiserver down")));
        let deleter = MockPodDeleter::new();

        assert_eq!(purge_restic_wait_pods(&lister, &deleter).await, 0);
    }
}
