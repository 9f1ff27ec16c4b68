//! Shared Kubernetes utilities using kube-rs
//!
//! Client construction, dynamic resource plumbing for CRDs we do not own
//! (Velero, cert-manager), and manifest application.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{Error, FIELD_MANAGER};

/// Label recording which tool manages a resource
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// Value of [`LABEL_MANAGED_BY`] for resources devenv creates
pub const LABEL_MANAGED_BY_DEVENV: &str = "devenv";

// =============================================================================
// ObjectMeta - metadata for resources we serialize ourselves
// =============================================================================

/// Kubernetes metadata for typed resources that are sent as dynamic objects.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Resource name
    pub name: String,
    /// Resource namespace
    pub namespace: String,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// Create new metadata carrying the devenv managed-by label
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(
            LABEL_MANAGED_BY.to_string(),
            LABEL_MANAGED_BY_DEVENV.to_string(),
        );
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels,
            annotations: BTreeMap::new(),
        }
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// HasApiResource Trait
// =============================================================================

/// Trait for types that have a known API group, version, and kind.
///
/// # Example
/// ```ignore
/// impl HasApiResource for Backup {
///     const API_VERSION: &'static str = "velero.io/v1";
///     const KIND: &'static str = "Backup";
/// }
///
/// let ar = Backup::api_resource();
/// ```
pub trait HasApiResource {
    /// Full API version (e.g., "velero.io/v1", "v1")
    const API_VERSION: &'static str;
    /// Resource kind (e.g., "Backup")
    const KIND: &'static str;

    /// Build an ApiResource from the type's constants.
    fn api_resource() -> ApiResource {
        build_api_resource(Self::API_VERSION, Self::KIND)
    }
}

/// Build an ApiResource from an apiVersion and kind.
///
/// The plural is derived by lowercasing the kind and appending "s", which
/// holds for every kind this crate touches.
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        plural: format!("{}s", kind.to_lowercase()),
    }
}

/// Parse apiVersion into (group, version)
///
/// # Examples
/// ```
/// use devenv_common::kube_utils::parse_api_version;
///
/// let (group, version) = parse_api_version("velero.io/v1");
/// assert_eq!(group, "velero.io");
/// assert_eq!(version, "v1");
///
/// let (group, version) = parse_api_version("v1");
/// assert_eq!(group, "");
/// assert_eq!(version, "v1");
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

// =============================================================================
// Client construction
// =============================================================================

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client from optional kubeconfig path with custom timeouts
///
/// Without a path the config is inferred (in-cluster service account, then
/// `KUBECONFIG`, then `~/.kube/config`).
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

// =============================================================================
// Polling
// =============================================================================

/// Poll until a condition is met, the timeout elapses, or the token fires.
///
/// # Arguments
/// * `timeout` - Maximum time to wait
/// * `poll_interval` - Time between checks
/// * `operation` - Description used in the timeout error
/// * `cancel` - Stops polling early
/// * `check_fn` - Returns `Ok(true)` when done, `Ok(false)` to keep polling.
///   Errors are logged and polling continues.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    operation: impl Into<String>,
    cancel: &CancellationToken,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let start = tokio::time::Instant::now();
    let operation = operation.into();

    loop {
        if start.elapsed() > timeout {
            return Err(Error::timeout(operation));
        }

        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!(operation = %operation, "condition not yet met"),
            Err(e) => trace!(operation = %operation, error = %e, "poll check failed, retrying"),
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled(operation)),
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

// =============================================================================
// Manifest application
// =============================================================================

/// Parsed manifest metadata for applying to Kubernetes
#[derive(Debug, Clone)]
pub struct ManifestMetadata {
    /// The parsed JSON value
    pub value: serde_json::Value,
    /// Resource name
    pub name: String,
    /// Optional namespace
    pub namespace: Option<String>,
    /// API resource definition
    pub api_resource: ApiResource,
}

/// Parse a single YAML or JSON manifest and extract its metadata
pub fn parse_manifest(manifest: &str) -> Result<ManifestMetadata, Error> {
    let value: serde_json::Value = if manifest.trim_start().starts_with('{') {
        serde_json::from_str(manifest)?
    } else {
        serde_yaml::from_str(manifest)?
    };

    let field = |pointer: &str| value.pointer(pointer).and_then(|v| v.as_str());

    let api_version = field("/apiVersion")
        .ok_or_else(|| Error::validation_for_field("apiVersion", "manifest missing apiVersion"))?
        .to_string();
    let kind = field("/kind")
        .ok_or_else(|| Error::validation_for_field("kind", "manifest missing kind"))?
        .to_string();
    let name = field("/metadata/name")
        .ok_or_else(|| {
            Error::validation_for_field("metadata.name", "manifest missing metadata.name")
        })?
        .to_string();
    let namespace = field("/metadata/namespace").map(str::to_string);

    Ok(ManifestMetadata {
        api_resource: build_api_resource(&api_version, &kind),
        value,
        name,
        namespace,
    })
}

/// Split a multi-document YAML stream into documents that look like manifests
pub fn split_manifests(manifests: &str) -> Vec<&str> {
    manifests
        .split("\n---")
        .map(|doc| doc.trim().trim_start_matches("---").trim())
        .filter(|doc| doc.contains("apiVersion"))
        .collect()
}

/// Apply a manifest using server-side apply
///
/// API errors keep their status code so callers can retry conflicts.
pub async fn apply_manifest(client: &Client, manifest: &str) -> Result<(), Error> {
    let metadata = parse_manifest(manifest)?;
    let params = PatchParams::apply(FIELD_MANAGER).force();

    let api: Api<DynamicObject> = match &metadata.namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, &metadata.api_resource),
        None => Api::all_with(client.clone(), &metadata.api_resource),
    };
    api.patch(&metadata.name, &params, &Patch::Apply(&metadata.value))
        .await?;

    debug!(
        kind = %metadata.api_resource.kind,
        name = %metadata.name,
        "applied manifest"
    );
    Ok(())
}

/// Apply a multi-document YAML manifest (documents separated by ---)
pub async fn apply_manifests(client: &Client, manifests: &str) -> Result<(), Error> {
    for doc in split_manifests(manifests) {
        apply_manifest(client, doc).await?;
    }
    Ok(())
}
