//! Velero resource types
//!
//! Typed structs for the Velero resources a snapshot touches (Backup,
//! Restore, BackupStorageLocation). These implement `HasApiResource` and are
//! sent to the API server as dynamic objects.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use devenv_common::kube_utils::{HasApiResource, ObjectMeta};
use devenv_common::VELERO_NAMESPACE;

/// Namespaces never captured in a snapshot backup
pub const SNAPSHOT_EXCLUDED_NAMESPACES: &[&str] = &["velero", "minio"];

/// Resource kinds never captured in a snapshot backup
pub const SNAPSHOT_EXCLUDED_RESOURCES: &[&str] = &["HelmChart"];

/// Namespaces left untouched when restoring a snapshot into a fresh cluster
///
/// These are installed by the base provisioning and must keep their local
/// state.
pub const DEFAULT_RESTORE_EXCLUDED_NAMESPACES: &[&str] = &[
    "nginx-ingress",
    "kube-system",
    "cert-manager",
    "velero",
    "minio",
    "vault-secrets-operator",
    "local-path-storage",
    "monitoring",
    "resourcer--bento1a",
];

/// Name of the storage location restores read snapshots from
pub const RESTORE_STORAGE_LOCATION: &str = "devenv";

/// Bucket in the in-cluster object store that holds staged snapshots
pub const RESTORE_BUCKET: &str = "velero-restore";

/// In-cluster object store URL as seen from the Velero pod
pub const IN_CLUSTER_S3_URL: &str = "http://minio.minio:9000";

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Backup name for a snapshot taken at `now`
///
/// Lowercased RFC 3339 with `:` replaced, since resource names may not
/// contain colons or capitals.
pub fn backup_name_at(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Secs, true)
        .replace(':', "-")
        .to_lowercase()
}

// =============================================================================
// Phase
// =============================================================================

/// Lifecycle phase shared by Velero Backups and Restores
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum Phase {
    /// Accepted but not started. Also used when no status is reported yet.
    #[default]
    #[serde(alias = "")]
    New,
    /// Running
    InProgress,
    /// Finished without errors
    Completed,
    /// Finished with some items failing
    PartiallyFailed,
    /// Finished unsuccessfully
    Failed,
    /// Rejected before starting
    FailedValidation,
    /// Being deleted
    Deleting,
    /// Any phase this client does not know about
    #[serde(other)]
    Other,
}

impl Phase {
    /// Whether waiting on this resource can stop
    ///
    /// Only `New` and `InProgress` are considered in flight; any other phase
    /// (including ones added by future Velero versions) ends the wait.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Phase::New | Phase::InProgress)
    }

    /// Read the phase from a resource's JSON representation
    pub fn from_value(value: &serde_json::Value) -> Self {
        value
            .pointer("/status/phase")
            .and_then(|p| serde_json::from_value(p.clone()).ok())
            .unwrap_or_default()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::New => "New",
            Phase::InProgress => "InProgress",
            Phase::Completed => "Completed",
            Phase::PartiallyFailed => "PartiallyFailed",
            Phase::Failed => "Failed",
            Phase::FailedValidation => "FailedValidation",
            Phase::Deleting => "Deleting",
            Phase::Other => "Other",
        };
        f.write_str(s)
    }
}

/// Status shared by Backups and Restores
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationStatus {
    /// Current phase
    #[serde(default)]
    pub phase: Phase,
    /// Number of warnings reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<u32>,
    /// Number of errors reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<u32>,
    /// Reason for a Failed phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

// =============================================================================
// Backup
// =============================================================================

/// Velero Backup resource
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    /// API version
    #[serde(default = "Backup::default_api_version")]
    pub api_version: String,
    /// Resource kind
    #[serde(default = "Backup::default_kind")]
    pub kind: String,
    /// Resource metadata
    pub metadata: ObjectMeta,
    /// Backup specification
    pub spec: BackupSpec,
    /// Status reported by Velero
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<OperationStatus>,
}

impl HasApiResource for Backup {
    const API_VERSION: &'static str = "velero.io/v1";
    const KIND: &'static str = "Backup";
}

impl Backup {
    fn default_api_version() -> String {
        <Self as HasApiResource>::API_VERSION.to_string()
    }
    fn default_kind() -> String {
        <Self as HasApiResource>::KIND.to_string()
    }

    /// Create a new Backup
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, spec: BackupSpec) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata: ObjectMeta::new(name, namespace),
            spec,
            status: None,
        }
    }

    /// Backup of a whole development cluster for snapshotting
    ///
    /// Captures cluster-scoped resources and volume contents through the
    /// file-system backup path, skipping the backup infrastructure itself.
    pub fn for_snapshot(name: impl Into<String>) -> Self {
        Self::new(
            name,
            VELERO_NAMESPACE,
            BackupSpec {
                excluded_namespaces: to_strings(SNAPSHOT_EXCLUDED_NAMESPACES),
                excluded_resources: to_strings(SNAPSHOT_EXCLUDED_RESOURCES),
                snapshot_volumes: Some(true),
                default_volumes_to_fs_backup: Some(true),
                include_cluster_resources: Some(true),
                ..Default::default()
            },
        )
    }

    /// Current phase (`New` when Velero has not reported one)
    pub fn phase(&self) -> Phase {
        self.status
            .as_ref()
            .map(|s| s.phase.clone())
            .unwrap_or_default()
    }
}

/// Backup spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// Included namespaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_namespaces: Vec<String>,
    /// Excluded namespaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_namespaces: Vec<String>,
    /// Excluded resources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_resources: Vec<String>,
    /// Snapshot volumes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_volumes: Option<bool>,
    /// Default volumes to Restic/file-system backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_volumes_to_fs_backup: Option<bool>,
    /// Include cluster-scoped resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_cluster_resources: Option<bool>,
    /// Storage location name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_location: Option<String>,
    /// TTL for the backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
}

// =============================================================================
// Restore
// =============================================================================

/// Velero Restore resource
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Restore {
    /// API version
    #[serde(default = "Restore::default_api_version")]
    pub api_version: String,
    /// Resource kind
    #[serde(default = "Restore::default_kind")]
    pub kind: String,
    /// Resource metadata
    pub metadata: ObjectMeta,
    /// Restore specification
    pub spec: RestoreSpec,
    /// Status reported by Velero
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<OperationStatus>,
}

impl HasApiResource for Restore {
    const API_VERSION: &'static str = "velero.io/v1";
    const KIND: &'static str = "Restore";
}

impl Restore {
    fn default_api_version() -> String {
        <Self as HasApiResource>::API_VERSION.to_string()
    }
    fn default_kind() -> String {
        <Self as HasApiResource>::KIND.to_string()
    }

    /// Create a new Restore
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, spec: RestoreSpec) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata: ObjectMeta::new(name, namespace),
            spec,
            status: None,
        }
    }

    /// Restore of a snapshot backup, named after the backup it restores
    pub fn for_snapshot(backup_name: &str, excluded_namespaces: &[String]) -> Self {
        Self::new(
            backup_name,
            VELERO_NAMESPACE,
            RestoreSpec {
                backup_name: backup_name.to_string(),
                excluded_namespaces: excluded_namespaces.to_vec(),
                restore_pvs: Some(true),
                include_cluster_resources: Some(true),
                preserve_node_ports: Some(true),
                ..Default::default()
            },
        )
    }

    /// Current phase (`New` when Velero has not reported one)
    pub fn phase(&self) -> Phase {
        self.status
            .as_ref()
            .map(|s| s.phase.clone())
            .unwrap_or_default()
    }
}

/// Restore spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSpec {
    /// Name of the Velero Backup to restore from
    pub backup_name: String,
    /// Included namespaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_namespaces: Vec<String>,
    /// Excluded namespaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_namespaces: Vec<String>,
    /// Excluded resources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_resources: Vec<String>,
    /// Restore PVs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_pvs: Option<bool>,
    /// Include cluster-scoped resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_cluster_resources: Option<bool>,
    /// Keep node ports from the backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preserve_node_ports: Option<bool>,
}

// =============================================================================
// BackupStorageLocation
// =============================================================================

/// Velero BackupStorageLocation resource
///
/// Defines where backups are stored (S3, GCS, Azure, etc.).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStorageLocation {
    /// API version
    #[serde(default = "BackupStorageLocation::default_api_version")]
    pub api_version: String,
    /// Resource kind
    #[serde(default = "BackupStorageLocation::default_kind")]
    pub kind: String,
    /// Resource metadata
    pub metadata: ObjectMeta,
    /// BSL specification
    pub spec: BackupStorageLocationSpec,
}

impl HasApiResource for BackupStorageLocation {
    const API_VERSION: &'static str = "velero.io/v1";
    const KIND: &'static str = "BackupStorageLocation";
}

impl BackupStorageLocation {
    fn default_api_version() -> String {
        <Self as HasApiResource>::API_VERSION.to_string()
    }
    fn default_kind() -> String {
        <Self as HasApiResource>::KIND.to_string()
    }

    /// Create a new BackupStorageLocation
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        spec: BackupStorageLocationSpec,
    ) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata: ObjectMeta::new(name, namespace),
            spec,
        }
    }

    /// Location pointing Velero at the staged snapshot in the in-cluster store
    pub fn for_restore() -> Self {
        let config = BTreeMap::from([
            ("region".to_string(), "minio".to_string()),
            ("s3ForcePathStyle".to_string(), "true".to_string()),
            ("s3Url".to_string(), IN_CLUSTER_S3_URL.to_string()),
        ]);
        Self::new(
            RESTORE_STORAGE_LOCATION,
            VELERO_NAMESPACE,
            BackupStorageLocationSpec {
                provider: "aws".to_string(),
                object_storage: ObjectStorageLocation {
                    bucket: RESTORE_BUCKET.to_string(),
                    prefix: None,
                },
                config,
                default: None,
            },
        )
    }
}

/// BackupStorageLocation spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStorageLocationSpec {
    /// Provider name (aws, gcp, azure)
    pub provider: String,
    /// Object storage configuration
    pub object_storage: ObjectStorageLocation,
    /// Provider-specific configuration
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
    /// Whether this is the default BSL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<bool>,
}

/// Object storage configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStorageLocation {
    /// Bucket name
    pub bucket: String,
    /// Prefix within the bucket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

// =============================================================================
// Tests
// =============================================================================
