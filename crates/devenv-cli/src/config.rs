//! devenv configuration stored at `~/.devenv/config.yaml`.
//!
//! Every field has a default, so a missing file is the same as an empty one.
//! `DEVENV_CONFIG` points at a different file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use devenv_backup::velero::{IN_CLUSTER_S3_URL, RESTORE_BUCKET};
use devenv_snapshot::S3Config;

use crate::{Error, Result};

const CONFIG_DIR_NAME: &str = ".devenv";
const CONFIG_FILE_NAME: &str = "config.yaml";
const KUBECONFIG_FILE_NAME: &str = "kubeconfig";
const DEVENV_CONFIG_ENV: &str = "DEVENV_CONFIG";

/// Persistent CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DevenvConfig {
    /// Where snapshots are published
    pub snapshots: SnapshotSettings,
    /// In-cluster object store Velero writes to
    pub minio: MinioSettings,
    /// Directory of manifests applied to every new cluster (Velero, minio,
    /// cert-manager)
    pub base_manifests: PathBuf,
    /// Command deploying one application; the app name is passed as `$1`
    pub deploy_app_command: String,
}

/// Remote snapshot storage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SnapshotSettings {
    /// Bucket holding archives and the lock document
    pub bucket: String,
    /// Region of the bucket
    pub region: String,
    /// S3-compatible endpoint, AWS when unset
    pub endpoint: Option<String>,
    /// Target provisioned when none is given
    pub default_target: String,
    /// Image running the snapshot stager
    pub stager_image: String,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            bucket: "devenv-snapshots".to_string(),
            region: "us-west-2".to_string(),
            endpoint: None,
            default_target: "base".to_string(),
            stager_image: "devenv/snapshot-stager:latest".to_string(),
        }
    }
}

/// Credentials and ports of the in-cluster minio
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MinioSettings {
    /// Access key
    pub access_key: String,
    /// Secret key
    pub secret_key: String,
    /// Local port minio is forwarded to
    pub local_port: u16,
    /// Bucket Velero writes backups to
    pub bucket: String,
}

impl Default for MinioSettings {
    fn default() -> Self {
        Self {
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            local_port: 61002,
            bucket: "velero".to_string(),
        }
    }
}

impl MinioSettings {
    /// Settings for the port-forwarded minio
    pub fn local(&self) -> S3Config {
        S3Config {
            s3_host: format!("http://127.0.0.1:{}", self.local_port),
            bucket: self.bucket.clone(),
            aws_access_key: self.access_key.clone(),
            aws_secret_key: self.secret_key.clone(),
            ..Default::default()
        }
    }

    /// Settings for the stager's destination, as seen from inside the
    /// cluster
    pub fn restore_destination(&self) -> S3Config {
        S3Config {
            s3_host: IN_CLUSTER_S3_URL.to_string(),
            bucket: RESTORE_BUCKET.to_string(),
            aws_access_key: self.access_key.clone(),
            aws_secret_key: self.secret_key.clone(),
            ..Default::default()
        }
    }
}

impl Default for DevenvConfig {
    fn default() -> Self {
        Self {
            snapshots: SnapshotSettings::default(),
            minio: MinioSettings::default(),
            base_manifests: PathBuf::from("manifests/base"),
            deploy_app_command: "./scripts/deploy-app.sh".to_string(),
        }
    }
}

impl DevenvConfig {
    /// Load from `DEVENV_CONFIG` or `~/.devenv/config.yaml`
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path()?)
    }

    /// Load from `path`; a missing file yields the defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) if contents.trim().is_empty() => Ok(Self::default()),
            Ok(contents) => serde_yaml::from_str(&contents).map_err(|e| Error::Config {
                path: path.to_path_buf(),
                message: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::Config {
                path: path.to_path_buf(),
                message: e.to_string(),
            }),
        }
    }
}

/// Returns `~/.devenv/`, creating it if it doesn't exist.
pub fn devenv_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| Error::command_failed("could not determine home directory"))?;
    let dir = home.join(CONFIG_DIR_NAME);
    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| {
            Error::command_failed(format!("failed to create {}: {}", dir.display(), e))
        })?;
    }
    Ok(dir)
}

/// Path of the config file, honouring `DEVENV_CONFIG`
pub fn config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(DEVENV_CONFIG_ENV) {
        if !path.is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    Ok(devenv_dir()?.join(CONFIG_FILE_NAME))
}

/// Path the devenv cluster's kubeconfig is written to
pub fn kubeconfig_path() -> Result<PathBuf> {
    Ok(devenv_dir()?.join(KUBECONFIG_FILE_NAME))
}
