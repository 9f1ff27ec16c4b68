//! Snapshot lifecycle for devenv clusters
//!
//! A snapshot is a Velero backup of a fully provisioned cluster, packed into
//! a tar archive and published to a shared bucket:
//!
//! - [`generator`] provisions a throwaway cluster per target, backs it up and
//!   publishes the archive in the [`lock`] registry.
//! - [`stager`] runs inside a new cluster, verifies the archive and unpacks
//!   it into the cluster's own object store.
//! - [`provision`] drives the stager and the [`restore`] orchestrator, then
//!   finishes the environment with [`post_restore`] manifests, [`cleanup`]
//!   and [`certs`] renewal.

#![deny(missing_docs)]

pub mod alert;
pub mod apps;
pub mod archive;
pub mod certs;
pub mod cleanup;
pub mod digest;
pub mod generator;
pub mod handoff;
pub mod lock;
pub mod post_restore;
pub mod provision;
pub mod restore;
pub mod runtime;
pub mod s3;
pub mod stager;
pub mod store;

#[cfg(test)]
mod mocks;

pub use generator::{Environment, GenerateOptions, GeneratedSnapshot, SnapshotGenerator};
pub use lock::{
    LockRegistry, SnapshotGenerateConfig, SnapshotLock, SnapshotLockListItem, SnapshotTarget,
};
pub use provision::{ProvisionClients, ProvisionSettings, SnapshotProvisioner};
pub use restore::{RestoreOrchestrator, RestoreReport};
pub use s3::{S3Config, S3Store};
pub use stager::{SnapshotStager, StageConfig, StageOutcome};
pub use store::{MemoryStore, ObjectStore};
