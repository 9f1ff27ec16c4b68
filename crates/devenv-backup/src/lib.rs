//! Velero integration for devenv snapshots
//!
//! Typed Backup, Restore and BackupStorageLocation resources, and the
//! [`BackupSystem`] client that creates them and waits for them to finish.

pub mod client;
pub mod velero;
pub mod watch;

pub use client::{wait_for_backup_visible, BackupSystem, VeleroClient};
pub use velero::{
    Backup, BackupSpec, BackupStorageLocation, BackupStorageLocationSpec, ObjectStorageLocation,
    Phase, Restore, RestoreSpec,
};
