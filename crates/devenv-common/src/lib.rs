//! Common types for devenv: errors, retry primitives, readiness and kube helpers

#![deny(missing_docs)]

pub mod error;
pub mod kube_utils;
pub mod readiness;
pub mod retry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace holding devenv bookkeeping (application registry, snapshot hand-off)
pub const DEVENV_NAMESPACE: &str = "devenv";

/// Namespace where Velero and its Backup/Restore resources live
pub const VELERO_NAMESPACE: &str = "velero";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "devenv";
