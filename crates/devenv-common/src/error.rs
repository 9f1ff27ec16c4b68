//! Error types for the devenv snapshot lifecycle
//!
//! Errors are structured with fields so that callers can classify them
//! (conflict, not-found, retryable) without inspecting error text. Each
//! variant carries the identifiers needed to debug a failed pipeline run:
//! snapshot targets and channels, object keys, backup and restore names.

use thiserror::Error;

use crate::readiness::UnreadyPod;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for devenv operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid configuration or input
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field (e.g., "snapshotTarget")
        field: Option<String>,
    },

    /// The lock registry has no entry for the requested target
    #[error("unknown snapshot target {target}")]
    UnknownSnapshotTarget {
        /// Requested snapshot target
        target: String,
    },

    /// The target exists but has no such channel
    #[error("unknown snapshot channel {channel} for target {target}")]
    UnknownSnapshotChannel {
        /// Requested snapshot target
        target: String,
        /// Requested release channel
        channel: String,
    },

    /// The channel exists but holds no snapshots
    #[error("no snapshots found for channel {channel} of target {target}")]
    EmptySnapshotChannel {
        /// Requested snapshot target
        target: String,
        /// Requested release channel
        channel: String,
    },

    /// Downloaded archive does not match its published digest
    #[error("downloaded snapshot failed checksum validation: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Digest recorded in the lock registry
        expected: String,
        /// Digest computed over the downloaded bytes
        actual: String,
    },

    /// A restore with the same name is still running
    #[error("restore {name} is already in progress")]
    RestoreInProgress {
        /// Name of the conflicting restore
        name: String,
    },

    /// The backup referenced by a snapshot is not visible to the backup system
    #[error("backup {name} not found")]
    BackupNotFound {
        /// Backup name
        name: String,
    },

    /// A watch subscription ended before a terminal phase was observed
    #[error("watch on {kind} {name} closed before reaching a terminal phase")]
    WatchClosed {
        /// Resource kind being watched
        kind: String,
        /// Resource name being watched
        name: String,
    },

    /// A watched resource was deleted while still in progress
    #[error("{kind} {name} was deleted while in phase {phase}")]
    ResourceDeleted {
        /// Resource kind being watched
        kind: String,
        /// Resource name being watched
        name: String,
        /// Last observed phase
        phase: String,
    },

    /// Object does not exist in the bucket
    #[error("object {key} not found in bucket {bucket}")]
    ObjectNotFound {
        /// Bucket name
        bucket: String,
        /// Object key
        key: String,
    },

    /// Object store rejected the credentials
    #[error("object store authentication failed for bucket {bucket}: {message}")]
    StorageAuth {
        /// Bucket name
        bucket: String,
        /// Description of what failed
        message: String,
    },

    /// Any other object store failure
    #[error("object store error [{operation}] for bucket {bucket}: {message}")]
    Storage {
        /// Operation that failed (get, put, list, remove)
        operation: String,
        /// Bucket name
        bucket: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The document being serialized (if known)
        kind: Option<String>,
    },

    /// An external command exited unsuccessfully
    #[error("command `{command}` failed: {message}")]
    Command {
        /// Command line that was run
        command: String,
        /// Exit status and stderr
        message: String,
    },

    /// A bounded wait ran out of time
    #[error("timed out waiting for {operation}")]
    Timeout {
        /// What was being waited for
        operation: String,
    },

    /// Some pods never became ready
    #[error("{} pods not ready: {}", .pods.len(), summarize_pods(.pods))]
    PodsNotReady {
        /// Diagnostics for each unready pod
        pods: Vec<UnreadyPod>,
    },

    /// A bounded retry ran out of attempts
    #[error("{operation} reached maximum attempts ({attempts}): {last}")]
    AttemptsExhausted {
        /// Name of the retried operation
        operation: String,
        /// Number of attempts made
        attempts: u32,
        /// Error from the final attempt
        last: Box<Error>,
    },

    /// The operation was cancelled
    #[error("{operation} cancelled")]
    Cancelled {
        /// Name of the cancelled operation
        operation: String,
    },

    /// A named pipeline step failed
    #[error("failed to run step {step}: {source}")]
    Step {
        /// Step name (e.g., "Discover", "Download")
        step: String,
        /// The underlying error
        #[source]
        source: Box<Error>,
    },

    /// Filesystem error
    #[error("io error: {source}")]
    Io {
        /// The underlying io error
        #[from]
        source: std::io::Error,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "generator", "stager")
        context: String,
    },
}

fn summarize_pods(pods: &[UnreadyPod]) -> String {
    pods.iter()
        .map(|p| format!("{}/{}", p.namespace, p.name))
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a specific field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error naming the document involved
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a storage error
    pub fn storage(
        operation: impl Into<String>,
        bucket: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Storage {
            operation: operation.into(),
            bucket: bucket.into(),
            message: msg.into(),
        }
    }

    /// Create a command failure error
    pub fn command(command: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Wrap this error as the failure of a named pipeline step
    pub fn in_step(self, step: impl Into<String>) -> Self {
        Self::Step {
            step: step.into(),
            source: Box::new(self),
        }
    }

    /// Unwrap step and retry wrappers down to the error that caused them
    pub fn root(&self) -> &Error {
        match self {
            Error::Step { source, .. } => source.root(),
            Error::AttemptsExhausted { last, .. } => last.root(),
            other => other,
        }
    }

    /// Whether this is an optimistic-concurrency conflict (HTTP 409)
    pub fn is_conflict(&self) -> bool {
        matches!(
            self.root(),
            Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409
        )
    }

    /// Whether the thing being looked up does not exist
    pub fn is_not_found(&self) -> bool {
        match self.root() {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            Error::ObjectNotFound { .. } | Error::BackupNotFound { .. } => true,
            _ => false,
        }
    }

    /// Check if this error is retryable
    ///
    /// Conflicts and transient transport failures are retryable. Validation,
    /// integrity and authentication failures require intervention.
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => ae.code == 409 || ae.code >= 500,
                _ => true,
            },
            Error::Storage { .. } => true,
            Error::PodsNotReady { .. } => true,
            Error::Timeout { .. } => true,
            Error::Io { .. } => true,
            Error::Internal { .. } => true,
            _ => false,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            Error::Step { step, .. } => Some(step),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization_for_kind("json", e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::serialization_for_kind("yaml", e.to_string())
    }
}
