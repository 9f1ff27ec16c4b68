//! Constant-interval retry with cancellation.
//!
//! Every retried operation in the snapshot lifecycle polls something that
//! settles on its own schedule (the backup system noticing a new storage
//! location, cert-manager releasing an object), so retries wait a fixed
//! interval rather than backing off exponentially.
//!
//! # Example
//!
//! ```ignore
//! use devenv_common::retry::{backoff, BackoffConfig};
//!
//! let backup = backoff(
//!     &BackoffConfig::new(Duration::from_secs(10), 10),
//!     "wait_for_backup",
//!     &cancel,
//!     || async { backups.get_backup(&name).await },
//! ).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::Error;

/// Configuration for a constant-interval retry loop.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffConfig {
    /// Delay between attempts
    pub interval: Duration,
    /// Maximum number of attempts (0 = unbounded)
    pub max_attempts: u32,
}

impl BackoffConfig {
    /// Create a bounded config
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Create a config that retries until success or cancellation
    pub fn unbounded(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: 0,
        }
    }
}

/// Why a retry loop gave up.
#[derive(Debug)]
pub enum BackoffError<E> {
    /// Every allowed attempt failed
    Exhausted {
        /// Name of the retried operation
        operation: String,
        /// Number of attempts made
        attempts: u32,
        /// Error from the final attempt
        last: E,
    },
    /// The operation failed with an error the caller does not retry
    Aborted(E),
    /// The cancellation token fired
    Cancelled {
        /// Name of the retried operation
        operation: String,
    },
}

impl From<BackoffError<Error>> for Error {
    fn from(e: BackoffError<Error>) -> Self {
        match e {
            BackoffError::Exhausted {
                operation,
                attempts,
                last,
            } => Error::AttemptsExhausted {
                operation,
                attempts,
                last: Box::new(last),
            },
            BackoffError::Aborted(e) => e,
            BackoffError::Cancelled { operation } => Error::cancelled(operation),
        }
    }
}

/// Execute an async operation until it succeeds, the attempts run out, or
/// the token is cancelled.
///
/// # Arguments
/// * `config` - Interval and attempt budget
/// * `operation_name` - Name for logging purposes
/// * `cancel` - Stops the loop between attempts
/// * `operation` - The async operation to retry
pub async fn backoff<F, Fut, T, E>(
    config: &BackoffConfig,
    operation_name: &str,
    cancel: &CancellationToken,
    operation: F,
) -> Result<T, BackoffError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(config, operation_name, cancel, operation, |_| true).await
}

/// Like [`backoff`], but only errors accepted by `should_retry` are retried.
///
/// Any other error is returned immediately as [`BackoffError::Aborted`].
pub async fn retry_if<F, Fut, T, E, P>(
    config: &BackoffConfig,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
    should_retry: P,
) -> Result<T, BackoffError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(BackoffError::Cancelled {
                operation: operation_name.to_string(),
            });
        }

        attempt += 1;

        let e = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !should_retry(&e) {
            return Err(BackoffError::Aborted(e));
        }

        if config.max_attempts > 0 && attempt >= config.max_attempts {
            error!(
                operation = %operation_name,
                attempt = attempt,
                error = %e,
                "Operation failed after max retries"
            );
            return Err(BackoffError::Exhausted {
                operation: operation_name.to_string(),
                attempts: attempt,
                last: e,
            });
        }

        warn!(
            operation = %operation_name,
            attempt = attempt,
            error = %e,
            delay_ms = config.interval.as_millis(),
            "Operation failed, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(BackoffError::Cancelled {
                    operation: operation_name.to_string(),
                });
            }
            _ = tokio::time::sleep(config.interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_attempts: u32) -> BackoffConfig {
        BackoffConfig::new(Duration::from_millis(1), max_attempts)
    }

    #[tokio::test]
    async fn test_backoff_succeeds_first_try() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<i32, BackoffError<String>> =
            backoff(&fast(3), "test_op", &CancellationToken::new(), || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_backoff_succeeds_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<i32, BackoffError<String>> =
            backoff(&fast(5), "test_op", &CancellationToken::new(), || {
                let calls = calls_clone.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err("transient".to_string())
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_backoff_exhausts_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<i32, BackoffError<String>> =
            backoff(&fast(3), "test_op", &CancellationToken::new(), || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("always fails".to_string())
                }
            })
            .await;

        match result {
            Err(BackoffError::Exhausted { attempts, last, .. }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last, "always fails");
            }
            other => panic!("expected Exhausted, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_if_stops_on_unclassified_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<i32, BackoffError<String>> = retry_if(
            &fast(0),
            "test_op",
            &CancellationToken::new(),
            || {
                let calls = calls_clone.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        Err("conflict".to_string())
                    } else {
                        Err("forbidden".to_string())
                    }
                }
            },
            |e| e == "conflict",
        )
        .await;

        assert!(matches!(result, Err(BackoffError::Aborted(ref e)) if e == "forbidden"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_sleep() {
        let cancel = CancellationToken::new();
        let config = BackoffConfig::unbounded(Duration::from_secs(3600));

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let result: Result<(), BackoffError<String>> =
            backoff(&config, "test_op", &cancel, || async {
                Err("not yet".to_string())
            })
            .await;

        assert!(matches!(result, Err(BackoffError::Cancelled { .. })));
    }

    #[test]
    fn test_exhausted_converts_to_error() {
        let err: Error = BackoffError::Exhausted {
            operation: "wait_for_backup".to_string(),
            attempts: 10,
            last: Error::BackupNotFound {
                name: "b".to_string(),
            },
        }
        .into();
        assert!(err.to_string().contains("reached maximum attempts (10)"));
        assert!(err.is_not_found());
    }
}
