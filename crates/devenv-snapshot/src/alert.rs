//! Completion alerts
//!
//! Long-running commands raise a desktop notification and ring the terminal
//! when they finish so the user can look away while a snapshot is generated
//! or restored. Alerts are best effort: a failing notifier is logged and
//! never changes the outcome.

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use notify_rust::Notification;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use devenv_common::{Error, Result};

/// Title of desktop notifications
const NOTIFICATION_SUMMARY: &str = "devenv";

/// Delivers an alert to the user
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Show `message`
    async fn notify(&self, message: &str) -> Result<()>;
}

/// [`Notifier`] ringing the terminal bell on stderr
#[derive(Clone, Debug, Default)]
pub struct TerminalBell;

#[async_trait]
impl Notifier for TerminalBell {
    async fn notify(&self, message: &str) -> Result<()> {
        info!("{}", message);
        let mut stderr = std::io::stderr();
        stderr.write_all(b"\x07")?;
        stderr.flush()?;
        Ok(())
    }
}

/// [`Notifier`] showing a desktop notification and ringing the terminal bell
#[derive(Clone, Debug, Default)]
pub struct DesktopAlert;

#[async_trait]
impl Notifier for DesktopAlert {
    async fn notify(&self, message: &str) -> Result<()> {
        TerminalBell.notify(message).await?;

        let notification = desktop_notification(message);
        tokio::task::spawn_blocking(move || notification.show().map(|_| ()))
            .await
            .map_err(|e| Error::internal_with_context("alert", e.to_string()))?
            .map_err(|e| Error::internal_with_context("alert", e.to_string()))
    }
}

fn desktop_notification(message: &str) -> Notification {
    let mut notification = Notification::new();
    notification
        .appname(NOTIFICATION_SUMMARY)
        .summary(NOTIFICATION_SUMMARY)
        .body(message);
    notification
}

/// An alert running in the background
pub struct AlertTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl AlertTask {
    /// Start delivering `message`
    pub fn spawn(notifier: Arc<dyn Notifier>, message: impl Into<String>) -> Self {
        let message = message.into();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => debug!("Alert cancelled"),
                result = notifier.notify(&message) => {
                    if let Err(e) = result {
                        warn!(error = %e, "Failed to deliver alert");
                    }
                }
            }
        });
        Self { handle, cancel }
    }

    /// Stop the alert if it has not been delivered yet
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the alert to finish
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Alert task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_desktop_notification_carries_message() {
        let notification = desktop_notification("Snapshot generated");
        assert_eq!(notification.summary, "devenv");
        assert_eq!(notification.appname, "devenv");
        assert_eq!(notification.body, "Snapshot generated");
    }

    #[tokio::test]
    async fn test_alert_is_delivered() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .withf(|m| m == "Snapshot generated")
            .times(1)
            .returning(|_| Ok(()));

        AlertTask::spawn(Arc::new(notifier), "Snapshot generated")
            .join()
            .await;
    }

    #[tokio::test]
    async fn test_failed_alert_is_swallowed() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .returning(|_| Err(Error::internal("no terminal")));

        AlertTask::spawn(Arc::new(notifier), "done").join().await;
    }

    struct Stuck;

    #[async_trait]
    impl Notifier for Stuck {
        async fn notify(&self, _message: &str) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_a_stuck_alert() {
        let alert = AlertTask::spawn(Arc::new(Stuck), "done");
        alert.cancel();
        tokio::time::timeout(Duration::from_secs(5), alert.join())
            .await
            .unwrap();
    }
}
