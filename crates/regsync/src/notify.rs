use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Severity of a user-facing notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Success,
    Info,
    Error,
}

/// A toast-style notification surfaced to the user.
///
/// Notifications are presentation data, not errors: the sync layer keeps
/// running regardless of whether anyone is listening.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub severity: Severity,
    pub message: String,
}

/// Fan-out point for user notifications
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to notifications emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn success(&self, message: impl Into<String>) {
        self.publish(Severity::Success, message.into());
    }

    pub fn info(&self, message: impl Into<String>) {
        self.publish(Severity::Info, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.publish(Severity::Error, message.into());
    }

    fn publish(&self, severity: Severity, message: String) {
        debug!("notification ({:?}): {}", severity, message);
        if self.tx.send(Notification { severity, message }).is_err() {
            debug!("no active notification receivers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_notifications_in_order() {
        let notifier = Notifier::new(8);
        let mut rx = notifier.subscribe();

        notifier.success("new guest registered");
        notifier.error("failed to load students");

        let first = rx.recv().await.unwrap();
        assert_eq!(first.severity, Severity::Success);
        assert_eq!(first.message, "new guest registered");

        let second = rx.recv().await.unwrap();
        assert_eq!(second.severity, Severity::Error);
    }

    #[tokio::test]
    async fn publishing_without_receivers_is_harmless() {
        let notifier = Notifier::new(8);
        notifier.info("nobody is listening");
    }
}
