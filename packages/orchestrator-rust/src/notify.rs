//! Lifecycle and error notifications.
//!
//! Notifications fan out over a broadcast channel. Errors are also logged, so
//! an unobserved failure is still visible.

use std::fmt::Display;

use tokio::sync::broadcast;
use tracing::error;

use crate::error::ShutdownError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// `start()` finished.
    Ready,
    /// A transport, queue, or dispatch fault.
    Error { source: String, message: String },
    /// `end()` finished, with the shutdown error if there was one.
    Ended { error: Option<String> },
}

/// Broadcasts [`Notification`]s to every subscriber.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn ready(&self) {
        self.send(Notification::Ready);
    }

    pub fn error(&self, source: impl Into<String>, message: impl Display) {
        let source = source.into();
        let message = message.to_string();
        error!(source = %source, %message, "orchestrator error");
        self.send(Notification::Error { source, message });
    }

    pub fn ended(&self, error: Option<&ShutdownError>) {
        self.send(Notification::Ended {
            error: error.map(ToString::to_string),
        });
    }

    fn send(&self, notification: Notification) {
        // No subscribers is fine.
        let _ = self.tx.send(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_notifications_in_order() {
        let notifier = Notifier::new(8);
        let mut rx = notifier.subscribe();

        notifier.ready();
        notifier.error("transport:memory", "connection reset");
        notifier.ended(Some(&ShutdownError::Timeout { timeout_ms: 50 }));

        assert_eq!(rx.recv().await.unwrap(), Notification::Ready);
        assert_eq!(
            rx.recv().await.unwrap(),
            Notification::Error {
                source: "transport:memory".into(),
                message: "connection reset".into(),
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            Notification::Ended {
                error: Some("shutdown timed out after 50ms".into()),
            }
        );
    }

    #[test]
    fn sending_without_subscribers_is_silent() {
        let notifier = Notifier::new(0);
        notifier.ready();
        notifier.error("queue:echo", "full");
    }
}
