//! Notification fan-out
//!
//! Observer of state transitions, never a dependency: engines dispatch
//! after a successful commit and delivery failures are logged, not
//! propagated. The push transport itself is behind `NotificationSink`.

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ChallengeReceived,
    ChallengeAccepted,
    ClipRejected,
    VotingOpened,
    ChallengeCompleted,
    ClaimSubmitted,
    FilmerTagged,
    ClaimApproved,
    ClaimRejected,
    ClaimPaid,
    BountyExpired,
    BountyCancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub recipient: String,
    pub kind: NotificationKind,
    /// Document path of the entity the notification is about.
    pub subject: String,
    pub body: String,
}

impl Notification {
    pub fn new(
        recipient: impl Into<String>,
        kind: NotificationKind,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            recipient: recipient.into(),
            kind,
            subject: subject.into(),
            body: body.into(),
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Fan-out to every registered sink. Held as `Arc` by all engines.
#[derive(Default)]
pub struct NotificationDispatcher {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub async fn dispatch(&self, notifications: Vec<Notification>) {
        for notification in &notifications {
            debug!(
                "notify {} {:?} about {}",
                notification.recipient, notification.kind, notification.subject
            );
        }

        let deliveries = notifications.iter().flat_map(|n| {
            self.sinks.iter().map(move |sink| async move {
                if let Err(e) = sink.deliver(n).await {
                    warn!(
                        "notification delivery to {} failed: {}",
                        n.recipient, e
                    );
                }
            })
        });
        join_all(deliveries).await;
    }
}

/// Default sink that just logs. Stands in until a push transport adapter
/// is wired up.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, notification: &Notification) -> anyhow::Result<()> {
        tracing::info!(
            "[notify] {} {:?}: {}",
            notification.recipient,
            notification.kind,
            notification.body
        );
        Ok(())
    }
}

/// Collecting sink for tests.
#[derive(Default)]
pub struct MemorySink {
    delivered: Mutex<Vec<Notification>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<Notification> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    async fn deliver(&self, notification: &Notification) -> anyhow::Result<()> {
        self.delivered.lock().push(notification.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_reaches_every_sink() {
        let a = Arc::new(MemorySink::new());
        let b = Arc::new(MemorySink::new());
        let dispatcher = NotificationDispatcher::new()
            .with_sink(a.clone())
            .with_sink(b.clone());

        dispatcher
            .dispatch(vec![
                Notification::new("u1", NotificationKind::VotingOpened, "challenges/c1", "go vote"),
                Notification::new("u2", NotificationKind::VotingOpened, "challenges/c1", "go vote"),
            ])
            .await;

        assert_eq!(a.delivered().len(), 2);
        assert_eq!(b.delivered().len(), 2);
    }
}
