//! Outbound change notifications.

use factory_core::Notification;
use tokio::sync::broadcast;
use tracing::trace;

/// Publishes notifications to named channels.
pub trait NotificationBus: Send + Sync {
    /// Publish `notification` on `channel`. Delivery is best effort.
    fn publish(&self, channel: &str, notification: Notification);
}

/// A notification together with the channel it was published on.
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    /// Channel name
    pub channel: String,
    /// Payload
    pub notification: Notification,
}

/// In-process bus over a tokio broadcast channel.
pub struct BroadcastBus {
    tx: broadcast::Sender<Published>,
}

impl BroadcastBus {
    /// Bus buffering up to `capacity` messages per lagging receiver.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Receive everything published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Published> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl NotificationBus for BroadcastBus {
    fn publish(&self, channel: &str, notification: Notification) {
        // No receivers is fine
        let receivers = self
            .tx
            .send(Published {
                channel: channel.to_string(),
                notification,
            })
            .unwrap_or(0);
        trace!(channel, receivers, "Published notification");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use factory_core::{JobChangeNotification, TaskChangeNotification};

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = BroadcastBus::default();
        let mut rx = bus.subscribe();
        bus.publish("jobs.project.1", Notification::Jobs(JobChangeNotification::default()));
        bus.publish("tasks.job.x", Notification::Tasks(TaskChangeNotification::default()));

        assert_eq!(rx.recv().await.unwrap().channel, "jobs.project.1");
        assert_eq!(rx.recv().await.unwrap().channel, "tasks.job.x");
    }

    #[test]
    fn test_publish_without_subscribers() {
        BroadcastBus::new(0).publish("c", Notification::Tasks(TaskChangeNotification::default()));
    }
}
