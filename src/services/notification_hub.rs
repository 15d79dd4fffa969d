use tokio::sync::broadcast;

use crate::models::Notification;

/// Pub-sub boundary for ad-hoc user-facing messages. The core only produces
/// structured records; rendering belongs to the presentation layer.
#[derive(Clone)]
pub struct NotificationHub {
    events: broadcast::Sender<Notification>,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationHub {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self { events }
    }

    pub fn send(&self, notification: Notification) {
        tracing::debug!(
            "notification [{:?}] {}: {}",
            notification.severity,
            notification.title,
            notification.text
        );
        let _ = self.events.send(notification);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.events.subscribe()
    }
}
