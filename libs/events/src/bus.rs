//! In-process event bus.
//!
//! A thin wrapper over a tokio broadcast channel. Publishing never blocks;
//! subscribers that fall behind see `Lagged` and lose the overwritten
//! events, which matches the at-least-once, best-effort delivery contract.

use tokio::sync::broadcast;
use tracing::debug;

use crate::Event;

const DEFAULT_CAPACITY: usize = 256;

/// Write-many read-many event bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

/// A live subscription to the bus.
pub type EventSubscription = broadcast::Receiver<Event>;

impl EventBus {
    /// Creates a bus with the default buffer capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a bus buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes an event to all current subscribers.
    ///
    /// An event with no subscribers is dropped silently.
    pub fn publish(&self, event: Event) {
        debug!(event_type = event.event_type(), "Publishing event");
        let _ = self.tx.send(event);
    }

    /// Opens a new subscription starting at the current position.
    #[must_use]
    pub fn subscribe(&self) -> EventSubscription {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gantry_path::DeploymentId;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut sub_a = bus.subscribe();
        let mut sub_b = bus.subscribe();

        bus.publish(Event::DeploymentSuccess {
            timestamp: Utc::now(),
            deployment_id: DeploymentId::new(),
        });

        assert_eq!(
            sub_a.recv().await.unwrap().event_type(),
            "deployment_success"
        );
        assert_eq!(
            sub_b.recv().await.unwrap().event_type(),
            "deployment_success"
        );
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.publish(Event::DeploymentCanceled {
            timestamp: Utc::now(),
            deployment_id: DeploymentId::new(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscription_starts_at_current_position() {
        let bus = EventBus::new();
        bus.publish(Event::DeploymentSuccess {
            timestamp: Utc::now(),
            deployment_id: DeploymentId::new(),
        });

        // Events published before subscribing are not replayed.
        let mut sub = bus.subscribe();
        bus.publish(Event::DeploymentCanceled {
            timestamp: Utc::now(),
            deployment_id: DeploymentId::new(),
        });
        assert_eq!(
            sub.recv().await.unwrap().event_type(),
            "deployment_canceled"
        );
    }
}
