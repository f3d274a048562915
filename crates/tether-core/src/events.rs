//! Fire-and-forget notification of bridge state changes.

use crate::models::BridgeEvent;
use dashmap::DashMap;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Side channel the bridge publishes to. Implementations must not block.
pub trait Notifier: Send + Sync {
    fn publish(&self, user_id: &str, event: BridgeEvent);
}

/// In-process fan-out of bridge events to per-user subscribers.
///
/// Publishing to a user nobody listens to is a no-op; a lagging subscriber
/// loses the oldest events rather than slowing the publisher.
#[derive(Default)]
pub struct EventBus {
    channels: DashMap<String, broadcast::Sender<BridgeEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, user_id: &str) -> broadcast::Receiver<BridgeEvent> {
        self.channels
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .subscribe()
    }
}

impl Notifier for EventBus {
    fn publish(&self, user_id: &str, event: BridgeEvent) {
        let Some(tx) = self.channels.get(user_id).map(|tx| tx.clone()) else {
            return;
        };
        if tx.send(event).is_err() {
            // Every receiver is gone; forget the channel unless someone re-subscribed meanwhile.
            self.channels.remove_if(user_id, |_, tx| tx.receiver_count() == 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_only_its_users_events() {
        let bus = EventBus::new();
        let mut alice = bus.subscribe("alice");
        let mut bob = bus.subscribe("bob");

        bus.publish("alice", BridgeEvent::connected(true));

        let event = alice.recv().await.expect("event");
        assert_eq!(event.data["bridge_connected"], true);
        assert!(bob.try_recv().is_err());
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let bus = EventBus::new();
        bus.publish("nobody", BridgeEvent::memory_updated());
        assert!(bus.channels.get("nobody").is_none());
    }

    #[test]
    fn dropped_subscribers_release_the_channel() {
        let bus = EventBus::new();
        let rx = bus.subscribe("alice");
        drop(rx);
        bus.publish("alice", BridgeEvent::connected(false));
        assert!(bus.channels.get("alice").is_none());
    }
}
