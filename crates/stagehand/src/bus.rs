//! Event fan-out to out-of-core observers.
//!
//! A bounded broadcast channel: publishers never block, a subscriber that
//! falls more than the channel depth behind loses the oldest events and is
//! told how many it skipped (the WebSocket layer turns that into a
//! `subscriber_lagged` marker).

use tokio::sync::broadcast;
use tracing::trace;

use x32osc::Broadcast;

/// Queue depth per subscriber before lag kicks in.
pub const EVENT_CHANNEL_DEPTH: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Broadcast>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_DEPTH);
        Self { tx }
    }

    /// The raw sender, for components that publish directly (the session
    /// reactor takes one at construction).
    pub fn sender(&self) -> broadcast::Sender<Broadcast> {
        self.tx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Broadcast> {
        self.tx.subscribe()
    }

    /// Subscribe to a subset of event kinds (see [`Broadcast::kind`]).
    pub fn subscribe_kinds(&self, kinds: &[&str]) -> KindSubscription {
        KindSubscription {
            rx: self.tx.subscribe(),
            kinds: kinds.iter().map(|k| k.to_string()).collect(),
        }
    }

    pub fn publish(&self, event: Broadcast) {
        // send() fails only when nobody is subscribed; that is fine.
        if self.tx.send(event).is_err() {
            trace!("event published with no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver that skips events outside its registered kinds.
pub struct KindSubscription {
    rx: broadcast::Receiver<Broadcast>,
    kinds: Vec<String>,
}

impl KindSubscription {
    /// Next matching event; `None` when the bus is gone. Lagging silently
    /// resumes from the oldest retained event.
    pub async fn recv(&mut self) -> Option<Broadcast> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.kinds.iter().any(|k| k == event.kind()) => {
                    return Some(event)
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Broadcast::SceneListInvalidated);
        bus.publish(Broadcast::warning("one"));

        assert_eq!(rx.recv().await.unwrap(), Broadcast::SceneListInvalidated);
        assert_eq!(rx.recv().await.unwrap(), Broadcast::warning("one"));
    }

    #[tokio::test]
    async fn kind_subscription_filters() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe_kinds(&["error"]);
        bus.publish(Broadcast::SceneListInvalidated);
        bus.publish(Broadcast::error("boom"));

        assert_eq!(sub.recv().await.unwrap(), Broadcast::error("boom"));
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        for _ in 0..(EVENT_CHANNEL_DEPTH + 10) {
            bus.publish(Broadcast::SceneListInvalidated);
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => assert!(skipped >= 10),
            other => panic!("expected lag, got {:?}", other),
        }
    }
}
