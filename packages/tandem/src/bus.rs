//! Best-effort notification bus.
//!
//! # Guarantees
//!
//! - **At-most-once delivery**: a lost publish is never an error.
//! - **Hint only**: the bus shortens worker wake-up latency; correctness
//!   comes from the store, which workers poll regardless.
//!
//! Topics are small strings built by [`topics`]. The in-process
//! [`BroadcastBus`] serves embedded setups and tests; the postgres driver
//! crate ships a LISTEN/NOTIFY bus with the same contract.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;

/// Topic name constructors. The strings are a wire contract shared with
/// external subscribers.
pub mod topics {
    use uuid::Uuid;

    /// Published when a job of `type_name` becomes acquirable.
    pub fn job_type(type_name: &str) -> String {
        format!("type:{type_name}")
    }

    /// Published when a chain whose root has `type_name` reaches terminal
    /// completion.
    pub fn chain_completed(type_name: &str) -> String {
        format!("chain-completed:{type_name}")
    }

    /// Published after a chain is deleted.
    pub fn deleted(chain_id: Uuid) -> String {
        format!("deleted:{chain_id}")
    }
}

/// Publish/subscribe contract for wake-up hints.
pub trait NotifyBus: Send + Sync {
    /// Fire-and-forget publish. Implementations must not block the caller
    /// on delivery.
    fn publish(&self, topic: &str);

    /// Subscribe to a set of topics with one merged stream. The
    /// subscription ends when the returned handle is dropped.
    fn subscribe(&self, topics: &[String]) -> BusSubscription;
}

/// Receiving end of a subscription. Yields the topic string of each
/// matching publish.
pub struct BusSubscription {
    rx: mpsc::UnboundedReceiver<String>,
    _guard: Box<dyn Send>,
}

impl BusSubscription {
    pub fn new(rx: mpsc::UnboundedReceiver<String>, guard: Box<dyn Send>) -> Self {
        Self { rx, _guard: guard }
    }

    /// Wait for the next notification. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Drop any notifications that piled up while the subscriber was busy.
    /// They are hints; one wake-up is as good as ten.
    pub fn drain(&mut self) {
        while self.rx.try_recv().is_ok() {}
    }
}

// ============================================================================
// In-process bus
// ============================================================================

type SubscriberMap = DashMap<String, Vec<(u64, mpsc::UnboundedSender<String>)>>;

/// In-process bus over unbounded channels.
#[derive(Clone, Default)]
pub struct BroadcastBus {
    subscribers: Arc<SubscriberMap>,
    next_id: Arc<AtomicU64>,
}

impl BroadcastBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn unsubscribe(subscribers: &SubscriberMap, topics: &[String], id: u64) {
        for topic in topics {
            if let Some(mut entry) = subscribers.get_mut(topic) {
                entry.retain(|(sub_id, _)| *sub_id != id);
            }
        }
    }
}

impl NotifyBus for BroadcastBus {
    fn publish(&self, topic: &str) {
        if let Some(mut entry) = self.subscribers.get_mut(topic) {
            entry.retain(|(_, tx)| tx.send(topic.to_string()).is_ok());
        }
    }

    fn subscribe(&self, topics: &[String]) -> BusSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        for topic in topics {
            self.subscribers
                .entry(topic.clone())
                .or_default()
                .push((id, tx.clone()));
        }

        let guard = SubscriptionGuard {
            subscribers: Arc::clone(&self.subscribers),
            topics: topics.to_vec(),
            id,
        };
        BusSubscription::new(rx, Box::new(guard))
    }
}

struct SubscriptionGuard {
    subscribers: Arc<SubscriberMap>,
    topics: Vec<String>,
    id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        BroadcastBus::unsubscribe(&self.subscribers, &self.topics, self.id);
    }
}

/// A bus that drops everything. Workers fall back to interval polling.
#[derive(Clone, Copy, Default)]
pub struct NullBus;

impl NotifyBus for NullBus {
    fn publish(&self, _topic: &str) {}

    fn subscribe(&self, _topics: &[String]) -> BusSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        // Park the sender in the guard so `recv` pends instead of ending.
        BusSubscription::new(rx, Box::new(tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn topic_names_are_stable() {
        let chain_id = Uuid::nil();
        assert_eq!(topics::job_type("send_email"), "type:send_email");
        assert_eq!(
            topics::chain_completed("send_email"),
            "chain-completed:send_email"
        );
        assert_eq!(
            topics::deleted(chain_id),
            format!("deleted:{chain_id}")
        );
    }

    #[tokio::test]
    async fn subscriber_receives_matching_topic() {
        let bus = BroadcastBus::new();
        let mut sub = bus.subscribe(&[topics::job_type("a"), topics::job_type("b")]);

        bus.publish(&topics::job_type("b"));
        assert_eq!(sub.recv().await.as_deref(), Some("type:b"));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let bus = BroadcastBus::new();
        bus.publish(&topics::job_type("nobody"));
    }

    #[tokio::test]
    async fn non_matching_topics_are_not_delivered() {
        let bus = BroadcastBus::new();
        let mut sub = bus.subscribe(&[topics::job_type("a")]);

        bus.publish(&topics::job_type("other"));
        bus.publish(&topics::job_type("a"));
        assert_eq!(sub.recv().await.as_deref(), Some("type:a"));
    }

    #[tokio::test]
    async fn dropped_subscription_is_removed() {
        let bus = BroadcastBus::new();
        let sub = bus.subscribe(&[topics::job_type("a")]);
        drop(sub);

        bus.publish(&topics::job_type("a"));
        assert!(
            bus.subscribers
                .get(&topics::job_type("a"))
                .map(|entry| entry.is_empty())
                .unwrap_or(true)
        );
    }

    #[tokio::test]
    async fn drain_discards_backlog() {
        let bus = BroadcastBus::new();
        let mut sub = bus.subscribe(&[topics::job_type("a")]);

        for _ in 0..5 {
            bus.publish(&topics::job_type("a"));
        }
        sub.drain();
        bus.publish(&topics::job_type("a"));
        assert_eq!(sub.recv().await.as_deref(), Some("type:a"));
    }
}
