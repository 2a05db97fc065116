//! Per-topic fan-out with bounded buffers.
//!
//! Uses tokio broadcast channels: one send reaches every subscriber of the
//! topic. Each subscriber buffers up to `capacity` messages; a subscriber
//! that falls further behind loses the oldest messages (best-effort
//! delivery, reported through [`TopicGroup::record_dropped`]).
//!
//! Shared by the in-memory hub and the WebSocket relay.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_subscribers: usize,
}

/// Lock-free counters for the publish hot path.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Fan-out group for a single topic.
pub struct TopicGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    subscribers: RwLock<HashSet<Uuid>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl TopicGroup {
    /// `capacity` is the per-subscriber buffer before lagging receivers drop.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            subscribers: RwLock::new(HashSet::new()),
            capacity,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a subscriber and hand back its receiver.
    ///
    /// Subscribing the same id twice yields a second receiver but counts once.
    pub async fn subscribe(&self, subscriber: Uuid) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.subscribers.write().await.insert(subscriber);
        self.sender.subscribe()
    }

    /// Returns true if the subscriber was present.
    pub async fn unsubscribe(&self, subscriber: &Uuid) -> bool {
        self.subscribers.write().await.remove(subscriber)
    }

    /// Publish to every current receiver. Returns the receiver count
    /// (zero when nobody listens, which is not an error).
    pub fn publish(&self, payload: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(payload).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account messages a lagging receiver never saw.
    pub fn record_dropped(&self, n: u64) {
        self.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn has_subscriber(&self, subscriber: &Uuid) -> bool {
        self.subscribers.read().await.contains(subscriber)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_subscribers: self.subscribers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps topic names to fan-out groups.
pub struct TopicRegistry {
    topics: RwLock<HashMap<String, Arc<TopicGroup>>>,
    default_capacity: usize,
}

impl TopicRegistry {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the group for `topic`.
    pub async fn get_or_create(&self, topic: &str) -> Arc<TopicGroup> {
        // Fast path: read lock
        {
            let topics = self.topics.read().await;
            if let Some(group) = topics.get(topic) {
                return group.clone();
            }
        }

        let mut topics = self.topics.write().await;
        // Double-check after acquiring write lock
        if let Some(group) = topics.get(topic) {
            return group.clone();
        }
        let group = Arc::new(TopicGroup::new(self.default_capacity));
        topics.insert(topic.to_string(), group.clone());
        group
    }

    pub async fn get(&self, topic: &str) -> Option<Arc<TopicGroup>> {
        self.topics.read().await.get(topic).cloned()
    }

    /// Drop the group once nobody is subscribed.
    pub async fn remove_if_empty(&self, topic: &str) -> bool {
        let mut topics = self.topics.write().await;
        if let Some(group) = topics.get(topic) {
            if group.subscriber_count().await == 0 {
                topics.remove(topic);
                log::debug!("Topic {topic} removed (empty)");
                return true;
            }
        }
        false
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }

    pub async fn active_topics(&self) -> Vec<String> {
        self.topics.read().await.keys().cloned().collect()
    }
}
