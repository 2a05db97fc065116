//! In-process pub/sub hub.
//!
//! ```text
//!  MemoryTransport (client A) ──┐                 ┌── forward task ──► inbound A
//!                               ├── MemoryHub ────┤
//!  MemoryTransport (client B) ──┘   TopicRegistry └── forward task ──► inbound B
//! ```
//!
//! The hub can be taken offline (`set_online(false)`): every link drops with
//! [`TransportEvent::Disconnected`] and new connects fail until it comes
//! back. [`MemoryTransport::drop_link`] drops a single client.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{Inbound, Transport, TransportEvent};
use crate::broadcast::TopicRegistry;
use crate::error::ConnectionError;

/// Shared in-process broker.
pub struct MemoryHub {
    topics: TopicRegistry,
    online: watch::Sender<bool>,
}

impl MemoryHub {
    /// `capacity` is the per-subscriber buffer of each topic.
    pub fn new(capacity: usize) -> Arc<Self> {
        let (online, _) = watch::channel(true);
        Arc::new(Self {
            topics: TopicRegistry::new(capacity),
            online,
        })
    }

    /// Simulate a network outage (`false`) or recovery (`true`).
    pub fn set_online(&self, online: bool) {
        self.online.send_replace(online);
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Number of distinct clients subscribed to `topic`.
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        match self.topics.get(topic).await {
            Some(group) => group.subscriber_count().await,
            None => 0,
        }
    }

    pub fn topics(&self) -> &TopicRegistry {
        &self.topics
    }
}

#[derive(Default)]
struct Link {
    inbound: Option<mpsc::Sender<Inbound>>,
    forwards: HashMap<String, JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
}

impl Link {
    fn is_up(&self) -> bool {
        self.inbound.is_some()
    }
}

/// One client's connection to a [`MemoryHub`].
pub struct MemoryTransport {
    id: Uuid,
    hub: Arc<MemoryHub>,
    link: Arc<Mutex<Link>>,
    events: broadcast::Sender<TransportEvent>,
    connect_attempts: AtomicU32,
}

impl MemoryTransport {
    pub fn new(hub: Arc<MemoryHub>) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            id: Uuid::new_v4(),
            hub,
            link: Arc::new(Mutex::new(Link::default())),
            events,
            connect_attempts: AtomicU32::new(0),
        })
    }

    /// Total `connect` calls, successful or not.
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub async fn is_connected(&self) -> bool {
        self.link.lock().await.is_up()
    }

    /// Drop this client's link as if the network failed.
    pub async fn drop_link(&self) {
        let mut link = self.link.lock().await;
        if !link.is_up() {
            return;
        }
        teardown(&self.hub, self.id, &mut link, true).await;
        let _ = self.events.send(TransportEvent::Disconnected);
    }
}

async fn teardown(hub: &MemoryHub, id: Uuid, link: &mut Link, abort_watchdog: bool) {
    link.inbound = None;
    if let Some(watchdog) = link.watchdog.take() {
        if abort_watchdog {
            watchdog.abort();
        }
    }
    for (topic, forward) in link.forwards.drain() {
        forward.abort();
        if let Some(group) = hub.topics.get(&topic).await {
            group.unsubscribe(&id).await;
        }
        hub.topics.remove_if_empty(&topic).await;
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, inbound: mpsc::Sender<Inbound>) -> Result<(), ConnectionError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.hub.is_online() {
            return Err(ConnectionError::Unreachable("memory hub offline".into()));
        }

        let mut link = self.link.lock().await;
        if link.is_up() {
            teardown(&self.hub, self.id, &mut link, true).await;
        }
        link.inbound = Some(inbound);

        // Watch the hub and drop the link when it goes offline
        let mut online_rx = self.hub.online.subscribe();
        let hub = self.hub.clone();
        let shared = self.link.clone();
        let events = self.events.clone();
        let id = self.id;
        link.watchdog = Some(tokio::spawn(async move {
            while online_rx.changed().await.is_ok() {
                if !*online_rx.borrow_and_update() {
                    let mut link = shared.lock().await;
                    if link.is_up() {
                        teardown(&hub, id, &mut link, false).await;
                        let _ = events.send(TransportEvent::Disconnected);
                    }
                    break;
                }
            }
        }));

        let _ = self.events.send(TransportEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) {
        let mut link = self.link.lock().await;
        teardown(&self.hub, self.id, &mut link, true).await;
    }

    async fn subscribe(&self, topic: &str) -> Result<(), ConnectionError> {
        let mut link = self.link.lock().await;
        let inbound = link.inbound.clone().ok_or(ConnectionError::NotConnected)?;
        if link.forwards.contains_key(topic) {
            return Ok(());
        }

        let group = self.hub.topics.get_or_create(topic).await;
        let mut rx = group.subscribe(self.id).await;
        let topic_name = topic.to_string();
        let forward = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => {
                        let msg = Inbound {
                            topic: topic_name.clone(),
                            payload: payload.as_ref().clone(),
                        };
                        if inbound.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Subscriber lagged on {topic_name}, {n} messages lost");
                        group.record_dropped(n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        link.forwards.insert(topic.to_string(), forward);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), ConnectionError> {
        let mut link = self.link.lock().await;
        if let Some(forward) = link.forwards.remove(topic) {
            forward.abort();
            if let Some(group) = self.hub.topics.get(topic).await {
                group.unsubscribe(&self.id).await;
            }
            self.hub.topics.remove_if_empty(topic).await;
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ConnectionError> {
        if !self.link.lock().await.is_up() {
            return Err(ConnectionError::NotConnected);
        }
        if let Some(group) = self.hub.topics.get(topic).await {
            group.publish(Arc::new(payload));
        }
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}
