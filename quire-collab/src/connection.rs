//! Transport lifecycle: connect, disconnect, bounded reconnect.
//!
//! ```text
//!              connect() ok
//! Disconnected ──────────► Connecting ──────────► Connected
//!      ▲                       │   ▲                  │
//!      │ disconnect()/offline  │   │ backoff          │ link dropped
//!      │                       ▼   │ (≤ max_attempts) ▼
//!      └──────────────────── Error ◄──────────── reconnect()
//! ```
//!
//! One manager per client process. It owns the only transport link and
//! multiplexes every document topic over it: inbound frames are dispatched
//! by topic to per-topic queues handed out by [`ConnectionManager::subscribe`].
//! Topics survive link loss and are re-subscribed after every successful
//! connect, until `disconnect()` forgets them.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::error::ConnectionError;
use crate::transport::{Inbound, Transport, TransportEvent};

/// Buffer of each per-topic inbound queue.
const ROUTE_CAPACITY: usize = 256;
/// Buffer between the transport and the dispatcher.
const INBOUND_CAPACITY: usize = 1024;

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Operating-system network reachability signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkSignal {
    Online,
    Offline,
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Consecutive failures before giving up.
    pub max_attempts: u32,
    #[serde(rename = "base_delay_ms", with = "crate::config::duration_ms")]
    pub base_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "crate::config::duration_ms")]
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the 1-based `attempt`: `min(base · 2^(attempt-1), max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// What the owner last asked for. Decides how link loss and network
/// signals are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
    /// Never connected, or explicitly disconnected.
    Idle,
    /// Wants to be connected.
    Active,
    /// Disconnected by an offline signal; resumes on online.
    Suspended,
}

#[derive(Default)]
struct Tasks {
    dispatcher: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

type Routes = Arc<RwLock<HashMap<String, mpsc::Sender<Vec<u8>>>>>;

/// Owner of the process-wide transport link.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    status: watch::Sender<ConnectionStatus>,
    /// Consecutive failed reconnect attempts.
    attempts: AtomicU32,
    /// Bumped by disconnect/offline; reconnect loops started under an older
    /// epoch stop.
    epoch: AtomicU64,
    /// Serializes connect/disconnect/reconnect steps.
    lifecycle: Mutex<Intent>,
    routes: Routes,
    /// Topics live on the current link.
    subscribed: RwLock<HashSet<String>>,
    tasks: Mutex<Tasks>,
    monitor: JoinHandle<()>,
    weak: Weak<ConnectionManager>,
}

impl ConnectionManager {
    /// Create a manager around `transport`. Must be called inside a tokio
    /// runtime: a monitor task watching transport events is spawned.
    pub fn new(transport: Arc<dyn Transport>, policy: ReconnectPolicy) -> Arc<Self> {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Arc::new_cyclic(|weak: &Weak<ConnectionManager>| {
            let monitor = spawn_monitor(transport.events(), weak.clone());
            Self {
                transport,
                policy,
                status,
                attempts: AtomicU32::new(0),
                epoch: AtomicU64::new(0),
                lifecycle: Mutex::new(Intent::Idle),
                routes: Arc::new(RwLock::new(HashMap::new())),
                subscribed: RwLock::new(HashSet::new()),
                tasks: Mutex::new(Tasks::default()),
                monitor,
                weak: weak.clone(),
            }
        })
    }

    pub fn with_default_policy(transport: Arc<dyn Transport>) -> Arc<Self> {
        Self::new(transport, ReconnectPolicy::default())
    }

    // ─── Status ───────────────────────────────────────────────────────

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Consecutive failed reconnect attempts since the last success.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn set_status(&self, next: ConnectionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            log::info!("Connection status → {next:?}");
        }
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    /// Open the link. No-op when already connected; concurrent calls
    /// serialize and the later ones observe the first one's result.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let mut intent = self.lifecycle.lock().await;
        *intent = Intent::Active;
        if self.status() == ConnectionStatus::Connected {
            return Ok(());
        }

        self.set_status(ConnectionStatus::Connecting);
        match self.open_link().await {
            Ok(()) => Ok(()),
            Err(e) => {
                log::warn!("Connect failed: {e}");
                self.set_status(ConnectionStatus::Error);
                Err(e)
            }
        }
    }

    /// Close the link, forget every topic and cancel pending reconnects.
    pub async fn disconnect(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let mut intent = self.lifecycle.lock().await;
        *intent = Intent::Idle;
        self.close_link().await;
        self.routes.write().await.clear();
        self.set_status(ConnectionStatus::Disconnected);
        log::info!("Disconnected, all topic routes dropped");
    }

    /// Retry the link with bounded exponential backoff.
    ///
    /// Each failure counts against a budget shared by every caller; the
    /// budget refills on any successful connect or an online signal. Once
    /// `max_attempts` consecutive attempts have failed, status becomes
    /// `Error` and [`ConnectionError::RetriesExhausted`] is returned, also
    /// for calls made while the budget is still empty.
    pub async fn reconnect(&self) -> Result<(), ConnectionError> {
        let epoch = self.epoch.load(Ordering::SeqCst);

        loop {
            {
                let mut intent = self.lifecycle.lock().await;
                if self.epoch.load(Ordering::SeqCst) != epoch {
                    return Err(ConnectionError::Cancelled);
                }
                *intent = Intent::Active;
                if self.status() == ConnectionStatus::Connected {
                    return Ok(());
                }
                let failed = self.attempts();
                if failed >= self.policy.max_attempts {
                    log::error!("Giving up after {failed} reconnection attempts");
                    self.set_status(ConnectionStatus::Error);
                    return Err(ConnectionError::RetriesExhausted { attempts: failed });
                }
                self.set_status(ConnectionStatus::Connecting);
            }

            let attempt = self.attempts() + 1;
            let delay = self.policy.delay_for(attempt);
            log::debug!("Reconnect attempt {attempt} in {delay:?}");
            tokio::time::sleep(delay).await;

            let _intent = self.lifecycle.lock().await;
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return Err(ConnectionError::Cancelled);
            }
            if self.status() == ConnectionStatus::Connected {
                return Ok(());
            }
            match self.open_link().await {
                Ok(()) => {
                    log::info!("Reconnected on attempt {attempt}");
                    return Ok(());
                }
                Err(e) => {
                    self.attempts.store(attempt, Ordering::SeqCst);
                    log::warn!("Reconnect attempt {attempt} failed: {e}");
                }
            }
        }
    }

    /// React to OS reachability changes.
    ///
    /// `Offline` cancels pending reconnects and forces `Disconnected`
    /// without any attempt; topic routes are kept. `Online` refills the
    /// retry budget and reconnects in the background unless the manager
    /// was explicitly disconnected.
    pub async fn handle_network(&self, signal: NetworkSignal) {
        match signal {
            NetworkSignal::Offline => {
                self.epoch.fetch_add(1, Ordering::SeqCst);
                let mut intent = self.lifecycle.lock().await;
                if *intent == Intent::Active {
                    *intent = Intent::Suspended;
                }
                self.close_link().await;
                self.set_status(ConnectionStatus::Disconnected);
                log::info!("Network offline");
            }
            NetworkSignal::Online => {
                self.attempts.store(0, Ordering::SeqCst);
                let resume = *self.lifecycle.lock().await != Intent::Idle;
                log::info!("Network online");
                if resume {
                    self.schedule_reconnect().await;
                }
            }
        }
    }

    /// Spawn a background reconnect unless one is already running.
    async fn schedule_reconnect(&self) {
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        let mut tasks = self.tasks.lock().await;
        if let Some(running) = &tasks.reconnect {
            if !running.is_finished() {
                return;
            }
        }
        tasks.reconnect = Some(tokio::spawn(async move {
            if let Err(e) = this.reconnect().await {
                log::warn!("Background reconnect ended: {e}");
            }
        }));
    }

    /// Link dropped without a local request.
    async fn on_transport_lost(&self, reason: &str) {
        {
            let intent = self.lifecycle.lock().await;
            if *intent != Intent::Active || self.status() != ConnectionStatus::Connected {
                return;
            }
            log::warn!("Transport lost: {reason}");
            self.subscribed.write().await.clear();
            self.abort_dispatcher().await;
            self.set_status(ConnectionStatus::Disconnected);
        }
        self.schedule_reconnect().await;
    }

    /// Connect the transport and restore every routed topic. Caller holds
    /// the lifecycle lock.
    async fn open_link(&self) -> Result<(), ConnectionError> {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        self.transport.connect(inbound_tx).await?;
        self.attempts.store(0, Ordering::SeqCst);

        {
            let mut tasks = self.tasks.lock().await;
            if let Some(old) = tasks.dispatcher.take() {
                old.abort();
            }
            tasks.dispatcher = Some(spawn_dispatcher(self.routes.clone(), inbound_rx));
        }

        let topics: Vec<String> = self.routes.read().await.keys().cloned().collect();
        let mut subscribed = self.subscribed.write().await;
        subscribed.clear();
        for topic in topics {
            match self.transport.subscribe(&topic).await {
                Ok(()) => {
                    subscribed.insert(topic);
                }
                Err(e) => log::warn!("Resubscribe to {topic} failed: {e}"),
            }
        }
        drop(subscribed);

        self.set_status(ConnectionStatus::Connected);
        Ok(())
    }

    /// Cancel reconnects, stop dispatch and close the transport. Caller
    /// holds the lifecycle lock.
    async fn close_link(&self) {
        {
            let mut tasks = self.tasks.lock().await;
            if let Some(reconnect) = tasks.reconnect.take() {
                reconnect.abort();
            }
        }
        self.abort_dispatcher().await;
        self.subscribed.write().await.clear();
        self.transport.disconnect().await;
    }

    async fn abort_dispatcher(&self) {
        if let Some(dispatcher) = self.tasks.lock().await.dispatcher.take() {
            dispatcher.abort();
        }
    }

    // ─── Topic routing ────────────────────────────────────────────────

    /// Route `topic` to a fresh queue, replacing any previous route.
    ///
    /// When connected the transport subscription is established before
    /// returning; otherwise the topic is subscribed on the next connect.
    pub async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>, ConnectionError> {
        let (tx, rx) = mpsc::channel(ROUTE_CAPACITY);
        self.routes.write().await.insert(topic.to_string(), tx);

        if self.status() == ConnectionStatus::Connected
            && !self.subscribed.read().await.contains(topic)
        {
            if let Err(e) = self.transport.subscribe(topic).await {
                self.routes.write().await.remove(topic);
                return Err(e);
            }
            self.subscribed.write().await.insert(topic.to_string());
        }
        log::debug!("Routed topic {topic}");
        Ok(rx)
    }

    /// Drop the route and the transport subscription for `topic`.
    pub async fn unsubscribe(&self, topic: &str) {
        self.routes.write().await.remove(topic);
        if self.subscribed.write().await.remove(topic) {
            if let Err(e) = self.transport.unsubscribe(topic).await {
                log::debug!("Unsubscribe from {topic} failed: {e}");
            }
        }
    }

    /// Hand `payload` to the network. Fails unless connected.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ConnectionError> {
        if self.status() != ConnectionStatus::Connected {
            return Err(ConnectionError::NotConnected);
        }
        self.transport.publish(topic, payload).await
    }

    /// Whether `topic` is live on the current link.
    pub async fn is_subscribed(&self, topic: &str) -> bool {
        self.subscribed.read().await.contains(topic)
    }

    /// Whether `topic` has a local route (live or waiting for a link).
    pub async fn has_route(&self, topic: &str) -> bool {
        self.routes.read().await.contains_key(topic)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.monitor.abort();
        let tasks = self.tasks.get_mut();
        if let Some(dispatcher) = tasks.dispatcher.take() {
            dispatcher.abort();
        }
        if let Some(reconnect) = tasks.reconnect.take() {
            reconnect.abort();
        }
    }
}

fn spawn_dispatcher(routes: Routes, mut inbound: mpsc::Receiver<Inbound>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(Inbound { topic, payload }) = inbound.recv().await {
            let route = routes.read().await.get(&topic).cloned();
            let Some(route) = route else {
                log::debug!("No route for {topic}, frame discarded");
                continue;
            };
            match route.try_send(payload) {
                Ok(()) => log::trace!("Dispatched frame on {topic}"),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!("Route {topic} is full, frame dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    log::debug!("Route {topic} closed, frame discarded");
                }
            }
        }
    })
}

fn spawn_monitor(
    mut events: broadcast::Receiver<TransportEvent>,
    manager: Weak<ConnectionManager>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let reason = match events.recv().await {
                Ok(TransportEvent::Connected) => continue,
                Ok(TransportEvent::Disconnected) => "link dropped".to_string(),
                Ok(TransportEvent::Error(e)) => e,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Some(manager) = manager.upgrade() else {
                break;
            };
            manager.on_transport_lost(&reason).await;
        }
    })
}
