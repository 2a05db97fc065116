//! Per-document broadcast channels on the shared connection.
//!
//! ```text
//!   join ×3 ──► refcount 3 ─┐            one transport subscription
//!   leave ×2 ─► refcount 1  ├──► topic "document:<id>" ──► ConnectionManager
//!   leave ───► refcount 0 ──┘        │
//!                  │ grace 1.5s      ├── pump:      inbound → PresenceTracker
//!                  ▼                 ├── writer:    Broadcaster queue → publish
//!               release              └── announcer: heartbeat timer, re-join on reconnect
//! ```
//!
//! Join and leave are serialized by one async mutex over the channel table,
//! so concurrent joins never open a second subscription. A join during the
//! grace period cancels the pending release and reuses the live channel.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::connection::{ConnectionManager, ConnectionStatus};
use crate::error::{CollabError, Result};
use crate::presence::PresenceTracker;
use crate::protocol::{
    topic_for, CursorPosition, DocumentId, Envelope, Identity, MessageType, Payload,
    ProtocolError, SelectionRange, UserId,
};
use crate::sharing::{ContentRef, Permission, ShareAccessController};

/// Channel timing and buffering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Delay between the last leave and the actual unsubscribe.
    #[serde(rename = "grace_period_ms", with = "crate::config::duration_ms")]
    pub grace_period: Duration,
    #[serde(rename = "heartbeat_interval_ms", with = "crate::config::duration_ms")]
    pub heartbeat_interval: Duration,
    /// Outbound queue per channel; sends beyond it are dropped.
    pub outbound_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_millis(1500),
            heartbeat_interval: Duration::from_secs(10),
            outbound_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Connecting,
    Subscribed,
    Error,
    Closed,
}

/// Snapshot of a channel's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSubscription {
    pub document_id: DocumentId,
    pub status: SubscriptionStatus,
    pub ref_count: usize,
}

// ─── Broadcaster ──────────────────────────────────────────────────────────

/// Send half of a joined channel.
///
/// Fire-and-forget: messages are queued for the channel writer and published
/// at most once, without acknowledgment. A full queue drops the message.
/// Callers throttle high-frequency traffic (see [`CursorThrottle`]).
#[derive(Debug, Clone)]
pub struct Broadcaster {
    document_id: DocumentId,
    sender_id: UserId,
    outbound: mpsc::Sender<Envelope>,
}

impl Broadcaster {
    pub(crate) fn new(document_id: DocumentId, sender_id: UserId, outbound: mpsc::Sender<Envelope>) -> Self {
        Self {
            document_id,
            sender_id,
            outbound,
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Wrap `payload` in an envelope and queue it.
    ///
    /// Fails only when the channel has been released.
    pub fn send(&self, msg_type: MessageType, payload: Payload) -> std::result::Result<(), ProtocolError> {
        self.enqueue(Envelope::new(msg_type, self.sender_id.clone(), payload))
    }

    pub fn send_cursor_position(&self, cursor: &CursorPosition) -> std::result::Result<(), ProtocolError> {
        self.send(MessageType::Cursor, Payload::from_cursor(cursor))
    }

    /// `None` clears the selection on every peer.
    pub fn send_selection(&self, selection: Option<&SelectionRange>) -> std::result::Result<(), ProtocolError> {
        self.send(MessageType::Selection, Payload::from_selection(selection))
    }

    pub fn send_heartbeat(&self) -> std::result::Result<(), ProtocolError> {
        self.send(MessageType::Heartbeat, Payload::default())
    }

    fn enqueue(&self, envelope: Envelope) -> std::result::Result<(), ProtocolError> {
        match self.outbound.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                log::warn!(
                    "Outbound queue of {} full, {:?} dropped",
                    self.document_id,
                    envelope.msg_type
                );
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ProtocolError::ChannelClosed),
        }
    }
}

/// Client-side rate limiter for cursor traffic (default 30 per second).
#[derive(Debug, Clone)]
pub struct CursorThrottle {
    interval: Duration,
    last_sent: Option<Instant>,
}

impl Default for CursorThrottle {
    fn default() -> Self {
        Self::new(Duration::from_millis(33))
    }
}

impl CursorThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
        }
    }

    /// Whether a cursor update may go out now; records the send if so.
    pub fn should_send(&mut self, now: Instant) -> bool {
        match self.last_sent {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last_sent = Some(now);
                true
            }
        }
    }
}

// ─── Registry ─────────────────────────────────────────────────────────────

struct Channel {
    topic: String,
    identity: Identity,
    ref_count: usize,
    open: bool,
    outbound: mpsc::Sender<Envelope>,
    pump: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    announcer: Option<JoinHandle<()>>,
    release: Option<JoinHandle<()>>,
    /// Bumped on every transition to zero; a stale release task is a no-op.
    generation: u64,
}

impl Channel {
    fn broadcaster(&self, document_id: &str) -> Broadcaster {
        Broadcaster::new(
            document_id.to_string(),
            self.identity.user_id.clone(),
            self.outbound.clone(),
        )
    }

    fn abort_workers(&mut self) {
        for task in [self.pump.take(), self.writer.take(), self.announcer.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }

    fn cancel_release(&mut self) -> bool {
        match self.release.take() {
            Some(release) => {
                release.abort();
                true
            }
            None => false,
        }
    }
}

pub struct ChannelRegistry {
    connection: Arc<ConnectionManager>,
    access: Arc<ShareAccessController>,
    presence: Arc<PresenceTracker>,
    config: ChannelConfig,
    channels: Mutex<HashMap<DocumentId, Channel>>,
    weak: Weak<ChannelRegistry>,
}

impl ChannelRegistry {
    pub fn new(
        connection: Arc<ConnectionManager>,
        access: Arc<ShareAccessController>,
        presence: Arc<PresenceTracker>,
        config: ChannelConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            connection,
            access,
            presence,
            config,
            channels: Mutex::new(HashMap::new()),
            weak: weak.clone(),
        })
    }

    /// Join `document_id` as `identity`.
    ///
    /// Requires view access. Only the first join opens the transport
    /// subscription; later joins share it and must use the same user.
    pub async fn join(&self, document_id: &str, identity: &Identity) -> Result<Broadcaster> {
        let content = ContentRef::document(document_id);
        if !self
            .access
            .check_access(&identity.user_id, &content, Permission::View)
            .await?
        {
            log::info!("{} denied access to {document_id}", identity.user_id);
            return Err(CollabError::AccessDenied(format!(
                "{} may not view {document_id}",
                identity.user_id
            )));
        }

        let mut channels = self.channels.lock().await;
        if let Some(channel) = channels.get_mut(document_id).filter(|c| c.open) {
            if channel.identity.user_id != identity.user_id {
                return Err(CollabError::InvalidState(format!(
                    "{document_id} is already joined as {}",
                    channel.identity.user_id
                )));
            }
            channel.ref_count += 1;
            if channel.cancel_release() {
                log::debug!("Rejoined {document_id} within grace period");
            }
            self.ensure_route(document_id, channel).await?;
            return Ok(channel.broadcaster(document_id));
        }

        let channel = self.open_channel(document_id, identity).await?;
        let broadcaster = channel.broadcaster(document_id);
        channels.insert(document_id.to_string(), channel);
        log::info!("Joined {document_id} as {}", identity.user_id);
        Ok(broadcaster)
    }

    /// Drop one reference. The last one schedules the release after the
    /// grace period. Unknown documents are ignored.
    pub async fn leave(&self, document_id: &str) {
        let mut channels = self.channels.lock().await;
        let Some(channel) = channels.get_mut(document_id) else {
            return;
        };
        if !channel.open || channel.ref_count == 0 {
            return;
        }

        channel.ref_count -= 1;
        if channel.ref_count > 0 {
            return;
        }

        channel.generation += 1;
        let generation = channel.generation;
        let registry = self.weak.clone();
        let grace = self.config.grace_period;
        let document_id = document_id.to_string();
        log::debug!("Last leave on {document_id}, releasing in {grace:?}");
        channel.release = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(registry) = registry.upgrade() {
                registry.release_if_idle(&document_id, generation).await;
            }
        }));
    }

    /// Close every open channel immediately.
    pub async fn close_all(&self) {
        let mut channels = self.channels.lock().await;
        for (document_id, channel) in channels.iter_mut().filter(|(_, c)| c.open) {
            channel.cancel_release();
            self.close_channel(document_id, channel).await;
        }
    }

    pub async fn subscription(&self, document_id: &str) -> Option<ChannelSubscription> {
        let channels = self.channels.lock().await;
        let channel = channels.get(document_id)?;
        let status = if !channel.open {
            SubscriptionStatus::Closed
        } else if self.connection.is_subscribed(&channel.topic).await {
            SubscriptionStatus::Subscribed
        } else if self.connection.status() == ConnectionStatus::Error {
            SubscriptionStatus::Error
        } else {
            SubscriptionStatus::Connecting
        };
        Some(ChannelSubscription {
            document_id: document_id.to_string(),
            status,
            ref_count: channel.ref_count,
        })
    }

    pub async fn broadcaster(&self, document_id: &str) -> Option<Broadcaster> {
        let channels = self.channels.lock().await;
        channels
            .get(document_id)
            .filter(|c| c.open)
            .map(|c| c.broadcaster(document_id))
    }

    /// Documents with an open channel (including ones inside their grace period).
    pub async fn active_documents(&self) -> Vec<DocumentId> {
        let channels = self.channels.lock().await;
        let mut documents: Vec<DocumentId> = channels
            .iter()
            .filter(|(_, c)| c.open)
            .map(|(id, _)| id.clone())
            .collect();
        documents.sort();
        documents
    }

    pub async fn ref_count(&self, document_id: &str) -> usize {
        self.channels
            .lock()
            .await
            .get(document_id)
            .map_or(0, |c| c.ref_count)
    }

    async fn open_channel(&self, document_id: &str, identity: &Identity) -> Result<Channel> {
        let topic = topic_for(document_id);
        let inbound = self.connection.subscribe(&topic).await?;
        let (outbound, queue) = mpsc::channel(self.config.outbound_capacity.max(1));

        let pump = spawn_pump(
            inbound,
            self.presence.clone(),
            document_id.to_string(),
            identity.user_id.clone(),
        );
        let writer = spawn_writer(queue, self.connection.clone(), topic.clone());
        let announcer = spawn_announcer(
            Broadcaster::new(document_id.to_string(), identity.user_id.clone(), outbound.clone()),
            identity.clone(),
            self.connection.clone(),
            self.config.heartbeat_interval,
        );

        if outbound.try_send(Envelope::join(identity)).is_err() {
            log::warn!("Join announcement for {document_id} dropped");
        }

        Ok(Channel {
            topic,
            identity: identity.clone(),
            ref_count: 1,
            open: true,
            outbound,
            pump: Some(pump),
            writer: Some(writer),
            announcer: Some(announcer),
            release: None,
            generation: 0,
        })
    }

    /// Re-route a live channel whose route was dropped by `disconnect()`.
    async fn ensure_route(&self, document_id: &str, channel: &mut Channel) -> Result<()> {
        if self.connection.has_route(&channel.topic).await {
            return Ok(());
        }
        let inbound = self.connection.subscribe(&channel.topic).await?;
        if let Some(old) = channel.pump.take() {
            old.abort();
        }
        channel.pump = Some(spawn_pump(
            inbound,
            self.presence.clone(),
            document_id.to_string(),
            channel.identity.user_id.clone(),
        ));
        log::debug!("Restored route for {document_id}");
        Ok(())
    }

    async fn release_if_idle(&self, document_id: &str, generation: u64) {
        let mut channels = self.channels.lock().await;
        let Some(channel) = channels.get_mut(document_id) else {
            return;
        };
        if !channel.open || channel.ref_count != 0 || channel.generation != generation {
            return;
        }
        self.close_channel(document_id, channel).await;
    }

    /// Runs inside the release task too, so the release handle is only
    /// detached here. Callers cancel it first when closing from outside.
    async fn close_channel(&self, document_id: &str, channel: &mut Channel) {
        // Stop the writer first so nothing queued goes out after the leave
        channel.abort_workers();
        channel.release.take();
        channel.open = false;
        channel.ref_count = 0;

        match Envelope::leave(channel.identity.user_id.clone()).encode() {
            Ok(bytes) => {
                if let Err(e) = self.connection.publish(&channel.topic, bytes).await {
                    log::debug!("Leave for {document_id} not sent: {e}");
                }
            }
            Err(e) => log::warn!("Could not encode leave: {e}"),
        }
        self.connection.unsubscribe(&channel.topic).await;
        self.presence.release(document_id).await;
        log::info!("Released channel {document_id}");
    }
}

impl Drop for ChannelRegistry {
    fn drop(&mut self) {
        for channel in self.channels.get_mut().values_mut() {
            channel.abort_workers();
            channel.cancel_release();
        }
    }
}

/// Inbound frames → presence store. Own echoes are skipped.
fn spawn_pump(
    mut inbound: mpsc::Receiver<Vec<u8>>,
    presence: Arc<PresenceTracker>,
    document_id: DocumentId,
    self_id: UserId,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(bytes) = inbound.recv().await {
            match Envelope::decode(&bytes) {
                Ok(envelope) if envelope.sender_id == self_id => {}
                Ok(envelope) => {
                    presence.apply(&document_id, &envelope).await;
                }
                Err(e) => log::warn!("Undecodable message on {document_id}: {e}"),
            }
        }
        log::debug!("Pump for {document_id} finished");
    })
}

/// Outbound queue → connection. Failed publishes are dropped.
fn spawn_writer(
    mut queue: mpsc::Receiver<Envelope>,
    connection: Arc<ConnectionManager>,
    topic: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = queue.recv().await {
            let bytes = match envelope.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::warn!("Could not encode {:?}: {e}", envelope.msg_type);
                    continue;
                }
            };
            match connection.publish(&topic, bytes).await {
                Ok(()) => log::trace!("Sent {:?} on {topic}", envelope.msg_type),
                Err(e) => log::debug!("{:?} on {topic} dropped: {e}", envelope.msg_type),
            }
        }
    })
}

/// Periodic heartbeat, plus a fresh join every time the link comes back.
fn spawn_announcer(
    broadcaster: Broadcaster,
    identity: Identity,
    connection: Arc<ConnectionManager>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut status = connection.watch_status();
        drop(connection);
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if broadcaster.send_heartbeat().is_err() {
                        break;
                    }
                }
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let connected = *status.borrow_and_update() == ConnectionStatus::Connected;
                    if connected
                        && broadcaster
                            .send(MessageType::Join, Payload::from_identity(&identity))
                            .is_err()
                    {
                        break;
                    }
                }
            }
        }
    })
}
