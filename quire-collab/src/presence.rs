//! Live collaborator state per document.
//!
//! ## Architecture
//!
//! ```text
//! channel pump ──Envelope──► PresenceTracker::apply()
//!                                 │
//!                                 ▼
//!        document_id → { user_id → Collaborator }   (owned store)
//!                                 │
//!               ┌─────────────────┼───────────────────┐
//!               ▼                 ▼                   ▼
//!        other_collaborators   subscribe()         sweep() every 5s
//!        (UI render)           (PresenceEvent)     30s → inactive
//!                                                  120s → evicted
//! ```
//!
//! Delivery is best-effort and unordered. Messages are applied in arrival
//! order and the last one applied wins per field; envelope timestamps are
//! never compared because sender clocks are not synchronized.
//!
//! Liveness is also checked at read time, so a silent collaborator shows up
//! inactive even between sweeps.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::protocol::{CursorPosition, DocumentId, Envelope, MessageType, SelectionRange, UserId};

/// Cursor/selection colors. Collisions are tolerated.
pub const PALETTE: [&str; 12] = [
    "#E5484D", "#F76B15", "#FFC53D", "#46A758", "#12A594", "#0090FF",
    "#3E63DD", "#8E4EC6", "#D6409F", "#AD7F58", "#7D8C2E", "#6E56CF",
];

/// Stable color for `user_id`: `hash(user_id) mod PALETTE.len()`.
pub fn user_color(user_id: &str) -> &'static str {
    let hash = user_id
        .bytes()
        .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(b as u32));
    PALETTE[hash as usize % PALETTE.len()]
}

/// Liveness timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    #[serde(rename = "sweep_interval_ms", with = "crate::config::duration_ms")]
    pub sweep_interval: Duration,
    /// Silence after which a collaborator is shown inactive.
    #[serde(rename = "inactivity_timeout_ms", with = "crate::config::duration_ms")]
    pub inactivity_timeout: Duration,
    /// Silence after which a collaborator is removed.
    #[serde(rename = "eviction_grace_ms", with = "crate::config::duration_ms")]
    pub eviction_grace: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
            inactivity_timeout: Duration::from_secs(30),
            eviction_grace: Duration::from_secs(120),
        }
    }
}

/// A remote user on a document.
#[derive(Debug, Clone, PartialEq)]
pub struct Collaborator {
    pub user_id: UserId,
    pub user_name: String,
    pub avatar_url: Option<String>,
    pub user_color: &'static str,
    pub cursor: Option<CursorPosition>,
    pub selection: Option<SelectionRange>,
    pub last_heartbeat: Instant,
    is_active: bool,
    join_seq: u64,
}

impl Collaborator {
    fn placeholder(user_id: &str, join_seq: u64, now: Instant) -> Self {
        Self {
            user_id: user_id.to_string(),
            // Replaced by the profile once a join arrives
            user_name: user_id.to_string(),
            avatar_url: None,
            user_color: user_color(user_id),
            cursor: None,
            selection: None,
            last_heartbeat: now,
            is_active: true,
            join_seq,
        }
    }

    /// Derived from heartbeat age; there is no setter.
    pub fn is_active(&self) -> bool {
        self.is_active
    }

    /// Position in join order (lower joined earlier).
    pub fn join_order(&self) -> u64 {
        self.join_seq
    }

    fn touch(&mut self, now: Instant) {
        self.last_heartbeat = now;
        self.is_active = true;
    }

    fn live_at(&self, now: Instant, timeout: Duration) -> bool {
        self.is_active && now.saturating_duration_since(self.last_heartbeat) <= timeout
    }
}

/// Store changes, for observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Joined { document_id: DocumentId, user_id: UserId },
    Updated { document_id: DocumentId, user_id: UserId },
    Left { document_id: DocumentId, user_id: UserId },
    Inactive { document_id: DocumentId, user_id: UserId },
    Evicted { document_id: DocumentId, user_id: UserId },
    /// All state of the document was dropped (channel released).
    Released { document_id: DocumentId },
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub inactive: Vec<(DocumentId, UserId)>,
    pub evicted: Vec<(DocumentId, UserId)>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.inactive.is_empty() && self.evicted.is_empty()
    }
}

pub struct PresenceTracker {
    config: PresenceConfig,
    documents: RwLock<HashMap<DocumentId, HashMap<UserId, Collaborator>>>,
    join_seq: AtomicU64,
    events: broadcast::Sender<PresenceEvent>,
}

impl PresenceTracker {
    pub fn new(config: PresenceConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            config,
            documents: RwLock::new(HashMap::new()),
            join_seq: AtomicU64::new(0),
            events,
        })
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: PresenceEvent) {
        // No observers is fine
        let _ = self.events.send(event);
    }

    pub async fn apply(&self, document_id: &str, envelope: &Envelope) -> Option<PresenceEvent> {
        self.apply_at(document_id, envelope, Instant::now()).await
    }

    /// Route one inbound message. Returns the emitted event, or `None` when
    /// the message changed nothing (unknown leaver, malformed payload).
    pub async fn apply_at(
        &self,
        document_id: &str,
        envelope: &Envelope,
        now: Instant,
    ) -> Option<PresenceEvent> {
        let sender = envelope.sender_id.as_str();
        let payload = &envelope.payload;
        let mut documents = self.documents.write().await;

        if envelope.msg_type == MessageType::Leave {
            let removed = documents
                .get_mut(document_id)
                .and_then(|users| users.remove(sender));
            drop(documents);
            return removed.map(|_| {
                log::debug!("{sender} left {document_id}");
                let event = PresenceEvent::Left {
                    document_id: document_id.to_string(),
                    user_id: sender.to_string(),
                };
                self.emit(event.clone());
                event
            });
        }

        // Validate before touching the store
        let selection = match envelope.msg_type {
            MessageType::Selection => match payload.selection() {
                Some(range) => Some(Some(range)),
                None if payload.is_cleared_selection() => Some(None),
                None => {
                    log::debug!("Malformed selection from {sender}, ignored");
                    return None;
                }
            },
            _ => None,
        };
        let cursor = match envelope.msg_type {
            MessageType::Cursor => match payload.cursor() {
                Some(cursor) => Some(cursor),
                None => {
                    log::debug!("Malformed cursor from {sender}, ignored");
                    return None;
                }
            },
            _ => None,
        };

        let users = documents.entry(document_id.to_string()).or_default();
        let is_new = !users.contains_key(sender);
        let collaborator = users.entry(sender.to_string()).or_insert_with(|| {
            let seq = self.join_seq.fetch_add(1, Ordering::Relaxed);
            Collaborator::placeholder(sender, seq, now)
        });
        collaborator.touch(now);

        match envelope.msg_type {
            MessageType::Join => {
                if let Some(name) = &payload.user_name {
                    collaborator.user_name = name.clone();
                }
                collaborator.avatar_url = payload.avatar_url.clone();
            }
            MessageType::Cursor => collaborator.cursor = cursor,
            MessageType::Selection => collaborator.selection = selection.flatten(),
            MessageType::Heartbeat | MessageType::Leave => {}
        }
        drop(documents);

        let event = if is_new {
            log::debug!("{sender} appeared on {document_id} via {:?}", envelope.msg_type);
            PresenceEvent::Joined {
                document_id: document_id.to_string(),
                user_id: sender.to_string(),
            }
        } else {
            log::trace!("{sender} {:?} on {document_id}", envelope.msg_type);
            PresenceEvent::Updated {
                document_id: document_id.to_string(),
                user_id: sender.to_string(),
            }
        };
        self.emit(event.clone());
        Some(event)
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now()).await
    }

    /// Mark silent collaborators inactive and evict long-silent ones.
    pub async fn sweep_at(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let mut documents = self.documents.write().await;

        for (document_id, users) in documents.iter_mut() {
            users.retain(|user_id, collaborator| {
                let silence = now.saturating_duration_since(collaborator.last_heartbeat);
                if silence > self.config.eviction_grace {
                    report.evicted.push((document_id.clone(), user_id.clone()));
                    return false;
                }
                if silence > self.config.inactivity_timeout && collaborator.is_active {
                    collaborator.is_active = false;
                    report.inactive.push((document_id.clone(), user_id.clone()));
                }
                true
            });
        }
        documents.retain(|_, users| !users.is_empty());
        drop(documents);

        for (document_id, user_id) in &report.inactive {
            self.emit(PresenceEvent::Inactive {
                document_id: document_id.clone(),
                user_id: user_id.clone(),
            });
        }
        for (document_id, user_id) in &report.evicted {
            log::debug!("Evicted {user_id} from {document_id}");
            self.emit(PresenceEvent::Evicted {
                document_id: document_id.clone(),
                user_id: user_id.clone(),
            });
        }
        report
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until the tracker
    /// is dropped or the handle aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let tracker = Arc::downgrade(self);
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(tracker) = tracker.upgrade() else {
                    break;
                };
                let report = tracker.sweep().await;
                if !report.is_empty() {
                    log::debug!(
                        "Presence sweep: {} inactive, {} evicted",
                        report.inactive.len(),
                        report.evicted.len()
                    );
                }
            }
        })
    }

    pub async fn other_collaborators(&self, document_id: &str, self_id: &str) -> Vec<Collaborator> {
        self.other_collaborators_at(document_id, self_id, Instant::now()).await
    }

    /// Active collaborators except `self_id`, in join order.
    pub async fn other_collaborators_at(
        &self,
        document_id: &str,
        self_id: &str,
        now: Instant,
    ) -> Vec<Collaborator> {
        let timeout = self.config.inactivity_timeout;
        let mut others: Vec<Collaborator> = self
            .collaborators_at(document_id, now)
            .await
            .into_iter()
            .filter(|c| c.user_id != self_id && c.live_at(now, timeout))
            .collect();
        others.sort_by_key(|c| c.join_seq);
        others
    }

    pub async fn collaborators(&self, document_id: &str) -> Vec<Collaborator> {
        self.collaborators_at(document_id, Instant::now()).await
    }

    /// Everyone still tracked, including inactive entries, in join order.
    pub async fn collaborators_at(&self, document_id: &str, now: Instant) -> Vec<Collaborator> {
        let timeout = self.config.inactivity_timeout;
        let documents = self.documents.read().await;
        let mut all: Vec<Collaborator> = documents
            .get(document_id)
            .map(|users| {
                users
                    .values()
                    .map(|c| {
                        let mut c = c.clone();
                        c.is_active = c.live_at(now, timeout);
                        c
                    })
                    .collect()
            })
            .unwrap_or_default();
        all.sort_by_key(|c| c.join_seq);
        all
    }

    pub async fn collaborator(&self, document_id: &str, user_id: &str) -> Option<Collaborator> {
        let now = Instant::now();
        let documents = self.documents.read().await;
        let mut c = documents.get(document_id)?.get(user_id)?.clone();
        c.is_active = c.live_at(now, self.config.inactivity_timeout);
        Some(c)
    }

    /// Drop all state of `document_id`.
    pub async fn release(&self, document_id: &str) {
        if self.documents.write().await.remove(document_id).is_some() {
            log::debug!("Released presence state of {document_id}");
        }
        self.emit(PresenceEvent::Released {
            document_id: document_id.to_string(),
        });
    }

    pub async fn document_count(&self) -> usize {
        self.documents.read().await.len()
    }
}
