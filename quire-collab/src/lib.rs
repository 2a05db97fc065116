//! # quire-collab — realtime collaboration & presence engine
//!
//! Live cursors and selections, presence liveness, version snapshots and
//! permission-gated sharing for collaborative documents.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   publish/subscribe   ┌──────────────┐
//! │ CollabClient │ ◄───────────────────► │ RelayServer  │
//! │ (per user)   │   topic "document:id" │ (fan-out)    │
//! └──────┬───────┘                       └──────┬───────┘
//!        │                                      │
//!        ▼                                      ▼
//! ┌───────────────────┐                 ┌───────────────┐
//! │ ChannelRegistry   │ refcounted      │ TopicRegistry │
//! │ ConnectionManager │ one link        │ TopicGroup    │
//! │ PresenceTracker   │ liveness sweep  └───────────────┘
//! └──────┬────────────┘
//!        │ check_access / save
//!        ▼
//! ┌───────────────────────────────┐
//! │ ShareAccessController         │
//! │ VersionStore (+ autosave)     │──► VersionRepository / ShareRepository
//! └───────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON presence envelope and bincode relay frames
//! - [`connection`] — link lifecycle, bounded backoff, topic routing
//! - [`channel`] — per-document channels, broadcaster, cursor throttle
//! - [`presence`] — collaborator store, liveness sweep, colors
//! - [`versions`] — numbered snapshots and idle autosave
//! - [`sharing`] — share lifecycle and access checks
//! - [`transport`] — transport contract, in-memory hub, WebSocket client
//! - [`relay`] / [`broadcast`] — WebSocket pub/sub relay
//! - [`storage`] — repository traits, in-memory and RocksDB stores
//! - [`layout`] — cursor and selection geometry for wrapped blocks
//! - [`client`] — facade wiring everything for one user

pub mod broadcast;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod layout;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod sharing;
pub mod storage;
pub mod transport;
pub mod versions;

// Re-exports for convenience
pub use channel::{
    Broadcaster, ChannelConfig, ChannelRegistry, ChannelSubscription, CursorThrottle,
    SubscriptionStatus,
};
pub use client::{ChannelHandle, CollabClient};
pub use config::CollabConfig;
pub use connection::{ConnectionManager, ConnectionStatus, NetworkSignal, ReconnectPolicy};
pub use error::{CollabError, ConnectionError, Result};
pub use layout::{BlockLayout, CursorOverlay, DocumentLayout, Rect, TextMetrics, WrappedTextLayout};
pub use presence::{
    user_color, Collaborator, PresenceConfig, PresenceEvent, PresenceTracker, SweepReport,
};
pub use protocol::{
    CursorPosition, DocumentId, Envelope, Identity, MessageType, Payload, ProtocolError,
    SelectionRange, UserId,
};
pub use relay::{RelayConfig, RelayServer, RelayStats};
pub use sharing::{
    ContentRef, ContentType, Permission, RevokeOutcome, Share, ShareAccessController,
    ShareEvent, ShareInvite, ShareStatus,
};
pub use storage::{MemoryStore, ShareRepository, StoreError, VersionRepository};
#[cfg(feature = "rocksdb")]
pub use storage::{RocksStore, StoreConfig};
pub use transport::{MemoryHub, MemoryTransport, Transport, TransportEvent, WebSocketTransport};
pub use versions::{AutosaveConfig, AutosaveSession, AutosaveState, Version, VersionStore};
