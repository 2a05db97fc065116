//! Realtime pub/sub transport contract.
//!
//! The collaboration layer needs only four primitives from the network:
//! connect, subscribe to a topic, publish to a topic, and connection-state
//! events. Anything offering them can carry presence traffic.
//!
//! - [`memory`] — in-process hub, used by tests and single-process setups.
//!   Supports fault injection (hub outages, per-link drops).
//! - [`websocket`] — client for the [`RelayServer`](crate::relay::RelayServer).

pub mod memory;
pub mod websocket;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::error::ConnectionError;

pub use memory::{MemoryHub, MemoryTransport};
pub use websocket::WebSocketTransport;

/// A message delivered on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Connection-state changes reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    /// The link went away without a local `disconnect()`.
    Disconnected,
    Error(String),
}

/// Pub/sub transport.
///
/// Implementations must not emit [`TransportEvent::Disconnected`] for a
/// locally requested [`Transport::disconnect`]; the event is reserved for
/// drops the caller did not ask for. All topic subscriptions die with the
/// link and have to be re-established after the next `connect`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open the link. Messages for subscribed topics are pushed to `inbound`.
    async fn connect(&self, inbound: mpsc::Sender<Inbound>) -> Result<(), ConnectionError>;

    /// Close the link and drop every subscription.
    async fn disconnect(&self);

    /// Start receiving `topic`. Resolves once the subscription is live.
    async fn subscribe(&self, topic: &str) -> Result<(), ConnectionError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), ConnectionError>;

    /// Fire-and-forget publish; success means "handed to the network".
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ConnectionError>;

    /// Subscribe to connection-state events.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}
