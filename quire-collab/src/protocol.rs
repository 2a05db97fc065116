//! Wire protocol for presence broadcast.
//!
//! Two layers:
//!
//! ```text
//! ┌──────────────────────────── RelayFrame (bincode) ───────────────────────┐
//! │ Publish { topic: "document:<id>", payload: ───┐ }                       │
//! └───────────────────────────────────────────────│─────────────────────────┘
//!                                                 ▼
//!            Envelope (JSON) { type, senderId, timestamp, payload }
//! ```
//!
//! The envelope is the transport-agnostic unit every client understands.
//! Relay frames only exist between [`WebSocketTransport`] and the relay.
//!
//! Delivery is best-effort: no acknowledgments, no ordering across types,
//! and envelope timestamps are informational only (sender clocks are not
//! synchronized).
//!
//! [`WebSocketTransport`]: crate::transport::websocket::WebSocketTransport

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Identifier issued by the identity provider.
pub type UserId = String;
/// Identifier of a collaborative document.
pub type DocumentId = String;

/// Prefix of every document topic on the shared connection.
pub const TOPIC_PREFIX: &str = "document:";

/// Pub/sub topic carrying a document's presence traffic.
pub fn topic_for(document_id: &str) -> String {
    format!("{TOPIC_PREFIX}{document_id}")
}

/// Inverse of [`topic_for`].
pub fn document_from_topic(topic: &str) -> Option<&str> {
    topic.strip_prefix(TOPIC_PREFIX)
}

/// Milliseconds since the Unix epoch (sender wall clock).
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ─── Identity ─────────────────────────────────────────────────────────────

/// A signed-in user, as supplied by the identity provider.
///
/// Trusted without re-validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
    /// Used to match share invitations addressed by email.
    pub email: Option<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            avatar_url: None,
            email: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_avatar(mut self, url: impl Into<String>) -> Self {
        self.avatar_url = Some(url.into());
        self
    }
}

// ─── Envelope ─────────────────────────────────────────────────────────────

/// Presence message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Cursor,
    Selection,
    Join,
    Leave,
    Heartbeat,
}

/// Caret location inside a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPosition {
    pub block_id: String,
    pub offset: u32,
}

impl CursorPosition {
    pub fn new(block_id: impl Into<String>, offset: u32) -> Self {
        Self { block_id: block_id.into(), offset }
    }
}

/// Selected character range inside a block. `start_offset <= end_offset`
/// once normalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionRange {
    pub block_id: String,
    pub start_offset: u32,
    pub end_offset: u32,
}

impl SelectionRange {
    pub fn new(block_id: impl Into<String>, start_offset: u32, end_offset: u32) -> Self {
        Self {
            block_id: block_id.into(),
            start_offset,
            end_offset,
        }
        .normalized()
    }

    /// Backwards selections (anchor after focus) are stored forwards.
    pub fn normalized(mut self) -> Self {
        if self.start_offset > self.end_offset {
            std::mem::swap(&mut self.start_offset, &mut self.end_offset);
        }
        self
    }

    pub fn is_collapsed(&self) -> bool {
        self.start_offset == self.end_offset
    }
}

/// Message body. Every field is optional on the wire; which ones are
/// meaningful depends on the [`MessageType`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_offset: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_offset: Option<u32>,
    /// Join profile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl Payload {
    pub fn from_cursor(cursor: &CursorPosition) -> Self {
        Self {
            block_id: Some(cursor.block_id.clone()),
            offset: Some(cursor.offset),
            ..Self::default()
        }
    }

    /// `None` encodes "selection cleared".
    pub fn from_selection(selection: Option<&SelectionRange>) -> Self {
        match selection {
            Some(sel) => Self {
                block_id: Some(sel.block_id.clone()),
                start_offset: Some(sel.start_offset),
                end_offset: Some(sel.end_offset),
                ..Self::default()
            },
            None => Self::default(),
        }
    }

    pub fn from_identity(identity: &Identity) -> Self {
        Self {
            user_name: Some(identity.display_name.clone()),
            avatar_url: identity.avatar_url.clone(),
            ..Self::default()
        }
    }

    pub fn cursor(&self) -> Option<CursorPosition> {
        Some(CursorPosition {
            block_id: self.block_id.clone()?,
            offset: self.offset?,
        })
    }

    pub fn selection(&self) -> Option<SelectionRange> {
        Some(
            SelectionRange {
                block_id: self.block_id.clone()?,
                start_offset: self.start_offset?,
                end_offset: self.end_offset?,
            }
            .normalized(),
        )
    }

    /// A selection payload with no range fields clears the selection.
    pub fn is_cleared_selection(&self) -> bool {
        self.block_id.is_none() && self.start_offset.is_none() && self.end_offset.is_none()
    }
}

/// The wire envelope.
///
/// ```json
/// { "type": "cursor", "senderId": "u-1", "timestamp": 1700000000000,
///   "payload": { "blockId": "p1", "offset": 5 } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub sender_id: UserId,
    pub timestamp: u64,
    #[serde(default)]
    pub payload: Payload,
}

impl Envelope {
    pub fn new(msg_type: MessageType, sender_id: impl Into<UserId>, payload: Payload) -> Self {
        Self {
            msg_type,
            sender_id: sender_id.into(),
            timestamp: now_millis(),
            payload,
        }
    }

    pub fn join(identity: &Identity) -> Self {
        Self::new(
            MessageType::Join,
            identity.user_id.clone(),
            Payload::from_identity(identity),
        )
    }

    pub fn leave(sender_id: impl Into<UserId>) -> Self {
        Self::new(MessageType::Leave, sender_id, Payload::default())
    }

    pub fn cursor(sender_id: impl Into<UserId>, cursor: &CursorPosition) -> Self {
        Self::new(MessageType::Cursor, sender_id, Payload::from_cursor(cursor))
    }

    pub fn selection(sender_id: impl Into<UserId>, selection: Option<&SelectionRange>) -> Self {
        Self::new(
            MessageType::Selection,
            sender_id,
            Payload::from_selection(selection),
        )
    }

    pub fn heartbeat(sender_id: impl Into<UserId>) -> Self {
        Self::new(MessageType::Heartbeat, sender_id, Payload::default())
    }

    /// Serialize to JSON bytes.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from JSON bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        if envelope.sender_id.is_empty() {
            return Err(ProtocolError::MissingSender);
        }
        Ok(envelope)
    }
}

// ─── Relay frames ─────────────────────────────────────────────────────────

/// Frames exchanged between a WebSocket client and the relay.
///
/// Serialized with bincode; the relay never inspects `payload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayFrame {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    /// Relay → client acknowledgment of `Subscribe`.
    Subscribed { topic: String },
    /// Client → relay: fan out. Relay → client: delivery.
    Publish { topic: String, payload: Vec<u8> },
}

impl RelayFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("envelope has no sender")]
    MissingSender,
    #[error("channel closed")]
    ChannelClosed,
}
