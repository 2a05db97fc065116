//! Error taxonomy shared by every collaboration component.
//!
//! Network failures are retried inside [`ConnectionManager`] up to its cap;
//! everything else is surfaced to the caller unchanged.
//!
//! [`ConnectionManager`]: crate::connection::ConnectionManager

use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::storage::StoreError;

/// Transport-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The transport could not be reached (or dropped mid-operation).
    #[error("transport unreachable: {0}")]
    Unreachable(String),
    /// Reconnection stopped after the configured number of consecutive failures.
    #[error("gave up after {attempts} consecutive reconnection attempts")]
    RetriesExhausted { attempts: u32 },
    /// Operation requires a live connection.
    #[error("not connected")]
    NotConnected,
    /// The transport timed out waiting for an acknowledgment.
    #[error("timed out waiting for {0}")]
    Timeout(String),
    /// A pending reconnect was cancelled by `disconnect()` or an offline signal.
    #[error("reconnection cancelled")]
    Cancelled,
}

/// Top-level error returned by the collaboration API.
#[derive(Debug, Error)]
pub enum CollabError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Insufficient share permission. Never retried.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Malformed share input.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Mutation attempted on a share in a terminal state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Version/share repository failure. No local rollback is attempted.
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl CollabError {
    /// Whether the UI may offer a retry for this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            CollabError::Connection(ConnectionError::RetriesExhausted { .. })
            | CollabError::Connection(ConnectionError::Cancelled) => false,
            CollabError::Connection(_) | CollabError::Persistence(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CollabError>;
