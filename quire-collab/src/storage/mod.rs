//! Persistence contract for versions and shares.
//!
//! ```text
//! ┌──────────────┐  insert/list   ┌───────────────────┐
//! │ VersionStore │ ─────────────► │ VersionRepository │──┐
//! └──────────────┘                └───────────────────┘  │   MemoryStore
//! ┌──────────────────────┐ CRUD   ┌───────────────────┐  ├─► (tests, default)
//! │ ShareAccessController│ ─────► │ ShareRepository   │──┤   RocksStore
//! └──────────────────────┘        └───────────────────┘  └─► (feature "rocksdb")
//! ```
//!
//! The repository is the single source of truth. Callers keep no state they
//! cannot re-fetch, and failures are surfaced without local rollback.

pub mod memory;
#[cfg(feature = "rocksdb")]
pub mod rocks;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::UserId;
use crate::sharing::{ContentRef, Share};
use crate::versions::Version;

pub use memory::MemoryStore;
#[cfg(feature = "rocksdb")]
pub use rocks::{RocksStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    /// Backend unreachable; the operation may be retried.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Uniqueness violation, e.g. a version number already taken.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("compression error: {0}")]
    Compression(String),
}

/// Version records.
#[async_trait]
pub trait VersionRepository: Send + Sync + 'static {
    /// Insert a new version. Fails with [`StoreError::Conflict`] when the
    /// document already has that version number.
    async fn insert_version(&self, version: &Version) -> Result<(), StoreError>;

    /// Every version of `document_id`, ascending by version number.
    async fn list_versions(&self, document_id: &str) -> Result<Vec<Version>, StoreError>;

    async fn max_version_number(&self, document_id: &str) -> Result<Option<u64>, StoreError>;

    async fn get_version(&self, id: Uuid) -> Result<Option<Version>, StoreError>;
}

/// Share records and content ownership.
#[async_trait]
pub trait ShareRepository: Send + Sync + 'static {
    async fn insert_share(&self, share: &Share) -> Result<(), StoreError>;

    /// Overwrite an existing share. [`StoreError::NotFound`] if absent.
    async fn update_share(&self, share: &Share) -> Result<(), StoreError>;

    async fn get_share(&self, id: Uuid) -> Result<Option<Share>, StoreError>;

    /// All shares of a content item, oldest first, in every status.
    async fn shares_for_content(&self, content: &ContentRef) -> Result<Vec<Share>, StoreError>;

    /// All shares addressed to `email` (case-insensitive), oldest first.
    async fn shares_for_grantee(&self, email: &str) -> Result<Vec<Share>, StoreError>;

    /// Owner of a content item, as recorded by the content store.
    async fn content_owner(&self, content: &ContentRef) -> Result<Option<UserId>, StoreError>;
}
