//! In-memory repository.
//!
//! Backs tests and single-process setups. `set_available(false)` makes every
//! call fail with [`StoreError::Unavailable`] to exercise failure paths.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ShareRepository, StoreError, VersionRepository};
use crate::protocol::{DocumentId, UserId};
use crate::sharing::{ContentRef, Share};
use crate::versions::Version;

#[derive(Default)]
struct Inner {
    versions: HashMap<Uuid, Version>,
    /// document → version number → version id
    by_document: HashMap<DocumentId, BTreeMap<u64, Uuid>>,
    shares: HashMap<Uuid, Share>,
    /// Insertion order of shares
    share_order: Vec<Uuid>,
    owners: HashMap<ContentRef, UserId>,
}

pub struct MemoryStore {
    inner: RwLock<Inner>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Record `owner` as the owner of `content`.
    pub async fn register_owner(&self, content: ContentRef, owner: impl Into<UserId>) {
        self.inner.write().await.owners.insert(content, owner.into());
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".into()))
        }
    }

    pub async fn version_count(&self) -> usize {
        self.inner.read().await.versions.len()
    }

    pub async fn share_count(&self) -> usize {
        self.inner.read().await.shares.len()
    }
}

#[async_trait]
impl VersionRepository for MemoryStore {
    async fn insert_version(&self, version: &Version) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        let numbers = inner
            .by_document
            .entry(version.document_id.clone())
            .or_default();
        if numbers.contains_key(&version.version_number) {
            return Err(StoreError::Conflict(format!(
                "version {} of {} already exists",
                version.version_number, version.document_id
            )));
        }
        numbers.insert(version.version_number, version.id);
        inner.versions.insert(version.id, version.clone());
        Ok(())
    }

    async fn list_versions(&self, document_id: &str) -> Result<Vec<Version>, StoreError> {
        self.check_available()?;
        let inner = self.inner.read().await;
        let Some(numbers) = inner.by_document.get(document_id) else {
            return Ok(Vec::new());
        };
        Ok(numbers
            .values()
            .filter_map(|id| inner.versions.get(id).cloned())
            .collect())
    }

    async fn max_version_number(&self, document_id: &str) -> Result<Option<u64>, StoreError> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .by_document
            .get(document_id)
            .and_then(|numbers| numbers.keys().next_back().copied()))
    }

    async fn get_version(&self, id: Uuid) -> Result<Option<Version>, StoreError> {
        self.check_available()?;
        Ok(self.inner.read().await.versions.get(&id).cloned())
    }
}

#[async_trait]
impl ShareRepository for MemoryStore {
    async fn insert_share(&self, share: &Share) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        if inner.shares.contains_key(&share.id) {
            return Err(StoreError::Conflict(format!("share {} already exists", share.id)));
        }
        inner.share_order.push(share.id);
        inner.shares.insert(share.id, share.clone());
        Ok(())
    }

    async fn update_share(&self, share: &Share) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        match inner.shares.get_mut(&share.id) {
            Some(existing) => {
                *existing = share.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("share {}", share.id))),
        }
    }

    async fn get_share(&self, id: Uuid) -> Result<Option<Share>, StoreError> {
        self.check_available()?;
        Ok(self.inner.read().await.shares.get(&id).cloned())
    }

    async fn shares_for_content(&self, content: &ContentRef) -> Result<Vec<Share>, StoreError> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .share_order
            .iter()
            .filter_map(|id| inner.shares.get(id))
            .filter(|share| &share.content == content)
            .cloned()
            .collect())
    }

    async fn shares_for_grantee(&self, email: &str) -> Result<Vec<Share>, StoreError> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .share_order
            .iter()
            .filter_map(|id| inner.shares.get(id))
            .filter(|share| share.shared_with_email.eq_ignore_ascii_case(email))
            .cloned()
            .collect())
    }

    async fn content_owner(&self, content: &ContentRef) -> Result<Option<UserId>, StoreError> {
        self.check_available()?;
        Ok(self.inner.read().await.owners.get(content).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn version(doc: &str, number: u64) -> Version {
        Version {
            id: Uuid::new_v4(),
            document_id: doc.to_string(),
            version_number: number,
            snapshot: vec![number as u8],
            change_summary: None,
            author_id: "A".into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_versions_listed_ascending() {
        let store = MemoryStore::new();
        store.insert_version(&version("doc-1", 2)).await.unwrap();
        store.insert_version(&version("doc-1", 1)).await.unwrap();
        store.insert_version(&version("doc-2", 1)).await.unwrap();

        let numbers: Vec<u64> = store
            .list_versions("doc-1")
            .await
            .unwrap()
            .iter()
            .map(|v| v.version_number)
            .collect();
        assert_eq!(numbers, vec![1, 2]);
        assert_eq!(store.max_version_number("doc-1").await.unwrap(), Some(2));
        assert_eq!(store.max_version_number("doc-3").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_version_number_conflicts() {
        let store = MemoryStore::new();
        store.insert_version(&version("doc-1", 1)).await.unwrap();
        assert!(matches!(
            store.insert_version(&version("doc-1", 1)).await,
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(store.version_count().await, 1);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.list_versions("doc-1").await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(matches!(
            store.content_owner(&ContentRef::document("doc-1")).await,
            Err(StoreError::Unavailable(_))
        ));

        store.set_available(true);
        assert!(store.list_versions("doc-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_owner_registration() {
        let store = MemoryStore::new();
        let content = ContentRef::document("doc-1");
        store.register_owner(content.clone(), "A").await;
        assert_eq!(store.content_owner(&content).await.unwrap().as_deref(), Some("A"));
        assert_eq!(
            store.content_owner(&ContentRef::document("doc-2")).await.unwrap(),
            None
        );
    }
}
