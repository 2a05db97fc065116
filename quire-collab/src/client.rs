//! Client facade: one signed-in user, one shared connection.
//!
//! ```text
//!                    ┌───────────── CollabClient ─────────────┐
//!  UI ──join/leave──►│ ChannelRegistry ──► ConnectionManager ──┼──► Transport
//!     ◄─presence─────│ PresenceTracker ◄── channel pumps       │
//!     ──save/list───►│ VersionStore ─────► VersionRepository   │
//!     ──invite──────►│ ShareAccessController ► ShareRepository │
//!                    └─────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::channel::{Broadcaster, ChannelRegistry};
use crate::config::CollabConfig;
use crate::connection::{ConnectionManager, ConnectionStatus, NetworkSignal};
use crate::error::Result;
use crate::presence::{Collaborator, PresenceEvent, PresenceTracker};
use crate::protocol::{CursorPosition, DocumentId, Identity, SelectionRange};
use crate::sharing::{ShareAccessController, ShareEvent};
use crate::storage::{ShareRepository, VersionRepository};
use crate::transport::Transport;
use crate::versions::{AutosaveSession, Version, VersionStore};

pub struct CollabClient {
    identity: Identity,
    connection: Arc<ConnectionManager>,
    presence: Arc<PresenceTracker>,
    sharing: Arc<ShareAccessController>,
    versions: Arc<VersionStore>,
    channels: Arc<ChannelRegistry>,
    sweeper: JoinHandle<()>,
}

impl CollabClient {
    /// Wire every component. Must be called inside a tokio runtime.
    pub fn new(
        identity: Identity,
        transport: Arc<dyn Transport>,
        version_repo: Arc<dyn VersionRepository>,
        share_repo: Arc<dyn ShareRepository>,
        config: CollabConfig,
    ) -> Self {
        let connection = ConnectionManager::new(transport, config.connection);
        let presence = PresenceTracker::new(config.presence);
        let sharing = ShareAccessController::new(share_repo);
        let versions = VersionStore::new(version_repo, config.autosave);
        let channels = ChannelRegistry::new(
            connection.clone(),
            sharing.clone(),
            presence.clone(),
            config.channel,
        );
        let sweeper = presence.spawn_sweeper();

        log::info!("Collaboration client ready for {}", identity.user_id);
        Self {
            identity,
            connection,
            presence,
            sharing,
            versions,
            channels,
            sweeper,
        }
    }

    /// Same store for versions and shares.
    pub fn with_store<S>(identity: Identity, transport: Arc<dyn Transport>, store: Arc<S>, config: CollabConfig) -> Self
    where
        S: VersionRepository + ShareRepository,
    {
        Self::new(identity, transport, store.clone(), store, config)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    // ─── Connection ───────────────────────────────────────────────────────

    pub async fn connect(&self) -> Result<()> {
        Ok(self.connection.connect().await?)
    }

    /// Release every channel, then drop the link.
    pub async fn disconnect(&self) {
        self.channels.close_all().await;
        self.connection.disconnect().await;
    }

    pub async fn reconnect(&self) -> Result<()> {
        Ok(self.connection.reconnect().await?)
    }

    pub async fn handle_network(&self, signal: NetworkSignal) {
        self.connection.handle_network(signal).await;
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn watch_connection_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.watch_status()
    }

    // ─── Documents ────────────────────────────────────────────────────────

    pub async fn join_document(&self, document_id: &str) -> Result<ChannelHandle> {
        let broadcaster = self.channels.join(document_id, &self.identity).await?;
        Ok(ChannelHandle {
            broadcaster,
            registry: self.channels.clone(),
        })
    }

    pub async fn leave_document(&self, document_id: &str) {
        self.channels.leave(document_id).await;
    }

    /// Active remote collaborators on `document_id`, in join order.
    pub async fn other_collaborators(&self, document_id: &str) -> Vec<Collaborator> {
        self.presence
            .other_collaborators(document_id, &self.identity.user_id)
            .await
    }

    pub fn presence_events(&self) -> broadcast::Receiver<PresenceEvent> {
        self.presence.subscribe()
    }

    pub async fn active_documents(&self) -> Vec<DocumentId> {
        self.channels.active_documents().await
    }

    // ─── Versions ─────────────────────────────────────────────────────────

    pub async fn save_version(&self, document_id: &str, snapshot: Vec<u8>, summary: Option<String>) -> Result<Version> {
        self.versions
            .save_version(document_id, &self.identity.user_id, snapshot, summary)
            .await
    }

    pub async fn list_versions(&self, document_id: &str) -> Result<Vec<Version>> {
        self.versions.list_versions(document_id).await
    }

    pub fn autosave(&self, document_id: &str) -> AutosaveSession {
        self.versions.autosave(document_id, self.identity.user_id.clone())
    }

    // ─── Sharing ──────────────────────────────────────────────────────────

    pub fn sharing(&self) -> &Arc<ShareAccessController> {
        &self.sharing
    }

    pub fn share_events(&self) -> broadcast::Receiver<ShareEvent> {
        self.sharing.subscribe_events()
    }

    // ─── Components ───────────────────────────────────────────────────────

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.channels
    }

    pub fn versions(&self) -> &Arc<VersionStore> {
        &self.versions
    }
}

impl Drop for CollabClient {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

/// A joined document as seen by the editor.
#[derive(Clone)]
pub struct ChannelHandle {
    broadcaster: Broadcaster,
    registry: Arc<ChannelRegistry>,
}

impl ChannelHandle {
    pub fn document_id(&self) -> &str {
        self.broadcaster.document_id()
    }

    pub fn send_cursor_position(&self, cursor: &CursorPosition) -> Result<()> {
        Ok(self.broadcaster.send_cursor_position(cursor)?)
    }

    pub fn send_selection(&self, selection: Option<&SelectionRange>) -> Result<()> {
        Ok(self.broadcaster.send_selection(selection)?)
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Drop this handle's reference on the channel.
    pub async fn leave(self) {
        self.registry.leave(self.broadcaster.document_id()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CollabError;
    use crate::sharing::ContentRef;
    use crate::storage::MemoryStore;
    use crate::transport::{MemoryHub, MemoryTransport};

    #[tokio::test]
    async fn test_client_wiring() {
        let hub = MemoryHub::new(16);
        let store = Arc::new(MemoryStore::new());
        store.register_owner(ContentRef::document("doc-1"), "A").await;
        let client = CollabClient::with_store(
            Identity::new("A", "Ada"),
            MemoryTransport::new(hub.clone()),
            store,
            CollabConfig::default(),
        );

        assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);
        client.connect().await.unwrap();
        assert_eq!(client.connection_status(), ConnectionStatus::Connected);

        let handle = client.join_document("doc-1").await.unwrap();
        assert_eq!(handle.document_id(), "doc-1");
        handle.send_cursor_position(&CursorPosition::new("p1", 3)).unwrap();
        assert_eq!(client.active_documents().await, vec!["doc-1".to_string()]);

        let version = client.save_version("doc-1", b"v1".to_vec(), None).await.unwrap();
        assert_eq!(version.author_id, "A");
        assert_eq!(client.list_versions("doc-1").await.unwrap().len(), 1);

        client.disconnect().await;
        assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);
        assert!(client.active_documents().await.is_empty());
        // Let the aborted writer drop its queue
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(matches!(
            handle.send_cursor_position(&CursorPosition::new("p1", 4)),
            Err(CollabError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_join_unshared_document_denied() {
        let store = Arc::new(MemoryStore::new());
        store.register_owner(ContentRef::document("doc-1"), "A").await;
        let client = CollabClient::with_store(
            Identity::new("B", "Bea"),
            MemoryTransport::new(MemoryHub::new(16)),
            store,
            CollabConfig::default(),
        );
        assert!(matches!(
            client.join_document("doc-1").await,
            Err(CollabError::AccessDenied(_))
        ));
    }
}
