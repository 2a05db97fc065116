//! Recoverable version snapshots.
//!
//! ```text
//! editor ──record_edit()──► AutosaveSession (actor task)
//!                              │  idle timer, restarted by every edit
//!                              │  save only if content ≠ last saved
//!                              ▼
//!                          VersionStore::save_version()
//!                              │  number = 1 + max(existing), serialized
//!                              ▼
//!                          VersionRepository
//! ```
//!
//! Snapshots are opaque full-document copies. Nothing is merged: when two
//! tabs save concurrently the persistence layer keeps both and the newest
//! snapshot is simply the latest version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{CollabError, Result};
use crate::protocol::{DocumentId, UserId};
use crate::storage::VersionRepository;

/// A stored snapshot of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub id: Uuid,
    pub document_id: DocumentId,
    /// Starts at 1, strictly increasing per document.
    pub version_number: u64,
    pub snapshot: Vec<u8>,
    pub change_summary: Option<String>,
    pub author_id: UserId,
    pub created_at: DateTime<Utc>,
}

/// Autosave configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutosaveConfig {
    /// Quiet time after the last edit before an autosave fires.
    #[serde(rename = "idle_period_ms", with = "crate::config::duration_ms")]
    pub idle_period: Duration,
    /// Change summary attached to autosaved versions.
    pub summary: String,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            idle_period: Duration::from_secs(30),
            summary: "Autosave".to_string(),
        }
    }
}

pub struct VersionStore {
    repo: Arc<dyn VersionRepository>,
    autosave: AutosaveConfig,
    /// One number allocation at a time.
    save_lock: Mutex<()>,
}

impl VersionStore {
    pub fn new(repo: Arc<dyn VersionRepository>, autosave: AutosaveConfig) -> Arc<Self> {
        Arc::new(Self {
            repo,
            autosave,
            save_lock: Mutex::new(()),
        })
    }

    /// Store a new snapshot as the next version of `document_id`.
    pub async fn save_version(
        &self,
        document_id: &str,
        author_id: &str,
        snapshot: Vec<u8>,
        change_summary: Option<String>,
    ) -> Result<Version> {
        let _guard = self.save_lock.lock().await;

        let latest = self.repo.max_version_number(document_id).await?;
        let version = Version {
            id: Uuid::new_v4(),
            document_id: document_id.to_string(),
            version_number: latest.unwrap_or(0) + 1,
            snapshot,
            change_summary,
            author_id: author_id.to_string(),
            created_at: Utc::now(),
        };

        if let Err(e) = self.repo.insert_version(&version).await {
            log::error!(
                "Saving version {} of {document_id} failed: {e}",
                version.version_number
            );
            return Err(e.into());
        }
        log::info!(
            "Saved version {} of {document_id} ({} bytes)",
            version.version_number,
            version.snapshot.len()
        );
        Ok(version)
    }

    /// Every version of `document_id`, newest first.
    pub async fn list_versions(&self, document_id: &str) -> Result<Vec<Version>> {
        let mut versions = self.repo.list_versions(document_id).await?;
        versions.sort_by(|a, b| b.version_number.cmp(&a.version_number));
        Ok(versions)
    }

    pub async fn get_version(&self, id: Uuid) -> Result<Option<Version>> {
        Ok(self.repo.get_version(id).await?)
    }

    pub async fn latest_version(&self, document_id: &str) -> Result<Option<Version>> {
        Ok(self.list_versions(document_id).await?.into_iter().next())
    }

    /// Start an autosave session for one open editor.
    pub fn autosave(
        self: &Arc<Self>,
        document_id: impl Into<DocumentId>,
        author_id: impl Into<UserId>,
    ) -> AutosaveSession {
        let document_id = document_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(AutosaveState::default());

        let actor = AutosaveActor {
            store: self.clone(),
            document_id: document_id.clone(),
            author_id: author_id.into(),
            idle_period: self.autosave.idle_period,
            summary: self.autosave.summary.clone(),
            pending: None,
            last_saved: None,
            state: state_tx,
        };
        tokio::spawn(actor.run(rx));

        AutosaveSession {
            document_id,
            commands: tx,
            state: state_rx,
        }
    }
}

// ─── Autosave ─────────────────────────────────────────────────────────────

/// Observable autosave state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutosaveState {
    /// Edits not yet persisted.
    pub dirty: bool,
    pub last_saved_version: Option<u64>,
    /// Set when the last save failed; cleared by the next success.
    pub last_error: Option<String>,
}

enum Command {
    Edit(Vec<u8>),
    SaveNow {
        snapshot: Vec<u8>,
        summary: String,
        reply: oneshot::Sender<Result<Version>>,
    },
    Flush {
        reply: oneshot::Sender<Result<Option<Version>>>,
    },
    Close {
        reply: oneshot::Sender<Result<Option<Version>>>,
    },
}

/// Idle-triggered autosave for one editor.
///
/// The idle timer lives in a task owned by the session. [`close`] cancels
/// it and flushes; dropping the session does the same without reporting
/// the outcome.
///
/// [`close`]: AutosaveSession::close
pub struct AutosaveSession {
    document_id: DocumentId,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<AutosaveState>,
}

impl AutosaveSession {
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Report the current content and restart the idle timer.
    pub fn record_edit(&self, snapshot: Vec<u8>) {
        if self.commands.send(Command::Edit(snapshot)).is_err() {
            log::warn!("Autosave for {} is no longer running", self.document_id);
        }
    }

    /// Manual save: always creates a version tagged with `summary`.
    pub async fn save_now(&self, snapshot: Vec<u8>, summary: impl Into<String>) -> Result<Version> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::SaveNow {
            snapshot,
            summary: summary.into(),
            reply,
        })?;
        rx.await.map_err(|_| self.closed())?
    }

    /// Save pending edits now if they differ from the last saved content.
    pub async fn flush(&self) -> Result<Option<Version>> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Flush { reply })?;
        rx.await.map_err(|_| self.closed())?
    }

    /// Cancel the timer and flush. The session ends even if the save fails.
    pub async fn close(self) -> Result<Option<Version>> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Close { reply })?;
        rx.await.map_err(|_| self.closed())?
    }

    pub fn state(&self) -> AutosaveState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<AutosaveState> {
        self.state.clone()
    }

    fn request(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| self.closed())
    }

    fn closed(&self) -> CollabError {
        CollabError::InvalidState(format!("autosave for {} has stopped", self.document_id))
    }
}

struct AutosaveActor {
    store: Arc<VersionStore>,
    document_id: DocumentId,
    author_id: UserId,
    idle_period: Duration,
    summary: String,
    /// Latest content not yet saved.
    pending: Option<Vec<u8>>,
    last_saved: Option<Vec<u8>>,
    state: watch::Sender<AutosaveState>,
}

impl AutosaveActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        // Seed with the stored head so reopening unchanged content is a no-op
        match self.store.latest_version(&self.document_id).await {
            Ok(Some(head)) => {
                self.state.send_modify(|s| s.last_saved_version = Some(head.version_number));
                self.last_saved = Some(head.snapshot);
            }
            Ok(None) => {}
            Err(e) => log::warn!("Autosave could not load head of {}: {e}", self.document_id),
        }

        let mut deadline: Option<Instant> = None;
        loop {
            let wake = deadline;
            let idle = async move {
                match wake {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Edit(snapshot)) => {
                        self.pending = Some(snapshot);
                        deadline = Some(Instant::now() + self.idle_period);
                        self.state.send_if_modified(|s| !std::mem::replace(&mut s.dirty, true));
                    }
                    Some(Command::SaveNow { snapshot, summary, reply }) => {
                        deadline = None;
                        let result = self.save(snapshot, Some(summary)).await;
                        if result.is_ok() {
                            // The manual save supersedes edits recorded before it
                            self.pending = None;
                            self.state.send_modify(|s| s.dirty = false);
                        } else if self.pending.is_some() {
                            deadline = Some(Instant::now() + self.idle_period);
                        }
                        let _ = reply.send(result);
                    }
                    Some(Command::Flush { reply }) => {
                        deadline = None;
                        let result = self.flush().await;
                        if result.is_err() && self.pending.is_some() {
                            deadline = Some(Instant::now() + self.idle_period);
                        }
                        let _ = reply.send(result);
                    }
                    Some(Command::Close { reply }) => {
                        let _ = reply.send(self.flush().await);
                        break;
                    }
                    None => {
                        if let Err(e) = self.flush().await {
                            log::error!("Final autosave of {} failed: {e}", self.document_id);
                        }
                        break;
                    }
                },
                _ = idle => {
                    deadline = None;
                    if let Err(e) = self.flush().await {
                        log::warn!("Autosave of {} failed, retrying after next idle period: {e}", self.document_id);
                        deadline = Some(Instant::now() + self.idle_period);
                    }
                }
            }
        }
        log::debug!("Autosave for {} stopped", self.document_id);
    }

    async fn flush(&mut self) -> Result<Option<Version>> {
        let Some(snapshot) = self.pending.take() else {
            return Ok(None);
        };
        if self.last_saved.as_ref() == Some(&snapshot) {
            self.state.send_modify(|s| s.dirty = false);
            return Ok(None);
        }

        let summary = Some(self.summary.clone());
        match self.save(snapshot.clone(), summary).await {
            Ok(version) => Ok(Some(version)),
            Err(e) => {
                // Keep the edit so a later flush retries it
                self.pending.get_or_insert(snapshot);
                Err(e)
            }
        }
    }

    async fn save(&mut self, snapshot: Vec<u8>, summary: Option<String>) -> Result<Version> {
        let result = self
            .store
            .save_version(&self.document_id, &self.author_id, snapshot.clone(), summary)
            .await;

        match &result {
            Ok(version) => {
                if self.pending.as_ref() == Some(&snapshot) {
                    self.pending = None;
                }
                self.last_saved = Some(snapshot);
                let dirty = self.pending.is_some();
                self.state.send_modify(|s| {
                    s.dirty = dirty;
                    s.last_saved_version = Some(version.version_number);
                    s.last_error = None;
                });
            }
            Err(e) => {
                let message = e.to_string();
                self.state.send_modify(|s| s.last_error = Some(message));
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, StoreError};
    use tokio::time::sleep;

    fn setup() -> (Arc<MemoryStore>, Arc<VersionStore>) {
        let repo = Arc::new(MemoryStore::new());
        let store = VersionStore::new(repo.clone(), AutosaveConfig::default());
        (repo, store)
    }

    #[tokio::test]
    async fn test_sequential_saves_are_gap_free() {
        let (_repo, store) = setup();
        for i in 0..10u8 {
            store.save_version("doc-1", "A", vec![i], None).await.unwrap();
        }
        let numbers: Vec<u64> = store
            .list_versions("doc-1")
            .await
            .unwrap()
            .iter()
            .map(|v| v.version_number)
            .collect();
        assert_eq!(numbers, (1..=10).rev().collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_concurrent_saves_through_one_store() {
        let (_repo, store) = setup();
        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.save_version("doc-1", "A", vec![i], None).await })
            })
            .collect();
        let mut numbers = Vec::new();
        for handle in handles {
            numbers.push(handle.await.unwrap().unwrap().version_number);
        }
        numbers.sort_unstable();
        assert_eq!(numbers, (1..=8).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_documents_are_numbered_independently() {
        let (_repo, store) = setup();
        store.save_version("doc-1", "A", vec![1], None).await.unwrap();
        let v = store.save_version("doc-2", "A", vec![1], None).await.unwrap();
        assert_eq!(v.version_number, 1);
        assert_eq!(store.latest_version("doc-1").await.unwrap().unwrap().version_number, 1);
        assert!(store.get_version(v.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_persistence_failure_is_surfaced() {
        let (repo, store) = setup();
        repo.set_available(false);
        let err = store.save_version("doc-1", "A", vec![1], None).await.unwrap_err();
        assert!(matches!(err, CollabError::Persistence(StoreError::Unavailable(_))));
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_autosave_fires_after_idle_period() {
        let (_repo, store) = setup();
        let session = store.autosave("doc-1", "A");

        session.record_edit(b"draft".to_vec());
        sleep(Duration::from_secs(29)).await;
        assert!(store.list_versions("doc-1").await.unwrap().is_empty());
        assert!(session.state().dirty);

        sleep(Duration::from_secs(2)).await;
        let versions = store.list_versions("doc-1").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].change_summary.as_deref(), Some("Autosave"));
        assert!(!session.state().dirty);
        assert_eq!(session.state().last_saved_version, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_edit_restarts_idle_timer() {
        let (_repo, store) = setup();
        let session = store.autosave("doc-1", "A");

        session.record_edit(b"v1".to_vec());
        sleep(Duration::from_secs(20)).await;
        session.record_edit(b"v2".to_vec());
        sleep(Duration::from_secs(15)).await;
        assert!(store.list_versions("doc-1").await.unwrap().is_empty());

        sleep(Duration::from_secs(16)).await;
        let versions = store.list_versions("doc-1").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].snapshot, b"v2".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_content_is_not_autosaved() {
        let (_repo, store) = setup();
        let session = store.autosave("doc-1", "A");

        session.save_now(b"same".to_vec(), "Manual").await.unwrap();
        session.record_edit(b"same".to_vec());
        sleep(Duration::from_secs(31)).await;

        assert_eq!(store.list_versions("doc-1").await.unwrap().len(), 1);
        assert!(!session.state().dirty);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reopened_session_skips_stored_head() {
        let (_repo, store) = setup();
        store.save_version("doc-1", "A", b"stored".to_vec(), None).await.unwrap();

        let session = store.autosave("doc-1", "A");
        session.record_edit(b"stored".to_vec());
        assert_eq!(session.flush().await.unwrap(), None);
        assert_eq!(store.list_versions("doc-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_manual_save_always_creates_version() {
        let (_repo, store) = setup();
        let session = store.autosave("doc-1", "A");

        session.save_now(b"x".to_vec(), "First").await.unwrap();
        let second = session.save_now(b"x".to_vec(), "Checkpoint").await.unwrap();

        assert_eq!(second.version_number, 2);
        assert_eq!(second.change_summary.as_deref(), Some("Checkpoint"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_flushes_and_cancels_timer() {
        let (_repo, store) = setup();
        let session = store.autosave("doc-1", "A");

        session.record_edit(b"unsaved".to_vec());
        let saved = session.close().await.unwrap().unwrap();
        assert_eq!(saved.snapshot, b"unsaved".to_vec());

        sleep(Duration::from_secs(60)).await;
        assert_eq!(store.list_versions("doc-1").await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_flushes_best_effort() {
        let (_repo, store) = setup();
        let session = store.autosave("doc-1", "A");
        session.record_edit(b"late".to_vec());
        drop(session);

        sleep(Duration::from_millis(10)).await;
        let versions = store.list_versions("doc-1").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].snapshot, b"late".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_autosave_is_retryable() {
        let (repo, store) = setup();
        let session = store.autosave("doc-1", "A");
        sleep(Duration::from_millis(10)).await;

        repo.set_available(false);
        session.record_edit(b"content".to_vec());
        sleep(Duration::from_secs(31)).await;

        let state = session.state();
        assert!(state.dirty);
        assert!(state.last_error.is_some());

        repo.set_available(true);
        let saved = session.flush().await.unwrap();
        assert_eq!(saved.map(|v| v.version_number), Some(1));
        assert_eq!(session.state().last_error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_save_supersedes_recorded_edit() {
        let (_repo, store) = setup();
        let session = store.autosave("doc-1", "A");

        session.record_edit(b"old draft".to_vec());
        let manual = session
            .save_now(b"newer content".to_vec(), "Checkpoint")
            .await
            .unwrap();
        assert_eq!(manual.version_number, 1);
        assert!(!session.state().dirty);

        sleep(Duration::from_secs(60)).await;
        assert_eq!(session.close().await.unwrap(), None);

        let versions = store.list_versions("doc-1").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].snapshot, b"newer content".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_manual_save_rearms_idle_timer() {
        let (repo, store) = setup();
        let session = store.autosave("doc-1", "A");
        sleep(Duration::from_millis(10)).await;

        session.record_edit(b"draft".to_vec());
        repo.set_available(false);
        assert!(session.save_now(b"draft".to_vec(), "Checkpoint").await.is_err());
        repo.set_available(true);

        sleep(Duration::from_secs(31)).await;
        let versions = store.list_versions("doc-1").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].change_summary.as_deref(), Some("Autosave"));
        assert!(!session.state().dirty);
    }
}
