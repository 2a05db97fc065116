//! Permission-gated sharing.
//!
//! ```text
//!            accept (grantee)
//!  pending ─────────────────► accepted
//!     │  \                        │
//!     │   \ decline (grantee)     │ revoke (owner/admin)
//!     │    ▼                      ▼
//!     │  declined             revoked
//!     └───────────────────────────▲
//!            revoke (owner/admin)
//! ```
//!
//! `declined` and `revoked` are terminal. Shares are never deleted.
//! Permissions are ordered `view < comment < edit < admin`; the content
//! owner is an implicit admin. Expiry is evaluated lazily against
//! `expires_at` on every access check.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::error::{CollabError, Result};
use crate::protocol::{Identity, UserId};
use crate::storage::ShareRepository;

/// Longest allowed invitation lifetime.
pub const MAX_EXPIRY_DAYS: i64 = 365;

// ─── Types ────────────────────────────────────────────────────────────────

/// Access level, ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    View,
    Comment,
    Edit,
    Admin,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::View => "view",
            Permission::Comment => "comment",
            Permission::Edit => "edit",
            Permission::Admin => "admin",
        }
    }

    /// Whether this level meets or exceeds `required`.
    pub fn satisfies(self, required: Permission) -> bool {
        self >= required
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = CollabError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "view" => Ok(Permission::View),
            "comment" => Ok(Permission::Comment),
            "edit" => Ok(Permission::Edit),
            "admin" => Ok(Permission::Admin),
            other => Err(CollabError::Validation(format!("unknown permission '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareStatus {
    Pending,
    Accepted,
    Declined,
    Revoked,
}

impl ShareStatus {
    /// No transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ShareStatus::Declined | ShareStatus::Revoked)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Document,
    FlashcardSet,
    Quiz,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Document => "document",
            ContentType::FlashcardSet => "flashcard_set",
            ContentType::Quiz => "quiz",
        }
    }
}

/// A shareable content item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentRef {
    pub content_type: ContentType,
    pub content_id: String,
}

impl ContentRef {
    pub fn new(content_type: ContentType, content_id: impl Into<String>) -> Self {
        Self {
            content_type,
            content_id: content_id.into(),
        }
    }

    pub fn document(document_id: impl Into<String>) -> Self {
        Self::new(ContentType::Document, document_id)
    }
}

/// A persisted access grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    pub id: Uuid,
    pub content: ContentRef,
    pub owner_id: UserId,
    /// Normalized (trimmed, lowercase).
    pub shared_with_email: String,
    /// Filled in when the grantee accepts.
    pub shared_with_user_id: Option<UserId>,
    pub permission: Permission,
    pub status: ShareStatus,
    pub message: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Share {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Accepted, unexpired and addressed to `user_id`.
    pub fn is_live_for(&self, user_id: &str, now: DateTime<Utc>) -> bool {
        self.status == ShareStatus::Accepted
            && self.shared_with_user_id.as_deref() == Some(user_id)
            && !self.is_expired_at(now)
    }
}

/// Input of [`ShareAccessController::create_share`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareInvite {
    pub content: ContentRef,
    pub grantee_email: String,
    /// Parsed as a [`Permission`]; anything else is a validation error.
    pub permission: String,
    pub message: Option<String>,
    pub expires_in_days: Option<i64>,
}

impl ShareInvite {
    pub fn new(content: ContentRef, grantee_email: impl Into<String>, permission: impl Into<String>) -> Self {
        Self {
            content,
            grantee_email: grantee_email.into(),
            permission: permission.into(),
            message: None,
            expires_in_days: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn expires_in_days(mut self, days: i64) -> Self {
        self.expires_in_days = Some(days);
        self
    }
}

/// Notifications for the unread-count aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareEvent {
    Created(Share),
    Revoked(Share),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevokeOutcome {
    Revoked(Share),
    /// The share was already revoked; nothing changed.
    AlreadyRevoked,
}

// ─── Controller ───────────────────────────────────────────────────────────

pub struct ShareAccessController {
    repo: Arc<dyn ShareRepository>,
    events: broadcast::Sender<ShareEvent>,
    /// Load-modify-store of share records, one at a time.
    mutation_lock: Mutex<()>,
}

impl ShareAccessController {
    pub fn new(repo: Arc<dyn ShareRepository>) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            repo,
            events,
            mutation_lock: Mutex::new(()),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ShareEvent> {
        self.events.subscribe()
    }

    /// Invite `invite.grantee_email` to the content. The actor must own the
    /// content or hold an admin share on it.
    pub async fn create_share(&self, actor: &Identity, invite: ShareInvite) -> Result<Share> {
        let email = normalize_email(&invite.grantee_email)?;
        let permission: Permission = invite.permission.parse()?;
        let now = Utc::now();
        let expires_at = match invite.expires_in_days {
            Some(days) if !(1..=MAX_EXPIRY_DAYS).contains(&days) => {
                return Err(CollabError::Validation(format!(
                    "expiry must be between 1 and {MAX_EXPIRY_DAYS} days, got {days}"
                )));
            }
            Some(days) => Some(now + Duration::days(days)),
            None => None,
        };

        let _guard = self.mutation_lock.lock().await;
        let owner_id = self.require_manager(&actor.user_id, &invite.content).await?;

        if actor
            .email
            .as_deref()
            .is_some_and(|own| own.trim().eq_ignore_ascii_case(&email))
        {
            return Err(CollabError::Validation("cannot share with yourself".into()));
        }

        let existing = self.repo.shares_for_content(&invite.content).await?;
        let duplicate = existing.iter().any(|share| {
            share.shared_with_email == email
                && matches!(share.status, ShareStatus::Pending | ShareStatus::Accepted)
                && !share.is_expired_at(now)
        });
        if duplicate {
            return Err(CollabError::Validation(format!(
                "{email} already has an active invitation"
            )));
        }

        let share = Share {
            id: Uuid::new_v4(),
            content: invite.content,
            owner_id,
            shared_with_email: email,
            shared_with_user_id: None,
            permission,
            status: ShareStatus::Pending,
            message: invite.message,
            expires_at,
            created_at: now,
            updated_at: now,
        };
        self.repo.insert_share(&share).await?;
        log::info!(
            "Share {} created: {} → {} ({})",
            share.id,
            share.content.content_id,
            share.shared_with_email,
            share.permission
        );
        let _ = self.events.send(ShareEvent::Created(share.clone()));
        Ok(share)
    }

    /// Grantee accepts a pending invitation.
    pub async fn accept_share(&self, grantee: &Identity, share_id: Uuid) -> Result<Share> {
        self.respond(grantee, share_id, ShareStatus::Accepted).await
    }

    /// Grantee declines a pending invitation. Terminal.
    pub async fn decline_share(&self, grantee: &Identity, share_id: Uuid) -> Result<Share> {
        self.respond(grantee, share_id, ShareStatus::Declined).await
    }

    async fn respond(&self, grantee: &Identity, share_id: Uuid, next: ShareStatus) -> Result<Share> {
        let _guard = self.mutation_lock.lock().await;
        let mut share = self.load(share_id).await?;

        let addressed = grantee
            .email
            .as_deref()
            .is_some_and(|email| email.trim().eq_ignore_ascii_case(&share.shared_with_email));
        if !addressed {
            return Err(CollabError::AccessDenied(format!(
                "share {share_id} is not addressed to {}",
                grantee.user_id
            )));
        }
        if share.status != ShareStatus::Pending {
            return Err(CollabError::InvalidState(format!(
                "share {share_id} is {:?}, only pending invitations can be answered",
                share.status
            )));
        }
        let now = Utc::now();
        if share.is_expired_at(now) {
            return Err(CollabError::InvalidState(format!("share {share_id} has expired")));
        }

        share.status = next;
        share.updated_at = now;
        if next == ShareStatus::Accepted {
            share.shared_with_user_id = Some(grantee.user_id.clone());
        }
        self.repo.update_share(&share).await?;
        log::info!("Share {share_id} {:?} by {}", next, grantee.user_id);
        Ok(share)
    }

    /// Change the level of a live share. Unchanged levels are a no-op.
    pub async fn update_permission(
        &self,
        actor_id: &str,
        share_id: Uuid,
        permission: Permission,
    ) -> Result<Share> {
        let _guard = self.mutation_lock.lock().await;
        let mut share = self.load(share_id).await?;
        if share.status.is_terminal() {
            return Err(CollabError::InvalidState(format!(
                "share {share_id} is {:?}",
                share.status
            )));
        }
        self.require_manager(actor_id, &share.content).await?;

        if share.permission == permission {
            return Ok(share);
        }
        share.permission = permission;
        share.updated_at = Utc::now();
        self.repo.update_share(&share).await?;
        log::info!("Share {share_id} permission → {permission}");
        Ok(share)
    }

    /// Revoke a pending or accepted share. Revoking twice is a no-op.
    pub async fn revoke_share(&self, actor_id: &str, share_id: Uuid) -> Result<RevokeOutcome> {
        let _guard = self.mutation_lock.lock().await;
        let mut share = self.load(share_id).await?;
        self.require_manager(actor_id, &share.content).await?;

        match share.status {
            ShareStatus::Revoked => {
                log::debug!("Share {share_id} already revoked");
                Ok(RevokeOutcome::AlreadyRevoked)
            }
            ShareStatus::Declined => Err(CollabError::InvalidState(format!(
                "share {share_id} was declined"
            ))),
            ShareStatus::Pending | ShareStatus::Accepted => {
                share.status = ShareStatus::Revoked;
                share.updated_at = Utc::now();
                self.repo.update_share(&share).await?;
                log::info!("Share {share_id} revoked by {actor_id}");
                let _ = self.events.send(ShareEvent::Revoked(share.clone()));
                Ok(RevokeOutcome::Revoked(share))
            }
        }
    }

    /// Whether `user_id` holds at least `required` on `content` right now.
    pub async fn check_access(&self, user_id: &str, content: &ContentRef, required: Permission) -> Result<bool> {
        self.check_access_at(user_id, content, required, Utc::now()).await
    }

    pub async fn check_access_at(
        &self,
        user_id: &str,
        content: &ContentRef,
        required: Permission,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self
            .effective_permission_at(user_id, content, now)
            .await?
            .is_some_and(|level| level.satisfies(required)))
    }

    /// Highest level `user_id` holds on `content`, if any.
    pub async fn effective_permission(&self, user_id: &str, content: &ContentRef) -> Result<Option<Permission>> {
        self.effective_permission_at(user_id, content, Utc::now()).await
    }

    pub async fn effective_permission_at(
        &self,
        user_id: &str,
        content: &ContentRef,
        now: DateTime<Utc>,
    ) -> Result<Option<Permission>> {
        if self.repo.content_owner(content).await?.as_deref() == Some(user_id) {
            return Ok(Some(Permission::Admin));
        }
        Ok(self
            .repo
            .shares_for_content(content)
            .await?
            .iter()
            .filter(|share| share.is_live_for(user_id, now))
            .map(|share| share.permission)
            .max())
    }

    pub async fn shares_for_content(&self, content: &ContentRef) -> Result<Vec<Share>> {
        Ok(self.repo.shares_for_content(content).await?)
    }

    /// Invitations addressed to `email`, in every status.
    pub async fn shares_for_grantee(&self, email: &str) -> Result<Vec<Share>> {
        Ok(self.repo.shares_for_grantee(email.trim()).await?)
    }

    async fn load(&self, share_id: Uuid) -> Result<Share> {
        self.repo
            .get_share(share_id)
            .await?
            .ok_or_else(|| CollabError::Validation(format!("unknown share {share_id}")))
    }

    /// Owner or admin; returns the owner id.
    async fn require_manager(&self, actor_id: &str, content: &ContentRef) -> Result<UserId> {
        let Some(owner_id) = self.repo.content_owner(content).await? else {
            return Err(CollabError::AccessDenied(format!(
                "{} {} has no owner on record",
                content.content_type.as_str(),
                content.content_id
            )));
        };
        if owner_id == actor_id {
            return Ok(owner_id);
        }
        let level = self.effective_permission(actor_id, content).await?;
        if level == Some(Permission::Admin) {
            Ok(owner_id)
        } else {
            Err(CollabError::AccessDenied(format!(
                "{actor_id} cannot manage shares of {}",
                content.content_id
            )))
        }
    }
}

/// Trim, lowercase and check the basic `local@domain.tld` shape.
fn normalize_email(raw: &str) -> Result<String> {
    let email = raw.trim().to_ascii_lowercase();
    let invalid = || CollabError::Validation(format!("malformed email '{raw}'"));

    if email.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.contains('@') {
        return Err(invalid());
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|label| label.is_empty()) {
        return Err(invalid());
    }
    Ok(email)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, StoreError};
    use async_trait::async_trait;

    /// Yields around reads and writes so concurrent mutations interleave.
    struct YieldingRepo(Arc<MemoryStore>);

    #[async_trait]
    impl ShareRepository for YieldingRepo {
        async fn insert_share(&self, share: &Share) -> std::result::Result<(), StoreError> {
            self.0.insert_share(share).await
        }

        async fn update_share(&self, share: &Share) -> std::result::Result<(), StoreError> {
            tokio::task::yield_now().await;
            self.0.update_share(share).await
        }

        async fn get_share(&self, id: Uuid) -> std::result::Result<Option<Share>, StoreError> {
            let share = self.0.get_share(id).await;
            tokio::task::yield_now().await;
            share
        }

        async fn shares_for_content(&self, content: &ContentRef) -> std::result::Result<Vec<Share>, StoreError> {
            self.0.shares_for_content(content).await
        }

        async fn shares_for_grantee(&self, email: &str) -> std::result::Result<Vec<Share>, StoreError> {
            self.0.shares_for_grantee(email).await
        }

        async fn content_owner(&self, content: &ContentRef) -> std::result::Result<Option<UserId>, StoreError> {
            tokio::task::yield_now().await;
            self.0.content_owner(content).await
        }
    }

    fn owner() -> Identity {
        Identity::new("A", "Ada").with_email("ada@example.com")
    }

    fn grantee() -> Identity {
        Identity::new("B", "Bob").with_email("bob@example.com")
    }

    async fn setup() -> (Arc<MemoryStore>, Arc<ShareAccessController>, ContentRef) {
        let repo = Arc::new(MemoryStore::new());
        let content = ContentRef::document("doc-1");
        repo.register_owner(content.clone(), "A").await;
        let controller = ShareAccessController::new(repo.clone());
        (repo, controller, content)
    }

    async fn accepted_share(
        controller: &ShareAccessController,
        content: &ContentRef,
        permission: &str,
    ) -> Share {
        let share = controller
            .create_share(&owner(), ShareInvite::new(content.clone(), "bob@example.com", permission))
            .await
            .unwrap();
        controller.accept_share(&grantee(), share.id).await.unwrap()
    }

    #[test]
    fn test_permission_hierarchy() {
        assert!(Permission::View < Permission::Comment);
        assert!(Permission::Comment < Permission::Edit);
        assert!(Permission::Edit < Permission::Admin);
        assert!(Permission::Admin.satisfies(Permission::View));
        assert!(!Permission::Comment.satisfies(Permission::Edit));
    }

    #[test]
    fn test_permission_parsing() {
        assert_eq!(" Edit ".parse::<Permission>().unwrap(), Permission::Edit);
        assert!("owner".parse::<Permission>().is_err());
        assert!(matches!("".parse::<Permission>(), Err(CollabError::Validation(_))));
    }

    #[test]
    fn test_email_validation() {
        assert_eq!(normalize_email(" Bob@Example.COM ").unwrap(), "bob@example.com");
        for bad in ["", "bob", "@example.com", "bob@", "bob@example", "b ob@example.com", "a@b@c.com", "bob@example..com"] {
            assert!(normalize_email(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[tokio::test]
    async fn test_create_share_is_pending() {
        let (_repo, controller, content) = setup().await;
        let share = controller
            .create_share(
                &owner(),
                ShareInvite::new(content.clone(), "Bob@example.com", "edit")
                    .with_message("have a look")
                    .expires_in_days(7),
            )
            .await
            .unwrap();

        assert_eq!(share.status, ShareStatus::Pending);
        assert_eq!(share.owner_id, "A");
        assert_eq!(share.shared_with_email, "bob@example.com");
        assert_eq!(share.permission, Permission::Edit);
        assert!(share.expires_at.is_some());
        // Pending shares grant nothing
        assert!(!controller.check_access("B", &content, Permission::View).await.unwrap());
    }

    #[tokio::test]
    async fn test_create_share_validation() {
        let (_repo, controller, content) = setup().await;
        let cases = [
            ShareInvite::new(content.clone(), "not-an-email", "view"),
            ShareInvite::new(content.clone(), "bob@example.com", "owner"),
            ShareInvite::new(content.clone(), "bob@example.com", "view").expires_in_days(0),
            ShareInvite::new(content.clone(), "bob@example.com", "view").expires_in_days(366),
            ShareInvite::new(content.clone(), "ada@example.com", "view"),
        ];
        for invite in cases {
            assert!(matches!(
                controller.create_share(&owner(), invite).await,
                Err(CollabError::Validation(_))
            ));
        }
        assert!(controller
            .create_share(
                &owner(),
                ShareInvite::new(content, "bob@example.com", "view").expires_in_days(365)
            )
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_live_invite_rejected() {
        let (_repo, controller, content) = setup().await;
        let first = controller
            .create_share(&owner(), ShareInvite::new(content.clone(), "bob@example.com", "view"))
            .await
            .unwrap();
        assert!(matches!(
            controller
                .create_share(&owner(), ShareInvite::new(content.clone(), "BOB@example.com", "edit"))
                .await,
            Err(CollabError::Validation(_))
        ));

        // Once revoked a fresh invitation is allowed
        controller.revoke_share("A", first.id).await.unwrap();
        assert!(controller
            .create_share(&owner(), ShareInvite::new(content, "bob@example.com", "edit"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_only_owner_or_admin_manage_shares() {
        let (_repo, controller, content) = setup().await;
        let outsider = Identity::new("C", "Cy").with_email("cy@example.com");
        assert!(matches!(
            controller
                .create_share(&outsider, ShareInvite::new(content.clone(), "dee@example.com", "view"))
                .await,
            Err(CollabError::AccessDenied(_))
        ));

        accepted_share(&controller, &content, "admin").await;
        // Admin grantee may invite others
        let share = controller
            .create_share(&grantee(), ShareInvite::new(content.clone(), "dee@example.com", "view"))
            .await
            .unwrap();
        assert_eq!(share.owner_id, "A");
        assert!(matches!(
            controller.revoke_share("C", share.id).await,
            Err(CollabError::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_accept_grants_access_up_to_level() {
        let (_repo, controller, content) = setup().await;
        let share = accepted_share(&controller, &content, "edit").await;

        assert_eq!(share.status, ShareStatus::Accepted);
        assert_eq!(share.shared_with_user_id.as_deref(), Some("B"));
        assert!(controller.check_access("B", &content, Permission::View).await.unwrap());
        assert!(controller.check_access("B", &content, Permission::Edit).await.unwrap());
        assert!(!controller.check_access("B", &content, Permission::Admin).await.unwrap());
        assert_eq!(
            controller.effective_permission("A", &content).await.unwrap(),
            Some(Permission::Admin)
        );
    }

    #[tokio::test]
    async fn test_only_grantee_can_answer() {
        let (_repo, controller, content) = setup().await;
        let share = controller
            .create_share(&owner(), ShareInvite::new(content, "bob@example.com", "view"))
            .await
            .unwrap();
        let impostor = Identity::new("C", "Cy").with_email("cy@example.com");
        assert!(matches!(
            controller.accept_share(&impostor, share.id).await,
            Err(CollabError::AccessDenied(_))
        ));
        assert!(matches!(
            controller.accept_share(&Identity::new("B", "Bob"), share.id).await,
            Err(CollabError::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_declined_is_terminal() {
        let (_repo, controller, content) = setup().await;
        let share = controller
            .create_share(&owner(), ShareInvite::new(content, "bob@example.com", "view"))
            .await
            .unwrap();
        controller.decline_share(&grantee(), share.id).await.unwrap();

        assert!(matches!(
            controller.accept_share(&grantee(), share.id).await,
            Err(CollabError::InvalidState(_))
        ));
        assert!(matches!(
            controller.update_permission("A", share.id, Permission::Edit).await,
            Err(CollabError::InvalidState(_))
        ));
        assert!(matches!(
            controller.revoke_share("A", share.id).await,
            Err(CollabError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_revoked_share_is_frozen() {
        let (_repo, controller, content) = setup().await;
        let share = accepted_share(&controller, &content, "edit").await;

        let outcome = controller.revoke_share("A", share.id).await.unwrap();
        assert!(matches!(outcome, RevokeOutcome::Revoked(ref s) if s.status == ShareStatus::Revoked));

        for level in [Permission::View, Permission::Edit, Permission::Admin] {
            assert!(matches!(
                controller.update_permission("A", share.id, level).await,
                Err(CollabError::InvalidState(_))
            ));
        }
        assert!(!controller.check_access("B", &content, Permission::View).await.unwrap());
        assert_eq!(
            controller.revoke_share("A", share.id).await.unwrap(),
            RevokeOutcome::AlreadyRevoked
        );
    }

    #[tokio::test]
    async fn test_update_permission() {
        let (_repo, controller, content) = setup().await;
        let share = accepted_share(&controller, &content, "view").await;

        let same = controller.update_permission("A", share.id, Permission::View).await.unwrap();
        assert_eq!(same.updated_at, share.updated_at);

        let raised = controller.update_permission("A", share.id, Permission::Comment).await.unwrap();
        assert_eq!(raised.permission, Permission::Comment);
        assert!(controller.check_access("B", &content, Permission::Comment).await.unwrap());
        assert!(matches!(
            controller.update_permission("B", share.id, Permission::Admin).await,
            Err(CollabError::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_expiry_checked_lazily() {
        let (_repo, controller, content) = setup().await;
        let share = controller
            .create_share(
                &owner(),
                ShareInvite::new(content.clone(), "bob@example.com", "edit").expires_in_days(7),
            )
            .await
            .unwrap();
        controller.accept_share(&grantee(), share.id).await.unwrap();

        let now = Utc::now();
        assert!(controller
            .check_access_at("B", &content, Permission::Edit, now + Duration::days(6))
            .await
            .unwrap());
        assert!(!controller
            .check_access_at("B", &content, Permission::View, now + Duration::days(8))
            .await
            .unwrap());
        // Status itself is untouched
        assert_eq!(
            controller.shares_for_content(&content).await.unwrap()[0].status,
            ShareStatus::Accepted
        );
    }

    #[tokio::test]
    async fn test_unknown_share_and_store_failure() {
        let (repo, controller, content) = setup().await;
        assert!(matches!(
            controller.revoke_share("A", Uuid::new_v4()).await,
            Err(CollabError::Validation(_))
        ));

        repo.set_available(false);
        assert!(matches!(
            controller.check_access("A", &content, Permission::View).await,
            Err(CollabError::Persistence(_))
        ));
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let (_repo, controller, content) = setup().await;
        let mut events = controller.subscribe_events();

        let share = controller
            .create_share(&owner(), ShareInvite::new(content, "bob@example.com", "view"))
            .await
            .unwrap();
        controller.revoke_share("A", share.id).await.unwrap();

        assert!(matches!(events.recv().await.unwrap(), ShareEvent::Created(s) if s.id == share.id));
        assert!(matches!(events.recv().await.unwrap(), ShareEvent::Revoked(s) if s.id == share.id));
        assert_eq!(
            controller.shares_for_grantee("bob@example.com").await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_concurrent_revoke_and_update_stay_revoked() {
        let store = Arc::new(MemoryStore::new());
        let content = ContentRef::document("doc-1");
        store.register_owner(content.clone(), "A").await;
        let controller = ShareAccessController::new(Arc::new(YieldingRepo(store.clone())));
        let share = accepted_share(&controller, &content, "view").await;

        let (revoked, updated) = tokio::join!(
            controller.revoke_share("A", share.id),
            controller.update_permission("A", share.id, Permission::Edit),
        );
        assert!(matches!(revoked.unwrap(), RevokeOutcome::Revoked(_)));
        assert!(matches!(updated, Err(CollabError::InvalidState(_))));

        let stored = store.get_share(share.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ShareStatus::Revoked);
        assert_eq!(stored.permission, Permission::View);
        assert!(!controller.check_access("B", &content, Permission::View).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_invites_admit_one() {
        let store = Arc::new(MemoryStore::new());
        let content = ContentRef::document("doc-1");
        store.register_owner(content.clone(), "A").await;
        let controller = ShareAccessController::new(Arc::new(YieldingRepo(store.clone())));

        let invite = || ShareInvite::new(content.clone(), "bob@example.com", "view");
        let (o1, o2) = (owner(), owner());
        let (first, second) = tokio::join!(
            controller.create_share(&o1, invite()),
            controller.create_share(&o2, invite()),
        );
        assert!(first.is_ok());
        assert!(matches!(second, Err(CollabError::Validation(_))));
        assert_eq!(store.share_count().await, 1);
    }
}
