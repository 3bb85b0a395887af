//! Backend-agnostic `Database` trait: one async interface for profiles,
//! contexts, the referral ledger and tags.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;

use crate::error::DatabaseError;
use crate::model::{ChildrenStats, ConversationContext, NotificationAdmin, ReferralUsage, UserProfile};

/// A profile read under an exclusive per-user lock.
///
/// The lock is held until this value is dropped.
pub struct ProfileLock {
    pub profile: Option<UserProfile>,
    _guard: OwnedMutexGuard<()>,
}

impl ProfileLock {
    pub fn new(profile: Option<UserProfile>, guard: OwnedMutexGuard<()>) -> Self {
        Self {
            profile,
            _guard: guard,
        }
    }
}

#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Conversation contexts ───────────────────────────────────────

    async fn get_context(&self, user_id: i64) -> Result<Option<ConversationContext>, DatabaseError>;

    /// Insert or fully replace a context.
    async fn upsert_context(&self, ctx: &ConversationContext) -> Result<(), DatabaseError>;

    /// Returns `true` if a context was removed.
    async fn delete_context(&self, user_id: i64) -> Result<bool, DatabaseError>;

    /// Contexts whose deferred epilogue is due at or before `now` and not yet
    /// sent, oldest first.
    async fn list_due_contexts(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ConversationContext>, DatabaseError>;

    /// Ids of profiles or contexts whose username matches one of `usernames`
    /// (case-insensitive, without `@`).
    async fn find_user_ids_by_usernames(
        &self,
        usernames: &[String],
    ) -> Result<Vec<i64>, DatabaseError>;

    // ── Profiles ────────────────────────────────────────────────────

    async fn get_profile(&self, user_id: i64) -> Result<Option<UserProfile>, DatabaseError>;

    /// Insert or update a profile.
    ///
    /// Never lowers `course_channel_subscribed` and never touches the
    /// ledger-owned point counter.
    async fn upsert_profile(&self, profile: &UserProfile) -> Result<(), DatabaseError>;

    /// Read a profile while holding its exclusive lock.
    async fn lock_profile_for_update(&self, user_id: i64) -> Result<ProfileLock, DatabaseError>;

    /// Set the course flag. Returns `true` if it was not set before.
    async fn set_course_subscribed(&self, user_id: i64) -> Result<bool, DatabaseError>;

    /// Flip a referred profile to counted, keeping an earlier counted-at.
    async fn mark_referral_counted(
        &self,
        user_id: i64,
        counted_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn set_referral_link(&self, user_id: i64, link: &str) -> Result<(), DatabaseError>;

    /// Registered profiles still waiting for their referrer to be credited.
    async fn list_pending_referrals(&self) -> Result<Vec<UserProfile>, DatabaseError>;

    /// Children answers counted over every stored profile.
    async fn children_stats(&self) -> Result<ChildrenStats, DatabaseError>;

    // ── Referral ledger ─────────────────────────────────────────────

    async fn find_usage_by_key(&self, key: &str) -> Result<Option<ReferralUsage>, DatabaseError>;

    async fn find_usage_by_pair(
        &self,
        referrer_id: i64,
        invitee_id: i64,
    ) -> Result<Option<ReferralUsage>, DatabaseError>;

    /// Whether `invitee_id` appears as invitee in any usage row.
    async fn usage_exists_for_invitee(&self, invitee_id: i64) -> Result<bool, DatabaseError>;

    /// Atomically append a counted usage row, add one point to the referrer
    /// and mark the invitee counted. Returns the referrer's new point total.
    async fn record_referral_credit(&self, usage: &ReferralUsage) -> Result<i64, DatabaseError>;

    // ── Tags ────────────────────────────────────────────────────────

    async fn tag_exists(&self, user_id: i64, tag: &str) -> Result<bool, DatabaseError>;

    /// Insert a tag if absent. Returns `true` if it was new.
    async fn insert_tag(&self, user_id: i64, tag: &str) -> Result<bool, DatabaseError>;

    async fn list_tags(&self, user_id: i64) -> Result<Vec<String>, DatabaseError>;

    // ── Notification admins ─────────────────────────────────────────

    /// Add (or re-activate) an admin by username. Returns the stored row.
    async fn add_notification_admin(&self, username: &str)
    -> Result<NotificationAdmin, DatabaseError>;

    async fn set_notification_admin_active(
        &self,
        username: &str,
        active: bool,
    ) -> Result<bool, DatabaseError>;

    async fn list_active_notification_admins(&self)
    -> Result<Vec<NotificationAdmin>, DatabaseError>;

    /// Remember the user id resolved for an admin's username.
    async fn bind_notification_admin(&self, id: i64, user_id: i64) -> Result<(), DatabaseError>;
}
