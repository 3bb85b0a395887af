//! Persistent data model: user profiles, conversation contexts, referral
//! usages and notification admins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::flow::state::{FlowState, Track};

/// Self-assessed Quran reading level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingLevel {
    StartFromZero,
    ReadBySyllables,
    KnowBasics,
    ReadWithMistakes,
    ReadConfidently,
}

impl ReadingLevel {
    pub const ALL: [ReadingLevel; 5] = [
        Self::StartFromZero,
        Self::ReadBySyllables,
        Self::KnowBasics,
        Self::ReadWithMistakes,
        Self::ReadConfidently,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartFromZero => "start_from_zero",
            Self::ReadBySyllables => "read_by_syllables",
            Self::KnowBasics => "know_basics",
            Self::ReadWithMistakes => "read_with_mistakes",
            Self::ReadConfidently => "read_confidently",
        }
    }

    /// Human-readable label, also used as the user's tag.
    pub fn label(&self) -> &'static str {
        match self {
            Self::StartFromZero => "Starting from zero",
            Self::ReadBySyllables => "Reading by syllables",
            Self::KnowBasics => "Know the basics",
            Self::ReadWithMistakes => "Reading with mistakes",
            Self::ReadConfidently => "Reading confidently",
        }
    }
}

impl std::str::FromStr for ReadingLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|level| level.as_str() == s)
            .ok_or_else(|| format!("unknown reading level: {s}"))
    }
}

/// Where a profile stands in the referral program.
///
/// `Pending` and `Counted` always come with a positive referrer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReferralStatus {
    #[default]
    NotApplicable,
    /// Invited; the referrer is credited once the course channel is joined.
    Pending,
    /// The referrer has been credited for this invitee.
    Counted,
}

impl ReferralStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotApplicable => "not_applicable",
            Self::Pending => "pending",
            Self::Counted => "counted",
        }
    }

    /// Whether this profile already takes part in the referral program.
    pub fn is_referred(&self) -> bool {
        matches!(self, Self::Pending | Self::Counted)
    }
}

impl std::fmt::Display for ReferralStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReferralStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_applicable" => Ok(Self::NotApplicable),
            "pending" => Ok(Self::Pending),
            "counted" => Ok(Self::Counted),
            other => Err(format!("unknown referral status: {other}")),
        }
    }
}

/// A registered user. Created when registration completes, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: i64,
    /// Name reported by the transport (first name or username).
    pub display_name: String,
    pub username: Option<String>,
    /// Name the user typed during registration.
    pub full_name: Option<String>,
    pub age: Option<u32>,
    pub phone: Option<String>,
    pub has_children: Option<bool>,
    pub children_study_quran: Option<bool>,
    pub reading_level: Option<ReadingLevel>,
    pub consent_given: bool,
    pub school_channel_subscribed: bool,
    pub course_channel_subscribed: bool,
    pub registration_completed: bool,
    pub registered_at: Option<DateTime<Utc>>,
    /// 0 when nobody invited this user.
    pub referrer_id: i64,
    pub referral_status: ReferralStatus,
    /// Number of invitees credited to this user. Only the ledger changes it.
    pub referral_points: i64,
    pub referral_counted_at: Option<DateTime<Utc>>,
    pub referral_link: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserProfile {
    pub fn new(user_id: i64, display_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            display_name: display_name.into(),
            username: None,
            full_name: None,
            age: None,
            phone: None,
            has_children: None,
            children_study_quran: None,
            reading_level: None,
            consent_given: false,
            school_channel_subscribed: false,
            course_channel_subscribed: false,
            registration_completed: false,
            registered_at: None,
            referrer_id: 0,
            referral_status: ReferralStatus::NotApplicable,
            referral_points: 0,
            referral_counted_at: None,
            referral_link: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Per-user conversation state, reused across attempts and reset on every
/// `/start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub user_id: i64,
    pub state: FlowState,
    pub track: Track,
    pub display_name: String,
    pub username: Option<String>,
    pub full_name: Option<String>,
    pub age: Option<u32>,
    pub phone: Option<String>,
    pub has_children: Option<bool>,
    pub children_study_quran: Option<bool>,
    pub reading_level: Option<ReadingLevel>,
    pub consent_given: bool,
    pub school_channel_subscribed: bool,
    pub referrer_id: i64,
    pub referral_source: Option<String>,
    pub referral_entered_at: Option<DateTime<Utc>>,
    /// Tags collected before the profile exists; flushed on completion.
    pub pending_tags: Vec<String>,
    pub epilogue_due_at: Option<DateTime<Utc>>,
    pub epilogue_sent: bool,
    pub updated_at: DateTime<Utc>,
}

impl ConversationContext {
    pub fn new(user_id: i64) -> Self {
        Self {
            user_id,
            state: FlowState::Idle,
            track: Track::Normal,
            display_name: String::new(),
            username: None,
            full_name: None,
            age: None,
            phone: None,
            has_children: None,
            children_study_quran: None,
            reading_level: None,
            consent_given: false,
            school_channel_subscribed: false,
            referrer_id: 0,
            referral_source: None,
            referral_entered_at: None,
            pending_tags: Vec::new(),
            epilogue_due_at: None,
            epilogue_sent: false,
            updated_at: Utc::now(),
        }
    }

    /// Drop everything collected so far and start over on `track`.
    ///
    /// The transport identity (display name, username) survives.
    pub fn reset(&mut self, track: Track) {
        let display_name = std::mem::take(&mut self.display_name);
        let username = self.username.take();
        *self = Self::new(self.user_id);
        self.display_name = display_name;
        self.username = username;
        self.track = track;
    }

    /// Record the transport identity seen on the latest event.
    pub fn remember_sender(&mut self, display_name: &str, username: Option<&str>) {
        if !display_name.trim().is_empty() {
            self.display_name = display_name.trim().to_string();
        }
        if let Some(username) = username.map(str::trim).filter(|u| !u.is_empty()) {
            self.username = Some(username.trim_start_matches('@').to_string());
        }
    }

    /// Move to `target`, logging transitions the state machine does not know.
    pub fn transition(&mut self, target: FlowState) {
        if self.state != target && !self.state.can_transition_to(target) {
            tracing::warn!(
                user_id = self.user_id,
                from = %self.state,
                to = %target,
                "Unexpected flow transition"
            );
        }
        self.state = target;
    }

    pub fn add_pending_tag(&mut self, tag: &str) {
        if !self.pending_tags.iter().any(|t| t == tag) {
            self.pending_tags.push(tag.to_string());
        }
    }
}

/// One crediting event in the referral ledger. Rows are never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferralUsage {
    pub event_id: Uuid,
    pub referral_link: String,
    pub referrer_id: i64,
    pub invitee_id: i64,
    pub idempotency_key: String,
    pub already_counted: bool,
    pub counted_at: Option<DateTime<Utc>>,
    pub trigger_source: String,
    pub triggered_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A stored recipient of registration notices.
///
/// Admins are known by username; `user_id` is filled in once the username has
/// been seen talking to the bot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAdmin {
    pub id: i64,
    /// Lowercase, without `@`.
    pub username: String,
    pub user_id: Option<i64>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate answers to the children questions over all profiles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildrenStats {
    pub total_users: i64,
    pub users_with_children: i64,
    pub users_without_children: i64,
    pub users_with_children_study_quran_true: i64,
    pub users_with_children_study_quran_false: i64,
    pub users_with_children_study_quran_unknown: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reading_level_round_trips_through_str() {
        for level in ReadingLevel::ALL {
            assert_eq!(level.as_str().parse::<ReadingLevel>().unwrap(), level);
            assert!(!level.label().is_empty());
        }
        assert!("fluent".parse::<ReadingLevel>().is_err());
    }

    #[test]
    fn referral_status_parsing() {
        assert_eq!(
            "counted".parse::<ReferralStatus>().unwrap(),
            ReferralStatus::Counted
        );
        assert!(ReferralStatus::Pending.is_referred());
        assert!(!ReferralStatus::NotApplicable.is_referred());
        assert!("maybe".parse::<ReferralStatus>().is_err());
    }

    #[test]
    fn reset_keeps_identity_only() {
        let mut ctx = ConversationContext::new(7);
        ctx.remember_sender("Ali", Some("@ali"));
        ctx.state = FlowState::AwaitAge;
        ctx.track = Track::Referral;
        ctx.referrer_id = 100;
        ctx.full_name = Some("Ali".into());
        ctx.add_pending_tag("x");

        ctx.reset(Track::Normal);

        assert_eq!(ctx.user_id, 7);
        assert_eq!(ctx.display_name, "Ali");
        assert_eq!(ctx.username.as_deref(), Some("ali"));
        assert_eq!(ctx.state, FlowState::Idle);
        assert_eq!(ctx.track, Track::Normal);
        assert_eq!(ctx.referrer_id, 0);
        assert!(ctx.full_name.is_none());
        assert!(ctx.pending_tags.is_empty());
    }

    #[test]
    fn pending_tags_are_deduplicated() {
        let mut ctx = ConversationContext::new(1);
        ctx.add_pending_tag("a");
        ctx.add_pending_tag("b");
        ctx.add_pending_tag("a");
        assert_eq!(ctx.pending_tags, vec!["a".to_string(), "b".to_string()]);
    }
}
