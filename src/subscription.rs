//! Channel-membership checks ("is user X subscribed to channel Y").
//!
//! Results are tri-state: a failed lookup is `Error`, never a guess.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::channels::registry::CourseChannelRegistry;
use crate::channels::telegram::TelegramClient;

/// Outcome of a membership check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MembershipStatus {
    Subscribed,
    NotSubscribed,
    /// The check itself failed (transport error, timeout, unknown channel).
    Error,
}

impl MembershipStatus {
    /// Map a Telegram `ChatMember.status` value.
    pub fn from_member_status(status: &str) -> Self {
        match status {
            "member" | "administrator" | "creator" => Self::Subscribed,
            _ => Self::NotSubscribed,
        }
    }
}

/// The two channels the onboarding flow gates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// The school's public channel, required before registration.
    School,
    /// The course channel, required before the referral epilogue.
    Course,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::School => f.write_str("school"),
            Self::Course => f.write_str("course"),
        }
    }
}

#[async_trait]
pub trait SubscriptionOracle: Send + Sync {
    async fn check_membership(&self, channel: ChannelKind, user_id: i64) -> MembershipStatus;
}

/// Run a membership check bounded by `timeout`; an expired check is `Error`.
pub async fn check_with_timeout(
    oracle: &dyn SubscriptionOracle,
    channel: ChannelKind,
    user_id: i64,
    timeout: Duration,
) -> MembershipStatus {
    match tokio::time::timeout(timeout, oracle.check_membership(channel, user_id)).await {
        Ok(status) => status,
        Err(_) => {
            warn!(user_id, %channel, ?timeout, "Membership check timed out");
            MembershipStatus::Error
        }
    }
}

/// Deterministic oracle answering from a table, with a default for unknown
/// users. Used for local runs without Telegram and in tests.
pub struct StaticOracle {
    default: MembershipStatus,
    answers: Mutex<HashMap<(ChannelKind, i64), MembershipStatus>>,
    calls: AtomicUsize,
}

impl StaticOracle {
    pub fn new(default: MembershipStatus) -> Self {
        Self {
            default,
            answers: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Fix the answer for one user and channel.
    pub fn set(&self, channel: ChannelKind, user_id: i64, status: MembershipStatus) {
        self.answers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((channel, user_id), status);
    }

    /// Number of checks answered so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SubscriptionOracle for StaticOracle {
    async fn check_membership(&self, channel: ChannelKind, user_id: i64) -> MembershipStatus {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(channel, user_id))
            .copied()
            .unwrap_or(self.default)
    }
}

/// Oracle backed by the Bot API `getChatMember` call.
pub struct TelegramOracle {
    client: Arc<TelegramClient>,
    school_channel_id: String,
    course_channels: Arc<CourseChannelRegistry>,
}

impl TelegramOracle {
    pub fn new(
        client: Arc<TelegramClient>,
        school_channel_id: impl Into<String>,
        course_channels: Arc<CourseChannelRegistry>,
    ) -> Self {
        Self {
            client,
            school_channel_id: school_channel_id.into(),
            course_channels,
        }
    }
}

#[async_trait]
impl SubscriptionOracle for TelegramOracle {
    async fn check_membership(&self, channel: ChannelKind, user_id: i64) -> MembershipStatus {
        let chat_id = match channel {
            ChannelKind::School => Some(self.school_channel_id.clone()),
            ChannelKind::Course => self.course_channels.resolve(),
        };
        let Some(chat_id) = chat_id.filter(|id| !id.trim().is_empty()) else {
            warn!(user_id, %channel, "No chat id known for channel");
            return MembershipStatus::Error;
        };

        match self.client.get_chat_member(&chat_id, user_id).await {
            Ok(status) => MembershipStatus::from_member_status(&status),
            Err(e) => {
                warn!(user_id, %channel, error = %e, "getChatMember failed");
                MembershipStatus::Error
            }
        }
    }
}
