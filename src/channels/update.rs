//! Telegram update payloads and their mapping onto engine events.

use serde::Deserialize;

use crate::channels::registry::CourseChannelRegistry;
use crate::flow::input::{Contact, InboundEvent};
use crate::subscription::MembershipStatus;

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
    #[serde(default)]
    pub chat_member: Option<ChatMemberUpdated>,
    #[serde(default)]
    pub my_chat_member: Option<ChatMemberUpdated>,
    #[serde(default)]
    pub channel_post: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    #[serde(default)]
    pub from: Option<User>,
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub contact: Option<TelegramContact>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub username: Option<String>,
}

impl User {
    /// First name, else username, else a generic placeholder.
    pub fn display_name(&self) -> String {
        let first = self.first_name.trim();
        if !first.is_empty() {
            return first.to_string();
        }
        self.username
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .unwrap_or("user")
            .to_string()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub username: Option<String>,
}

impl Chat {
    fn is_private(&self) -> bool {
        self.kind == "private"
    }

    fn is_channel(&self) -> bool {
        self.kind == "channel"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramContact {
    pub phone_number: String,
    #[serde(default)]
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMemberUpdated {
    pub chat: Chat,
    pub new_chat_member: ChatMember,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMember {
    pub status: String,
    pub user: User,
}

/// What an update means for the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappedUpdate {
    /// A private-chat message or button press.
    Event {
        event: InboundEvent,
        callback_query_id: Option<String>,
    },
    /// Someone joined the course channel.
    CourseMembership { user_id: i64 },
    Ignored,
}

/// Map a raw update, feeding any channel it mentions to the registry.
pub fn map_update(update: &Update, registry: &CourseChannelRegistry) -> MappedUpdate {
    if let Some(query) = &update.callback_query {
        return MappedUpdate::Event {
            event: InboundEvent {
                user_id: query.from.id,
                display_name: query.from.display_name(),
                username: query.from.username.clone(),
                callback: query.data.clone(),
                ..Default::default()
            },
            callback_query_id: Some(query.id.clone()),
        };
    }

    if let Some(message) = &update.message {
        let Some(from) = message.from.as_ref().filter(|_| message.chat.is_private()) else {
            return MappedUpdate::Ignored;
        };
        return MappedUpdate::Event {
            event: InboundEvent {
                user_id: from.id,
                display_name: from.display_name(),
                username: from.username.clone(),
                text: message.text.clone(),
                contact: message.contact.as_ref().map(|c| Contact {
                    owner_id: c.user_id.unwrap_or_default(),
                    phone_number: c.phone_number.clone(),
                }),
                ..Default::default()
            },
            callback_query_id: None,
        };
    }

    if let Some(change) = &update.chat_member {
        let chat = &change.chat;
        if !chat.is_channel() {
            return MappedUpdate::Ignored;
        }
        registry.observe(chat.id, chat.username.as_deref());
        let member = &change.new_chat_member;
        let joined = MembershipStatus::from_member_status(&member.status)
            == MembershipStatus::Subscribed;
        if joined && !member.user.is_bot && registry.is_course_channel(chat.id, chat.username.as_deref()) {
            return MappedUpdate::CourseMembership {
                user_id: member.user.id,
            };
        }
        return MappedUpdate::Ignored;
    }

    let channel_chat = update
        .my_chat_member
        .as_ref()
        .map(|c| &c.chat)
        .or(update.channel_post.as_ref().map(|p| &p.chat));
    if let Some(chat) = channel_chat.filter(|c| c.is_channel()) {
        registry.observe(chat.id, chat.username.as_deref());
    }
    MappedUpdate::Ignored
}
