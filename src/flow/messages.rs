//! Outbound message types and the bot's user-facing texts.

use serde::{Deserialize, Serialize};

use crate::model::UserProfile;

/// What pressing a button does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ButtonKind {
    /// Sends `token` back as a callback.
    Callback { token: String },
    /// Opens a link.
    Url { href: String },
    /// Shares the user's own phone number.
    RequestContact,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub label: String,
    #[serde(flatten)]
    pub kind: ButtonKind,
}

impl Button {
    pub fn callback(label: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            kind: ButtonKind::Callback {
                token: token.into(),
            },
        }
    }

    pub fn url(label: impl Into<String>, href: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            kind: ButtonKind::Url { href: href.into() },
        }
    }

    pub fn request_contact(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            kind: ButtonKind::RequestContact,
        }
    }
}

/// A message for one recipient, produced by the engine and delivered by a
/// transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub recipient_id: i64,
    pub text: String,
    #[serde(default)]
    pub buttons: Vec<Button>,
}

impl OutboundMessage {
    /// Callback tokens carried by this message, in button order.
    pub fn callback_tokens(&self) -> impl Iterator<Item = &str> {
        self.buttons.iter().filter_map(|b| match &b.kind {
            ButtonKind::Callback { token } => Some(token.as_str()),
            _ => None,
        })
    }
}

/// Messages collected while handling one event.
#[derive(Debug, Default)]
pub struct Outbox {
    messages: Vec<OutboundMessage>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, recipient_id: i64, text: impl Into<String>) {
        self.push_with(recipient_id, text, Vec::new());
    }

    pub fn push_with(&mut self, recipient_id: i64, text: impl Into<String>, buttons: Vec<Button>) {
        self.messages.push(OutboundMessage {
            recipient_id,
            text: text.into(),
            buttons,
        });
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn into_messages(self) -> Vec<OutboundMessage> {
        self.messages
    }
}

// ── Tags ────────────────────────────────────────────────────────────

pub const TAG_CLICKED_SUBSCRIBED: &str = "clicked subscribed button";
pub const TAG_SUBSCRIBED_VIA_BOT: &str = "subscribed via bot";
pub const TAG_REFERRER_GOT_LINK: &str = "referrer got link";
pub const TAG_COURSE_CONFIRMED: &str = "course channel confirmed";

// ── Button labels ───────────────────────────────────────────────────

pub const BTN_CONTINUE: &str = "Continue";
pub const BTN_SUBSCRIBED: &str = "I've subscribed";
pub const BTN_CHECK_AGAIN: &str = "Check again";
pub const BTN_CHECK_SUBSCRIPTION: &str = "Check subscription";
pub const BTN_SCHOOL_CHANNEL: &str = "School Telegram channel";
pub const BTN_COURSE_CHANNEL: &str = "Course channel";
pub const BTN_YES: &str = "Yes";
pub const BTN_NO: &str = "No";
pub const BTN_SEND_PHONE: &str = "Send number";
pub const BTN_TERMS: &str = "Terms";
pub const BTN_SHOW_LINK: &str = "Here is your link";
pub const BTN_TRY_AGAIN: &str = "Try again";

// ── Texts ───────────────────────────────────────────────────────────

const GREETING: &str = "Assalamu alaikum wa rahmatullahi wa barakatuh! 🌙";

pub const CONSENT_NOTICE: &str = "May Allah make your studies easy 🤍\n\
    By continuing with the bot you agree to the processing of your personal data.";

pub const START_HINT: &str = "Press /start to begin registration.";
pub const NUDGE: &str = "Press /start to begin or continue with the buttons.";
pub const STALE_BUTTON: &str = "This button is no longer active. Press /start to begin again.";

pub const SCHOOL_NOT_SUBSCRIBED: &str = "It looks like the subscription hasn't gone through yet.\n\
    Please subscribe to the Telegram channel and press the button again.";
pub const SUBSCRIPTION_CHECK_FAILED: &str =
    "Temporary error while checking the subscription. Please press the button and try again.";

pub const ASK_NAME: &str = "Great, let's continue.\nPlease enter your name.";
pub const INVALID_NAME: &str =
    "Please enter a valid name (2-50 characters: letters, spaces and hyphens only).";
pub const ASK_AGE: &str = "Please enter your age.";
pub const INVALID_AGE: &str = "Please enter a valid age as a number from 7 to 100.";
pub const ASK_HAS_CHILDREN: &str = "Do you have children? 👶";
pub const ASK_CHILDREN_STUDY: &str = "Do they study the Quran? 📖";
pub const PICK_OPTION: &str = "Please choose one of the options below 👇";
pub const ASK_PHONE: &str = "Send your phone number with the button below 📱";
pub const PHONE_VIA_BUTTON: &str = "Please send your number with the button in the bot.";
pub const NOT_OWN_PHONE: &str = "Please send your own number with the button in the bot.";
pub const CONTACT_NOT_REQUESTED: &str =
    "A contact is not expected right now. Press /start to begin.";
pub const ASK_READING_LEVEL: &str = "What is your current level of Quran reading?";
pub const PICK_READING_LEVEL: &str = "Please choose one of the offered reading levels.";

pub const REGISTERED: &str = "✅ You are registered for the tajwid course!\n\
    All information about the lessons, links and materials will be posted in the Telegram channel.\n\
    Please subscribe to the course channel.";
pub const EPILOGUE_PENDING: &str =
    "Almost done 🙌 I'll send you the referral program automatically in a couple of minutes.";
pub const COURSE_NOT_SUBSCRIBED: &str =
    "It looks like the course channel subscription isn't active yet.\n\
    Subscribe to the course channel and press the check button again.";

pub const EPILOGUE: &str = "You're registered, alhamdulillah 🤍\n\
    Now invite friends and get a reward for each one! 🔥\n\
    Press the button below to see the terms and get your link 👇";
pub const TERMS: &str = "📌 Terms of participation:\n\
    1) You get a personal invitation link.\n\
    2) An invitation counts once your friend follows the link, completes registration \
    and joins the course channel.\n\
    3) Fake accounts and bots are forbidden.\n\
    4) Violations cancel participation.";
pub const FINISH_REGISTRATION_FIRST: &str = "Please complete registration first. Press /start.";
pub const LINK_FAILED: &str =
    "Temporary error while generating the link. Press the button and try again.";
pub const LINK_CLOSING: &str = "Above is your invitation link.\n\
    Start right now and lead your brothers to good 🤲";

pub const REJECT_INVALID_LINK: &str = "This referral link cannot be used.";
pub const REJECT_SELF_REFERRAL: &str = "You cannot use your own invitation link.";
pub const REJECT_UNKNOWN_REFERRER: &str =
    "This invitation link is not valid: its owner is not registered.";
pub const REJECT_REPLAY: &str = "You can no longer use this link.";

/// Intro for an organic user who is already in the school channel.
pub fn intro_subscribed() -> String {
    format!(
        "{GREETING}\nYou are signing up for the free tajwid course during Ramadan.\n\n{CONSENT_NOTICE}"
    )
}

/// Intro shown when the entry membership check itself failed.
pub fn intro_check_failed() -> String {
    format!(
        "{GREETING}\nYou are signing up for the free tajwid course during Ramadan.\n\n\
        {SUBSCRIPTION_CHECK_FAILED}"
    )
}

/// Intro asking an organic user to join the school channel first.
pub fn intro_school_gate() -> String {
    format!(
        "{GREETING}\nYou are signing up for the free tajwid course during Ramadan.\n\
        To take part, please subscribe to our Telegram channel first, \
        then press the button below to continue registration."
    )
}

/// Intro for a user who arrived through an invitation link.
pub fn intro_invited() -> String {
    format!(
        "{GREETING}\nA friend cared about you and invited you to our tajwid course.\n\
        To take part, please subscribe to our Telegram channel first, \
        then press the button below to continue registration."
    )
}

pub fn nice_to_meet(name: &str) -> String {
    format!("Nice to meet you, {name}! Let's go on 😊")
}

pub fn referral_credited(total: i64) -> String {
    format!("+1 to the common pot 🔥\nTotal friends invited: {total}.")
}

/// Summary of a fresh registration for the configured recipients.
pub fn registration_notice(profile: &UserProfile, inviter: &str) -> String {
    let name = profile
        .full_name
        .as_deref()
        .filter(|n| !n.is_empty())
        .unwrap_or(profile.display_name.as_str());
    let name = if name.is_empty() { "not specified" } else { name };
    let username = profile
        .username
        .as_deref()
        .map(|u| format!("@{u}"))
        .unwrap_or_else(|| "not specified".to_string());
    let age = profile
        .age
        .map(|a| a.to_string())
        .unwrap_or_else(|| "not specified".to_string());
    let phone = profile.phone.as_deref().unwrap_or("not specified");
    let children = match (profile.has_children, profile.children_study_quran) {
        (Some(true), Some(true)) => "Yes, they study the Quran",
        (Some(true), Some(false)) => "Yes, they don't study the Quran",
        (Some(true), None) => "Yes",
        (Some(false), _) => "No",
        (None, _) => "not specified",
    };
    let level = profile
        .reading_level
        .map(|l| l.label())
        .unwrap_or("not specified");

    format!(
        "🆕 New registration\n\n\
        👤 Name: {name}\n\
        🎂 Age: {age}\n\
        📨 Telegram: {username}\n\
        📱 Phone: {phone}\n\
        👨‍👩‍👧 Children: {children}\n\
        📖 Level: {level}\n\
        🤝 Invited by: {inviter}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReadingLevel;

    #[test]
    fn buttons_serialize_with_kind_tag() {
        let msg = OutboundMessage {
            recipient_id: 1,
            text: "hi".into(),
            buttons: vec![
                Button::callback("Go", "normal:consent"),
                Button::url("Site", "https://example.com"),
                Button::request_contact("Phone"),
            ],
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["buttons"][0]["kind"], "callback");
        assert_eq!(json["buttons"][0]["token"], "normal:consent");
        assert_eq!(json["buttons"][1]["href"], "https://example.com");
        assert_eq!(json["buttons"][2]["kind"], "request_contact");

        let back: OutboundMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.callback_tokens().collect::<Vec<_>>(), vec!["normal:consent"]);
    }

    #[test]
    fn outbox_collects_in_order() {
        let mut out = Outbox::new();
        assert!(out.is_empty());
        out.push(1, "a");
        out.push_with(2, "b", vec![Button::callback("x", "y")]);
        assert_eq!(out.len(), 2);
        let messages = out.into_messages();
        assert_eq!(messages[0].recipient_id, 1);
        assert_eq!(messages[1].buttons.len(), 1);
    }

    #[test]
    fn registration_notice_lists_answers() {
        let mut p = UserProfile::new(5, "Ali");
        p.full_name = Some("Ali Karimov".into());
        p.username = Some("ali".into());
        p.age = Some(30);
        p.has_children = Some(true);
        p.children_study_quran = Some(false);
        p.reading_level = Some(ReadingLevel::ReadBySyllables);

        let text = registration_notice(&p, "nobody");
        assert!(text.contains("Ali Karimov"));
        assert!(text.contains("@ali"));
        assert!(text.contains("30"));
        assert!(text.contains("don't study"));
        assert!(text.contains(ReadingLevel::ReadBySyllables.label()));
        assert!(text.contains("Phone: not specified"));
        assert!(text.ends_with("Invited by: nobody"));
    }
}
