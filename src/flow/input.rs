//! Inbound events: classification, callback tokens and answer validation.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::flow::state::Track;
use crate::model::ReadingLevel;

/// Phone number shared through the transport's contact button.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// User the contact card belongs to.
    pub owner_id: i64,
    pub phone_number: String,
}

/// A transport-neutral update from one user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub user_id: i64,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub callback: Option<String>,
    #[serde(default)]
    pub contact: Option<Contact>,
}

/// What a button press asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackAction {
    SchoolRecheck,
    ConsentContinue,
    HasChildren(bool),
    ChildrenStudy(bool),
    ReadingLevel(ReadingLevel),
    CourseCheck,
    Terms,
    ShowLink,
}

impl CallbackAction {
    /// Whether tokens for this action carry the track they were issued on.
    fn is_track_scoped(&self) -> bool {
        !matches!(self, Self::Terms | Self::ShowLink)
    }

    /// Wire token for a button issued on `track`.
    pub fn token(&self, track: Track) -> String {
        let body = match self {
            Self::SchoolRecheck => "school_recheck".to_string(),
            Self::ConsentContinue => "consent".to_string(),
            Self::HasChildren(yes) => format!("has_children:{}", yes_no(*yes)),
            Self::ChildrenStudy(yes) => format!("children_study:{}", yes_no(*yes)),
            Self::ReadingLevel(level) => format!("level:{}", level.as_str()),
            Self::CourseCheck => "course_check".to_string(),
            Self::Terms => "terms".to_string(),
            Self::ShowLink => "show_link".to_string(),
        };
        if self.is_track_scoped() {
            format!("{track}:{body}")
        } else {
            format!("epilogue:{body}")
        }
    }
}

fn yes_no(yes: bool) -> &'static str {
    if yes { "yes" } else { "no" }
}

/// A parsed callback token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackToken {
    /// `None` for tokens shared by both tracks.
    pub track: Option<Track>,
    pub action: CallbackAction,
}

impl CallbackToken {
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.trim().split(':');
        let scope = parts.next()?;
        let name = parts.next()?;
        let arg = parts.next();
        if parts.next().is_some() {
            return None;
        }

        let track = match scope {
            "epilogue" => None,
            other => Some(other.parse::<Track>().ok()?),
        };
        let flag = |arg: Option<&str>| match arg {
            Some("yes") => Some(true),
            Some("no") => Some(false),
            _ => None,
        };
        let action = match (name, arg) {
            ("school_recheck", None) => CallbackAction::SchoolRecheck,
            ("consent", None) => CallbackAction::ConsentContinue,
            ("has_children", a) => CallbackAction::HasChildren(flag(a)?),
            ("children_study", a) => CallbackAction::ChildrenStudy(flag(a)?),
            ("level", Some(level)) => CallbackAction::ReadingLevel(level.parse().ok()?),
            ("course_check", None) => CallbackAction::CourseCheck,
            ("terms", None) => CallbackAction::Terms,
            ("show_link", None) => CallbackAction::ShowLink,
            _ => return None,
        };
        if action.is_track_scoped() != track.is_some() {
            return None;
        }
        Some(Self { track, action })
    }
}

/// An inbound event reduced to the one thing the engine acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// `/start`, optionally with a referrer argument.
    Start { payload: Option<String> },
    Callback(CallbackToken),
    /// A callback token this bot never issues.
    UnknownCallback(String),
    Contact(Contact),
    Text(String),
    Empty,
}

impl Input {
    /// Classify by priority: entry command, callback, contact, free text.
    pub fn classify(event: &InboundEvent) -> Self {
        let text = event.text.as_deref().map(str::trim).unwrap_or_default();
        if let Some(payload) = parse_start_command(text) {
            return Self::Start { payload };
        }
        if let Some(raw) = event
            .callback
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
        {
            return match CallbackToken::parse(raw) {
                Some(token) => Self::Callback(token),
                None => Self::UnknownCallback(raw.to_string()),
            };
        }
        if let Some(contact) = &event.contact {
            return Self::Contact(contact.clone());
        }
        if !text.is_empty() {
            return Self::Text(text.to_string());
        }
        Self::Empty
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Callback(_) => "callback",
            Self::UnknownCallback(_) => "unknown_callback",
            Self::Contact(_) => "contact",
            Self::Text(_) => "text",
            Self::Empty => "empty",
        }
    }
}

/// `Some(payload)` when `text` is `/start` or `/start@bot`, with the first
/// argument as payload.
fn parse_start_command(text: &str) -> Option<Option<String>> {
    let mut words = text.split_whitespace();
    let command = words.next()?;
    if command != "/start" && !command.starts_with("/start@") {
        return None;
    }
    Some(words.next().map(str::to_string))
}

static NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\p{L}[\p{L} \-]{1,49}$").unwrap_or_else(|e| panic!("invalid name pattern: {e}"))
});

/// Accept a trimmed name of 2-50 characters: a letter, then letters, spaces
/// or hyphens.
pub fn parse_name(raw: &str) -> Option<String> {
    let name = raw.trim();
    let len = name.chars().count();
    if !(2..=50).contains(&len) || !NAME_PATTERN.is_match(name) {
        return None;
    }
    Some(name.to_string())
}

/// Accept a whole-number age in [7, 100].
pub fn parse_age(raw: &str) -> Option<u32> {
    raw.trim()
        .parse::<u32>()
        .ok()
        .filter(|age| (7..=100).contains(age))
}

/// Free-text yes/no answer.
pub fn parse_yes_no(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "yes" | "y" | "да" => Some(true),
        "no" | "n" | "нет" => Some(false),
        _ => None,
    }
}

/// Referrer id from a `/start` argument; only positive ids are valid.
pub fn parse_referrer_id(payload: &str) -> Option<i64> {
    payload.trim().parse::<i64>().ok().filter(|id| *id > 0)
}

/// Canonical phone form: digits with a leading `+`.
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    format!("+{digits}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_event(text: &str) -> InboundEvent {
        InboundEvent {
            user_id: 1,
            text: Some(text.into()),
            ..Default::default()
        }
    }

    #[test]
    fn start_command_variants() {
        assert_eq!(
            Input::classify(&text_event("/start")),
            Input::Start { payload: None }
        );
        assert_eq!(
            Input::classify(&text_event("  /start 100  ")),
            Input::Start {
                payload: Some("100".into())
            }
        );
        assert_eq!(
            Input::classify(&text_event("/start@tajwid_bot abc")),
            Input::Start {
                payload: Some("abc".into())
            }
        );
        assert_eq!(
            Input::classify(&text_event("/starting")),
            Input::Text("/starting".into())
        );
    }

    #[test]
    fn classification_priority() {
        let event = InboundEvent {
            user_id: 1,
            text: Some("/start".into()),
            callback: Some("normal:consent".into()),
            ..Default::default()
        };
        assert!(matches!(Input::classify(&event), Input::Start { .. }));

        let event = InboundEvent {
            user_id: 1,
            text: Some("hello".into()),
            callback: Some("normal:consent".into()),
            contact: Some(Contact {
                owner_id: 1,
                phone_number: "1".into(),
            }),
            ..Default::default()
        };
        assert!(matches!(Input::classify(&event), Input::Callback(_)));

        let event = InboundEvent {
            contact: Some(Contact {
                owner_id: 1,
                phone_number: "1".into(),
            }),
            ..text_event("hello")
        };
        assert!(matches!(Input::classify(&event), Input::Contact(_)));

        assert_eq!(Input::classify(&text_event("   ")), Input::Empty);
        assert_eq!(Input::classify(&InboundEvent::default()), Input::Empty);
    }

    #[test]
    fn every_action_token_parses_back() {
        let mut actions = vec![
            CallbackAction::SchoolRecheck,
            CallbackAction::ConsentContinue,
            CallbackAction::HasChildren(true),
            CallbackAction::HasChildren(false),
            CallbackAction::ChildrenStudy(true),
            CallbackAction::ChildrenStudy(false),
            CallbackAction::CourseCheck,
            CallbackAction::Terms,
            CallbackAction::ShowLink,
        ];
        actions.extend(ReadingLevel::ALL.map(CallbackAction::ReadingLevel));

        for track in [Track::Normal, Track::Referral] {
            for action in &actions {
                let token = action.token(track);
                let parsed = CallbackToken::parse(&token)
                    .unwrap_or_else(|| panic!("token {token} did not parse"));
                assert_eq!(parsed.action, *action);
                let expected_track = action.is_track_scoped().then_some(track);
                assert_eq!(parsed.track, expected_track, "token {token}");
            }
        }
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        for raw in [
            "",
            "consent",
            "vip:consent",
            "normal:terms",
            "epilogue:consent",
            "normal:has_children:maybe",
            "normal:level:fluent",
            "normal:consent:extra",
            "normal:has_children:yes:1",
        ] {
            assert!(CallbackToken::parse(raw).is_none(), "{raw:?} should not parse");
        }
        let event = InboundEvent {
            user_id: 1,
            callback: Some("FLOW9_SOMETHING".into()),
            ..Default::default()
        };
        assert_eq!(
            Input::classify(&event),
            Input::UnknownCallback("FLOW9_SOMETHING".into())
        );
    }

    #[test]
    fn name_rules() {
        assert_eq!(parse_name("  Ali "), Some("Ali".into()));
        assert_eq!(parse_name("Анна-Мария"), Some("Анна-Мария".into()));
        assert_eq!(parse_name("Abu Bakr"), Some("Abu Bakr".into()));
        assert_eq!(parse_name("A"), None);
        assert_eq!(parse_name("-Ali"), None);
        assert_eq!(parse_name("Ali2"), None);
        assert_eq!(parse_name(&"a".repeat(51)), None);
        assert!(parse_name(&"a".repeat(50)).is_some());
    }

    #[test]
    fn age_bounds() {
        assert_eq!(parse_age("7"), Some(7));
        assert_eq!(parse_age(" 100 "), Some(100));
        assert_eq!(parse_age("6"), None);
        assert_eq!(parse_age("101"), None);
        assert_eq!(parse_age("twenty"), None);
        assert_eq!(parse_age("-5"), None);
    }

    #[test]
    fn referrer_and_yes_no_parsing() {
        assert_eq!(parse_referrer_id("100"), Some(100));
        assert_eq!(parse_referrer_id("0"), None);
        assert_eq!(parse_referrer_id("-3"), None);
        assert_eq!(parse_referrer_id("abc"), None);
        assert_eq!(parse_yes_no("Yes"), Some(true));
        assert_eq!(parse_yes_no("нет"), Some(false));
        assert_eq!(parse_yes_no("perhaps"), None);
        assert_eq!(normalize_phone("7 (900) 000-00-00"), "+79000000000");
        assert_eq!(normalize_phone("+79000000000"), "+79000000000");
    }
}
