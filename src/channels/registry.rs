//! Course channel discovery.
//!
//! When no course channel id is configured, the first channel update the bot
//! sees that is not the school channel names the course channel.

use std::sync::{PoisonError, RwLock};

use tracing::info;

pub struct CourseChannelRegistry {
    configured: Option<String>,
    school_channel_id: String,
    discovered: RwLock<Option<String>>,
}

impl CourseChannelRegistry {
    pub fn new(configured: Option<String>, school_channel_id: impl Into<String>) -> Self {
        Self {
            configured: configured.filter(|id| !id.trim().is_empty()),
            school_channel_id: school_channel_id.into(),
            discovered: RwLock::new(None),
        }
    }

    /// Chat id to query for course membership, if known.
    pub fn resolve(&self) -> Option<String> {
        self.configured.clone().or_else(|| {
            self.discovered
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        })
    }

    /// Remember a channel seen in an update. Returns `true` if the course
    /// channel changed.
    pub fn observe(&self, chat_id: i64, username: Option<&str>) -> bool {
        if self.configured.is_some() || self.is_school_channel(chat_id, username) {
            return false;
        }
        let id = chat_id.to_string();
        let mut discovered = self
            .discovered
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if discovered.as_deref() == Some(id.as_str()) {
            return false;
        }
        info!(chat_id, previous = ?*discovered, "Course channel discovered");
        *discovered = Some(id);
        true
    }

    pub fn is_course_channel(&self, chat_id: i64, username: Option<&str>) -> bool {
        self.resolve()
            .is_some_and(|course| same_chat(&course, chat_id, username))
    }

    fn is_school_channel(&self, chat_id: i64, username: Option<&str>) -> bool {
        same_chat(&self.school_channel_id, chat_id, username)
    }
}

/// Whether `reference` (numeric id or `@handle`) names the given chat.
fn same_chat(reference: &str, chat_id: i64, username: Option<&str>) -> bool {
    let reference = reference.trim();
    if reference == chat_id.to_string() {
        return true;
    }
    match (reference.strip_prefix('@'), username) {
        (Some(handle), Some(username)) => {
            handle.eq_ignore_ascii_case(username.trim_start_matches('@'))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_channel_wins() {
        let registry = CourseChannelRegistry::new(Some("-100500".into()), "@school");
        assert!(!registry.observe(-100777, Some("other")));
        assert_eq!(registry.resolve().as_deref(), Some("-100500"));
        assert!(registry.is_course_channel(-100500, None));
        assert!(!registry.is_course_channel(-100777, None));
    }

    #[test]
    fn discovers_first_non_school_channel() {
        let registry = CourseChannelRegistry::new(None, "@tartil_madrasa");
        assert!(registry.resolve().is_none());

        assert!(!registry.observe(-1001, Some("Tartil_Madrasa")), "school channel is skipped");
        assert!(registry.resolve().is_none());

        assert!(registry.observe(-1002, Some("course")));
        assert!(!registry.observe(-1002, Some("course")), "same channel is not a change");
        assert_eq!(registry.resolve().as_deref(), Some("-1002"));
        assert!(registry.is_course_channel(-1002, None));
    }

    #[test]
    fn blank_configured_id_means_discovery() {
        let registry = CourseChannelRegistry::new(Some("  ".into()), "-1001");
        assert!(!registry.observe(-1001, None));
        assert!(registry.observe(-1003, None));
        assert_eq!(registry.resolve().as_deref(), Some("-1003"));
    }
}
