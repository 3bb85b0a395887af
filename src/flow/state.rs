//! Conversation state machine: which step the user is on and which track
//! they are following.

use serde::{Deserialize, Serialize};

/// Onboarding track a conversation follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Track {
    /// Organic signup via a plain `/start`.
    #[default]
    Normal,
    /// Signup through someone's invitation link.
    Referral,
}

impl Track {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Referral => "referral",
        }
    }
}

impl std::fmt::Display for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Track {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Self::Normal),
            "referral" => Ok(Self::Referral),
            other => Err(format!("unknown track: {other}")),
        }
    }
}

/// The steps of the onboarding conversation.
///
/// Both tracks share the registration steps. After the reading level the
/// normal track waits for the deferred epilogue while the referral track waits
/// for a course-channel confirmation; both then continue into the epilogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    #[default]
    Idle,
    AwaitSchoolRecheck,
    AwaitConsent,
    AwaitName,
    AwaitAge,
    AwaitHasChildren,
    AwaitChildrenStudy,
    AwaitPhone,
    AwaitReadingLevel,
    /// Normal track: registered, epilogue scheduled for `epilogue_due_at`.
    AwaitEpilogue,
    /// Referral track: registered, waiting for the course-channel click.
    AwaitCourseConfirm,
    AwaitTerms,
    AwaitLinkRequest,
    LinkIssued,
}

impl FlowState {
    pub const ALL: [FlowState; 14] = [
        Self::Idle,
        Self::AwaitSchoolRecheck,
        Self::AwaitConsent,
        Self::AwaitName,
        Self::AwaitAge,
        Self::AwaitHasChildren,
        Self::AwaitChildrenStudy,
        Self::AwaitPhone,
        Self::AwaitReadingLevel,
        Self::AwaitEpilogue,
        Self::AwaitCourseConfirm,
        Self::AwaitTerms,
        Self::AwaitLinkRequest,
        Self::LinkIssued,
    ];

    /// Check if a transition from `self` to `target` is valid.
    ///
    /// Any state may fall back to `Idle` (fresh `/start` or rejected entry)
    /// or jump to the school gate on a new entry.
    pub fn can_transition_to(&self, target: FlowState) -> bool {
        use FlowState::*;
        if matches!(target, Idle | AwaitSchoolRecheck | AwaitConsent) {
            return true;
        }
        matches!(
            (self, target),
            (AwaitSchoolRecheck, AwaitConsent)
                | (AwaitConsent, AwaitName)
                | (AwaitName, AwaitAge)
                | (AwaitAge, AwaitHasChildren)
                | (AwaitHasChildren, AwaitChildrenStudy)
                | (AwaitHasChildren, AwaitPhone)
                | (AwaitChildrenStudy, AwaitPhone)
                | (AwaitPhone, AwaitReadingLevel)
                | (AwaitReadingLevel, AwaitEpilogue)
                | (AwaitReadingLevel, AwaitCourseConfirm)
                | (AwaitReadingLevel, AwaitTerms)
                | (AwaitEpilogue, AwaitTerms)
                | (AwaitCourseConfirm, AwaitTerms)
                | (AwaitTerms, AwaitLinkRequest)
                | (AwaitLinkRequest, LinkIssued)
        )
    }

    /// Registration is finished and the user is waiting for the course
    /// subscription to be confirmed before the epilogue.
    pub fn awaits_course_confirmation(&self) -> bool {
        matches!(self, Self::AwaitEpilogue | Self::AwaitCourseConfirm)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitSchoolRecheck => "await_school_recheck",
            Self::AwaitConsent => "await_consent",
            Self::AwaitName => "await_name",
            Self::AwaitAge => "await_age",
            Self::AwaitHasChildren => "await_has_children",
            Self::AwaitChildrenStudy => "await_children_study",
            Self::AwaitPhone => "await_phone",
            Self::AwaitReadingLevel => "await_reading_level",
            Self::AwaitEpilogue => "await_epilogue",
            Self::AwaitCourseConfirm => "await_course_confirm",
            Self::AwaitTerms => "await_terms",
            Self::AwaitLinkRequest => "await_link_request",
            Self::LinkIssued => "link_issued",
        }
    }
}

impl std::fmt::Display for FlowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FlowState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown flow state: {s}"))
    }
}
