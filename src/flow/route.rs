//! Pure routing of a classified input against the current state.

use crate::flow::input::{CallbackAction, Contact, Input, parse_yes_no};
use crate::flow::state::{FlowState, Track};
use crate::model::ReadingLevel;

/// The handler an input is dispatched to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    SchoolRecheck,
    Consent,
    Name(String),
    Age(String),
    /// `None` when the free-text answer was not a yes/no.
    HasChildren(Option<bool>),
    ChildrenStudy(Option<bool>),
    Phone(Contact),
    /// Free text where a contact share was expected.
    PhoneViaButton,
    ContactNotRequested,
    /// `None` when the user typed instead of picking a level.
    ReadingLevel(Option<ReadingLevel>),
    CourseCheck,
    Terms,
    ShowLink,
    /// Free text while the deferred epilogue is still pending.
    EpiloguePending,
    /// A button that does not belong to the current step or track.
    Stale,
    Nudge,
}

/// Decide what to do with `input` in `state` on `track`.
///
/// Entry commands and empty updates are handled before routing and land on
/// [`Route::Nudge`] here.
pub fn route(state: FlowState, track: Track, input: &Input) -> Route {
    use FlowState::*;

    match input {
        Input::Callback(token) => {
            if token.track.is_some_and(|t| t != track) {
                return Route::Stale;
            }
            match (state, token.action) {
                (AwaitSchoolRecheck, CallbackAction::SchoolRecheck) => Route::SchoolRecheck,
                (AwaitConsent, CallbackAction::ConsentContinue) => Route::Consent,
                (AwaitHasChildren, CallbackAction::HasChildren(v)) => Route::HasChildren(Some(v)),
                (AwaitChildrenStudy, CallbackAction::ChildrenStudy(v)) => {
                    Route::ChildrenStudy(Some(v))
                }
                (AwaitReadingLevel, CallbackAction::ReadingLevel(l)) => {
                    Route::ReadingLevel(Some(l))
                }
                (AwaitEpilogue | AwaitCourseConfirm, CallbackAction::CourseCheck) => {
                    Route::CourseCheck
                }
                (AwaitTerms, CallbackAction::Terms) => Route::Terms,
                (AwaitLinkRequest | LinkIssued, CallbackAction::ShowLink) => Route::ShowLink,
                _ => Route::Stale,
            }
        }
        Input::UnknownCallback(_) => Route::Stale,
        Input::Contact(contact) if state == AwaitPhone => Route::Phone(contact.clone()),
        Input::Contact(_) => Route::ContactNotRequested,
        Input::Text(text) => match state {
            AwaitName => Route::Name(text.clone()),
            AwaitAge => Route::Age(text.clone()),
            AwaitHasChildren => Route::HasChildren(parse_yes_no(text)),
            AwaitChildrenStudy => Route::ChildrenStudy(parse_yes_no(text)),
            AwaitPhone => Route::PhoneViaButton,
            AwaitReadingLevel => Route::ReadingLevel(None),
            AwaitEpilogue => Route::EpiloguePending,
            _ => Route::Nudge,
        },
        Input::Start { .. } | Input::Empty => Route::Nudge,
    }
}
