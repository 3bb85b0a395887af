//! Signup conversation: state machine, input handling and the engine that
//! ties them to storage and the subscription oracle.

pub mod engine;
pub mod input;
pub mod messages;
pub mod route;
pub mod state;

pub use engine::{ConfirmTrigger, FlowEngine};
pub use input::{CallbackAction, CallbackToken, Contact, InboundEvent, Input};
pub use messages::{Button, ButtonKind, OutboundMessage};
pub use state::{FlowState, Track};
