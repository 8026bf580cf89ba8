//! Call bounded context - lifecycle of a single peer-to-peer call

pub mod aggregate;
pub mod event;
pub mod machine;
pub mod value_object;

pub use aggregate::CallSession;
pub use event::CallEvent;
pub use machine::{
    transition, CallInput, CallState, Disposition, Effect, Negotiation, Transition,
    TransitionContext,
};
pub use value_object::{CallRole, CallStatus, EndReason, MediaKind};
