//! Call use cases: the engine owning the current call and its observable view

pub mod manager;
pub mod snapshot;

pub use manager::{CallManager, CallManagerConfig, EndCallOutcome};
pub use snapshot::CallSnapshot;
