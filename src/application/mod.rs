//! Application layer - Use cases and application services
//!
//! This layer orchestrates the domain state machine and the capability
//! adapters. It's responsible for:
//! - Serializing every call input through one owner
//! - Running transition effects against media, peer and signaling adapters
//! - Publishing snapshots and domain events to observers

pub mod call;

pub use call::{CallManager, CallManagerConfig, CallSnapshot, EndCallOutcome};
