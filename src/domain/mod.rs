//! Domain layer - Call lifecycle rules and the capability ports
//!
//! This layer contains:
//! - The call session aggregate and its pure state machine
//! - Value objects shared across the call core
//! - Ports for media capture, peer connections and signaling
//! - Domain events published to observers

pub mod call;
pub mod media;
pub mod peer;
pub mod shared;
pub mod signaling;

// Re-export commonly used types
pub use shared::{CallError, Result};
