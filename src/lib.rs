//! YakTalk - peer-to-peer call sessions over a signaling relay
//!
//! Layered the same way as the rest of the stack: a pure domain core
//! (call state machine and capability ports), an application actor that
//! owns the current call, infrastructure adapters for media, peer
//! connections and signaling transports, and an axum relay server.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod interface;

// Re-export commonly used types
pub use domain::shared::error::CallError;
pub use domain::shared::result::Result;
