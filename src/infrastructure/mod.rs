//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - Scoped owners for captured media and peer connections
//! - Loopback capabilities for the daemon and tests
//! - Signaling routing and transports (in-process hub, WebSocket client)

pub mod media;
pub mod peer;
pub mod signaling;
