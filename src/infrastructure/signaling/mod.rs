//! Signaling transport adapters

pub mod memory;
pub mod router;
pub mod ws_client;

pub use memory::{MemoryChannel, MemorySignalingHub};
pub use router::SignalingRouter;
pub use ws_client::WsSignalingClient;
