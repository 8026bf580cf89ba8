//! Peer connection adapters

pub mod loopback;
pub mod session;

pub use loopback::LoopbackPeerConnector;
pub use session::{PeerNotification, PeerSession};
