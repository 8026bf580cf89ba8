//! Peer-connection capability port and session descriptions

use crate::domain::media::{MediaStream, RemoteStream};
use crate::domain::shared::result::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Complete (non-trickle) session description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Negotiation role of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerMode {
    Offerer,
    Answerer,
}

/// Callbacks of a peer connection, delivered as messages
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// The full local description; produced once per connection
    LocalDescription(SessionDescription),
    /// Remote media arrived; the connection keeps the strong reference
    RemoteStream(Arc<RemoteStream>),
    /// Terminal negotiation or transport failure
    Error(String),
}

/// Factory for peer connections (host media stack)
pub trait PeerConnector: Send + Sync {
    /// Open a connection with `local_stream` attached. Events flow into
    /// `events` until the connection is destroyed.
    fn open(
        &self,
        mode: PeerMode,
        local_stream: &MediaStream,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerConnection>>;
}

/// One live peer connection
pub trait PeerConnection: Send + Sync {
    /// Feed the remote description (offer for answerers, answer for offerers)
    fn signal(&self, remote: SessionDescription) -> Result<()>;

    /// Tear down transport and stop emitting events
    fn destroy(&self);
}
