//! Domain errors

use crate::domain::call::value_object::EndReason;
use crate::domain::shared::value_objects::SessionId;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Capture device missing or permission denied
    #[error("Media unavailable: {0}")]
    MediaUnavailable(String),

    /// A second call was attempted while one is active
    #[error("Call already active: {0}")]
    CallAlreadyActive(SessionId),

    /// Peer-connection capability failure
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// Signaling channel not connected or send failed
    #[error("Signaling channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("No active call")]
    NoActiveCall,

    /// The session ended before the requested operation completed
    #[error("Call ended: {0}")]
    CallEnded(EndReason),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for CallError {
    fn from(err: serde_json::Error) -> Self {
        CallError::Serialization(err.to_string())
    }
}
