//! Call value objects

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of the call this client is on; fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    Caller,
    Callee,
}

/// Media carried by the call; fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Microphone only
    Voice,
    /// Microphone and camera
    Video,
}

impl MediaKind {
    pub fn wants_video(&self) -> bool {
        matches!(self, MediaKind::Video)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Voice => "voice",
            MediaKind::Video => "video",
        }
    }
}

/// Call status as seen by observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// Outbound call created, offer being prepared or awaiting answer
    Initiated,
    /// Inbound call alerting locally
    Ringing,
    /// Both sides exchanged descriptions
    Answered,
    /// Terminal
    Ended,
}

impl CallStatus {
    /// Check if status transition is valid
    pub fn can_transition_to(&self, next: CallStatus) -> bool {
        use CallStatus::*;

        match (self, next) {
            (Initiated, Answered) => true,
            (Initiated, Ended) => true,

            (Ringing, Answered) => true,
            (Ringing, Ended) => true,

            (Answered, Ended) => true,

            // Ended is terminal
            (Ended, _) => false,

            _ => false,
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, CallStatus::Ended)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Initiated => "initiated",
            CallStatus::Ringing => "ringing",
            CallStatus::Answered => "answered",
            CallStatus::Ended => "ended",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason for call ending
///
/// Travels as a plain string in `endCall`/`callEnded` payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EndReason {
    /// Normal local or remote hangup
    Hangup,
    /// Callee refused the call
    Declined,
    /// Remote party is on another call
    Busy,
    /// Caller gave up before the call was answered
    Cancelled,
    /// Capture device missing or permission denied
    MediaUnavailable,
    /// Signaling channel could not deliver a setup message
    ChannelUnavailable,
    /// Negotiation or peer failure; the detail stays local
    Error(String),
    /// Any reason string this client does not recognise
    Other(String),
}

impl EndReason {
    pub fn as_str(&self) -> &str {
        match self {
            EndReason::Hangup => "hangup",
            EndReason::Declined => "declined",
            EndReason::Busy => "busy",
            EndReason::Cancelled => "cancelled",
            EndReason::MediaUnavailable => "media-unavailable",
            EndReason::ChannelUnavailable => "channel-unavailable",
            EndReason::Error(_) => "error",
            EndReason::Other(reason) => reason,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            EndReason::MediaUnavailable | EndReason::ChannelUnavailable | EndReason::Error(_)
        )
    }
}

impl From<String> for EndReason {
    fn from(reason: String) -> Self {
        match reason.as_str() {
            "hangup" => EndReason::Hangup,
            "declined" => EndReason::Declined,
            "busy" => EndReason::Busy,
            "cancelled" => EndReason::Cancelled,
            "media-unavailable" => EndReason::MediaUnavailable,
            "channel-unavailable" => EndReason::ChannelUnavailable,
            "error" => EndReason::Error(String::new()),
            _ => EndReason::Other(reason),
        }
    }
}

impl From<&str> for EndReason {
    fn from(reason: &str) -> Self {
        EndReason::from(reason.to_string())
    }
}

impl From<EndReason> for String {
    fn from(reason: EndReason) -> Self {
        reason.as_str().to_string()
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::Error(detail) if !detail.is_empty() => write!(f, "error: {}", detail),
            other => f.write_str(other.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_status_transitions() {
        assert!(CallStatus::Initiated.can_transition_to(CallStatus::Answered));
        assert!(CallStatus::Initiated.can_transition_to(CallStatus::Ended));
        assert!(CallStatus::Ringing.can_transition_to(CallStatus::Answered));
        assert!(CallStatus::Answered.can_transition_to(CallStatus::Ended));
    }

    #[test]
    fn test_invalid_status_transitions() {
        assert!(!CallStatus::Initiated.can_transition_to(CallStatus::Ringing));
        assert!(!CallStatus::Answered.can_transition_to(CallStatus::Ringing));
        assert!(!CallStatus::Ended.can_transition_to(CallStatus::Answered));
        assert!(!CallStatus::Ended.can_transition_to(CallStatus::Ended));
    }

    #[test]
    fn test_end_reason_wire_strings() {
        assert_eq!(serde_json::to_string(&EndReason::Busy).unwrap(), "\"busy\"");
        assert_eq!(
            serde_json::to_string(&EndReason::Error("ice failed".into())).unwrap(),
            "\"error\""
        );

        let parsed: EndReason = serde_json::from_str("\"declined\"").unwrap();
        assert_eq!(parsed, EndReason::Declined);

        let unknown: EndReason = serde_json::from_str("\"timeout\"").unwrap();
        assert_eq!(unknown, EndReason::Other("timeout".into()));
        assert_eq!(unknown.as_str(), "timeout");
    }

    #[test]
    fn test_media_kind_wire_names() {
        assert_eq!(serde_json::to_string(&MediaKind::Video).unwrap(), "\"video\"");
        let kind: MediaKind = serde_json::from_str("\"voice\"").unwrap();
        assert!(!kind.wants_video());
    }
}
