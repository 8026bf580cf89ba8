//! Call domain events
//!
//! Published to observers after every applied transition.

use crate::domain::call::value_object::{CallRole, EndReason, MediaKind};
use crate::domain::shared::events::{DomainEvent, EventMetadata};
use crate::domain::shared::value_objects::{ParticipantId, SessionId, StreamId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Base struct for all call events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEventBase {
    pub metadata: EventMetadata,
    pub session_id: SessionId,
}

impl CallEventBase {
    fn new(event_type: &'static str, session_id: &SessionId) -> Self {
        Self {
            metadata: EventMetadata::new(event_type),
            session_id: session_id.clone(),
        }
    }
}

/// Outbound call created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallInitiated {
    pub base: CallEventBase,
    pub remote: ParticipantId,
    pub kind: MediaKind,
}

impl DomainEvent for CallInitiated {
    fn event_type(&self) -> &'static str {
        "call.initiated"
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.base.metadata.occurred_at
    }
}

/// Inbound call alerting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRinging {
    pub base: CallEventBase,
    pub caller: ParticipantId,
    pub kind: MediaKind,
}

impl DomainEvent for CallRinging {
    fn event_type(&self) -> &'static str {
        "call.ringing"
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.base.metadata.occurred_at
    }
}

/// Call answered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallAnswered {
    pub base: CallEventBase,
    pub role: CallRole,
    pub answered_at: DateTime<Utc>,
}

impl DomainEvent for CallAnswered {
    fn event_type(&self) -> &'static str {
        "call.answered"
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.base.metadata.occurred_at
    }
}

/// Remote media became available
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteStreamAttached {
    pub base: CallEventBase,
    pub stream_id: StreamId,
}

impl DomainEvent for RemoteStreamAttached {
    fn event_type(&self) -> &'static str {
        "call.remote_stream"
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.base.metadata.occurred_at
    }
}

/// Advisory status from the signaling server; no state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallStatusAdvisory {
    pub base: CallEventBase,
    pub status: String,
}

impl DomainEvent for CallStatusAdvisory {
    fn event_type(&self) -> &'static str {
        "call.status"
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.base.metadata.occurred_at
    }
}

/// Call ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnded {
    pub base: CallEventBase,
    pub reason: EndReason,
    pub ended_at: DateTime<Utc>,
    /// Talk time, present only when the call was answered
    pub duration_ms: Option<i64>,
}

impl DomainEvent for CallEnded {
    fn event_type(&self) -> &'static str {
        "call.ended"
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.base.metadata.occurred_at
    }
}

/// Union of all call events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallEvent {
    Initiated(CallInitiated),
    Ringing(CallRinging),
    Answered(CallAnswered),
    RemoteStream(RemoteStreamAttached),
    Status(CallStatusAdvisory),
    Ended(CallEnded),
}

impl CallEvent {
    pub fn initiated(session_id: &SessionId, remote: ParticipantId, kind: MediaKind) -> Self {
        CallEvent::Initiated(CallInitiated {
            base: CallEventBase::new("call.initiated", session_id),
            remote,
            kind,
        })
    }

    pub fn ringing(session_id: &SessionId, caller: ParticipantId, kind: MediaKind) -> Self {
        CallEvent::Ringing(CallRinging {
            base: CallEventBase::new("call.ringing", session_id),
            caller,
            kind,
        })
    }

    pub fn answered(session_id: &SessionId, role: CallRole, answered_at: DateTime<Utc>) -> Self {
        CallEvent::Answered(CallAnswered {
            base: CallEventBase::new("call.answered", session_id),
            role,
            answered_at,
        })
    }

    pub fn remote_stream(session_id: &SessionId, stream_id: StreamId) -> Self {
        CallEvent::RemoteStream(RemoteStreamAttached {
            base: CallEventBase::new("call.remote_stream", session_id),
            stream_id,
        })
    }

    pub fn status(session_id: &SessionId, status: String) -> Self {
        CallEvent::Status(CallStatusAdvisory {
            base: CallEventBase::new("call.status", session_id),
            status,
        })
    }

    pub fn ended(
        session_id: &SessionId,
        reason: EndReason,
        ended_at: DateTime<Utc>,
        duration_ms: Option<i64>,
    ) -> Self {
        CallEvent::Ended(CallEnded {
            base: CallEventBase::new("call.ended", session_id),
            reason,
            ended_at,
            duration_ms,
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.base().session_id
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            CallEvent::Initiated(e) => e.event_type(),
            CallEvent::Ringing(e) => e.event_type(),
            CallEvent::Answered(e) => e.event_type(),
            CallEvent::RemoteStream(e) => e.event_type(),
            CallEvent::Status(e) => e.event_type(),
            CallEvent::Ended(e) => e.event_type(),
        }
    }

    fn base(&self) -> &CallEventBase {
        match self {
            CallEvent::Initiated(e) => &e.base,
            CallEvent::Ringing(e) => &e.base,
            CallEvent::Answered(e) => &e.base,
            CallEvent::RemoteStream(e) => &e.base,
            CallEvent::Status(e) => &e.base,
            CallEvent::Ended(e) => &e.base,
        }
    }
}
