//! Call session aggregate root

use crate::domain::call::event::CallEvent;
use crate::domain::call::value_object::{CallRole, CallStatus, EndReason, MediaKind};
use crate::domain::shared::error::CallError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{ParticipantId, SessionId, StreamId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Call session aggregate root
///
/// Holds the identity and timeline of one call. The session id, role and
/// media kind never change after creation; status only moves forward through
/// [`CallStatus::can_transition_to`]. A session is never reused: a new call
/// always gets a new `CallSession`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSession {
    id: SessionId,
    role: CallRole,
    kind: MediaKind,
    status: CallStatus,
    local: ParticipantId,
    remote: ParticipantId,
    created_at: DateTime<Utc>,
    answered_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    end_reason: Option<EndReason>,
    remote_stream: Option<StreamId>,
    /// Pending domain events
    #[serde(skip)]
    events: Vec<CallEvent>,
}

impl CallSession {
    /// Create a session for a locally started call
    pub fn outgoing(
        id: SessionId,
        local: ParticipantId,
        remote: ParticipantId,
        kind: MediaKind,
        at: DateTime<Utc>,
    ) -> Self {
        let mut session = Self::new(id, CallRole::Caller, CallStatus::Initiated, local, remote, kind, at);
        let event = CallEvent::initiated(&session.id, session.remote.clone(), kind);
        session.record_event(event);
        session
    }

    /// Create a session from an incoming-call notification
    pub fn incoming(
        id: SessionId,
        local: ParticipantId,
        caller: ParticipantId,
        kind: MediaKind,
        at: DateTime<Utc>,
    ) -> Self {
        let mut session = Self::new(id, CallRole::Callee, CallStatus::Ringing, local, caller, kind, at);
        let event = CallEvent::ringing(&session.id, session.remote.clone(), kind);
        session.record_event(event);
        session
    }

    fn new(
        id: SessionId,
        role: CallRole,
        status: CallStatus,
        local: ParticipantId,
        remote: ParticipantId,
        kind: MediaKind,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            role,
            kind,
            status,
            local,
            remote,
            created_at: at,
            answered_at: None,
            ended_at: None,
            end_reason: None,
            remote_stream: None,
            events: Vec::new(),
        }
    }

    /// Mark the call answered
    pub fn answer(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.transition_to(CallStatus::Answered)?;
        self.answered_at = Some(at);

        let event = CallEvent::answered(&self.id, self.role, at);
        self.record_event(event);

        // stream that arrived while ringing becomes observable now
        if let Some(stream_id) = self.remote_stream {
            let event = CallEvent::remote_stream(&self.id, stream_id);
            self.record_event(event);
        }
        Ok(())
    }

    /// End the call
    pub fn end(&mut self, reason: EndReason, at: DateTime<Utc>) -> Result<()> {
        self.transition_to(CallStatus::Ended)?;
        self.ended_at = Some(at);
        self.end_reason = Some(reason.clone());

        let duration_ms = self
            .answered_at
            .map(|answered| (at - answered).num_milliseconds());

        let event = CallEvent::ended(&self.id, reason, at, duration_ms);
        self.record_event(event);
        Ok(())
    }

    /// Record that the remote party's media is flowing
    ///
    /// Observers hear about it once the call is answered.
    pub fn remote_stream_attached(&mut self, stream_id: StreamId) {
        self.remote_stream = Some(stream_id);
        if self.status == CallStatus::Answered {
            let event = CallEvent::remote_stream(&self.id, stream_id);
            self.record_event(event);
        }
    }

    /// Record an advisory status notice from the signaling server
    pub fn status_advised(&mut self, status: String) {
        let event = CallEvent::status(&self.id, status);
        self.record_event(event);
    }

    fn transition_to(&mut self, next: CallStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(CallError::InvalidStateTransition(format!(
                "Cannot transition session {} from {} to {}",
                self.id, self.status, next
            )));
        }

        self.status = next;
        Ok(())
    }

    fn record_event(&mut self, event: CallEvent) {
        self.events.push(event);
    }

    /// Take all pending events
    pub fn take_events(&mut self) -> Vec<CallEvent> {
        std::mem::take(&mut self.events)
    }

    // Getters
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn status(&self) -> CallStatus {
        self.status
    }

    pub fn local(&self) -> &ParticipantId {
        &self.local
    }

    pub fn remote(&self) -> &ParticipantId {
        &self.remote
    }

    pub fn created_at(&self) -> &DateTime<Utc> {
        &self.created_at
    }

    pub fn answered_at(&self) -> Option<&DateTime<Utc>> {
        self.answered_at.as_ref()
    }

    pub fn ended_at(&self) -> Option<&DateTime<Utc>> {
        self.ended_at.as_ref()
    }

    pub fn end_reason(&self) -> Option<&EndReason> {
        self.end_reason.as_ref()
    }

    pub fn remote_stream(&self) -> Option<StreamId> {
        self.remote_stream
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.answered_at
            .and_then(|answered| self.ended_at.map(|ended| ended - answered))
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}
