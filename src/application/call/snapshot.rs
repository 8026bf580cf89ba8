//! Read-only view of the current call for observers

use crate::domain::call::machine::CallState;
use crate::domain::call::value_object::{CallRole, CallStatus, EndReason, MediaKind};
use crate::domain::media::{RemoteStream, StreamInfo};
use crate::domain::shared::value_objects::{ParticipantId, SessionId};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;

/// Point-in-time view of the call, published after every event
#[derive(Debug, Clone, Default)]
pub struct CallSnapshot {
    pub session_id: Option<SessionId>,
    pub role: Option<CallRole>,
    pub kind: Option<MediaKind>,
    pub status: Option<CallStatus>,
    pub remote: Option<ParticipantId>,
    pub local_stream: Option<StreamInfo>,
    pub end_reason: Option<EndReason>,
    remote_stream: Option<Weak<RemoteStream>>,
    answered_at: Option<Instant>,
}

impl CallSnapshot {
    pub(crate) fn capture(
        state: &CallState,
        local_stream: Option<StreamInfo>,
        remote_stream: Option<Weak<RemoteStream>>,
    ) -> Self {
        let session = match state.session() {
            Some(session) => session,
            None => return Self::default(),
        };

        Self {
            session_id: Some(session.id().clone()),
            role: Some(session.role()),
            kind: Some(session.kind()),
            status: Some(session.status()),
            remote: Some(session.remote().clone()),
            local_stream,
            end_reason: session.end_reason().cloned(),
            remote_stream,
            answered_at: state.answered_at(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.map_or(false, |s| s.is_active())
    }

    pub fn is_answered(&self) -> bool {
        self.status == Some(CallStatus::Answered)
    }

    /// The remote media, observable only while the call is answered
    pub fn remote_stream(&self) -> Option<Arc<RemoteStream>> {
        if !self.is_answered() {
            return None;
        }
        self.remote_stream.as_ref().and_then(Weak::upgrade)
    }

    /// Time since the call was answered
    pub fn elapsed(&self) -> Option<Duration> {
        if !self.is_answered() {
            return None;
        }
        self.answered_at.map(|at| at.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::call::machine::{transition, CallInput, TransitionContext};
    use crate::domain::media::{MediaTrack, TrackKind};
    use crate::domain::peer::SessionDescription;
    use crate::domain::signaling::IncomingCall;

    fn ringing() -> CallState {
        let input = CallInput::IncomingCall(IncomingCall {
            session_id: SessionId::new("s1"),
            caller_id: ParticipantId::from("alice"),
            receiver_id: ParticipantId::from("bob"),
            call_type: MediaKind::Video,
            remote_description: SessionDescription::offer("v=0"),
        });
        transition(&CallState::Idle, input, &TransitionContext::new(Duration::ZERO))
            .unwrap()
            .state
    }

    #[test]
    fn test_idle_snapshot_is_empty() {
        let snapshot = CallSnapshot::capture(&CallState::Idle, None, None);
        assert!(snapshot.session_id.is_none());
        assert!(!snapshot.is_active());
    }

    #[test]
    fn test_remote_stream_hidden_before_answer() {
        let stream = Arc::new(RemoteStream::new(vec![MediaTrack::new("r0", TrackKind::Audio)]));
        let snapshot = CallSnapshot::capture(&ringing(), None, Some(Arc::downgrade(&stream)));

        assert_eq!(snapshot.status, Some(CallStatus::Ringing));
        assert_eq!(snapshot.remote, Some(ParticipantId::from("alice")));
        assert!(snapshot.remote_stream().is_none());
        assert!(snapshot.elapsed().is_none());
    }
}
