//! Call state machine
//!
//! `transition` is a pure function from the current [`CallState`] and one
//! [`CallInput`] to the next state plus the ordered [`Effect`]s the shell must
//! run. It performs no I/O; media capture, peer connections and signaling are
//! all expressed as effects. A rejected input returns `Err` and the caller
//! keeps its previous state untouched.

use crate::domain::call::aggregate::CallSession;
use crate::domain::call::event::CallEvent;
use crate::domain::call::value_object::{CallRole, CallStatus, EndReason, MediaKind};
use crate::domain::peer::{PeerMode, SessionDescription};
use crate::domain::shared::error::CallError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{ParticipantId, SessionId, StreamId};
use crate::domain::signaling::{
    AnswerCall, CallAnswered, CallEnded, CallStatusNotice, EndCall, IncomingCall, InboundSignal,
    InitiateCall, OutboundSignal,
};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

/// Progress of the local side of the offer/answer exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    /// Waiting for the capture device
    AcquiringMedia,
    /// Peer connection open, local description not produced yet
    Negotiating,
    /// Local description produced (for the caller: `initiateCall` sent)
    Described,
}

/// Tagged-union call state
#[derive(Debug, Clone)]
pub enum CallState {
    /// No call has happened yet
    Idle,
    Initiated {
        session: CallSession,
        negotiation: Negotiation,
    },
    Ringing {
        session: CallSession,
        negotiation: Negotiation,
        remote_description: SessionDescription,
        local_description: Option<SessionDescription>,
        /// The user answered before the answer description was ready
        answer_requested: bool,
    },
    Answered {
        session: CallSession,
        answered_at: Instant,
    },
    /// Last finished call, kept for observers until the next one starts
    Ended { session: CallSession },
}

impl CallState {
    pub fn session(&self) -> Option<&CallSession> {
        match self {
            CallState::Idle => None,
            CallState::Initiated { session, .. }
            | CallState::Ringing { session, .. }
            | CallState::Answered { session, .. }
            | CallState::Ended { session } => Some(session),
        }
    }

    /// The session in {Initiated, Ringing, Answered}, if any
    pub fn active_session(&self) -> Option<&CallSession> {
        self.session().filter(|s| s.is_active())
    }

    pub fn status(&self) -> Option<CallStatus> {
        self.session().map(|s| s.status())
    }

    pub fn role(&self) -> Option<CallRole> {
        self.session().map(|s| s.role())
    }

    pub fn answered_at(&self) -> Option<Instant> {
        match self {
            CallState::Answered { answered_at, .. } => Some(*answered_at),
            _ => None,
        }
    }

    fn is_current(&self, session_id: &SessionId) -> bool {
        self.active_session().map_or(false, |s| s.id() == session_id)
    }

    /// Whether the remote party already knows this session exists
    fn remote_knows(&self) -> bool {
        match self {
            CallState::Initiated { negotiation, .. } => *negotiation == Negotiation::Described,
            CallState::Ringing { .. } | CallState::Answered { .. } => true,
            CallState::Idle | CallState::Ended { .. } => false,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Initiated { .. } => "initiated",
            CallState::Ringing { .. } => "ringing",
            CallState::Answered { .. } => "answered",
            CallState::Ended { .. } => "ended",
        }
    }
}

/// Everything that can happen to a call
#[derive(Debug, Clone)]
pub enum CallInput {
    /// Local intent to place a call
    StartCall {
        session_id: SessionId,
        local: ParticipantId,
        remote: ParticipantId,
        kind: MediaKind,
    },
    /// Local intent to pick up the ringing call
    Answer,
    /// Local hangup, decline or cancel
    EndCall { reason: EndReason },
    IncomingCall(IncomingCall),
    RemoteAnswered(CallAnswered),
    RemoteEnded(CallEnded),
    StatusNotice(CallStatusNotice),
    MediaAcquired { session_id: SessionId },
    MediaFailed { session_id: SessionId, reason: String },
    LocalDescription {
        session_id: SessionId,
        description: SessionDescription,
    },
    PeerStreamArrived { session_id: SessionId, stream_id: StreamId },
    PeerError { session_id: SessionId, message: String },
    /// A setup message could not be delivered
    SignalFailed { session_id: SessionId, message: String },
}

impl CallInput {
    pub fn name(&self) -> &'static str {
        match self {
            CallInput::StartCall { .. } => "start_call",
            CallInput::Answer => "answer",
            CallInput::EndCall { .. } => "end_call",
            CallInput::IncomingCall(_) => "incoming_call",
            CallInput::RemoteAnswered(_) => "remote_answered",
            CallInput::RemoteEnded(_) => "remote_ended",
            CallInput::StatusNotice(_) => "status_notice",
            CallInput::MediaAcquired { .. } => "media_acquired",
            CallInput::MediaFailed { .. } => "media_failed",
            CallInput::LocalDescription { .. } => "local_description",
            CallInput::PeerStreamArrived { .. } => "peer_stream_arrived",
            CallInput::PeerError { .. } => "peer_error",
            CallInput::SignalFailed { .. } => "signal_failed",
        }
    }
}

impl From<InboundSignal> for CallInput {
    fn from(signal: InboundSignal) -> Self {
        match signal {
            InboundSignal::IncomingCall(p) => CallInput::IncomingCall(p),
            InboundSignal::CallAnswered(p) => CallInput::RemoteAnswered(p),
            InboundSignal::CallEnded(p) => CallInput::RemoteEnded(p),
            InboundSignal::CallStatus(p) => CallInput::StatusNotice(p),
        }
    }
}

/// Work the shell performs, in order, after a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Start asynchronous capture for the session
    AcquireMedia { session_id: SessionId, kind: MediaKind },
    /// Keep the stream that just arrived as the session's local stream
    AdoptMedia,
    /// Release the stream that just arrived; its session is gone
    DiscardMedia,
    /// Open the peer session with the adopted stream attached
    CreatePeer {
        mode: PeerMode,
        remote_description: Option<SessionDescription>,
    },
    AcceptRemoteDescription(SessionDescription),
    /// Keep a weak reference to the stream that just arrived
    AttachRemoteStream,
    Emit { to: ParticipantId, signal: OutboundSignal },
    DestroyPeer,
    ReleaseMedia,
    Publish(CallEvent),
}

/// What an input did to the state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Applied,
    /// Stale, duplicate or irrelevant input; nothing changed
    Ignored,
    /// Local hangup dropped inside the grace window
    Suppressed,
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub state: CallState,
    pub effects: Vec<Effect>,
    pub disposition: Disposition,
}

impl Transition {
    fn applied(state: CallState, effects: Vec<Effect>) -> Self {
        Self {
            state,
            effects,
            disposition: Disposition::Applied,
        }
    }

    fn unchanged(state: &CallState, disposition: Disposition) -> Self {
        Self {
            state: state.clone(),
            effects: Vec::new(),
            disposition,
        }
    }
}

/// Clock readings and policy for one transition
#[derive(Debug, Clone)]
pub struct TransitionContext {
    pub now: Instant,
    pub wall_clock: DateTime<Utc>,
    /// Local hangups this soon after `Answered` are dropped
    pub grace_window: Duration,
}

impl TransitionContext {
    pub fn new(grace_window: Duration) -> Self {
        Self {
            now: Instant::now(),
            wall_clock: Utc::now(),
            grace_window,
        }
    }
}

/// Apply one input to the call state
pub fn transition(state: &CallState, input: CallInput, ctx: &TransitionContext) -> Result<Transition> {
    match input {
        CallInput::StartCall {
            session_id,
            local,
            remote,
            kind,
        } => {
            reject_if_active(state)?;
            let mut session = CallSession::outgoing(session_id.clone(), local, remote, kind, ctx.wall_clock);
            let mut effects = vec![Effect::AcquireMedia { session_id, kind }];
            publish(&mut session, &mut effects);
            Ok(Transition::applied(
                CallState::Initiated {
                    session,
                    negotiation: Negotiation::AcquiringMedia,
                },
                effects,
            ))
        }

        CallInput::IncomingCall(call) => {
            reject_if_active(state)?;
            let mut session = CallSession::incoming(
                call.session_id.clone(),
                call.receiver_id,
                call.caller_id,
                call.call_type,
                ctx.wall_clock,
            );
            let mut effects = vec![Effect::AcquireMedia {
                session_id: call.session_id,
                kind: call.call_type,
            }];
            publish(&mut session, &mut effects);
            Ok(Transition::applied(
                CallState::Ringing {
                    session,
                    negotiation: Negotiation::AcquiringMedia,
                    remote_description: call.remote_description,
                    local_description: None,
                    answer_requested: false,
                },
                effects,
            ))
        }

        CallInput::Answer => match state {
            CallState::Ringing {
                session,
                local_description: Some(description),
                ..
            } => answer_locally(session, description.clone(), ctx),
            CallState::Ringing {
                session,
                negotiation,
                remote_description,
                local_description: None,
                ..
            } => Ok(Transition::applied(
                CallState::Ringing {
                    session: session.clone(),
                    negotiation: *negotiation,
                    remote_description: remote_description.clone(),
                    local_description: None,
                    answer_requested: true,
                },
                Vec::new(),
            )),
            CallState::Idle | CallState::Ended { .. } => Err(CallError::NoActiveCall),
            other => Err(CallError::InvalidStateTransition(format!(
                "Cannot answer a call in state {}",
                other.name()
            ))),
        },

        CallInput::EndCall { reason } => match state {
            CallState::Idle | CallState::Ended { .. } => {
                Ok(Transition::unchanged(state, Disposition::Ignored))
            }
            CallState::Answered { answered_at, .. }
                if ctx.now.saturating_duration_since(*answered_at) < ctx.grace_window =>
            {
                Ok(Transition::unchanged(state, Disposition::Suppressed))
            }
            _ => end(state, reason, state.remote_knows(), ctx),
        },

        CallInput::RemoteEnded(ended) => {
            if !state.is_current(&ended.session_id) {
                return Ok(Transition::unchanged(state, Disposition::Ignored));
            }
            end(state, ended.reason, false, ctx)
        }

        CallInput::RemoteAnswered(answered) => match state {
            CallState::Initiated {
                session,
                negotiation: Negotiation::Described,
            } if session.id() == &answered.session_id => {
                let mut session = session.clone();
                session.answer(ctx.wall_clock)?;
                let mut effects = vec![Effect::AcceptRemoteDescription(answered.remote_description)];
                publish(&mut session, &mut effects);
                Ok(Transition::applied(
                    CallState::Answered {
                        session,
                        answered_at: ctx.now,
                    },
                    effects,
                ))
            }
            _ => Ok(Transition::unchanged(state, Disposition::Ignored)),
        },

        CallInput::StatusNotice(notice) => match state.active_session() {
            Some(session) if session.id() == &notice.session_id => {
                let mut next = state.clone();
                let mut effects = Vec::new();
                if let Some(session) = session_mut(&mut next) {
                    session.status_advised(notice.status);
                    publish(session, &mut effects);
                }
                Ok(Transition::applied(next, effects))
            }
            _ => Ok(Transition::unchanged(state, Disposition::Ignored)),
        },

        CallInput::MediaAcquired { session_id } => match state {
            CallState::Initiated {
                session,
                negotiation: Negotiation::AcquiringMedia,
            } if session.id() == &session_id => Ok(Transition::applied(
                CallState::Initiated {
                    session: session.clone(),
                    negotiation: Negotiation::Negotiating,
                },
                vec![
                    Effect::AdoptMedia,
                    Effect::CreatePeer {
                        mode: PeerMode::Offerer,
                        remote_description: None,
                    },
                ],
            )),
            CallState::Ringing {
                session,
                negotiation: Negotiation::AcquiringMedia,
                remote_description,
                local_description,
                answer_requested,
            } if session.id() == &session_id => Ok(Transition::applied(
                CallState::Ringing {
                    session: session.clone(),
                    negotiation: Negotiation::Negotiating,
                    remote_description: remote_description.clone(),
                    local_description: local_description.clone(),
                    answer_requested: *answer_requested,
                },
                vec![
                    Effect::AdoptMedia,
                    Effect::CreatePeer {
                        mode: PeerMode::Answerer,
                        remote_description: Some(remote_description.clone()),
                    },
                ],
            )),
            _ => Ok(Transition {
                state: state.clone(),
                effects: vec![Effect::DiscardMedia],
                disposition: Disposition::Ignored,
            }),
        },

        CallInput::MediaFailed { session_id, .. } => {
            if !state.is_current(&session_id) {
                return Ok(Transition::unchanged(state, Disposition::Ignored));
            }
            end(state, EndReason::MediaUnavailable, state.remote_knows(), ctx)
        }

        CallInput::LocalDescription {
            session_id,
            description,
        } => match state {
            CallState::Initiated {
                session,
                negotiation: Negotiation::Negotiating,
            } if session.id() == &session_id => {
                let signal = OutboundSignal::InitiateCall(InitiateCall {
                    session_id,
                    caller_id: session.local().clone(),
                    receiver_id: session.remote().clone(),
                    call_type: session.kind(),
                    local_description: description,
                });
                Ok(Transition::applied(
                    CallState::Initiated {
                        session: session.clone(),
                        negotiation: Negotiation::Described,
                    },
                    vec![Effect::Emit {
                        to: session.remote().clone(),
                        signal,
                    }],
                ))
            }
            CallState::Ringing {
                session,
                negotiation: Negotiation::Negotiating,
                answer_requested: true,
                ..
            } if session.id() == &session_id => answer_locally(session, description, ctx),
            CallState::Ringing {
                session,
                negotiation: Negotiation::Negotiating,
                remote_description,
                answer_requested: false,
                ..
            } if session.id() == &session_id => Ok(Transition::applied(
                CallState::Ringing {
                    session: session.clone(),
                    negotiation: Negotiation::Described,
                    remote_description: remote_description.clone(),
                    local_description: Some(description),
                    answer_requested: false,
                },
                Vec::new(),
            )),
            _ => Ok(Transition::unchanged(state, Disposition::Ignored)),
        },

        CallInput::PeerStreamArrived {
            session_id,
            stream_id,
        } => {
            if !state.is_current(&session_id) {
                return Ok(Transition::unchanged(state, Disposition::Ignored));
            }
            let mut next = state.clone();
            let mut effects = vec![Effect::AttachRemoteStream];
            if let Some(session) = session_mut(&mut next) {
                session.remote_stream_attached(stream_id);
                publish(session, &mut effects);
            }
            Ok(Transition::applied(next, effects))
        }

        CallInput::PeerError {
            session_id,
            message,
        } => {
            if !state.is_current(&session_id) {
                return Ok(Transition::unchanged(state, Disposition::Ignored));
            }
            end(state, EndReason::Error(message), state.remote_knows(), ctx)
        }

        CallInput::SignalFailed { session_id, .. } => {
            if !state.is_current(&session_id) {
                return Ok(Transition::unchanged(state, Disposition::Ignored));
            }
            end(state, EndReason::ChannelUnavailable, false, ctx)
        }
    }
}

fn reject_if_active(state: &CallState) -> Result<()> {
    match state.active_session() {
        Some(active) => Err(CallError::CallAlreadyActive(active.id().clone())),
        None => Ok(()),
    }
}

fn answer_locally(
    session: &CallSession,
    description: SessionDescription,
    ctx: &TransitionContext,
) -> Result<Transition> {
    let mut session = session.clone();
    session.answer(ctx.wall_clock)?;

    let signal = OutboundSignal::AnswerCall(AnswerCall {
        session_id: session.id().clone(),
        local_description: description,
    });
    let mut effects = vec![Effect::Emit {
        to: session.remote().clone(),
        signal,
    }];
    publish(&mut session, &mut effects);

    Ok(Transition::applied(
        CallState::Answered {
            session,
            answered_at: ctx.now,
        },
        effects,
    ))
}

/// Move an active call to `Ended`; every path into `Ended` goes through here
fn end(
    state: &CallState,
    reason: EndReason,
    notify_remote: bool,
    ctx: &TransitionContext,
) -> Result<Transition> {
    let mut session = match state.active_session() {
        Some(session) => session.clone(),
        None => return Ok(Transition::unchanged(state, Disposition::Ignored)),
    };

    let mut effects = Vec::with_capacity(4);
    if notify_remote {
        effects.push(Effect::Emit {
            to: session.remote().clone(),
            signal: OutboundSignal::EndCall(EndCall {
                session_id: session.id().clone(),
                reason: reason.clone(),
            }),
        });
    }
    effects.push(Effect::DestroyPeer);
    effects.push(Effect::ReleaseMedia);

    session.end(reason, ctx.wall_clock)?;
    publish(&mut session, &mut effects);

    Ok(Transition::applied(CallState::Ended { session }, effects))
}

fn session_mut(state: &mut CallState) -> Option<&mut CallSession> {
    match state {
        CallState::Idle => None,
        CallState::Initiated { session, .. }
        | CallState::Ringing { session, .. }
        | CallState::Answered { session, .. }
        | CallState::Ended { session } => Some(session),
    }
}

fn publish(session: &mut CallSession, effects: &mut Vec<Effect>) {
    effects.extend(session.take_events().into_iter().map(Effect::Publish));
}
