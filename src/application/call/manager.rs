//! Call manager
//!
//! Owns the single current call. All inputs (user commands, inbound
//! signaling, media completions and peer callbacks) are serialized through
//! one engine task, which feeds them to the pure state machine and then runs
//! the returned effects against the capabilities it holds.

use crate::application::call::snapshot::CallSnapshot;
use crate::config::Config;
use crate::domain::call::event::CallEvent;
use crate::domain::call::machine::{
    transition, CallInput, CallState, Disposition, Effect, Negotiation, TransitionContext,
};
use crate::domain::call::value_object::{EndReason, MediaKind};
use crate::domain::media::{MediaDevices, RemoteStream};
use crate::domain::peer::{PeerConnector, PeerEvent, PeerMode};
use crate::domain::shared::error::CallError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{ParticipantId, SessionId};
use crate::domain::signaling::{EndCall, InboundSignal, OutboundSignal, SignalingChannel};
use crate::infrastructure::media::MediaGuard;
use crate::infrastructure::peer::{PeerNotification, PeerSession};
use crate::infrastructure::signaling::SignalingRouter;
use metrics::{counter, gauge, histogram};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const COMMAND_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 128;

#[derive(Debug, Clone)]
pub struct CallManagerConfig {
    pub local_id: ParticipantId,
    pub grace_window: Duration,
}

impl CallManagerConfig {
    pub fn new(local_id: impl Into<ParticipantId>) -> Self {
        Self {
            local_id: local_id.into(),
            grace_window: Duration::from_millis(1000),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            local_id: ParticipantId::new(config.signaling.user_id.clone()),
            grace_window: config.call.grace_window(),
        }
    }

    pub fn with_grace_window(mut self, grace_window: Duration) -> Self {
        self.grace_window = grace_window;
        self
    }
}

/// Result of a local end-call request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndCallOutcome {
    /// The call is now ended
    Ended,
    /// Dropped: the call was answered less than the grace window ago
    Suppressed,
    NoActiveCall,
}

enum Command {
    StartCall {
        remote: ParticipantId,
        kind: MediaKind,
        reply: oneshot::Sender<Result<SessionId>>,
    },
    Answer {
        reply: oneshot::Sender<Result<()>>,
    },
    EndCall {
        reason: EndReason,
        reply: oneshot::Sender<EndCallOutcome>,
    },
}

/// Handle to the call engine
///
/// Cheap to clone. When the last handle is dropped the engine ends any
/// active call with `hangup` and stops.
#[derive(Clone)]
pub struct CallManager {
    local_id: ParticipantId,
    commands: mpsc::Sender<Command>,
    router: Arc<SignalingRouter>,
    snapshots: watch::Receiver<CallSnapshot>,
    events: broadcast::Sender<CallEvent>,
}

impl CallManager {
    pub fn spawn(
        config: CallManagerConfig,
        devices: Arc<dyn MediaDevices>,
        connector: Arc<dyn PeerConnector>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (snapshots_tx, snapshots_rx) = watch::channel(CallSnapshot::default());
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let router = Arc::new(SignalingRouter::new(inbound_tx));

        let engine = Engine {
            local_id: config.local_id.clone(),
            grace_window: config.grace_window,
            devices,
            connector,
            router: router.clone(),
            state: CallState::Idle,
            resources: None,
            media_tx,
            peer_tx,
            arriving_media: None,
            arriving_remote: None,
            followups: VecDeque::new(),
            pending_failure: None,
            start_waiter: None,
            answer_waiters: Vec::new(),
            snapshots: snapshots_tx,
            events: events_tx.clone(),
        };
        tokio::spawn(engine.run(commands_rx, inbound_rx, media_rx, peer_rx));

        info!("Call manager started for {}", config.local_id);

        Self {
            local_id: config.local_id,
            commands: commands_tx,
            router,
            snapshots: snapshots_rx,
            events: events_tx,
        }
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    /// Route signaling through `channel`; false if it is already attached
    pub async fn attach_channel(&self, channel: Arc<dyn SignalingChannel>) -> bool {
        self.router.bind(channel).await
    }

    pub async fn detach_channel(&self) {
        self.router.unbind().await
    }

    /// Rebind automatically whenever the transport reconnects
    pub fn follow_channel(
        &self,
        channels: watch::Receiver<Option<Arc<dyn SignalingChannel>>>,
    ) -> JoinHandle<()> {
        self.router.follow(channels)
    }

    /// Place a call; resolves once the offer has been sent
    pub async fn start_call(
        &self,
        remote: impl Into<ParticipantId>,
        kind: MediaKind,
    ) -> Result<SessionId> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::StartCall {
            remote: remote.into(),
            kind,
            reply,
        })
        .await?;
        rx.await.map_err(|_| engine_stopped())?
    }

    /// Pick up the ringing call; resolves once the answer has been sent
    pub async fn answer(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Answer { reply }).await?;
        rx.await.map_err(|_| engine_stopped())?
    }

    /// Hang up, decline or cancel the current call
    pub async fn end_call(&self, reason: EndReason) -> EndCallOutcome {
        let (reply, rx) = oneshot::channel();
        if self.request(Command::EndCall { reason, reply }).await.is_err() {
            return EndCallOutcome::NoActiveCall;
        }
        rx.await.unwrap_or(EndCallOutcome::NoActiveCall)
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshots.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    async fn request(&self, command: Command) -> Result<()> {
        self.commands.send(command).await.map_err(|_| engine_stopped())
    }
}

fn engine_stopped() -> CallError {
    CallError::Internal("call engine stopped".to_string())
}

/// Capability handles owned by one call session
struct SessionResources {
    session_id: SessionId,
    media: Option<MediaGuard>,
    peer: Option<PeerSession>,
    remote_stream: Option<Weak<RemoteStream>>,
}

impl SessionResources {
    fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            media: None,
            peer: None,
            remote_stream: None,
        }
    }
}

struct MediaCompletion {
    session_id: SessionId,
    result: Result<MediaGuard>,
}

struct Engine {
    local_id: ParticipantId,
    grace_window: Duration,
    devices: Arc<dyn MediaDevices>,
    connector: Arc<dyn PeerConnector>,
    router: Arc<SignalingRouter>,
    state: CallState,
    resources: Option<SessionResources>,
    media_tx: mpsc::UnboundedSender<MediaCompletion>,
    peer_tx: mpsc::UnboundedSender<PeerNotification>,
    /// Stream delivered by the media completion being dispatched
    arriving_media: Option<MediaGuard>,
    /// Stream delivered by the peer notification being dispatched
    arriving_remote: Option<Arc<RemoteStream>>,
    /// Inputs produced by effects, applied after the current one
    followups: VecDeque<CallInput>,
    /// Detail of the failure that ended the call, for waiting callers
    pending_failure: Option<CallError>,
    start_waiter: Option<(SessionId, oneshot::Sender<Result<SessionId>>)>,
    /// Every `answer()` caller waiting on the pending answer description
    answer_waiters: Vec<(SessionId, oneshot::Sender<Result<()>>)>,
    snapshots: watch::Sender<CallSnapshot>,
    events: broadcast::Sender<CallEvent>,
}

impl Engine {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut inbound: mpsc::UnboundedReceiver<InboundSignal>,
        mut media: mpsc::UnboundedReceiver<MediaCompletion>,
        mut peer: mpsc::UnboundedReceiver<PeerNotification>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(signal) = inbound.recv() => self.handle_inbound(signal).await,
                Some(completion) = media.recv() => self.media_completed(completion).await,
                Some(notification) = peer.recv() => self.peer_notified(notification).await,
            }
            self.settle();
        }

        self.shutdown().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartCall {
                remote,
                kind,
                reply,
            } => {
                let session_id = SessionId::generate();
                let input = CallInput::StartCall {
                    session_id: session_id.clone(),
                    local: self.local_id.clone(),
                    remote,
                    kind,
                };
                self.pending_failure = None;
                match self.dispatch(input).await {
                    Ok(_) => self.start_waiter = Some((session_id, reply)),
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::Answer { reply } => match self.dispatch(CallInput::Answer).await {
                Ok(_) => {
                    if let Some(session) = self.state.session() {
                        self.answer_waiters.push((session.id().clone(), reply));
                    }
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::EndCall { reason, reply } => {
                let outcome = match self.dispatch(CallInput::EndCall { reason }).await {
                    Ok(Disposition::Applied) => EndCallOutcome::Ended,
                    Ok(Disposition::Suppressed) => {
                        info!("Hangup ignored inside the {:?} grace window", self.grace_window);
                        EndCallOutcome::Suppressed
                    }
                    Ok(Disposition::Ignored) | Err(_) => EndCallOutcome::NoActiveCall,
                };
                let _ = reply.send(outcome);
            }
        }
    }

    async fn handle_inbound(&mut self, signal: InboundSignal) {
        let caller = match &signal {
            InboundSignal::IncomingCall(call) => {
                Some((call.caller_id.clone(), call.session_id.clone()))
            }
            _ => None,
        };
        let session_id = signal.session_id().clone();

        if caller.is_some() {
            self.pending_failure = None;
        }

        match self.dispatch(CallInput::from(signal)).await {
            Ok(Disposition::Ignored) => {
                debug!("Ignored signaling event for call {}", session_id);
            }
            Ok(_) => {}
            Err(CallError::CallAlreadyActive(active)) => {
                if let Some((caller, session_id)) = caller.filter(|(_, id)| *id != active) {
                    info!(
                        "Rejecting call {} from {}: call {} is active",
                        session_id, caller, active
                    );
                    let busy = OutboundSignal::EndCall(EndCall {
                        session_id,
                        reason: EndReason::Busy,
                    });
                    if let Err(e) = self.router.emit(&caller, &busy).await {
                        warn!("Failed to send busy to {}: {}", caller, e);
                    }
                }
            }
            Err(e) => warn!("Signaling event for call {} rejected: {}", session_id, e),
        }
    }

    async fn media_completed(&mut self, completion: MediaCompletion) {
        let session_id = completion.session_id;
        match completion.result {
            Ok(guard) => {
                self.arriving_media = Some(guard);
                let result = self
                    .dispatch(CallInput::MediaAcquired {
                        session_id: session_id.clone(),
                    })
                    .await;
                if let Err(e) = result {
                    warn!("Media for call {} rejected: {}", session_id, e);
                }
                if let Some(mut leftover) = self.arriving_media.take() {
                    leftover.release();
                }
            }
            Err(e) => {
                warn!("Media acquisition for call {} failed: {}", session_id, e);
                let reason = e.to_string();
                self.pending_failure = Some(e);
                let result = self
                    .dispatch(CallInput::MediaFailed { session_id, reason })
                    .await;
                if let Err(e) = result {
                    warn!("Media failure rejected: {}", e);
                }
            }
        }
    }

    async fn peer_notified(&mut self, notification: PeerNotification) {
        let session_id = notification.session_id;
        let input = match notification.event {
            PeerEvent::LocalDescription(description) => CallInput::LocalDescription {
                session_id,
                description,
            },
            PeerEvent::RemoteStream(stream) => {
                let stream_id = stream.id();
                self.arriving_remote = Some(stream);
                CallInput::PeerStreamArrived {
                    session_id,
                    stream_id,
                }
            }
            PeerEvent::Error(message) => {
                warn!("Peer error on call {}: {}", session_id, message);
                CallInput::PeerError {
                    session_id,
                    message,
                }
            }
        };

        if let Err(e) = self.dispatch(input).await {
            warn!("Peer event rejected: {}", e);
        }
        self.arriving_remote = None;
    }

    /// Apply `input` and every follow-up its effects produce
    ///
    /// Returns the outcome of `input` itself.
    async fn dispatch(&mut self, input: CallInput) -> Result<Disposition> {
        let disposition = self.apply(input).await?;

        while let Some(followup) = self.followups.pop_front() {
            if let Err(e) = self.apply(followup).await {
                warn!("Follow-up input rejected: {}", e);
            }
        }
        Ok(disposition)
    }

    async fn apply(&mut self, input: CallInput) -> Result<Disposition> {
        let name = input.name();
        let ctx = TransitionContext::new(self.grace_window);

        let next = transition(&self.state, input, &ctx).map_err(|e| {
            debug!("Input {} rejected in {:?}: {}", name, self.state.status(), e);
            e
        })?;

        if next.disposition == Disposition::Applied {
            debug!(
                "Input {} moved call from {:?} to {:?}",
                name,
                self.state.status(),
                next.state.status()
            );
        }

        self.state = next.state;
        for effect in next.effects {
            if let Some(followup) = self.run_effect(effect).await {
                self.followups.push_back(followup);
            }
        }
        Ok(next.disposition)
    }

    async fn run_effect(&mut self, effect: Effect) -> Option<CallInput> {
        match effect {
            Effect::AcquireMedia { session_id, kind } => {
                self.resources = Some(SessionResources::new(session_id.clone()));

                let devices = self.devices.clone();
                let completions = self.media_tx.clone();
                tokio::spawn(async move {
                    let result = MediaGuard::acquire(devices, kind).await;
                    // an undelivered guard releases itself on drop
                    let _ = completions.send(MediaCompletion { session_id, result });
                });
                None
            }

            Effect::AdoptMedia => {
                let guard = self.arriving_media.take()?;
                match self.resources.as_mut() {
                    Some(resources) => resources.media = Some(guard),
                    None => warn!("No session to adopt media stream into"),
                }
                None
            }

            Effect::DiscardMedia => {
                if let Some(mut guard) = self.arriving_media.take() {
                    debug!("Discarding media that arrived after its call ended");
                    guard.release();
                }
                None
            }

            Effect::CreatePeer {
                mode,
                remote_description,
            } => {
                let resources = self.resources.as_mut()?;
                let session_id = resources.session_id.clone();

                let stream = match resources.media.as_ref().and_then(MediaGuard::stream) {
                    Some(stream) => stream,
                    None => {
                        return Some(CallInput::PeerError {
                            session_id,
                            message: "no local stream to attach".to_string(),
                        })
                    }
                };

                let created = match (mode, remote_description) {
                    (PeerMode::Offerer, _) => PeerSession::create_outbound(
                        self.connector.as_ref(),
                        session_id.clone(),
                        stream,
                        self.peer_tx.clone(),
                    ),
                    (PeerMode::Answerer, Some(offer)) => PeerSession::create_inbound(
                        self.connector.as_ref(),
                        session_id.clone(),
                        stream,
                        offer,
                        self.peer_tx.clone(),
                    ),
                    (PeerMode::Answerer, None) => Err(CallError::Negotiation(
                        "answering peer needs the caller's offer".to_string(),
                    )),
                };

                match created {
                    Ok(peer) => {
                        resources.peer = Some(peer);
                        None
                    }
                    Err(e) => Some(CallInput::PeerError {
                        session_id,
                        message: e.to_string(),
                    }),
                }
            }

            Effect::AcceptRemoteDescription(description) => {
                let resources = self.resources.as_ref()?;
                let result = match resources.peer.as_ref() {
                    Some(peer) => peer.accept_remote_description(description),
                    None => Err(CallError::Negotiation("no peer session".to_string())),
                };
                result.err().map(|e| CallInput::PeerError {
                    session_id: resources.session_id.clone(),
                    message: e.to_string(),
                })
            }

            Effect::AttachRemoteStream => {
                // only a weak handle is kept; the peer connection owns the stream
                let stream = self.arriving_remote.take()?;
                if let Some(resources) = self.resources.as_mut() {
                    resources.remote_stream = Some(Arc::downgrade(&stream));
                }
                None
            }

            Effect::Emit { to, signal } => match self.router.emit(&to, &signal).await {
                Ok(()) => None,
                Err(e) => {
                    warn!(
                        "Failed to emit {} for call {}: {}",
                        signal.event_name(),
                        signal.session_id(),
                        e
                    );
                    signal.is_setup().then(|| CallInput::SignalFailed {
                        session_id: signal.session_id().clone(),
                        message: e.to_string(),
                    })
                }
            },

            Effect::DestroyPeer => {
                if let Some(resources) = self.resources.as_mut() {
                    if let Some(peer) = resources.peer.take() {
                        peer.destroy();
                    }
                    resources.remote_stream = None;
                }
                None
            }

            Effect::ReleaseMedia => {
                if let Some(mut guard) = self.resources.as_mut().and_then(|r| r.media.take()) {
                    guard.release();
                }
                None
            }

            Effect::Publish(event) => {
                self.publish(event);
                None
            }
        }
    }

    fn publish(&self, event: CallEvent) {
        match &event {
            CallEvent::Initiated(_) => {
                counter!("calls_started_total", "role" => "caller").increment(1);
            }
            CallEvent::Ringing(_) => {
                counter!("calls_started_total", "role" => "callee").increment(1);
            }
            CallEvent::Ended(ended) => {
                counter!("calls_ended_total", "reason" => ended.reason.as_str().to_string())
                    .increment(1);
                if let Some(ms) = ended.duration_ms {
                    histogram!("call_duration_seconds").record(ms as f64 / 1000.0);
                }
                info!(
                    "Call {} ended: {} (duration {:?} ms)",
                    ended.base.session_id, ended.reason, ended.duration_ms
                );
            }
            _ => {}
        }
        debug!("Call {} event {}", event.session_id(), event.event_type());

        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Publish the snapshot, then resolve waiters against the new state
    fn settle(&mut self) {
        let (local_stream, remote_stream) = match self.resources.as_ref() {
            Some(resources) => (
                resources.media.as_ref().and_then(MediaGuard::info),
                resources.remote_stream.clone(),
            ),
            None => (None, None),
        };
        let snapshot = CallSnapshot::capture(&self.state, local_stream, remote_stream);
        gauge!("calls_active").set(if snapshot.is_active() { 1.0 } else { 0.0 });
        self.snapshots.send_replace(snapshot);

        self.resolve_start_waiter();
        self.resolve_answer_waiters();
    }

    fn resolve_start_waiter(&mut self) {
        let waiting_for = match self.start_waiter.as_ref() {
            Some((id, _)) => id.clone(),
            None => return,
        };

        let outcome = match &self.state {
            CallState::Initiated {
                session,
                negotiation: Negotiation::Described,
            } if *session.id() == waiting_for => Ok(waiting_for.clone()),
            CallState::Answered { session, .. } if *session.id() == waiting_for => {
                Ok(waiting_for.clone())
            }
            CallState::Ended { session } if *session.id() == waiting_for => {
                Err(failure_for(session.end_reason(), &mut self.pending_failure))
            }
            CallState::Initiated { session, .. } if *session.id() == waiting_for => return,
            _ => Err(CallError::Internal(format!("call {} was superseded", waiting_for))),
        };

        if let Some((_, reply)) = self.start_waiter.take() {
            let _ = reply.send(outcome);
        }
    }

    fn resolve_answer_waiters(&mut self) {
        if self.answer_waiters.is_empty() {
            return;
        }

        let mut failure = None;
        for (waiting_for, reply) in std::mem::take(&mut self.answer_waiters) {
            let outcome = match &self.state {
                CallState::Answered { session, .. } if *session.id() == waiting_for => Ok(()),
                CallState::Ended { session } if *session.id() == waiting_for => Err(failure
                    .get_or_insert_with(|| {
                        failure_for(session.end_reason(), &mut self.pending_failure)
                    })
                    .clone()),
                CallState::Ringing { session, .. } if *session.id() == waiting_for => {
                    self.answer_waiters.push((waiting_for, reply));
                    continue;
                }
                _ => Err(CallError::NoActiveCall),
            };
            let _ = reply.send(outcome);
        }
    }

    async fn shutdown(&mut self) {
        if self.state.active_session().is_some() {
            info!("Call manager stopping, hanging up active call");
            // shutdown is never suppressed
            self.grace_window = Duration::ZERO;
            if let Err(e) = self
                .dispatch(CallInput::EndCall {
                    reason: EndReason::Hangup,
                })
                .await
            {
                warn!("Hangup on shutdown failed: {}", e);
            }
        }
        self.settle();
        self.resources = None;
        info!("Call manager for {} stopped", self.local_id);
    }
}

/// Error reported to a waiting caller when its call ended instead
fn failure_for(reason: Option<&EndReason>, pending: &mut Option<CallError>) -> CallError {
    let reason = reason.cloned().unwrap_or(EndReason::Hangup);
    match reason {
        EndReason::MediaUnavailable => match pending.take() {
            Some(e @ CallError::MediaUnavailable(_)) => e,
            _ => CallError::MediaUnavailable("local media unavailable".to_string()),
        },
        EndReason::ChannelUnavailable => {
            CallError::ChannelUnavailable("signaling channel unavailable".to_string())
        }
        EndReason::Error(detail) => CallError::Negotiation(detail),
        other => CallError::CallEnded(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::call::value_object::CallStatus;
    use crate::domain::media::{MediaStream, MediaTrack, MockMediaDevices, TrackKind};
    use crate::infrastructure::media::LoopbackMedia;
    use crate::infrastructure::peer::LoopbackPeerConnector;
    use crate::infrastructure::signaling::MemorySignalingHub;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::assert_err;

    struct Party {
        manager: CallManager,
        media: Arc<LoopbackMedia>,
        peers: Arc<LoopbackPeerConnector>,
    }

    async fn party(hub: &MemorySignalingHub, user: &str) -> Party {
        let media = Arc::new(LoopbackMedia::new());
        let peers = Arc::new(LoopbackPeerConnector::new());
        let manager = CallManager::spawn(CallManagerConfig::new(user), media.clone(), peers.clone());
        manager.attach_channel(hub.connect(user)).await;
        Party {
            manager,
            media,
            peers,
        }
    }

    async fn wait_for_status(manager: &CallManager, status: CallStatus) -> CallSnapshot {
        let mut snapshots = manager.watch();
        let snapshot = snapshots
            .wait_for(|s| s.status == Some(status))
            .await
            .unwrap()
            .clone();
        snapshot
    }

    #[tokio::test]
    async fn test_end_without_call() {
        let hub = MemorySignalingHub::new();
        let alice = party(&hub, "alice").await;

        assert_eq!(
            alice.manager.end_call(EndReason::Hangup).await,
            EndCallOutcome::NoActiveCall
        );
        assert!(matches!(alice.manager.answer().await, Err(CallError::NoActiveCall)));
    }

    #[tokio::test]
    async fn test_denied_media_fails_start_without_signaling() {
        let hub = MemorySignalingHub::new();
        let alice = party(&hub, "alice").await;
        let bob = party(&hub, "bob").await;
        alice.media.set_denied(true);

        let result = alice.manager.start_call("bob", MediaKind::Video).await;
        assert!(matches!(result, Err(CallError::MediaUnavailable(_))));

        let snapshot = alice.manager.snapshot();
        assert_eq!(snapshot.status, Some(CallStatus::Ended));
        assert_eq!(snapshot.end_reason, Some(EndReason::MediaUnavailable));
        assert_eq!(alice.peers.opened_count(), 0);
        assert_eq!(bob.manager.snapshot().status, None);
    }

    #[tokio::test]
    async fn test_second_start_rejected_while_active() {
        let hub = MemorySignalingHub::new();
        let alice = party(&hub, "alice").await;
        let _bob = party(&hub, "bob").await;

        let first = alice.manager.start_call("bob", MediaKind::Voice).await.unwrap();
        let second = alice.manager.start_call("carol", MediaKind::Voice).await;
        assert!(matches!(second, Err(CallError::CallAlreadyActive(id)) if id == first));
        assert_eq!(alice.manager.snapshot().session_id, Some(first));
    }

    #[tokio::test]
    async fn test_release_counts_balance_after_hangup() {
        let hub = MemorySignalingHub::new();
        let alice = party(&hub, "alice").await;
        let bob = party(&hub, "bob").await;

        alice.manager.start_call("bob", MediaKind::Video).await.unwrap();
        wait_for_status(&bob.manager, CallStatus::Ringing).await;
        bob.manager.answer().await.unwrap();
        wait_for_status(&alice.manager, CallStatus::Answered).await;

        tokio::time::pause();
        tokio::time::advance(Duration::from_millis(1500)).await;
        tokio::time::resume();

        assert_eq!(alice.manager.end_call(EndReason::Hangup).await, EndCallOutcome::Ended);
        wait_for_status(&bob.manager, CallStatus::Ended).await;

        for party in [&alice, &bob] {
            assert_eq!(party.media.acquired_count(), 1);
            assert_eq!(party.media.released_count(), 1);
            assert_eq!(party.peers.opened_count(), 1);
            assert_eq!(party.peers.destroyed_count(), 1);
        }
    }

    #[tokio::test]
    async fn test_channel_unavailable_ends_call_locally() {
        let media = Arc::new(LoopbackMedia::new());
        let peers = Arc::new(LoopbackPeerConnector::new());
        let manager = CallManager::spawn(CallManagerConfig::new("alice"), media.clone(), peers.clone());

        let result = manager.start_call("bob", MediaKind::Voice).await;
        assert!(matches!(result, Err(CallError::ChannelUnavailable(_))));
        assert_eq!(
            manager.snapshot().end_reason,
            Some(EndReason::ChannelUnavailable)
        );
        assert_eq!(media.live_count(), 0);
        assert_eq!(peers.destroyed_count(), 1);
    }

    #[tokio::test]
    async fn test_media_released_once_through_mock() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut devices = MockMediaDevices::new();
        devices.expect_acquire().returning(|_| {
            Ok(MediaStream::new(vec![MediaTrack::new("mic", TrackKind::Audio)]))
        });
        let counter = released.clone();
        devices.expect_release().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let hub = MemorySignalingHub::new();
        let _bob = party(&hub, "bob").await;
        let manager = CallManager::spawn(
            CallManagerConfig::new("alice"),
            Arc::new(devices),
            Arc::new(LoopbackPeerConnector::new()),
        );
        manager.attach_channel(hub.connect("alice")).await;

        manager.start_call("bob", MediaKind::Voice).await.unwrap();
        assert_eq!(manager.end_call(EndReason::Cancelled).await, EndCallOutcome::Ended);
        assert_eq!(manager.end_call(EndReason::Cancelled).await, EndCallOutcome::NoActiveCall);
        assert_eq!(released.load(Ordering::SeqCst), 1);

        drop(manager);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_negotiation_failure_surfaces_as_error() {
        let hub = MemorySignalingHub::new();
        let _bob = party(&hub, "bob").await;
        let media = Arc::new(LoopbackMedia::new());
        let manager = CallManager::spawn(
            CallManagerConfig::new("alice"),
            media.clone(),
            Arc::new(LoopbackPeerConnector::failing()),
        );
        manager.attach_channel(hub.connect("alice")).await;

        assert_err!(manager.start_call("bob", MediaKind::Voice).await);
        let snapshot = manager.snapshot();
        assert!(matches!(snapshot.end_reason, Some(EndReason::Error(_))));
        assert_eq!(media.live_count(), 0);
    }

    #[tokio::test]
    async fn test_repeated_answer_resolves_every_caller() {
        let hub = MemorySignalingHub::new();
        let alice = party(&hub, "alice").await;
        let bob = party(&hub, "bob").await;
        bob.media.hold();

        alice.manager.start_call("bob", MediaKind::Voice).await.unwrap();
        wait_for_status(&bob.manager, CallStatus::Ringing).await;

        let first = tokio::spawn({
            let manager = bob.manager.clone();
            async move { manager.answer().await }
        });
        let second = tokio::spawn({
            let manager = bob.manager.clone();
            async move { manager.answer().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        bob.media.open();

        assert_eq!(first.await.unwrap(), Ok(()));
        assert_eq!(second.await.unwrap(), Ok(()));
        assert_eq!(bob.manager.snapshot().status, Some(CallStatus::Answered));
        wait_for_status(&alice.manager, CallStatus::Answered).await;
    }

    #[tokio::test]
    async fn test_peer_error_after_answer_tears_down() {
        let hub = MemorySignalingHub::new();
        let alice = party(&hub, "alice").await;
        let bob = party(&hub, "bob").await;

        alice.manager.start_call("bob", MediaKind::Video).await.unwrap();
        wait_for_status(&bob.manager, CallStatus::Ringing).await;
        bob.manager.answer().await.unwrap();
        wait_for_status(&alice.manager, CallStatus::Answered).await;

        // still inside the grace window
        assert_eq!(alice.peers.break_connections("remote track ended"), 1);

        let ended = wait_for_status(&alice.manager, CallStatus::Ended).await;
        assert_eq!(
            ended.end_reason,
            Some(EndReason::Error("remote track ended".into()))
        );
        let remote = wait_for_status(&bob.manager, CallStatus::Ended).await;
        assert!(matches!(remote.end_reason, Some(EndReason::Error(_))));

        for party in [&alice, &bob] {
            assert_eq!(party.media.acquired_count(), 1);
            assert_eq!(party.media.released_count(), 1);
            assert_eq!(party.peers.opened_count(), 1);
            assert_eq!(party.peers.destroyed_count(), 1);
        }
    }
}
