//! Scoped ownership of one peer connection

use crate::domain::media::MediaStream;
use crate::domain::peer::{PeerConnection, PeerConnector, PeerEvent, PeerMode, SessionDescription};
use crate::domain::shared::error::CallError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::SessionId;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Peer callback tagged with the call it belongs to
#[derive(Debug, Clone)]
pub struct PeerNotification {
    pub session_id: SessionId,
    pub event: PeerEvent,
}

/// Peer connection bound to a call session
///
/// Destroyed exactly once, on [`PeerSession::destroy`] or drop. After that no
/// notification for this session is forwarded.
pub struct PeerSession {
    session_id: SessionId,
    mode: PeerMode,
    connection: Box<dyn PeerConnection>,
    destroyed: AtomicBool,
    forwarder: JoinHandle<()>,
}

impl PeerSession {
    /// Open an offering connection; the offer arrives as a notification
    pub fn create_outbound(
        connector: &dyn PeerConnector,
        session_id: SessionId,
        local_stream: &MediaStream,
        notify: mpsc::UnboundedSender<PeerNotification>,
    ) -> Result<Self> {
        Self::open(connector, PeerMode::Offerer, session_id, local_stream, notify)
    }

    /// Open an answering connection and feed it the caller's offer
    pub fn create_inbound(
        connector: &dyn PeerConnector,
        session_id: SessionId,
        local_stream: &MediaStream,
        remote_offer: SessionDescription,
        notify: mpsc::UnboundedSender<PeerNotification>,
    ) -> Result<Self> {
        let session = Self::open(connector, PeerMode::Answerer, session_id, local_stream, notify)?;
        session.connection.signal(remote_offer)?;
        Ok(session)
    }

    fn open(
        connector: &dyn PeerConnector,
        mode: PeerMode,
        session_id: SessionId,
        local_stream: &MediaStream,
        notify: mpsc::UnboundedSender<PeerNotification>,
    ) -> Result<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = connector.open(mode, local_stream, events_tx)?;
        let forwarder = tokio::spawn(forward(session_id.clone(), events_rx, notify));

        info!("Opened {:?} peer session for call {}", mode, session_id);

        Ok(Self {
            session_id,
            mode,
            connection,
            destroyed: AtomicBool::new(false),
            forwarder,
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn mode(&self) -> PeerMode {
        self.mode
    }

    /// Feed the callee's answer to an offering connection
    pub fn accept_remote_description(&self, description: SessionDescription) -> Result<()> {
        if self.is_destroyed() {
            return Err(CallError::Negotiation(format!(
                "Peer session for call {} is already destroyed",
                self.session_id
            )));
        }
        self.connection.signal(description)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Tear the connection down; returns false when already destroyed
    pub fn destroy(&self) -> bool {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.forwarder.abort();
        self.connection.destroy();
        info!("Destroyed peer session for call {}", self.session_id);
        true
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("session_id", &self.session_id)
            .field("mode", &self.mode)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// Relay connection events to the call engine
///
/// Only the first local description and the first error are passed on.
async fn forward(
    session_id: SessionId,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
    notify: mpsc::UnboundedSender<PeerNotification>,
) {
    let mut described = false;
    let mut failed = false;

    while let Some(event) = events.recv().await {
        match &event {
            PeerEvent::LocalDescription(_) if described => {
                debug!("Dropping repeated local description for call {}", session_id);
                continue;
            }
            PeerEvent::LocalDescription(_) => described = true,
            PeerEvent::Error(_) if failed => continue,
            PeerEvent::Error(_) => failed = true,
            PeerEvent::RemoteStream(_) => {}
        }

        let notification = PeerNotification {
            session_id: session_id.clone(),
            event,
        };
        if notify.send(notification).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::media::{MediaTrack, TrackKind};
    use crate::domain::peer::SdpType;
    use crate::infrastructure::peer::loopback::LoopbackPeerConnector;

    fn local_stream() -> MediaStream {
        MediaStream::new(vec![MediaTrack::new("mic", TrackKind::Audio)])
    }

    #[tokio::test]
    async fn test_outbound_produces_one_offer() {
        let connector = LoopbackPeerConnector::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let session =
            PeerSession::create_outbound(&connector, SessionId::new("s1"), &local_stream(), tx).unwrap();

        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.session_id, SessionId::new("s1"));
        assert!(matches!(
            notification.event,
            PeerEvent::LocalDescription(ref d) if d.sdp_type == SdpType::Offer
        ));
        assert_eq!(session.mode(), PeerMode::Offerer);
    }

    #[tokio::test]
    async fn test_inbound_answers_and_attaches_remote() {
        let connector = LoopbackPeerConnector::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let offer = SessionDescription::offer("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n");

        let _session =
            PeerSession::create_inbound(&connector, SessionId::new("s1"), &local_stream(), offer, tx)
                .unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(
            first.event,
            PeerEvent::LocalDescription(ref d) if d.sdp_type == SdpType::Answer
        ));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second.event, PeerEvent::RemoteStream(_)));
    }

    #[tokio::test]
    async fn test_destroy_exactly_once() {
        let connector = LoopbackPeerConnector::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let session =
            PeerSession::create_outbound(&connector, SessionId::new("s1"), &local_stream(), tx).unwrap();
        assert!(session.destroy());
        assert!(!session.destroy());
        drop(session);

        assert_eq!(connector.opened_count(), 1);
        assert_eq!(connector.destroyed_count(), 1);
    }

    #[tokio::test]
    async fn test_drop_destroys() {
        let connector = LoopbackPeerConnector::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let session =
            PeerSession::create_outbound(&connector, SessionId::new("s1"), &local_stream(), tx).unwrap();
        drop(session);
        assert_eq!(connector.destroyed_count(), 1);
    }

    #[tokio::test]
    async fn test_signal_after_destroy_fails() {
        let connector = LoopbackPeerConnector::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let session =
            PeerSession::create_outbound(&connector, SessionId::new("s1"), &local_stream(), tx).unwrap();
        session.destroy();

        let result = session.accept_remote_description(SessionDescription::answer("v=0"));
        assert!(matches!(result, Err(CallError::Negotiation(_))));
    }

    #[tokio::test]
    async fn test_forwards_only_first_error() {
        let connector = LoopbackPeerConnector::failing();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let offer = SessionDescription::offer("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n");

        let session =
            PeerSession::create_outbound(&connector, SessionId::new("s1"), &local_stream(), tx).unwrap();
        // a second failure on the same connection
        let _ = session.connection.signal(offer);

        let first = rx.recv().await.unwrap();
        assert!(matches!(first.event, PeerEvent::Error(_)));
        session.destroy();
        assert!(rx.recv().await.is_none());
    }
}
