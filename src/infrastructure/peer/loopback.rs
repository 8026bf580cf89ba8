//! In-process peer connections
//!
//! Synthesizes offer/answer descriptions from the attached local tracks and
//! reports a remote stream built from the media sections of the other side's
//! description. No transport is involved.

use crate::domain::media::{MediaStream, MediaTrack, RemoteStream, TrackKind};
use crate::domain::peer::{
    PeerConnection, PeerConnector, PeerEvent, PeerMode, SdpType, SessionDescription,
};
use crate::domain::shared::error::CallError;
use crate::domain::shared::result::Result;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

const AUDIO_PAYLOAD: u8 = 111;
const VIDEO_PAYLOAD: u8 = 96;

pub struct LoopbackPeerConnector {
    fail_negotiation: bool,
    opened: AtomicUsize,
    destroyed: Arc<AtomicUsize>,
    /// Event senders of every opened connection
    links: Mutex<Vec<mpsc::UnboundedSender<PeerEvent>>>,
}

impl LoopbackPeerConnector {
    pub fn new() -> Self {
        Self {
            fail_negotiation: false,
            opened: AtomicUsize::new(0),
            destroyed: Arc::new(AtomicUsize::new(0)),
            links: Mutex::new(Vec::new()),
        }
    }

    /// Connections that report a negotiation error instead of a description
    pub fn failing() -> Self {
        Self {
            fail_negotiation: true,
            ..Self::new()
        }
    }

    /// Report a transport failure on every connection still listening
    pub fn break_connections(&self, reason: &str) -> usize {
        let links = match self.links.lock() {
            Ok(links) => links,
            Err(_) => return 0,
        };
        links
            .iter()
            .filter(|events| events.send(PeerEvent::Error(reason.to_string())).is_ok())
            .count()
    }

    pub fn opened_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn destroyed_count(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl Default for LoopbackPeerConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerConnector for LoopbackPeerConnector {
    fn open(
        &self,
        mode: PeerMode,
        local_stream: &MediaStream,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerConnection>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut links) = self.links.lock() {
            links.retain(|events| !events.is_closed());
            links.push(events.clone());
        }

        let connection = LoopbackConnection {
            mode,
            fail_negotiation: self.fail_negotiation,
            local_tracks: local_stream.tracks().to_vec(),
            events,
            remote: Mutex::new(None),
            closed: AtomicBool::new(false),
            destroyed_counter: self.destroyed.clone(),
        };

        if mode == PeerMode::Offerer {
            if self.fail_negotiation {
                connection.emit(PeerEvent::Error("failed to create offer".to_string()));
            } else {
                let offer = SessionDescription::offer(build_sdp(&connection.local_tracks));
                connection.emit(PeerEvent::LocalDescription(offer));
            }
        }

        Ok(Box::new(connection))
    }
}

struct LoopbackConnection {
    mode: PeerMode,
    fail_negotiation: bool,
    local_tracks: Vec<MediaTrack>,
    events: mpsc::UnboundedSender<PeerEvent>,
    /// Strong handle to the remote stream; observers only get weak ones
    remote: Mutex<Option<Arc<RemoteStream>>>,
    closed: AtomicBool,
    destroyed_counter: Arc<AtomicUsize>,
}

impl LoopbackConnection {
    fn emit(&self, event: PeerEvent) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if self.events.send(event).is_err() {
            debug!("Peer event receiver gone");
        }
    }

    fn attach_remote(&self, description: &SessionDescription) {
        let stream = Arc::new(RemoteStream::new(parse_tracks(&description.sdp)));
        match self.remote.lock() {
            Ok(mut remote) => *remote = Some(stream.clone()),
            Err(_) => warn!("Remote stream slot poisoned"),
        }
        self.emit(PeerEvent::RemoteStream(stream));
    }
}

impl PeerConnection for LoopbackConnection {
    fn signal(&self, remote: SessionDescription) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CallError::Negotiation("connection closed".to_string()));
        }

        if self.fail_negotiation {
            self.emit(PeerEvent::Error("failed to apply remote description".to_string()));
            return Ok(());
        }

        match (self.mode, remote.sdp_type) {
            (PeerMode::Answerer, SdpType::Offer) => {
                let answer = SessionDescription::answer(build_sdp(&self.local_tracks));
                self.emit(PeerEvent::LocalDescription(answer));
                self.attach_remote(&remote);
                Ok(())
            }
            (PeerMode::Offerer, SdpType::Answer) => {
                self.attach_remote(&remote);
                Ok(())
            }
            (mode, sdp_type) => Err(CallError::Negotiation(format!(
                "{:?} cannot accept a {:?} description",
                mode, sdp_type
            ))),
        }
    }

    fn destroy(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut remote) = self.remote.lock() {
            remote.take();
        }
        self.destroyed_counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// Minimal session description with one media section per track kind
fn build_sdp(tracks: &[MediaTrack]) -> String {
    let mut sdp = String::new();

    sdp.push_str("v=0\r\n");
    sdp.push_str(&format!(
        "o=yaktalk {} 2 IN IP4 127.0.0.1\r\n",
        Uuid::new_v4().as_u128() as u64
    ));
    sdp.push_str("s=-\r\n");
    sdp.push_str("t=0 0\r\n");

    if tracks.iter().any(|t| t.kind == TrackKind::Audio) {
        sdp.push_str(&format!("m=audio 9 UDP/TLS/RTP/SAVPF {}\r\n", AUDIO_PAYLOAD));
        sdp.push_str(&format!("a=rtpmap:{} opus/48000/2\r\n", AUDIO_PAYLOAD));
        sdp.push_str("a=sendrecv\r\n");
    }
    if tracks.iter().any(|t| t.kind == TrackKind::Video) {
        sdp.push_str(&format!("m=video 9 UDP/TLS/RTP/SAVPF {}\r\n", VIDEO_PAYLOAD));
        sdp.push_str(&format!("a=rtpmap:{} VP8/90000\r\n", VIDEO_PAYLOAD));
        sdp.push_str("a=sendrecv\r\n");
    }

    sdp
}

fn parse_tracks(sdp: &str) -> Vec<MediaTrack> {
    sdp.lines()
        .filter_map(|line| line.strip_prefix("m="))
        .enumerate()
        .filter_map(|(index, media)| {
            let kind = match media.split_whitespace().next()? {
                "audio" => TrackKind::Audio,
                "video" => TrackKind::Video,
                _ => return None,
            };
            Some(MediaTrack::new(format!("remote-{}", index), kind))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_stream() -> MediaStream {
        MediaStream::new(vec![
            MediaTrack::new("mic", TrackKind::Audio),
            MediaTrack::new("cam", TrackKind::Video),
        ])
    }

    #[test]
    fn test_sdp_media_sections_follow_tracks() {
        let sdp = build_sdp(video_stream().tracks());
        assert!(sdp.starts_with("v=0\r\n"));
        assert!(sdp.contains("m=audio 9 UDP/TLS/RTP/SAVPF 111"));
        assert!(sdp.contains("m=video 9 UDP/TLS/RTP/SAVPF 96"));

        let tracks = parse_tracks(&sdp);
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[1].kind, TrackKind::Video);
    }

    #[test]
    fn test_offer_then_answer() {
        let connector = LoopbackPeerConnector::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let offerer = connector.open(PeerMode::Offerer, &video_stream(), tx).unwrap();
        let offer = match rx.try_recv().unwrap() {
            PeerEvent::LocalDescription(d) => d,
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(offer.sdp_type, SdpType::Offer);

        let (tx, mut answer_rx) = mpsc::unbounded_channel();
        let answerer = connector.open(PeerMode::Answerer, &video_stream(), tx).unwrap();
        answerer.signal(offer).unwrap();
        let answer = match answer_rx.try_recv().unwrap() {
            PeerEvent::LocalDescription(d) => d,
            other => panic!("unexpected event {:?}", other),
        };
        assert!(matches!(answer_rx.try_recv().unwrap(), PeerEvent::RemoteStream(_)));

        offerer.signal(answer).unwrap();
        match rx.try_recv().unwrap() {
            PeerEvent::RemoteStream(stream) => assert_eq!(stream.tracks().len(), 2),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_destroy_drops_remote_stream() {
        let connector = LoopbackPeerConnector::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let answerer = connector.open(PeerMode::Answerer, &video_stream(), tx).unwrap();
        answerer
            .signal(SessionDescription::offer(build_sdp(video_stream().tracks())))
            .unwrap();

        let _answer = rx.try_recv().unwrap();
        let weak = match rx.try_recv().unwrap() {
            PeerEvent::RemoteStream(stream) => Arc::downgrade(&stream),
            other => panic!("unexpected event {:?}", other),
        };
        assert!(weak.upgrade().is_some());

        answerer.destroy();
        answerer.destroy();
        assert!(weak.upgrade().is_none());
        assert_eq!(connector.destroyed_count(), 1);
    }

    #[test]
    fn test_wrong_description_type_rejected() {
        let connector = LoopbackPeerConnector::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let offerer = connector.open(PeerMode::Offerer, &video_stream(), tx).unwrap();

        let result = offerer.signal(SessionDescription::offer("v=0"));
        assert!(matches!(result, Err(CallError::Negotiation(_))));
    }

    #[test]
    fn test_break_connections_reaches_listening_peers() {
        let connector = LoopbackPeerConnector::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _offerer = connector.open(PeerMode::Offerer, &video_stream(), tx).unwrap();
        let (gone_tx, gone_rx) = mpsc::unbounded_channel();
        let _orphan = connector.open(PeerMode::Answerer, &video_stream(), gone_tx).unwrap();
        drop(gone_rx);

        assert!(matches!(rx.try_recv().unwrap(), PeerEvent::LocalDescription(_)));
        assert_eq!(connector.break_connections("link down"), 1);
        match rx.try_recv().unwrap() {
            PeerEvent::Error(reason) => assert_eq!(reason, "link down"),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
