//! In-process capture device
//!
//! Produces synthetic tracks instead of touching real hardware. Used by the
//! daemon when no host media stack is wired in and by tests, which can deny
//! permission or hold acquisitions open to exercise races.

use crate::domain::call::value_object::MediaKind;
use crate::domain::media::{MediaDevices, MediaStream, MediaTrack, TrackKind};
use crate::domain::shared::error::CallError;
use crate::domain::shared::result::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::watch;
use tracing::debug;

pub struct LoopbackMedia {
    denied: AtomicBool,
    /// Acquisitions complete only while the gate is open
    gate: watch::Sender<bool>,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl LoopbackMedia {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            denied: AtomicBool::new(false),
            gate,
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    /// A device that refuses every acquisition
    pub fn denying() -> Self {
        let media = Self::new();
        media.set_denied(true);
        media
    }

    pub fn set_denied(&self, denied: bool) {
        self.denied.store(denied, Ordering::SeqCst);
    }

    /// Park acquisitions until [`LoopbackMedia::open`]
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn open(&self) {
        self.gate.send_replace(true);
    }

    pub fn acquired_count(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Streams handed out and not yet given back
    pub fn live_count(&self) -> usize {
        self.acquired_count().saturating_sub(self.released_count())
    }
}

impl Default for LoopbackMedia {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for LoopbackMedia {
    async fn acquire(&self, kind: MediaKind) -> Result<MediaStream> {
        let mut gate = self.gate.subscribe();
        gate.wait_for(|open| *open)
            .await
            .map_err(|_| CallError::MediaUnavailable("capture device closed".to_string()))?;

        if self.denied.load(Ordering::SeqCst) {
            return Err(CallError::MediaUnavailable("permission denied".to_string()));
        }

        let mut tracks = vec![MediaTrack::new("loopback-audio", TrackKind::Audio)];
        if kind.wants_video() {
            tracks.push(MediaTrack::new("loopback-video", TrackKind::Video));
        }

        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(MediaStream::new(tracks))
    }

    fn release(&self, stream: &MediaStream) {
        self.released.fetch_add(1, Ordering::SeqCst);
        debug!("Loopback stream {} stopped", stream.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_video_gets_two_tracks() {
        let media = LoopbackMedia::new();
        let stream = media.acquire(MediaKind::Video).await.unwrap();
        assert!(stream.has_video());
        assert_eq!(stream.tracks().len(), 2);

        let voice = media.acquire(MediaKind::Voice).await.unwrap();
        assert!(!voice.has_video());
        assert_eq!(media.acquired_count(), 2);
    }

    #[tokio::test]
    async fn test_denied() {
        let media = LoopbackMedia::denying();
        let result = media.acquire(MediaKind::Voice).await;
        assert!(matches!(result, Err(CallError::MediaUnavailable(_))));
        assert_eq!(media.acquired_count(), 0);
    }

    #[tokio::test]
    async fn test_hold_parks_acquisition() {
        let media = Arc::new(LoopbackMedia::new());
        media.hold();

        let pending = tokio::spawn({
            let media = media.clone();
            async move { media.acquire(MediaKind::Voice).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        media.open();
        let stream = pending.await.unwrap().unwrap();
        media.release(&stream);
        assert_eq!(media.live_count(), 0);
    }
}
