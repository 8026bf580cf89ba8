//! Local capture media and the device capability port

use crate::domain::call::value_object::MediaKind;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::StreamId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Track media type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// A single capture or remote track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

/// Captured local stream
///
/// Not `Clone`: the owning call session holds the only handle,
/// and giving it back to [`MediaDevices::release`] stops every track.
#[derive(Debug, PartialEq, Eq)]
pub struct MediaStream {
    id: StreamId,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: StreamId::new(),
            tracks,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == TrackKind::Video)
    }

    /// Read-only description safe to hand to observers
    pub fn info(&self) -> StreamInfo {
        StreamInfo::from_tracks(self.id, &self.tracks)
    }
}

/// Media arriving from the remote party
///
/// Owned by the peer connection; the call session only keeps a weak
/// reference to it.
#[derive(Debug, PartialEq, Eq)]
pub struct RemoteStream {
    id: StreamId,
    tracks: Vec<MediaTrack>,
}

impl RemoteStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: StreamId::new(),
            tracks,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn info(&self) -> StreamInfo {
        StreamInfo::from_tracks(self.id, &self.tracks)
    }
}

/// Summary of a stream's tracks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub id: StreamId,
    pub audio_tracks: usize,
    pub video_tracks: usize,
}

impl StreamInfo {
    fn from_tracks(id: StreamId, tracks: &[MediaTrack]) -> Self {
        let video_tracks = tracks.iter().filter(|t| t.kind == TrackKind::Video).count();
        Self {
            id,
            audio_tracks: tracks.len() - video_tracks,
            video_tracks,
        }
    }
}

/// Capture capability provided by the host platform
///
/// `acquire` asks for the microphone (Voice) or microphone and camera
/// (Video) and fails with [`CallError::MediaUnavailable`] on denial.
/// `release` stops every track of the stream and must tolerate being called
/// for a stream that is already stopped.
///
/// [`CallError::MediaUnavailable`]: crate::domain::shared::CallError::MediaUnavailable
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, kind: MediaKind) -> Result<MediaStream>;

    fn release(&self, stream: &MediaStream);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_info_counts_tracks() {
        let stream = MediaStream::new(vec![
            MediaTrack::new("mic", TrackKind::Audio),
            MediaTrack::new("cam", TrackKind::Video),
        ]);
        let info = stream.info();
        assert_eq!(info.id, stream.id());
        assert_eq!(info.audio_tracks, 1);
        assert_eq!(info.video_tracks, 1);
        assert!(stream.has_video());
    }
}
