//! Scoped ownership of a captured local stream

use crate::domain::call::value_object::MediaKind;
use crate::domain::media::{MediaDevices, MediaStream, StreamInfo};
use crate::domain::shared::result::Result;
use std::sync::Arc;
use tracing::debug;

/// Owns one captured stream and stops its tracks exactly once
///
/// Release happens on the first of [`MediaGuard::release`] or drop; every
/// later call is a no-op.
pub struct MediaGuard {
    devices: Arc<dyn MediaDevices>,
    stream: Option<MediaStream>,
}

impl MediaGuard {
    /// Capture a stream for `kind` and take ownership of it
    pub async fn acquire(devices: Arc<dyn MediaDevices>, kind: MediaKind) -> Result<Self> {
        let stream = devices.acquire(kind).await?;
        debug!(
            "Acquired {} stream {} with {} tracks",
            kind.as_str(),
            stream.id(),
            stream.tracks().len()
        );
        Ok(Self {
            devices,
            stream: Some(stream),
        })
    }

    /// The owned stream, until released
    pub fn stream(&self) -> Option<&MediaStream> {
        self.stream.as_ref()
    }

    pub fn info(&self) -> Option<StreamInfo> {
        self.stream.as_ref().map(MediaStream::info)
    }

    pub fn is_released(&self) -> bool {
        self.stream.is_none()
    }

    /// Stop every track; returns false when already released
    pub fn release(&mut self) -> bool {
        match self.stream.take() {
            Some(stream) => {
                self.devices.release(&stream);
                debug!("Released local stream {}", stream.id());
                true
            }
            None => false,
        }
    }
}

impl Drop for MediaGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for MediaGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaGuard")
            .field("stream", &self.stream.as_ref().map(MediaStream::id))
            .finish()
    }
}
