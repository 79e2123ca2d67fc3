use async_trait::async_trait;
use tracing::info;

use crate::error::DeviceError;
use crate::media::track::{LocalStream, LocalTrack, MediaKind};
use crate::utils::random_id;

/// Which local devices a call asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl MediaConstraints {
    pub fn kinds(&self) -> Vec<MediaKind> {
        let mut kinds = Vec::with_capacity(2);
        if self.audio {
            kinds.push(MediaKind::Audio);
        }
        if self.video {
            kinds.push(MediaKind::Video);
        }
        kinds
    }
}

/// Source of local camera/microphone streams.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(&self, constraints: &MediaConstraints)
        -> Result<LocalStream, DeviceError>;
}

/// Devices whose tracks are fed with already-encoded samples (Opus audio,
/// VP8 video) by the embedding application's capture loop.
#[derive(Debug, Clone)]
pub struct SampleDevices {
    audio: bool,
    video: bool,
    granted: bool,
}

impl Default for SampleDevices {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            granted: true,
        }
    }
}

impl SampleDevices {
    pub fn new(audio: bool, video: bool) -> Self {
        Self {
            audio,
            video,
            granted: true,
        }
    }

    /// Simulates the user refusing the permission prompt.
    pub fn denied() -> Self {
        Self {
            granted: false,
            ..Self::default()
        }
    }

    fn available(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio,
            MediaKind::Video => self.video,
        }
    }
}

#[async_trait]
impl MediaDevices for SampleDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalStream, DeviceError> {
        if !self.granted {
            return Err(DeviceError::PermissionDenied);
        }
        let kinds = constraints.kinds();
        if let Some(missing) = kinds.iter().find(|k| !self.available(**k)) {
            return Err(DeviceError::NotFound(missing.to_string()));
        }

        let stream_id = format!("local-{}", random_id());
        let tracks = kinds
            .into_iter()
            .map(|kind| LocalTrack::new(kind, format!("{kind}-{}", random_id()), stream_id.clone()))
            .collect::<Vec<_>>();
        info!("Acquired local stream {} with {} tracks", stream_id, tracks.len());
        Ok(LocalStream::new(stream_id, tracks))
    }
}
