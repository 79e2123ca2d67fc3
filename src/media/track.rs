use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::PeerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }

    pub fn codec_type(self) -> RTPCodecType {
        match self {
            MediaKind::Audio => RTPCodecType::Audio,
            MediaKind::Video => RTPCodecType::Video,
        }
    }

    fn capability(self) -> RTCRtpCodecCapability {
        match self {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outgoing track fed with encoded samples by the capture side.
#[derive(Clone)]
pub struct LocalTrack {
    kind: MediaKind,
    rtc: Arc<TrackLocalStaticSample>,
    stopped: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        let rtc = Arc::new(TrackLocalStaticSample::new(
            kind.capability(),
            id.into(),
            stream_id.into(),
        ));
        Self {
            kind,
            rtc,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        self.rtc.id()
    }

    pub fn stream_id(&self) -> &str {
        self.rtc.stream_id()
    }

    /// Handle to add to a peer connection.
    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.rtc) as Arc<dyn TrackLocal + Send + Sync>
    }

    pub fn is_live(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    /// Returns true only for the call that actually stopped the track.
    pub fn stop(&self) -> bool {
        !self.stopped.swap(true, Ordering::SeqCst)
    }

    pub async fn write_sample(&self, sample: &Sample) -> Result<(), PeerError> {
        if !self.is_live() {
            return Err(PeerError(format!("track {} is stopped", self.id())));
        }
        self.rtc.write_sample(sample).await.map_err(PeerError::from)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("id", &self.id())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Incoming track announced by the peer connection.
#[derive(Clone)]
pub struct RemoteTrack {
    kind: MediaKind,
    id: String,
    stream_id: String,
    rtc: Option<Arc<TrackRemote>>,
    stopped: Arc<AtomicBool>,
}

impl RemoteTrack {
    pub fn new(kind: MediaKind, id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            stream_id: stream_id.into(),
            rtc: None,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn from_rtc(track: Arc<TrackRemote>) -> Self {
        let kind = match track.kind() {
            RTPCodecType::Video => MediaKind::Video,
            _ => MediaKind::Audio,
        };
        Self {
            kind,
            id: track.id(),
            stream_id: track.stream_id(),
            rtc: Some(track),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Underlying RTP track for renderers that read packets.
    pub fn rtc_track(&self) -> Option<Arc<TrackRemote>> {
        self.rtc.clone()
    }

    pub fn is_live(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    pub fn stop(&self) -> bool {
        !self.stopped.swap(true, Ordering::SeqCst)
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Tracks produced by one device acquisition.
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn has(&self, kind: MediaKind) -> bool {
        self.tracks.iter().any(|t| t.kind() == kind)
    }

    /// Stops every track, returning how many were still live.
    pub fn stop(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }
}

/// Remote tracks grouped by their stream id.
#[derive(Debug, Clone)]
pub struct RemoteStream {
    id: String,
    tracks: Arc<Mutex<Vec<RemoteTrack>>>,
}

impl RemoteStream {
    pub(crate) fn new(first: RemoteTrack) -> Self {
        Self {
            id: first.stream_id().to_owned(),
            tracks: Arc::new(Mutex::new(vec![first])),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> Vec<RemoteTrack> {
        self.tracks.lock().map(|t| t.clone()).unwrap_or_default()
    }

    pub(crate) fn push(&self, track: RemoteTrack) {
        if let Ok(mut tracks) = self.tracks.lock() {
            tracks.push(track);
        }
    }

    pub fn stop(&self) -> usize {
        self.tracks().iter().filter(|t| t.stop()).count()
    }
}
