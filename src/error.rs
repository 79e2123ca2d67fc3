use thiserror::Error;

/// Transport-level failure of the signaling channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("invalid signaling endpoint `{0}`")]
    InvalidEndpoint(String),
    #[error("failed to open signaling channel: {0}")]
    Connect(String),
    #[error("signaling channel dropped: {0}")]
    Dropped(String),
    #[error("signaling channel is closed")]
    Closed,
}

/// Local media acquisition failure. The message is shown to the user as is.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("camera/microphone permission denied")]
    PermissionDenied,
    #[error("no {0} device found")]
    NotFound(String),
    #[error("{0} device is busy")]
    HardwareBusy(String),
    #[error("media acquisition already in progress")]
    AcquireInProgress,
    #[error("media was released before acquisition completed")]
    Released,
}

/// Error reported by the underlying peer connection engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct PeerError(pub String);

impl From<webrtc::Error> for PeerError {
    fn from(e: webrtc::Error) -> Self {
        PeerError(e.to_string())
    }
}

/// An offer/answer/description step failed twice in a row.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{step} failed after retry: {source}")]
pub struct NegotiationError {
    pub step: &'static str,
    #[source]
    pub source: PeerError,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("ICE server `{0}` has an empty url")]
    EmptyUrl(String),
    #[error("TURN server `{0}` requires username and credential")]
    MissingTurnCredentials(String),
    #[error("invalid origin `{0}`")]
    InvalidOrigin(String),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("malformed signaling message: {0}")]
    MalformedMessage(String),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error("peer connection error: {0}")]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;
