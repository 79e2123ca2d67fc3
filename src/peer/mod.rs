pub mod connection;
pub mod ice;
pub mod state;
pub mod types;

pub use connection::{PeerConnection, PeerFactory, PeerObserver, WebRtcPeer, WebRtcPeerFactory};
pub use ice::{analyze_candidates, CandidateBuffer, CandidateStats};
pub use state::{CallStatus, NegotiationState};
pub use types::{IceCandidate, IceServerConfig, PeerState, SdpKind, SessionDescription};
