use crate::config::ConsultConfig;
use crate::error::PeerError;
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::media::track::{LocalTrack, MediaKind, RemoteTrack};
use crate::peer::types::{IceCandidate, IceServerConfig, PeerState, SdpKind, SessionDescription};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_remote::TrackRemote;
use webrtc::{
    api::APIBuilder,
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
};

/// Receives the asynchronous events of a peer connection.
///
/// Callbacks run on the engine's tasks and must not block.
pub trait PeerObserver: Send + Sync {
    fn on_local_candidate(&self, candidate: IceCandidate);
    fn on_remote_track(&self, track: RemoteTrack);
    fn on_state_change(&self, state: PeerState);
}

/// The operations the negotiator needs from a peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), PeerError>;
    /// Negotiates a receive-only section for `kind` when nothing is sent.
    async fn add_receive_only(&self, kind: MediaKind) -> Result<(), PeerError>;
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn local_description(&self) -> Option<SessionDescription>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;
    async fn close(&self) -> Result<(), PeerError>;
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        observer: Arc<dyn PeerObserver>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}

/// Builds webrtc-rs peer connections.
#[derive(Debug, Clone)]
pub struct WebRtcPeerFactory {
    ice_servers: Vec<IceServerConfig>,
}

impl WebRtcPeerFactory {
    pub fn new(ice_servers: Vec<IceServerConfig>) -> Self {
        Self { ice_servers }
    }

    pub fn from_config(config: &ConsultConfig) -> Self {
        Self::new(config.ice_servers.clone())
    }
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        observer: Arc<dyn PeerObserver>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let peer = new_peer(rtc_config(&self.ice_servers), observer).await?;
        Ok(Arc::new(peer))
    }
}

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
}


/// Creates the peer and wires its events to `observer`.
pub async fn new_peer(
    config: RTCConfiguration,
    observer: Arc<dyn PeerObserver>,
) -> Result<WebRtcPeer, PeerError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let pc = Arc::new(api.new_peer_connection(config).await?);

    let obs = observer.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        let obs = obs.clone();
        Box::pin(async move {
            match cand {
                Some(c) => match c.to_json() {
                    Ok(init) => {
                        let candidate = IceCandidate::from(init);
                        dump_candidate("LOCAL", &candidate);
                        obs.on_local_candidate(candidate);
                    }
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                },
                // None marks the end of gathering
                None => debug!("ICE candidate gathering completed"),
            }
        })
    }));

    pc.on_ice_gathering_state_change(Box::new(move |state| {
        debug!("ICE gathering state changed to: {:?}", state);
        Box::pin(async {})
    }));

    let obs = observer.clone();
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let remote = RemoteTrack::from_rtc(track);
        info!(
            "Remote {} track {} arrived (stream {})",
            remote.kind(),
            remote.id(),
            remote.stream_id()
        );
        obs.on_remote_track(remote);
        Box::pin(async {})
    }));

    let pc_state = Arc::downgrade(&pc);
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        info!("Peer connection state changed to: {:?}", st);
        if matches!(
            st,
            RTCPeerConnectionState::Connected | RTCPeerConnectionState::Failed
        ) {
            if let Some(pc) = pc_state.upgrade() {
                let moment = if st == RTCPeerConnectionState::Connected {
                    "CONNECTED"
                } else {
                    "BEFORE-FAIL"
                };
                tokio::spawn(async move {
                    dump_selected_pair(&pc, moment).await;
                });
            }
        }
        observer.on_state_change(st.into());
        Box::pin(async {})
    }));

    Ok(WebRtcPeer { pc })
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
    };
    Ok(rtc)
}

fn from_rtc(desc: RTCSessionDescription) -> Option<SessionDescription> {
    match desc.sdp_type {
        RTCSdpType::Offer => Some(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Some(SessionDescription::answer(desc.sdp)),
        _ => None,
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        let rtp_sender = self.pc.add_track(track.rtc_track()).await?;

        // RTCP has to be drained for the interceptors to work
        let track_id = track.id().to_owned();
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while rtp_sender.read(&mut rtcp_buf).await.is_ok() {}
            debug!("RTCP reader for {} stopped", track_id);
        });
        Ok(())
    }

    async fn add_receive_only(&self, kind: MediaKind) -> Result<(), PeerError> {
        let init = RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Recvonly,
            send_encodings: vec![],
        };
        self.pc
            .add_transceiver_from_kind(kind.codec_type(), Some(init))
            .await?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc.local_description().await.and_then(from_rtc)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc.close().await?;
        Ok(())
    }
}

/// Peer configuration; falls back to the public Google STUN servers.
pub fn rtc_config(servers: &[IceServerConfig]) -> RTCConfiguration {
    let ice_servers = if servers.is_empty() {
        vec![RTCIceServer {
            urls: vec![
                "stun:stun.l.google.com:19302".into(),
                "stun:stun1.l.google.com:19302".into(),
            ],
            ..Default::default()
        }]
    } else {
        get_ice_servers(servers)
    };

    RTCConfiguration {
        ice_servers,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn get_ice_servers(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}
