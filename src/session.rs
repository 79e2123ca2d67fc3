//! One live consultation call: the negotiator task that drives the
//! offer/answer/ICE exchange, and the handle the call UI holds.
//!
//! A `Session` owns its signaling channel, peer connection and media; nothing
//! is shared between calls, and a new session is started for every attempt.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::ConsultConfig;
use crate::error::{ChannelError, DeviceError, Error, NegotiationError, PeerError, Result};
use crate::logger::dump_candidate;
use crate::media::devices::{MediaConstraints, MediaDevices, SampleDevices};
use crate::media::track::MediaKind;
use crate::media::pipeline::MediaPipeline;
use crate::media::track::RemoteTrack;
use crate::peer::connection::{PeerConnection, PeerFactory, PeerObserver, WebRtcPeerFactory};
use crate::peer::ice::{analyze_candidates, CandidateBuffer, CandidateStats};
use crate::peer::state::{CallStatus, NegotiationState};
use crate::peer::types::{IceCandidate, PeerState, SessionDescription};
use crate::signaling::{SignalTransport, SignalingChannel, SignalingMessage, WebSocketTransport};
use crate::utils::{random_id, signaling_endpoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Places the call (patient side).
    Sender,
    /// Answers the call (doctor side).
    Receiver,
}

impl Role {
    /// Endpoint path segment.
    pub fn path(self) -> &'static str {
        match self {
            Role::Sender => "sender",
            Role::Receiver => "receiver",
        }
    }

    pub fn counterpart(self) -> Role {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

#[derive(Debug, Clone, ThisError, PartialEq, Eq)]
#[error("unknown role `{0}`")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "sender" => Ok(Role::Sender),
            "receiver" => Ok(Role::Receiver),
            other => Err(UnknownRole(other.to_owned())),
        }
    }
}

/// Display label of the local participant, from the identity lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub display_name: String,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaStatus {
    Pending,
    Live { tracks: usize },
    /// Some requested devices are missing; the rest are live.
    Degraded { tracks: usize, error: DeviceError },
    /// Local capture failed; the call continues receive-only unless media is required.
    Unavailable(DeviceError),
}

/// What the call UI renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: NegotiationState,
    pub media: MediaStatus,
    /// Human-readable reason when the session ended abnormally.
    pub failure: Option<String>,
    pub participant: Option<Participant>,
    /// Remote candidate types seen when the media transport last connected or failed.
    pub remote_candidates: CandidateStats,
}

impl SessionSnapshot {
    pub fn call_status(&self) -> CallStatus {
        self.state.call_status()
    }
}

/// Collaborators a session is built from.
#[derive(Clone)]
pub struct SessionDeps {
    pub transport: Arc<dyn SignalTransport>,
    pub peers: Arc<dyn PeerFactory>,
    pub devices: Arc<dyn MediaDevices>,
}

impl SessionDeps {
    /// WebSocket signaling, webrtc-rs peers and sample-fed devices.
    pub fn webrtc(config: &ConsultConfig) -> Self {
        Self {
            transport: Arc::new(WebSocketTransport),
            peers: Arc::new(WebRtcPeerFactory::from_config(config)),
            devices: Arc::new(SampleDevices::default()),
        }
    }
}

/// Per-call settings. ICE servers are a property of the peer factory in
/// [`SessionDeps`]; `config` is validated on start and drives the endpoint and
/// media policy.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub config: ConsultConfig,
    pub participant: Option<Participant>,
    pub constraints: MediaConstraints,
    /// Overrides the endpoint derived from `config.origin`.
    pub endpoint: Option<String>,
}

enum SessionEvent {
    Signal(SignalingMessage),
    PeerState(PeerState),
}

/// Routes peer connection callbacks: candidates go straight out through the
/// channel, remote tracks straight to the media pipeline.
struct SessionObserver {
    channel: SignalingChannel,
    media: Arc<MediaPipeline>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl PeerObserver for SessionObserver {
    fn on_local_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self
            .channel
            .send(&SignalingMessage::IceCandidate { candidate })
        {
            debug!("Local candidate not sent: {}", e);
        }
    }

    fn on_remote_track(&self, track: RemoteTrack) {
        self.media.push_remote_track(track);
    }

    fn on_state_change(&self, state: PeerState) {
        let _ = self.events.send(SessionEvent::PeerState(state));
    }
}

pub struct Session;

impl Session {
    /// Starts a call in `role` and returns immediately; negotiation proceeds
    /// on a spawned task. Must be called inside a tokio runtime.
    pub fn start(role: Role, deps: SessionDeps, options: SessionOptions) -> Result<SessionHandle> {
        options.config.validate()?;
        let endpoint = match options.endpoint.clone() {
            Some(endpoint) => endpoint,
            None => signaling_endpoint(&options.config.origin, role)?,
        };
        let id = random_id();

        let channel = SignalingChannel::new(deps.transport.clone());
        let media = Arc::new(MediaPipeline::new(deps.devices.clone()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();

        let tx = events_tx.clone();
        channel.on_message(Box::new(move |msg| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(SessionEvent::Signal(msg));
            })
        }));
        channel.on_close(Box::new(move |reason| {
            let tx = closed_tx.clone();
            Box::pin(async move {
                let _ = tx.send(reason);
            })
        }));

        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot {
            state: NegotiationState::Idle,
            media: MediaStatus::Pending,
            failure: None,
            participant: options.participant.clone(),
            remote_candidates: CandidateStats::default(),
        });
        let (stop_tx, stop_rx) = watch::channel(None);

        let observer = Arc::new(SessionObserver {
            channel: channel.clone(),
            media: media.clone(),
            events: events_tx,
        });

        let negotiator = Negotiator {
            role,
            endpoint,
            media_required: options.config.media_required,
            constraints: options.constraints,
            channel: channel.clone(),
            media: media.clone(),
            peers: deps.peers,
            observer,
            peer: None,
            candidates: CandidateBuffer::new(),
            remote_candidates: Vec::new(),
            offer_accepted: false,
            snapshot: snapshot_tx,
            torn_down: false,
        };

        let span = info_span!("session", session_id = %id, role = %role);
        tokio::spawn(
            negotiator
                .run(events_rx, closed_rx, stop_rx)
                .instrument(span),
        );
        if let Some(p) = &options.participant {
            info!("Session {} started as {} for {}", id, role, p.display_name);
        } else {
            info!("Session {} started as {}", id, role);
        }

        Ok(SessionHandle {
            id,
            role,
            snapshot: snapshot_rx,
            stop: Arc::new(stop_tx),
            media,
            channel,
        })
    }
}

/// Caller-side view of a running session. Cheap to clone; the call ends when
/// `end` is invoked or every handle has been dropped.
#[derive(Clone)]
pub struct SessionHandle {
    id: String,
    role: Role,
    snapshot: watch::Receiver<SessionSnapshot>,
    stop: Arc<watch::Sender<Option<String>>>,
    media: Arc<MediaPipeline>,
    channel: SignalingChannel,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.snapshot.borrow().state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Local preview binding and remote streams.
    pub fn media(&self) -> &Arc<MediaPipeline> {
        &self.media
    }

    /// Signaling messages still waiting for the channel to open.
    pub fn pending_outbound(&self) -> usize {
        self.channel.pending_len()
    }

    pub async fn wait_for<F>(&self, pred: F) -> SessionSnapshot
    where
        F: Fn(&SessionSnapshot) -> bool,
    {
        let mut rx = self.snapshot.clone();
        let result = rx.wait_for(|s| pred(s)).await.map(|s| (*s).clone());
        match result {
            Ok(snapshot) => snapshot,
            Err(_) => self.snapshot(),
        }
    }

    pub async fn wait_for_state(&self, state: NegotiationState) -> SessionSnapshot {
        self.wait_for(move |s| s.state == state || s.state.is_terminal())
            .await
    }

    /// Ends the call and waits for teardown. Idempotent.
    pub async fn end(&self) {
        self.stop.send_if_modified(|reason| {
            if reason.is_none() {
                *reason = Some("call ended".into());
                true
            } else {
                false
            }
        });
        self.wait_for(|s| s.state.is_terminal()).await;
    }
}

enum Outcome {
    Stopped(String),
    ChannelLost(ChannelError),
    Failed(Error),
    Drained,
}

async fn stop_requested(stop: &mut watch::Receiver<Option<String>>) -> String {
    loop {
        if let Some(reason) = stop.borrow_and_update().clone() {
            return reason;
        }
        if stop.changed().await.is_err() {
            return "session handle dropped".into();
        }
    }
}

/// `constraints` minus the device named by `error`, when something is left to try.
fn without_device(constraints: &MediaConstraints, error: &DeviceError) -> Option<MediaConstraints> {
    let (DeviceError::NotFound(kind) | DeviceError::HardwareBusy(kind)) = error else {
        return None;
    };
    let reduced = MediaConstraints {
        audio: constraints.audio && kind != MediaKind::Audio.as_str(),
        video: constraints.video && kind != MediaKind::Video.as_str(),
    };
    if reduced == *constraints || reduced.kinds().is_empty() {
        None
    } else {
        Some(reduced)
    }
}

/// Runs `op`, retrying once on failure.
async fn retry_once<T, F, Fut>(step: &'static str, mut op: F) -> std::result::Result<T, NegotiationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, PeerError>>,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(first) => {
            warn!("{} failed, retrying once: {}", step, first);
            op().await.map_err(|source| {
                error!("{} failed again: {}", step, source);
                NegotiationError { step, source }
            })
        }
    }
}

struct Negotiator {
    role: Role,
    endpoint: String,
    media_required: bool,
    constraints: MediaConstraints,
    channel: SignalingChannel,
    media: Arc<MediaPipeline>,
    peers: Arc<dyn PeerFactory>,
    observer: Arc<SessionObserver>,
    peer: Option<Arc<dyn PeerConnection>>,
    candidates: CandidateBuffer,
    // every remote candidate received, for the transport diagnostics
    remote_candidates: Vec<IceCandidate>,
    offer_accepted: bool,
    snapshot: watch::Sender<SessionSnapshot>,
    torn_down: bool,
}

impl Negotiator {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
        mut closed: mpsc::UnboundedReceiver<ChannelError>,
        mut stop: watch::Receiver<Option<String>>,
    ) {
        let outcome = tokio::select! {
            biased;
            reason = stop_requested(&mut stop) => Outcome::Stopped(reason),
            Some(reason) = closed.recv() => Outcome::ChannelLost(reason),
            result = self.drive(&mut events) => match result {
                Ok(()) => Outcome::Drained,
                Err(e) => Outcome::Failed(e),
            },
        };

        match outcome {
            Outcome::Stopped(reason) => info!("Stopping session: {}", reason),
            Outcome::ChannelLost(reason) => {
                warn!("Signaling channel lost, ending session: {}", reason);
                self.fail(reason.to_string());
            }
            Outcome::Failed(e) => {
                error!("Session failed: {}", e);
                self.fail(e.to_string());
            }
            Outcome::Drained => debug!("Session event stream ended"),
        }
        self.teardown().await;
    }

    async fn drive(&mut self, events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Result<()> {
        // Both roles open the channel and build the peer up front so early
        // candidates have somewhere to go.
        self.channel.open(self.endpoint.clone());
        let observer: Arc<dyn PeerObserver> = self.observer.clone();
        self.peer = Some(self.peers.create(observer).await?);

        match self.role {
            Role::Sender => self.start_sender().await?,
            Role::Receiver => {
                self.transition(NegotiationState::AwaitingOffer);
                info!("Waiting for an offer");
            }
        }

        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Signal(msg) => self.handle_signal(msg).await?,
                SessionEvent::PeerState(state) => self.handle_peer_state(state)?,
            }
        }
        Ok(())
    }

    fn peer(&self) -> Result<Arc<dyn PeerConnection>> {
        self.peer
            .clone()
            .ok_or_else(|| Error::Peer(PeerError("peer connection not created".into())))
    }

    fn state(&self) -> NegotiationState {
        self.snapshot.borrow().state
    }

    fn transition(&self, next: NegotiationState) {
        let current = self.state();
        if !current.can_transition_to(next) {
            warn!("Ignoring transition {} -> {}", current, next);
            return;
        }
        debug!("{} -> {}", current, next);
        self.snapshot.send_modify(|s| s.state = next);
    }

    fn fail(&self, reason: String) {
        self.snapshot.send_modify(|s| {
            if s.failure.is_none() {
                s.failure = Some(reason);
            }
        });
    }

    fn send(&self, msg: SignalingMessage) -> Result<()> {
        self.channel.send(&msg)?;
        Ok(())
    }

    async fn start_sender(&mut self) -> Result<()> {
        self.transition(NegotiationState::AwaitingLocalMedia);
        self.acquire_and_attach().await?;

        let peer = self.peer()?;
        let offer = retry_once("create offer", || peer.create_offer()).await?;
        retry_once("set local description", || {
            peer.set_local_description(offer.clone())
        })
        .await?;
        self.transition(NegotiationState::OfferCreated);

        let sdp = peer.local_description().await.unwrap_or(offer);
        info!(
            "Sending offer ({} audio, {} video sections)",
            sdp.media_sections("audio"),
            sdp.media_sections("video")
        );
        self.send(SignalingMessage::Offer { sdp })?;
        self.transition(NegotiationState::AwaitingAnswer);
        Ok(())
    }

    /// Captures local media and adds it to the peer. A missing or busy device
    /// is dropped from the request and the rest retried; if nothing can be
    /// captured the session either aborts (media required) or goes receive-only.
    async fn acquire_and_attach(&mut self) -> Result<()> {
        let peer = self.peer()?;
        let first = match self.media.acquire_local(&self.constraints).await {
            Ok(_) => None,
            Err(e) if self.media_required => {
                error!("Local media unavailable: {}", e);
                self.snapshot
                    .send_modify(|s| s.media = MediaStatus::Unavailable(e.clone()));
                return Err(Error::Device(e));
            }
            Err(e) => Some(e),
        };

        let (error, missing) = match first {
            None => (None, Vec::new()),
            Some(e) => match without_device(&self.constraints, &e) {
                Some(reduced) => {
                    warn!("{}, retrying with {:?}", e, reduced.kinds());
                    match self.media.acquire_local(&reduced).await {
                        Ok(_) => {
                            let missing = self
                                .constraints
                                .kinds()
                                .into_iter()
                                .filter(|k| !reduced.kinds().contains(k))
                                .collect();
                            (Some(e), missing)
                        }
                        Err(_) => (Some(e), self.constraints.kinds()),
                    }
                }
                None => (Some(e), self.constraints.kinds()),
            },
        };

        let tracks = if self.media.local_stream().is_some() {
            self.media.attach_to_connection(peer.as_ref()).await?
        } else {
            0
        };
        let status = match error {
            None => MediaStatus::Live { tracks },
            Some(e) if tracks > 0 => MediaStatus::Degraded { tracks, error: e },
            Some(e) => MediaStatus::Unavailable(e),
        };
        match &status {
            MediaStatus::Live { tracks } => info!("Local media attached ({} tracks)", tracks),
            MediaStatus::Degraded { tracks, error } => {
                warn!("Local media partly available ({} tracks): {}", tracks, error)
            }
            MediaStatus::Unavailable(e) => {
                error!("Local media unavailable: {}", e);
                warn!("Continuing without local media");
            }
            MediaStatus::Pending => {}
        }
        self.snapshot.send_modify(|s| s.media = status);

        // The answering side inherits its transceivers from the offer.
        if self.role == Role::Sender {
            for kind in missing {
                peer.add_receive_only(kind).await?;
            }
        }
        Ok(())
    }

    async fn handle_signal(&mut self, msg: SignalingMessage) -> Result<()> {
        match msg {
            SignalingMessage::Offer { sdp } => self.handle_offer(sdp).await,
            SignalingMessage::Answer { sdp } => self.handle_answer(sdp).await,
            SignalingMessage::IceCandidate { candidate } => {
                dump_candidate("REMOTE", &candidate);
                self.remote_candidates.push(candidate.clone());
                if let Some(candidate) = self.candidates.accept(candidate) {
                    self.apply_candidate(candidate).await;
                }
                Ok(())
            }
        }
    }

    async fn handle_offer(&mut self, offer: SessionDescription) -> Result<()> {
        if self.role == Role::Sender {
            warn!("Ignoring offer received by the sender");
            return Ok(());
        }
        if self.offer_accepted {
            warn!("Rejecting offer, one was already accepted for this session");
            return Ok(());
        }
        self.offer_accepted = true;
        info!("Received offer, creating answer");
        self.transition(NegotiationState::OfferReceived);

        let peer = self.peer()?;
        retry_once("set remote description", || {
            peer.set_remote_description(offer.clone())
        })
        .await?;
        self.flush_candidates().await;

        self.transition(NegotiationState::AwaitingLocalMedia);
        self.acquire_and_attach().await?;

        let answer = retry_once("create answer", || peer.create_answer()).await?;
        retry_once("set local description", || {
            peer.set_local_description(answer.clone())
        })
        .await?;
        self.transition(NegotiationState::AnswerCreated);

        let sdp = peer.local_description().await.unwrap_or(answer);
        self.send(SignalingMessage::Answer { sdp })?;
        self.transition(NegotiationState::Connected);
        info!("Answer sent, call connected");
        Ok(())
    }

    async fn handle_answer(&mut self, answer: SessionDescription) -> Result<()> {
        if self.role == Role::Receiver {
            warn!("Ignoring answer received by the receiver");
            return Ok(());
        }
        if self.state() != NegotiationState::AwaitingAnswer {
            warn!("Ignoring answer in state {}", self.state());
            return Ok(());
        }

        let peer = self.peer()?;
        retry_once("set remote description", || {
            peer.set_remote_description(answer.clone())
        })
        .await?;
        self.flush_candidates().await;
        self.transition(NegotiationState::Connected);
        info!("Answer applied, call connected");
        Ok(())
    }

    async fn flush_candidates(&mut self) {
        let pending = self.candidates.release();
        if !pending.is_empty() {
            info!("Applying {} buffered remote candidates", pending.len());
        }
        for candidate in pending {
            self.apply_candidate(candidate).await;
        }
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        let Some(peer) = self.peer.as_ref() else {
            return;
        };
        if let Err(e) = peer.add_ice_candidate(candidate).await {
            warn!("Failed to add remote candidate: {}", e);
        }
    }

    fn handle_peer_state(&self, state: PeerState) -> Result<()> {
        if matches!(state, PeerState::Connected | PeerState::Failed) {
            let stats = analyze_candidates(&self.remote_candidates);
            self.snapshot.send_modify(|s| s.remote_candidates = stats);
        }
        match state {
            PeerState::Connected => info!("Media transport connected"),
            PeerState::Disconnected => warn!("Media transport disconnected"),
            PeerState::Failed => {
                return Err(Error::Peer(PeerError("peer connection failed".into())))
            }
            PeerState::Closed => {
                return Err(Error::Peer(PeerError("peer connection closed".into())))
            }
            PeerState::New | PeerState::Connecting => debug!("Peer state {:?}", state),
        }
        Ok(())
    }

    /// Releases local media, remote media, the peer connection and the
    /// channel, in that order. Runs at most once.
    async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        let local = self.media.release_local();
        let remote = self.media.release_remote();
        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.close().await {
                warn!("Error closing peer connection: {}", e);
            }
        }
        self.channel.close();
        self.candidates.clear();
        self.remote_candidates.clear();
        self.transition(NegotiationState::Terminated);
        info!(
            "Session terminated ({} local, {} remote tracks stopped)",
            local, remote
        );
    }
}
