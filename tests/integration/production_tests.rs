use consult_rtc::error::ChannelError;
use consult_rtc::peer::{IceCandidate, NegotiationState, SessionDescription};
use consult_rtc::relay::{router, Relay};
use consult_rtc::signaling::{
    ChannelState, SignalTransport, SignalingChannel, SignalingMessage, WebSocketTransport,
};
use consult_rtc::{
    ConsultConfig, MediaStatus, Role, Session, SessionDeps, SessionHandle, SessionOptions,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;

use crate::integration::init_tracing;
use crate::utils::{next_message, next_of_kind, wait_state, FakePeerFactory, WAIT};

/// webrtc-rs needs a few seconds for ICE and DTLS on loopback.
const MEDIA_WAIT: Duration = Duration::from_secs(30);

/// Serves the relay's WebSocket router on an ephemeral local port.
async fn serve_relay(relay: Relay) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(relay)).await.unwrap();
    });
    addr
}

fn origin(addr: SocketAddr) -> SessionOptions {
    SessionOptions {
        config: ConsultConfig {
            origin: format!("http://{addr}"),
            ..ConsultConfig::default()
        },
        ..SessionOptions::default()
    }
}

async fn wait_connected(handle: &SessionHandle) {
    let snapshot = timeout(MEDIA_WAIT, handle.wait_for_state(NegotiationState::Connected))
        .await
        .unwrap_or_else(|_| panic!("{} never connected, at {}", handle.role(), handle.state()));
    assert_eq!(snapshot.state, NegotiationState::Connected, "{:?}", snapshot.failure);
}

#[tokio::test(flavor = "multi_thread")]
async fn webrtc_sessions_connect_over_relay() {
    init_tracing();
    let relay = Relay::new();
    let config = ConsultConfig::default();
    let deps = || SessionDeps {
        transport: Arc::new(relay.clone()),
        ..SessionDeps::webrtc(&config)
    };
    let options = |role: Role| SessionOptions {
        endpoint: Some(format!("ws://clinic.test/ws/live-consultation/{}", role.path())),
        ..SessionOptions::default()
    };

    let sender = Session::start(Role::Sender, deps(), options(Role::Sender)).unwrap();
    let receiver = Session::start(Role::Receiver, deps(), options(Role::Receiver)).unwrap();
    wait_connected(&sender).await;
    wait_connected(&receiver).await;

    for handle in [&sender, &receiver] {
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.media, MediaStatus::Live { tracks: 2 });
        assert_eq!(snapshot.failure, None);
    }
    sender.end().await;
    receiver.end().await;
}

#[tokio::test]
async fn websocket_channel_delivers_in_order() {
    init_tracing();
    let relay = Relay::new();
    let addr = serve_relay(relay.clone()).await;
    let (_, mut far_end) = relay.connect(Role::Receiver);
    let channel = SignalingChannel::new(Arc::new(WebSocketTransport));

    let sent = vec![
        SignalingMessage::Offer {
            sdp: SessionDescription::offer("v=0\r\n"),
        },
        SignalingMessage::IceCandidate {
            candidate: IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 1 typ host"),
        },
        SignalingMessage::IceCandidate {
            candidate: IceCandidate::new("candidate:2 1 udp 1 10.0.0.2 2 typ host"),
        },
    ];
    for msg in &sent {
        channel.send(msg).unwrap();
    }
    channel.open(format!("ws://{addr}/ws/live-consultation/sender"));
    for expected in &sent {
        assert_eq!(&next_message(&mut far_end).await, expected);
    }
    assert_eq!(channel.state(), ChannelState::Open);
    assert_eq!(channel.pending_len(), 0);
    assert!(channel.close());
}

#[tokio::test]
async fn session_negotiates_through_served_relay() {
    init_tracing();
    let relay = Relay::new();
    let addr = serve_relay(relay.clone()).await;
    let (_, mut far_end) = relay.connect(Role::Receiver);
    let peers = FakePeerFactory::new();
    let sender = Session::start(
        Role::Sender,
        SessionDeps {
            peers: peers.clone(),
            ..SessionDeps::webrtc(&ConsultConfig::default())
        },
        origin(addr),
    )
    .unwrap();

    let SignalingMessage::Offer { sdp } = next_of_kind(&mut far_end, "offer").await else {
        unreachable!()
    };
    assert_eq!(sdp.sdp.matches("a=sendrecv").count(), 2);

    let answer = SignalingMessage::Answer {
        sdp: SessionDescription::answer(sdp.sdp.clone()),
    };
    relay.relay(Role::Receiver, answer.to_json());
    wait_state(&sender, NegotiationState::Connected).await;
    assert_eq!(peers.peer().await.remote().unwrap().sdp, sdp.sdp);

    sender.end().await;
    timeout(WAIT, async {
        while relay.is_connected(Role::Sender) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("socket closed on hang up");
}

#[tokio::test]
async fn served_relay_refuses_unknown_role() {
    init_tracing();
    let addr = serve_relay(Relay::new()).await;
    let err = WebSocketTransport
        .connect(&format!("ws://{addr}/ws/live-consultation/doctor"))
        .await
        .err()
        .unwrap();
    let ChannelError::Connect(reason) = err else {
        panic!("unexpected error: {err}")
    };
    assert!(reason.contains("404"), "{reason}");
}
