use consult_rtc::peer::{IceCandidate, NegotiationState, SessionDescription};
use consult_rtc::relay::Relay;
use consult_rtc::signaling::{ChannelState, SignalingChannel, SignalingMessage};
use consult_rtc::Role;
use std::sync::Arc;

use crate::integration::{init_tracing, offer_frame};
use crate::utils::{endpoint, next_message, start, wait_state, FakePeerFactory};

#[tokio::test]
async fn messages_queued_before_open_arrive_in_order() {
    init_tracing();
    let relay = Relay::new();
    let (_, mut far_end) = relay.connect(Role::Receiver);
    let channel = SignalingChannel::new(Arc::new(relay.clone()));

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
    assert_eq!(channel.pending_len(), 3);

    channel.open(endpoint(Role::Sender));
    for expected in &sent {
        assert_eq!(&next_message(&mut far_end).await, expected);
    }
    assert_eq!(channel.pending_len(), 0);
    assert_eq!(channel.state(), ChannelState::Open);
    assert!(channel.close());
}

#[tokio::test]
async fn close_is_idempotent() {
    let relay = Relay::new();
    let never_opened = SignalingChannel::new(Arc::new(relay.clone()));
    assert!(!never_opened.close());
    assert!(!never_opened.close());

    let channel = SignalingChannel::new(Arc::new(relay));
    channel.open(endpoint(Role::Receiver));
    channel
        .send(&SignalingMessage::IceCandidate {
            candidate: IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 1 typ host"),
        })
        .unwrap();
    assert!(channel.close());
    assert!(!channel.close());
    assert_eq!(channel.pending_len(), 0);
    assert_eq!(channel.state(), ChannelState::Closed);
}

#[tokio::test]
async fn malformed_frames_leave_the_session_untouched() {
    init_tracing();
    let relay = Relay::new();
    let receiver = start(&relay, Role::Receiver, FakePeerFactory::new());
    wait_state(&receiver, NegotiationState::AwaitingOffer).await;

    for garbage in [
        "not json at all",
        r#"{"sdp":{"type":"offer","sdp":"v=0"}}"#,
        r#"{"type":"renegotiate"}"#,
        r#"{"type":"ice"}"#,
    ] {
        relay.relay(Role::Sender, garbage.to_owned());
    }
    tokio::task::yield_now().await;
    let snapshot = receiver.snapshot();
    assert_eq!(snapshot.state, NegotiationState::AwaitingOffer);
    assert_eq!(snapshot.failure, None);

    // still listening
    relay.relay(Role::Sender, offer_frame());
    wait_state(&receiver, NegotiationState::Connected).await;
}

#[tokio::test]
async fn stray_answer_is_ignored_by_the_receiver() {
    init_tracing();
    let relay = Relay::new();
    let receiver = start(&relay, Role::Receiver, FakePeerFactory::new());
    wait_state(&receiver, NegotiationState::AwaitingOffer).await;

    relay.relay(
        Role::Sender,
        SignalingMessage::Answer {
            sdp: SessionDescription::answer("v=0\r\n"),
        }
        .to_json(),
    );
    relay.relay(Role::Sender, offer_frame());
    wait_state(&receiver, NegotiationState::Connected).await;
}
