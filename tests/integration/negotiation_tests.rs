use consult_rtc::peer::ice::CandidateStats;
use consult_rtc::peer::NegotiationState;
use consult_rtc::relay::Relay;
use consult_rtc::signaling::SignalingMessage;
use consult_rtc::Role;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::timeout;

use crate::integration::{ice_frame, init_tracing, offer_frame};
use crate::utils::{next_of_kind, start, wait_state, FailPlan, FakePeerFactory, WAIT};

#[tokio::test]
async fn sender_and_receiver_connect_through_relay() {
    init_tracing();
    let relay = Relay::new();
    let sender_peers = FakePeerFactory::new();
    let receiver_peers = FakePeerFactory::new();

    let sender = start(&relay, Role::Sender, sender_peers.clone());
    wait_state(&sender, NegotiationState::AwaitingAnswer).await;
    let receiver = start(&relay, Role::Receiver, receiver_peers.clone());

    wait_state(&receiver, NegotiationState::Connected).await;
    wait_state(&sender, NegotiationState::Connected).await;

    let offer = sender_peers.peer().await.local().unwrap();
    assert_eq!(offer.sdp.matches("a=sendrecv").count(), 2);
    assert_eq!(offer.media_sections("audio"), 1);
    assert_eq!(offer.media_sections("video"), 1);

    // candidates trickled ahead of the descriptions were replayed
    assert_eq!(receiver_peers.peer().await.accepted_candidates().len(), 1);
    assert_eq!(sender_peers.peer().await.accepted_candidates().len(), 1);

    let remote = receiver.media().remote_streams();
    assert_eq!(remote.len(), 1);
    assert_eq!(remote[0].tracks().len(), 2);
    assert_eq!(sender.media().remote_streams()[0].tracks().len(), 2);

    assert_eq!(sender.snapshot().failure, None);
    sender.end().await;
    receiver.end().await;
}

#[tokio::test]
async fn receiver_waits_for_offer_indefinitely() {
    init_tracing();
    let relay = Relay::new();
    let receiver = start(&relay, Role::Receiver, FakePeerFactory::new());

    wait_state(&receiver, NegotiationState::AwaitingOffer).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(receiver.state(), NegotiationState::AwaitingOffer);

    let sender = start(&relay, Role::Sender, FakePeerFactory::new());
    wait_state(&sender, NegotiationState::Connected).await;
    wait_state(&receiver, NegotiationState::Connected).await;
}

#[tokio::test]
async fn second_offer_is_rejected() {
    init_tracing();
    let relay = Relay::new();
    let (_, mut far_end) = relay.connect(Role::Sender);
    let peers = FakePeerFactory::new();
    let receiver = start(&relay, Role::Receiver, peers.clone());
    wait_state(&receiver, NegotiationState::AwaitingOffer).await;

    relay.relay(Role::Sender, offer_frame());
    wait_state(&receiver, NegotiationState::Connected).await;
    assert!(matches!(
        next_of_kind(&mut far_end, "answer").await,
        SignalingMessage::Answer { .. }
    ));

    relay.relay(Role::Sender, offer_frame());
    // a candidate behind the second offer proves it was processed
    relay.relay(Role::Sender, ice_frame("candidate:9 1 udp 1 10.0.0.9 9 typ host"));
    let peer = peers.peer().await;
    while peer.accepted_candidates().is_empty() {
        tokio::task::yield_now().await;
    }

    assert_eq!(receiver.state(), NegotiationState::Connected);
    while let Ok(text) = far_end.try_recv() {
        assert!(!text.contains("\"answer\""), "unexpected second answer: {text}");
    }
}

#[tokio::test]
async fn early_candidates_wait_for_the_offer() {
    init_tracing();
    let relay = Relay::new();
    let peers = FakePeerFactory::new();
    let receiver = start(&relay, Role::Receiver, peers.clone());
    wait_state(&receiver, NegotiationState::AwaitingOffer).await;

    relay.relay(Role::Sender, ice_frame("candidate:1 1 udp 1 10.0.0.1 5000 typ host"));
    relay.relay(Role::Sender, ice_frame("candidate:2 1 udp 1 203.0.113.4 5001 typ srflx"));
    relay.relay(Role::Sender, offer_frame());
    wait_state(&receiver, NegotiationState::Connected).await;

    let accepted = peers.peer().await.accepted_candidates();
    assert_eq!(accepted.len(), 2);
    assert_eq!(accepted[0].candidate_type(), Some("host"));
    assert_eq!(accepted[1].candidate_type(), Some("srflx"));

    let expected = CandidateStats {
        host: 1,
        srflx: 1,
        relay: 0,
    };
    let snapshot = timeout(WAIT, receiver.wait_for(|s| s.remote_candidates == expected))
        .await
        .expect("candidate stats recorded");
    assert_eq!(snapshot.state, NegotiationState::Connected);
}

#[tokio::test]
async fn offer_creation_is_retried_once() {
    init_tracing();
    let relay = Relay::new();
    let plan = FailPlan::default();
    plan.create_offer.store(1, Ordering::SeqCst);
    let peers = FakePeerFactory::with_plan(plan);

    let sender = start(&relay, Role::Sender, peers.clone());
    wait_state(&sender, NegotiationState::AwaitingAnswer).await;
    assert_eq!(peers.peer().await.create_offer_calls.load(Ordering::SeqCst), 2);
    sender.end().await;
}

#[tokio::test]
async fn repeated_negotiation_failure_ends_the_call() {
    init_tracing();
    let relay = Relay::new();
    let plan = FailPlan::default();
    plan.create_offer.store(2, Ordering::SeqCst);
    let peers = FakePeerFactory::with_plan(plan);

    let sender = start(&relay, Role::Sender, peers.clone());
    let snapshot = wait_state(&sender, NegotiationState::Terminated).await;
    let failure = snapshot.failure.unwrap();
    assert!(failure.contains("create offer"), "{failure}");
    assert!(peers.peer().await.closed.load(Ordering::SeqCst));
    assert_eq!(relay.held_for(Role::Receiver), 0);
}

#[tokio::test]
async fn remote_description_glitch_is_retried() {
    init_tracing();
    let relay = Relay::new();
    let plan = FailPlan::default();
    plan.set_remote_description.store(1, Ordering::SeqCst);
    let receiver = start(&relay, Role::Receiver, FakePeerFactory::with_plan(plan));
    let sender = start(&relay, Role::Sender, FakePeerFactory::new());

    wait_state(&receiver, NegotiationState::Connected).await;
    wait_state(&sender, NegotiationState::Connected).await;
}
