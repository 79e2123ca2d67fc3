use async_trait::async_trait;
use consult_rtc::error::DeviceError;
use consult_rtc::media::{LocalStream, MediaConstraints, MediaDevices, SampleDevices};
use consult_rtc::peer::{CallStatus, NegotiationState};
use consult_rtc::relay::Relay;
use consult_rtc::{Role, Session};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;

use crate::integration::init_tracing;
use crate::utils::{deps, options, start, wait_state, FakePeerFactory, WAIT};

/// Holds the permission prompt open until released.
struct PromptDevices {
    answered: Arc<Notify>,
}

#[async_trait]
impl MediaDevices for PromptDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalStream, DeviceError> {
        self.answered.notified().await;
        SampleDevices::default().get_user_media(constraints).await
    }
}

#[tokio::test]
async fn channel_drop_mid_call_stops_everything() {
    init_tracing();
    let relay = Relay::new();
    let receiver_peers = FakePeerFactory::new();
    let sender = start(&relay, Role::Sender, FakePeerFactory::new());
    let receiver = start(&relay, Role::Receiver, receiver_peers.clone());
    wait_state(&sender, NegotiationState::Connected).await;
    wait_state(&receiver, NegotiationState::Connected).await;

    let local = receiver.media().local_stream().unwrap();
    let remote = receiver.media().remote_streams();
    assert!(local.tracks().iter().all(|t| t.is_live()));

    assert!(relay.drop_role(Role::Receiver));
    let snapshot = wait_state(&receiver, NegotiationState::Terminated).await;

    assert_eq!(snapshot.call_status(), CallStatus::Ended);
    assert!(snapshot.failure.unwrap().contains("dropped"));
    assert!(local.tracks().iter().all(|t| !t.is_live()));
    assert!(remote.iter().flat_map(|s| s.tracks()).all(|t| !t.is_live()));
    assert!(receiver.media().remote_streams().is_empty());
    assert!(receiver_peers.peer().await.closed.load(Ordering::SeqCst));
    assert_eq!(receiver.pending_outbound(), 0);

    // the other side is unaffected until it hangs up
    assert_eq!(sender.state(), NegotiationState::Connected);
    sender.end().await;
}

#[tokio::test]
async fn end_twice_is_harmless() {
    init_tracing();
    let relay = Relay::new();
    let peers = FakePeerFactory::new();
    let receiver = start(&relay, Role::Receiver, peers.clone());
    wait_state(&receiver, NegotiationState::AwaitingOffer).await;

    receiver.end().await;
    receiver.end().await;
    let snapshot = receiver.snapshot();
    assert_eq!(snapshot.state, NegotiationState::Terminated);
    assert_eq!(snapshot.failure, None);
    assert!(peers.peer().await.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn end_while_waiting_for_permission() {
    init_tracing();
    let relay = Relay::new();
    let answered = Arc::new(Notify::new());
    let sender = Session::start(
        Role::Sender,
        deps(
            &relay,
            FakePeerFactory::new(),
            Arc::new(PromptDevices {
                answered: answered.clone(),
            }),
        ),
        options(Role::Sender),
    )
    .unwrap();
    wait_state(&sender, NegotiationState::AwaitingLocalMedia).await;

    sender.end().await;
    answered.notify_waiters();
    assert_eq!(sender.state(), NegotiationState::Terminated);
    assert!(sender.media().local_stream().is_none());
    assert_eq!(relay.held_for(Role::Receiver), 0);
}

#[tokio::test]
async fn transport_failure_ends_the_call() {
    init_tracing();
    let relay = Relay::new();
    let sender_peers = FakePeerFactory::new();
    let sender = start(&relay, Role::Sender, sender_peers.clone());
    let receiver = start(&relay, Role::Receiver, FakePeerFactory::new());
    wait_state(&sender, NegotiationState::Connected).await;

    sender_peers.peer().await.fail_transport();
    let snapshot = wait_state(&sender, NegotiationState::Terminated).await;
    assert_eq!(snapshot.failure.as_deref(), Some("peer connection error: peer connection failed"));
    receiver.end().await;
}

#[tokio::test]
async fn dropping_every_handle_hangs_up() {
    init_tracing();
    let relay = Relay::new();
    let peers = FakePeerFactory::new();
    let receiver = start(&relay, Role::Receiver, peers.clone());
    let mut updates = receiver.subscribe();
    wait_state(&receiver, NegotiationState::AwaitingOffer).await;

    drop(receiver);
    let ended = updates.wait_for(|s| s.state.is_terminal()).await.is_ok();
    assert!(ended);
    assert!(peers.peer().await.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn sender_ending_before_receiver_joins_leaves_nothing_behind() {
    init_tracing();
    let relay = Relay::new();
    let sender = start(&relay, Role::Sender, FakePeerFactory::new());
    wait_state(&sender, NegotiationState::AwaitingAnswer).await;
    assert!(relay.held_for(Role::Receiver) > 0);

    sender.end().await;
    timeout(WAIT, async {
        while relay.is_connected(Role::Sender) || relay.held_for(Role::Receiver) > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("relay forgot the sender");

    // a later receiver must not pick up the stale offer
    let receiver = start(&relay, Role::Receiver, FakePeerFactory::new());
    wait_state(&receiver, NegotiationState::AwaitingOffer).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(receiver.state(), NegotiationState::AwaitingOffer);
    receiver.end().await;
}
