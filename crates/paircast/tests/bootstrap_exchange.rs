//! End-to-end bootstrap exchanges over the in-memory transport pair.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use paircast::config::{ManagerConfig, RetryPolicy};
use paircast::manager::{ConnectionManager, ManagerError, ManagerEvent};
use paircast::message::MessageError;
use paircast::session::SessionState;
use paircast_transport::mock::{MockTransport, MockTransportFactory};

const WAIT: Duration = Duration::from_secs(2);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn manager_pair(
    budget: u8,
    config: ManagerConfig,
) -> (
    (Arc<ConnectionManager>, UnboundedReceiver<ManagerEvent>),
    (Arc<ConnectionManager>, UnboundedReceiver<ManagerEvent>),
    (Arc<MockTransport>, Arc<MockTransport>),
) {
    let ((ta, ea), (tb, eb)) = MockTransport::pair_with_budget(budget);
    let factory_a = Arc::new(MockTransportFactory::new());
    factory_a.queue(ta.clone(), ea);
    let factory_b = Arc::new(MockTransportFactory::new());
    factory_b.queue(tb.clone(), eb);
    let alice = ConnectionManager::new(config.clone(), factory_a, None);
    let bob = ConnectionManager::new(config, factory_b, None);
    (alice, bob, (ta, tb))
}

async fn next_message(
    events: &mut UnboundedReceiver<ManagerEvent>,
) -> paircast::message::ApplicationMessage {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("timed out waiting for message event");
        match timeout(remaining, events.recv()).await {
            Ok(Some(ManagerEvent::MessageReceived(message))) => return message,
            Ok(Some(_)) => continue,
            Ok(None) => panic!("event channel closed"),
            Err(_) => panic!("timed out waiting for message event"),
        }
    }
}

async fn collect_states(events: &mut UnboundedReceiver<ManagerEvent>) -> Vec<SessionState> {
    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ManagerEvent::SessionState(state) = event {
            states.push(state);
        }
    }
    states
}

// Scenario A: trickle bootstrap. Only the offer travels out-of-band; the
// answer and all candidates ride the data channel. Histories on both sides
// contain exactly the sent application messages, nothing else.
#[tokio::test]
async fn trickle_bootstrap_connects_and_exchanges_messages() {
    init_tracing();
    let ((alice, mut alice_events), (bob, mut bob_events), _) =
        manager_pair(2, ManagerConfig::default());

    let token = alice.create_offer(true).await.expect("offer token");
    assert!(token.is_trickle());
    assert!(token.ice_candidates.is_empty());
    assert!(token.offer.sdp.starts_with("v=0"));

    // Message sent before the channel exists is queued, not dropped.
    let queued = alice
        .send_message("payment-request", serde_json::json!({"amount": 5}))
        .await
        .expect_err("channel not up yet");
    assert!(matches!(
        queued,
        ManagerError::Message(MessageError::NotReady { .. })
    ));
    assert_eq!(alice.messages().queue_len(), 1);

    // The token crosses the visual channel armored in base64.
    let encoded = ConnectionManager::encode_token(&token).expect("armor");
    let scanned = ConnectionManager::decode_token(&encoded).expect("scan");
    let reply = bob.join_with_token(&scanned).await.expect("join");
    assert!(reply.is_none(), "trickle join returns no reverse token");

    alice.wait_until_connected(WAIT).await.expect("alice connected");
    bob.wait_until_connected(WAIT).await.expect("bob connected");

    // The queued message was flushed on channel-open.
    let first = next_message(&mut bob_events).await;
    assert_eq!(first.kind, "payment-request");
    assert_eq!(alice.messages().queue_len(), 0);

    let request = alice
        .send_message("payment-request", serde_json::json!({"amount": 9, "currency": "EUR"}))
        .await
        .expect("send");
    let ack = bob
        .send_message("payment-ack", serde_json::json!({"of": request.id}))
        .await
        .expect("ack");

    let second = next_message(&mut bob_events).await;
    assert_eq!(second.id, request.id);
    let received_ack = next_message(&mut alice_events).await;
    assert_eq!(received_ack.id, ack.id);

    // No signaling envelope leaked into either history.
    let bob_history: Vec<_> = bob.messages().history();
    assert_eq!(
        bob_history.iter().map(|m| m.id).collect::<Vec<_>>(),
        vec![first.id, request.id]
    );
    let alice_history = alice.messages().history();
    assert_eq!(
        alice_history.iter().map(|m| m.id).collect::<Vec<_>>(),
        vec![ack.id]
    );
    assert!(bob_history.iter().all(|m| m.kind != "answer" && m.kind != "ice-candidate"));

    alice.close().await;
    bob.close().await;
}

// Scenario B: non-trickle bootstrap. The responder returns the answer plus
// a capped candidate batch out-of-band; the initiator completes manually
// and passes through Connecting to Connected.
#[tokio::test]
async fn non_trickle_bootstrap_completes_with_reverse_token() {
    init_tracing();
    let ((alice, mut alice_events), (bob, _bob_events), (ta, _tb)) =
        manager_pair(5, ManagerConfig::default());

    let token = alice.create_offer(false).await.expect("offer token");
    assert!(!token.is_trickle());
    assert_eq!(token.ice_candidates.len(), 5);

    let reply = bob
        .join_with_token(&token)
        .await
        .expect("join")
        .expect("reverse token");
    assert_eq!(reply.candidates.len(), 3, "reverse batch capped at 3");

    alice
        .complete_offer(reply.answer.clone(), reply.candidates.clone())
        .await
        .expect("complete");

    alice.wait_until_connected(WAIT).await.expect("alice connected");
    bob.wait_until_connected(WAIT).await.expect("bob connected");

    let states = collect_states(&mut alice_events).await;
    let connecting_at = states
        .iter()
        .position(|s| *s == SessionState::Connecting)
        .expect("saw Connecting");
    let connected_at = states
        .iter()
        .position(|s| *s == SessionState::Connected)
        .expect("saw Connected");
    assert!(connecting_at < connected_at);

    assert_eq!(ta.applied_candidates().len(), 3);

    alice.close().await;
    bob.close().await;
}

// A second join attempt with the same manager replaces the session rather
// than corrupting it.
#[tokio::test]
async fn stale_token_is_rejected_before_any_transport_work() {
    init_tracing();
    let ((_alice, _alice_events), (bob, _bob_events), _) =
        manager_pair(0, ManagerConfig::default());

    let mut metadata = paircast_token::TokenMetadata::new("conn-stale", true);
    metadata.created_at_ms = paircast_token::now_ms().saturating_sub(3_600_000);
    let token = paircast_token::BootstrapToken::new(
        paircast_token::SessionDescription::offer("v=0\r\n"),
        Vec::new(),
        metadata,
    );
    let err = bob.join_with_token(&token).await.expect_err("stale");
    assert!(matches!(err, ManagerError::TokenValidation(_)));
    assert!(bob.session().is_none(), "no session minted for a stale token");
}

#[tokio::test]
async fn transport_failure_without_auto_retry_terminates() {
    init_tracing();
    let ((alice, mut alice_events), (bob, _bob_events), (ta, _tb)) =
        manager_pair(1, ManagerConfig::default());

    let token = alice.create_offer(true).await.expect("token");
    bob.join_with_token(&token).await.expect("join");
    alice.wait_until_connected(WAIT).await.expect("connected");

    ta.inject_failure();
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("timed out waiting for termination");
        match timeout(remaining, alice_events.recv()).await {
            Ok(Some(ManagerEvent::Terminated { reason })) => {
                assert!(reason.contains("failed"));
                break;
            }
            Ok(Some(_)) => continue,
            other => panic!("unexpected event outcome: {other:?}"),
        }
    }
    assert_eq!(
        alice.session().expect("session").state(),
        SessionState::Failed
    );
}

#[tokio::test]
async fn auto_retry_schedules_backoff_then_signals_manual_rebootstrap() {
    init_tracing();
    let mut config = ManagerConfig::default();
    config.retry = RetryPolicy {
        auto_retry: true,
        max_retries: 2,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
        ..RetryPolicy::default()
    };
    let ((alice, mut alice_events), (bob, _bob_events), (ta, _tb)) = manager_pair(1, config);

    let token = alice.create_offer(true).await.expect("token");
    bob.join_with_token(&token).await.expect("join");
    alice.wait_until_connected(WAIT).await.expect("connected");

    ta.inject_failure();

    let mut scheduled = None;
    let mut ready = None;
    let deadline = tokio::time::Instant::now() + WAIT;
    while (scheduled.is_none() || ready.is_none()) && tokio::time::Instant::now() < deadline {
        match timeout(Duration::from_millis(100), alice_events.recv()).await {
            Ok(Some(ManagerEvent::RetryScheduled { attempt, delay })) => {
                scheduled = Some((attempt, delay));
            }
            Ok(Some(ManagerEvent::RetryReady { attempt })) => {
                ready = Some(attempt);
            }
            Ok(Some(_)) => continue,
            Ok(None) => panic!("event channel closed"),
            Err(_) => continue,
        }
    }
    let (attempt, delay) = scheduled.expect("retry scheduled");
    assert_eq!(attempt, 1);
    assert_eq!(delay, Duration::from_millis(10));
    assert_eq!(ready.expect("retry window elapsed"), 1);
}
