use pubsub::{HandshakeMode, JwtTokenIssuer, MemoryBroker, StalledCall};
use shared::{domain::MessagePriority, error::ErrorCode};

use super::*;
use crate::clock::ManualClock;

struct Harness {
    broker: MemoryBroker,
    supervisor: Arc<ConnectionSupervisor>,
    queue: Arc<OfflineQueue>,
    deliveries: Arc<DeliveryTracker>,
}

fn harness() -> Harness {
    harness_with(RealtimeSettings::default())
}

fn harness_with(settings: RealtimeSettings) -> Harness {
    let broker = MemoryBroker::with_token_verification(settings.token_config());
    let clock = Arc::new(ManualClock::default());
    let queue = Arc::new(OfflineQueue::new(settings.offline_queue(), clock.clone()));
    let deliveries = Arc::new(DeliveryTracker::new(clock.clone()));
    let supervisor = ConnectionSupervisor::new(
        Arc::new(broker.clone()),
        Arc::new(JwtTokenIssuer::new(settings.token_config())),
        settings,
        clock,
        queue.clone(),
        deliveries.clone(),
    );
    Harness {
        broker,
        supervisor,
        queue,
        deliveries,
    }
}

fn conversation() -> ConversationId {
    ConversationId::from("c1")
}

fn user(name: &str) -> UserId {
    UserId::from(name)
}

fn message(id: &str, sender: &str, recipients: &[&str]) -> ConversationMessage {
    ConversationMessage {
        message_id: MessageId::from(id),
        conversation_id: conversation(),
        sender_id: user(sender),
        sequence: 1,
        recipients: recipients.iter().map(|name| user(name)).collect(),
        payload: serde_json::json!({ "text": "rebuttal" }),
        priority: MessagePriority::Normal,
        sent_at: Utc::now(),
    }
}

async fn next_matching<T>(
    events: &mut broadcast::Receiver<RealtimeEvent>,
    mut pick: impl FnMut(RealtimeEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(event) {
                        return found;
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("expected event did not arrive")
}

#[tokio::test(start_paused = true)]
async fn connect_joins_channels_and_enters_presence() {
    let h = harness();
    let state = h
        .supervisor
        .connect(&conversation(), &user("alice"))
        .await
        .expect("connect");

    assert_eq!(state.status, ConnectionStatus::Connected);
    assert_eq!(state.reconnect_attempts, 0);
    assert_eq!(state.connection_id.as_deref(), Some("mem-1"));
    assert_eq!(state.client_id.as_deref(), Some("alice"));
    assert!(state.last_connected.is_some());

    let channels = h
        .supervisor
        .list_channels(&conversation(), &user("alice"))
        .await;
    assert_eq!(channels.len(), 4);

    let members = h.broker.presence_members("conversation:c1");
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].data["action"], "joined");
    assert_eq!(h.broker.presence_members("presence:c1").len(), 1);
    assert!(h.broker.presence_members("moderation:c1").is_empty());
    assert!(h.broker.presence_members("coaching:alice:c1").is_empty());
}

#[tokio::test(start_paused = true)]
async fn connect_is_idempotent_while_connected() {
    let h = harness();
    h.supervisor
        .connect(&conversation(), &user("alice"))
        .await
        .expect("first connect");
    let again = h
        .supervisor
        .connect(&conversation(), &user("alice"))
        .await
        .expect("second connect");

    assert_eq!(again.status, ConnectionStatus::Connected);
    assert_eq!(h.broker.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn stalled_handshake_times_out_and_fails() {
    let h = harness();
    h.broker.set_handshake(HandshakeMode::Stall);

    let err = h
        .supervisor
        .connect(&conversation(), &user("alice"))
        .await
        .expect_err("should time out");
    assert!(matches!(err, RealtimeError::ConnectionTimeout { .. }));

    let state = h
        .supervisor
        .get_connection_state(&conversation(), &user("alice"))
        .await
        .expect("state kept");
    assert_eq!(state.status, ConnectionStatus::Failed);
    assert_eq!(h.broker.live_clients(), 0);
}

#[tokio::test(start_paused = true)]
async fn refused_initial_connect_is_not_retried() {
    let h = harness();
    h.broker.set_handshake(HandshakeMode::Refuse);

    let err = h
        .supervisor
        .connect(&conversation(), &user("alice"))
        .await
        .expect_err("should be refused");
    assert_eq!(err.code(), ErrorCode::Unauthorized);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.broker.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_connection_recovers_on_explicit_connect() {
    let h = harness();
    h.broker.set_handshake(HandshakeMode::Refuse);
    assert!(h
        .supervisor
        .connect(&conversation(), &user("alice"))
        .await
        .is_err());

    h.broker.set_handshake(HandshakeMode::Accept);
    let state = h
        .supervisor
        .connect(&conversation(), &user("alice"))
        .await
        .expect("connect after failure");
    assert_eq!(state.status, ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn reconnect_backoff_walks_the_table_then_fails() {
    let h = harness();
    h.supervisor
        .connect(&conversation(), &user("alice"))
        .await
        .expect("connect");
    let mut events = h.supervisor.subscribe_events();

    h.broker.set_handshake(HandshakeMode::Refuse);
    h.broker.interrupt("alice", TransportState::Disconnected);

    let mut delays = Vec::new();
    let failure = next_matching(&mut events, |event| match event {
        RealtimeEvent::ReconnectScheduled { delay, .. } => {
            delays.push(delay.as_secs());
            None
        }
        RealtimeEvent::ConnectionFailed { error, .. } => Some(error),
        _ => None,
    })
    .await;

    assert_eq!(delays, vec![1, 2, 4, 8, 16, 30]);
    assert_eq!(failure.code, ErrorCode::ReconnectRequired);
    assert!(failure.requires_user_action());

    let state = h
        .supervisor
        .get_connection_state(&conversation(), &user("alice"))
        .await
        .expect("state kept");
    assert_eq!(state.status, ConnectionStatus::Failed);
    assert_eq!(state.reconnect_attempts, 6);
    assert_eq!(h.broker.open_count(), 7);
}

#[tokio::test(start_paused = true)]
async fn reconnect_replays_channels_with_reconnected_presence() {
    let h = harness();
    h.supervisor
        .connect(&conversation(), &user("alice"))
        .await
        .expect("connect");
    let mut events = h.supervisor.subscribe_events();

    h.broker.interrupt("alice", TransportState::Suspended);

    let recovered = next_matching(&mut events, |event| match event {
        RealtimeEvent::ConnectionStateChanged(state)
            if state.status == ConnectionStatus::Connected =>
        {
            Some(state)
        }
        _ => None,
    })
    .await;

    assert_eq!(recovered.reconnect_attempts, 0);
    assert_eq!(recovered.connection_id.as_deref(), Some("mem-2"));

    let members = h.broker.presence_members("conversation:c1");
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].connection_id, "mem-2");
    assert_eq!(members[0].data["action"], "reconnected");
    assert_eq!(h.broker.presence_members("presence:c1").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn health_check_detects_a_silently_dropped_link() {
    let h = harness();
    h.supervisor
        .connect(&conversation(), &user("alice"))
        .await
        .expect("connect");
    let mut events = h.supervisor.subscribe_events();

    h.broker.drop_silently("alice");

    let attempt = next_matching(&mut events, |event| match event {
        RealtimeEvent::ReconnectScheduled { attempt, .. } => Some(attempt),
        _ => None,
    })
    .await;
    assert_eq!(attempt, 1);

    let recovered = next_matching(&mut events, |event| match event {
        RealtimeEvent::ConnectionStateChanged(state)
            if state.status == ConnectionStatus::Connected =>
        {
            Some(state)
        }
        _ => None,
    })
    .await;
    assert_eq!(recovered.reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn health_check_records_latency() {
    let h = harness();
    h.broker.set_probe_latency(Duration::from_secs(6));
    h.supervisor
        .connect(&conversation(), &user("alice"))
        .await
        .expect("connect");

    tokio::time::sleep(Duration::from_secs(31)).await;

    let state = h
        .supervisor
        .get_connection_state(&conversation(), &user("alice"))
        .await
        .expect("state");
    assert_eq!(state.latency_ms, Some(6_000));
    assert_eq!(state.status, ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn disconnect_leaves_presence_and_closes_the_client() {
    let h = harness();
    h.supervisor
        .connect(&conversation(), &user("alice"))
        .await
        .expect("connect");

    let removed = h
        .supervisor
        .disconnect(&conversation(), Some(&user("alice")))
        .await;

    assert_eq!(removed, 1);
    assert!(h
        .supervisor
        .get_connection_state(&conversation(), &user("alice"))
        .await
        .is_none());
    assert!(h.broker.presence_members("conversation:c1").is_empty());
    assert!(h.broker.presence_members("presence:c1").is_empty());
    assert_eq!(h.broker.live_clients(), 0);
    assert!(h
        .supervisor
        .list_channels(&conversation(), &user("alice"))
        .await
        .is_empty());
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_a_pending_reconnect() {
    let h = harness();
    h.supervisor
        .connect(&conversation(), &user("alice"))
        .await
        .expect("connect");
    let mut events = h.supervisor.subscribe_events();

    h.broker.interrupt("alice", TransportState::Disconnected);
    next_matching(&mut events, |event| match event {
        RealtimeEvent::ReconnectScheduled { .. } => Some(()),
        _ => None,
    })
    .await;

    h.supervisor
        .disconnect(&conversation(), Some(&user("alice")))
        .await;
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(h.broker.open_count(), 1);
    assert_eq!(h.broker.live_clients(), 0);
}

#[tokio::test(start_paused = true)]
async fn disconnect_without_user_removes_the_whole_conversation() {
    let h = harness();
    let other = ConversationId::from("c2");
    for (conversation_id, name) in [
        (conversation(), "alice"),
        (conversation(), "bob"),
        (other.clone(), "carol"),
    ] {
        h.supervisor
            .connect(&conversation_id, &user(name))
            .await
            .expect("connect");
    }

    assert_eq!(h.supervisor.disconnect(&conversation(), None).await, 2);
    assert!(h.supervisor.is_connected(&other, &user("carol")).await);
    assert!(!h.supervisor.is_connected(&conversation(), &user("bob")).await);
}

#[tokio::test(start_paused = true)]
async fn queued_messages_are_delivered_on_connect() {
    let h = harness();
    let queued = message("m1", "alice", &["bob"]);
    h.deliveries
        .create_delivery(&queued.message_id, &queued.recipients)
        .await;
    h.queue
        .enqueue(&user("bob"), &conversation(), queued.clone())
        .await;
    let mut events = h.supervisor.subscribe_events();

    h.supervisor
        .connect(&conversation(), &user("bob"))
        .await
        .expect("connect");

    let received = next_matching(&mut events, |event| match event {
        RealtimeEvent::MessageReceived { user_id, message } if user_id == user("bob") => {
            Some(message)
        }
        _ => None,
    })
    .await;
    assert_eq!(received.message_id, queued.message_id);
    assert_eq!(h.queue.len(&user("bob"), &conversation()).await, 0);

    let status = h
        .deliveries
        .get_status(&queued.message_id)
        .await
        .expect("tracked");
    assert_eq!(status[&user("bob")], shared::domain::DeliveryStatus::Delivered);
}

#[tokio::test(start_paused = true)]
async fn live_messages_are_received_once() {
    let h = harness();
    for name in ["alice", "bob"] {
        h.supervisor
            .connect(&conversation(), &user(name))
            .await
            .expect("connect");
    }
    let mut events = h.supervisor.subscribe_events();
    let sender = h
        .supervisor
        .connected_client(&conversation(), &user("alice"))
        .await
        .expect("alice connected");

    let first = message("m1", "alice", &["bob"]);
    let second = message("m2", "alice", &["bob"]);
    for outgoing in [&first, &first, &second] {
        sender
            .publish(
                "conversation:c1",
                MESSAGE_EVENT_NAME,
                serde_json::to_value(outgoing).expect("serialize"),
            )
            .await
            .expect("publish");
    }

    let mut received = Vec::new();
    next_matching(&mut events, |event| match event {
        RealtimeEvent::MessageReceived { message, .. } => {
            received.push(message.message_id.clone());
            (message.message_id == second.message_id).then_some(())
        }
        _ => None,
    })
    .await;
    assert_eq!(received, vec![first.message_id, second.message_id]);
}

#[tokio::test(start_paused = true)]
async fn add_channel_respects_connection_and_capabilities() {
    let h = harness();
    let err = h
        .supervisor
        .add_channel(&conversation(), &user("alice"), "conversation:side-room")
        .await
        .expect_err("not connected yet");
    assert!(matches!(err, RealtimeError::NotConnected { .. }));

    h.supervisor
        .connect(&conversation(), &user("alice"))
        .await
        .expect("connect");

    let joined = h
        .supervisor
        .add_channel(&conversation(), &user("alice"), "conversation:side-room")
        .await
        .expect("allowed channel");
    assert_eq!(joined.kind, ChannelKind::Conversation);
    assert!(h
        .supervisor
        .get_channel(&conversation(), &user("alice"), "conversation:side-room")
        .await
        .is_some());

    let err = h
        .supervisor
        .add_channel(&conversation(), &user("alice"), "coaching:bob:c1")
        .await
        .expect_err("another user's coaching channel");
    assert!(matches!(err, RealtimeError::Transport(_)));
    assert!(h
        .supervisor
        .get_channel(&conversation(), &user("alice"), "coaching:bob:c1")
        .await
        .is_none());
}

#[test]
fn new_connection_reads_as_connecting() {
    let connection = ManagedConnection::new(ConnectionKey::new(conversation(), user("alice")));
    let state = connection.view().state;
    assert_eq!(state.status, ConnectionStatus::Connecting);
    assert_eq!(state.reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn queued_messages_stay_queued_without_a_subscriber() {
    let h = harness();
    let queued = message("m1", "alice", &["bob"]);
    h.deliveries
        .create_delivery(&queued.message_id, &queued.recipients)
        .await;
    h.queue
        .enqueue(&user("bob"), &conversation(), queued.clone())
        .await;

    h.supervisor
        .connect(&conversation(), &user("bob"))
        .await
        .expect("connect");
    assert_eq!(h.queue.len(&user("bob"), &conversation()).await, 1);
    let status = h.deliveries.get_status(&queued.message_id).await.expect("tracked");
    assert_eq!(status[&user("bob")], shared::domain::DeliveryStatus::Pending);

    let mut events = h.supervisor.subscribe_events();
    h.supervisor
        .disconnect(&conversation(), Some(&user("bob")))
        .await;
    h.supervisor
        .connect(&conversation(), &user("bob"))
        .await
        .expect("reconnect");

    let received = next_matching(&mut events, |event| match event {
        RealtimeEvent::MessageReceived { message, .. } => Some(message),
        _ => None,
    })
    .await;
    assert_eq!(received.message_id, queued.message_id);
    assert_eq!(h.queue.len(&user("bob"), &conversation()).await, 0);
    let delivery = h
        .deliveries
        .get_delivery(&queued.message_id)
        .await
        .expect("tracked");
    assert_eq!(delivery.retry_count, 1);
    assert_eq!(
        delivery.recipients[&user("bob")],
        shared::domain::DeliveryStatus::Delivered
    );
}

#[tokio::test(start_paused = true)]
async fn disconnect_completes_while_a_connect_is_stuck_attaching() {
    let h = harness();
    h.broker.set_stalled(StalledCall::Attach, true);

    let supervisor = Arc::clone(&h.supervisor);
    let connecting = tokio::spawn(async move {
        supervisor.connect(&conversation(), &user("alice")).await
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.broker.live_clients(), 1);

    let removed = tokio::time::timeout(
        Duration::from_secs(60),
        h.supervisor.disconnect(&conversation(), Some(&user("alice"))),
    )
    .await
    .expect("disconnect must not hang");
    assert_eq!(removed, 1);
    assert!(h
        .supervisor
        .get_connection_state(&conversation(), &user("alice"))
        .await
        .is_none());

    tokio::time::timeout(Duration::from_secs(600), connecting)
        .await
        .expect("connect gives up on stuck attaches")
        .expect("connect task")
        .expect("transport itself connected");
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.broker.live_clients(), 0);
    assert!(h
        .supervisor
        .list_channels(&conversation(), &user("alice"))
        .await
        .is_empty());
}

#[tokio::test(start_paused = true)]
async fn health_check_reconnects_when_pings_hang() {
    let h = harness();
    h.broker.set_stalled(StalledCall::Ping, true);
    h.supervisor
        .connect(&conversation(), &user("alice"))
        .await
        .expect("connect");
    let mut events = h.supervisor.subscribe_events();

    h.broker.drop_silently("alice");

    let attempt = next_matching(&mut events, |event| match event {
        RealtimeEvent::ReconnectScheduled { attempt, .. } => Some(attempt),
        _ => None,
    })
    .await;
    assert_eq!(attempt, 1);
    let recovered = next_matching(&mut events, |event| match event {
        RealtimeEvent::ConnectionStateChanged(state)
            if state.status == ConnectionStatus::Connected =>
        {
            Some(state)
        }
        _ => None,
    })
    .await;
    assert_eq!(recovered.connection_id.as_deref(), Some("mem-2"));
}
