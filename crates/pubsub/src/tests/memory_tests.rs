use super::*;
use crate::capability::{mint_token, user_capabilities};
use serde_json::json;
use shared::domain::UserId;

fn options(client_id: &str) -> ClientOptions {
    ClientOptions {
        client_id: client_id.into(),
        token: String::new(),
    }
}

async fn connected(broker: &MemoryBroker, client_id: &str) -> Arc<dyn PubSubClient> {
    let client = broker.open(options(client_id)).await.expect("open");
    let mut states = client.subscribe_state();
    if client.state() != TransportState::Connected {
        let change = states.recv().await.expect("state change");
        assert_eq!(change.current, TransportState::Connected);
    }
    client
}

#[tokio::test]
async fn accepted_client_announces_connected() {
    let broker = MemoryBroker::new();
    let client = broker.open(options("u1")).await.expect("open");
    let mut states = client.subscribe_state();
    assert_eq!(client.state(), TransportState::Connecting);

    let change = states.recv().await.expect("state change");
    assert_eq!(change.previous, TransportState::Connecting);
    assert_eq!(change.current, TransportState::Connected);
    assert_eq!(broker.open_count(), 1);
    assert_eq!(client.connection_id().as_deref(), Some("mem-1"));
}

#[tokio::test]
async fn refused_handshake_fails_open_but_is_counted() {
    let broker = MemoryBroker::new();
    broker.set_handshake(HandshakeMode::Refuse);
    assert!(broker.open(options("u1")).await.is_err());
    assert_eq!(broker.open_count(), 1);
    assert_eq!(broker.live_clients(), 0);
}

#[tokio::test(start_paused = true)]
async fn stalled_handshake_never_connects() {
    let broker = MemoryBroker::new();
    broker.set_handshake(HandshakeMode::Stall);
    let client = broker.open(options("u1")).await.expect("open");
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(client.state(), TransportState::Connecting);
    assert!(client.ping().await.is_err());
}

#[tokio::test]
async fn messages_reach_attached_clients_only() {
    let broker = MemoryBroker::new();
    let alice = connected(&broker, "alice").await;
    let bob = connected(&broker, "bob").await;
    let carol = connected(&broker, "carol").await;
    alice.attach("conversation:c1").await.expect("attach");
    bob.attach("conversation:c1").await.expect("attach");

    let mut bob_messages = bob.subscribe_messages();
    let mut carol_messages = carol.subscribe_messages();
    alice
        .publish("conversation:c1", "conversation.message", json!({ "n": 1 }))
        .await
        .expect("publish");

    let received = bob_messages.recv().await.expect("bob receives");
    assert_eq!(received.publisher_client_id, "alice");
    assert_eq!(received.data["n"], 1);
    assert!(carol_messages.try_recv().is_err());
    assert_eq!(broker.published("conversation:c1").len(), 1);
}

#[tokio::test]
async fn presence_is_tracked_per_connection_and_cleared_on_close() {
    let broker = MemoryBroker::new();
    let alice = connected(&broker, "alice").await;
    alice
        .enter_presence("presence:c1", json!({ "action": "joined" }))
        .await
        .expect("enter");

    let members = broker.presence_members("presence:c1");
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].client_id, "alice");
    assert_eq!(members[0].data["action"], "joined");

    alice.close().await.expect("close");
    assert!(broker.presence_members("presence:c1").is_empty());
    assert_eq!(alice.state(), TransportState::Closed);
}

#[tokio::test]
async fn leaving_presence_that_was_never_entered_is_an_error() {
    let broker = MemoryBroker::new();
    let alice = connected(&broker, "alice").await;
    assert!(alice
        .leave_presence("presence:c1", json!({}))
        .await
        .is_err());
}

#[tokio::test]
async fn interrupt_announces_loss_and_blocks_publishing() {
    let broker = MemoryBroker::new();
    let alice = connected(&broker, "alice").await;
    let mut states = alice.subscribe_state();

    assert_eq!(broker.interrupt("alice", TransportState::Suspended), 1);
    let change = states.recv().await.expect("state change");
    assert_eq!(change.current, TransportState::Suspended);
    assert!(alice
        .publish("conversation:c1", "x", json!(null))
        .await
        .is_err());
}

#[tokio::test]
async fn silent_drop_changes_state_without_event() {
    let broker = MemoryBroker::new();
    let alice = connected(&broker, "alice").await;
    let mut states = alice.subscribe_state();

    assert_eq!(broker.drop_silently("alice"), 1);
    assert_eq!(alice.state(), TransportState::Disconnected);
    assert!(states.try_recv().is_err());
}

#[tokio::test]
async fn probe_reports_configured_latency() {
    let broker = MemoryBroker::new();
    broker.set_probe_latency(Duration::from_millis(42));
    let alice = connected(&broker, "alice").await;
    assert_eq!(alice.ping().await.expect("ping"), Duration::from_millis(42));
}

#[tokio::test]
async fn verified_broker_enforces_token_capabilities() {
    let config = TokenConfig {
        api_key: "k".into(),
        api_secret: "s".into(),
        ttl_seconds: 60,
    };
    let broker = MemoryBroker::with_token_verification(config.clone());
    let user = UserId::from("alice");
    let issued = mint_token(&config, &user, &user_capabilities(&user)).expect("token");

    let client = broker
        .open(ClientOptions {
            client_id: "alice".into(),
            token: issued.token,
        })
        .await
        .expect("open");
    let mut states = client.subscribe_state();
    if client.state() != TransportState::Connected {
        states.recv().await.expect("connected");
    }

    client.attach("moderation:c1").await.expect("subscribe allowed");
    assert!(client
        .publish("moderation:c1", "x", json!(null))
        .await
        .is_err());
    assert!(client.attach("coaching:bob:c1").await.is_err());
    client
        .publish("coaching:alice:c1", "hint", json!("slow down"))
        .await
        .expect("own coaching channel");
}

#[tokio::test]
async fn verified_broker_rejects_bad_tokens() {
    let broker = MemoryBroker::with_token_verification(TokenConfig {
        api_key: "k".into(),
        api_secret: "s".into(),
        ttl_seconds: 60,
    });
    let err = broker
        .open(ClientOptions {
            client_id: "mallory".into(),
            token: "not-a-jwt".into(),
        })
        .await
        .err()
        .expect("should reject");
    assert!(err.to_string().contains("token rejected"));
}

#[tokio::test(start_paused = true)]
async fn stalled_calls_hang_until_released() {
    let broker = MemoryBroker::new();
    let client = connected(&broker, "alice").await;
    broker.set_stalled(StalledCall::Ping, true);
    broker.set_stalled(StalledCall::Attach, true);

    let ping = tokio::time::timeout(Duration::from_secs(3600), client.ping()).await;
    assert!(ping.is_err());
    let attach = tokio::time::timeout(Duration::from_secs(3600), client.attach("c")).await;
    assert!(attach.is_err());

    broker.set_stalled(StalledCall::Ping, false);
    broker.set_stalled(StalledCall::Attach, false);
    client.ping().await.expect("ping");
    client.attach("c").await.expect("attach");
}
