use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::Parser;
use pubsub::{HandshakeMode, MemoryBroker, TransportState};
use realtime_core::{load_settings, RealtimeEvent, RealtimeTransport};
use shared::{
    domain::{ConnectionStatus, ConversationId, UserId},
    protocol::OutboundMessage,
};
use tokio::sync::broadcast::{error::RecvError, Receiver};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Drives a conversation through an outage and recovery on the in-memory
/// broker and reports what each participant ended up with.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "debate-1")]
    conversation: String,
    /// Comma separated. The first speaks, the last joins late.
    #[arg(long, value_delimiter = ',', default_value = "moderator,alice,bob")]
    participants: Vec<String>,
    #[arg(long, default_value_t = 3)]
    messages: usize,
    /// Reconnect attempts the broker refuses before letting the speaker back in.
    #[arg(long, default_value_t = 2)]
    refused_attempts: u32,
    /// Use a 100ms-based backoff table instead of the configured one.
    #[arg(long)]
    fast: bool,
    #[arg(long, default_value = "info")]
    log_filter: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if args.participants.len() < 2 {
        bail!("need at least a speaker and one other participant");
    }

    let mut settings = load_settings().context("loading realtime settings")?;
    if args.fast {
        settings.reconnect_backoff_ms = vec![100, 200, 400, 800, 1_600, 3_000];
        settings.health_check_interval_ms = 1_000;
    }
    let max_wait = Duration::from_millis(
        settings.reconnect_backoff_ms.iter().sum::<u64>() + settings.connection_timeout_ms * 8,
    );

    let broker = MemoryBroker::with_token_verification(settings.token_config());
    let transport = RealtimeTransport::new(Arc::new(broker.clone()), settings);

    let conversation_id = ConversationId::new(args.conversation.clone());
    let participants: Vec<UserId> = args
        .participants
        .iter()
        .map(|name| UserId::new(name.trim()))
        .collect();
    let speaker = participants[0].clone();
    let late_joiner = participants[participants.len() - 1].clone();
    let listeners: Vec<UserId> = participants[1..].to_vec();

    for user_id in &participants[..participants.len() - 1] {
        let state = transport.connect(&conversation_id, user_id).await?;
        info!(%user_id, connection_id = state.connection_id.as_deref().unwrap_or_default(), "probe: connected");
    }

    let mut sent = Vec::with_capacity(args.messages);
    for n in 1..=args.messages {
        let message = transport
            .send_message(
                &conversation_id,
                OutboundMessage::new(
                    speaker.clone(),
                    listeners.clone(),
                    serde_json::json!({ "text": format!("argument #{n}") }),
                ),
            )
            .await?;
        sent.push(message);
    }
    println!(
        "sent {} messages; offline queue: {:?}",
        sent.len(),
        transport.offline_stats().await
    );

    let mut events = transport.subscribe_events();
    broker.set_handshake(HandshakeMode::Refuse);
    let interrupted = broker.interrupt(speaker.as_str(), TransportState::Disconnected);
    info!(%speaker, interrupted, "probe: outage started");

    tokio::time::timeout(
        max_wait,
        wait_for_recovery(&mut events, &broker, &speaker, args.refused_attempts),
    )
    .await
    .context("speaker did not recover in time")??;

    let mut late_events = transport.subscribe_events();
    transport.connect(&conversation_id, &late_joiner).await?;
    let mut received = 0;
    while let Ok(Ok(event)) =
        tokio::time::timeout(Duration::from_millis(200), late_events.recv()).await
    {
        if let RealtimeEvent::MessageReceived { user_id, message } = event {
            if user_id == late_joiner {
                received += 1;
                transport.mark_read(&message.message_id, &user_id).await;
            }
        }
    }
    println!("{late_joiner} received {received} queued messages after joining");

    for message in &sent {
        let status = transport
            .get_delivery_status(&message.message_id)
            .await
            .unwrap_or_default();
        println!(
            "seq {} ({}): {}",
            message.sequence,
            message.message_id,
            serde_json::to_string(&status)?
        );
    }

    if let Some(state) = transport
        .get_connection_state(&conversation_id, &speaker)
        .await
    {
        println!("speaker state: {}", serde_json::to_string_pretty(&state)?);
    }

    transport.disconnect(&conversation_id, None).await;
    println!("live clients after disconnect: {}", broker.live_clients());
    Ok(())
}

async fn wait_for_recovery(
    events: &mut Receiver<RealtimeEvent>,
    broker: &MemoryBroker,
    speaker: &UserId,
    refused_attempts: u32,
) -> Result<()> {
    loop {
        match events.recv().await {
            Ok(RealtimeEvent::ReconnectScheduled {
                user_id,
                attempt,
                delay,
                ..
            }) if user_id == *speaker => {
                info!(%user_id, attempt, delay_ms = delay.as_millis() as u64, "probe: reconnect scheduled");
                if attempt > refused_attempts {
                    broker.set_handshake(HandshakeMode::Accept);
                }
            }
            Ok(RealtimeEvent::ConnectionStateChanged(state))
                if state.user_id == *speaker && state.status == ConnectionStatus::Connected =>
            {
                info!(%speaker, connection_id = state.connection_id.as_deref().unwrap_or_default(), "probe: speaker recovered");
                return Ok(());
            }
            Ok(RealtimeEvent::ConnectionFailed { user_id, error, .. }) if user_id == *speaker => {
                bail!("speaker gave up reconnecting: {}", error.message);
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "probe: event stream lagged"),
            Err(RecvError::Closed) => bail!("event stream closed"),
        }
    }
}
