use std::{collections::BTreeMap, slice, sync::Arc};

use pubsub::{JwtTokenIssuer, PubSubConnector, TokenIssuer};
use shared::{
    domain::{conversation_channel, ConversationId, DeliveryStatus, MessageId, UserId},
    protocol::{ConnectionState, ConversationMessage, OutboundMessage, MESSAGE_EVENT_NAME},
};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::{
    channels::JoinedChannel,
    clock::{Clock, SystemClock},
    config::RealtimeSettings,
    delivery::{DeliveryTracker, MessageDelivery},
    error::RealtimeError,
    events::RealtimeEvent,
    offline_queue::{OfflineQueue, QueueStats, QueuedMessage},
    sequence::{ConversationSequence, SequenceAllocator},
    supervisor::ConnectionSupervisor,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub deliveries_pruned: usize,
    pub queued_expired: usize,
}

/// Entry point for conversation code: connections, sending and receipts.
pub struct RealtimeTransport {
    supervisor: Arc<ConnectionSupervisor>,
    sequences: SequenceAllocator,
    deliveries: Arc<DeliveryTracker>,
    offline_queue: Arc<OfflineQueue>,
    clock: Arc<dyn Clock>,
}

impl RealtimeTransport {
    /// Signs capability tokens locally with the configured credentials.
    pub fn new(connector: Arc<dyn PubSubConnector>, settings: RealtimeSettings) -> Self {
        let tokens = Arc::new(JwtTokenIssuer::new(settings.token_config()));
        Self::new_with_dependencies(connector, tokens, settings, Arc::new(SystemClock))
    }

    pub fn new_with_dependencies(
        connector: Arc<dyn PubSubConnector>,
        tokens: Arc<dyn TokenIssuer>,
        settings: RealtimeSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let offline_queue = Arc::new(OfflineQueue::new(
            settings.offline_queue(),
            Arc::clone(&clock),
        ));
        let deliveries = Arc::new(DeliveryTracker::new(Arc::clone(&clock)));
        let supervisor = ConnectionSupervisor::new(
            connector,
            tokens,
            settings,
            Arc::clone(&clock),
            Arc::clone(&offline_queue),
            Arc::clone(&deliveries),
        );
        Self {
            supervisor,
            sequences: SequenceAllocator::new(Arc::clone(&clock)),
            deliveries,
            offline_queue,
            clock,
        }
    }

    pub async fn connect(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<ConnectionState, RealtimeError> {
        self.supervisor.connect(conversation_id, user_id).await
    }

    pub async fn disconnect(&self, conversation_id: &ConversationId, user_id: Option<&UserId>) {
        let removed = self.supervisor.disconnect(conversation_id, user_id).await;
        debug!(%conversation_id, removed, "realtime: disconnect finished");
    }

    pub async fn get_connection_state(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Option<ConnectionState> {
        self.supervisor
            .get_connection_state(conversation_id, user_id)
            .await
    }

    pub async fn add_channel(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        channel: &str,
    ) -> Result<JoinedChannel, RealtimeError> {
        self.supervisor
            .add_channel(conversation_id, user_id, channel)
            .await
    }

    pub async fn get_channel(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        channel: &str,
    ) -> Option<JoinedChannel> {
        self.supervisor
            .get_channel(conversation_id, user_id, channel)
            .await
    }

    /// Sequences, tracks and publishes `outbound`. Recipients without a live
    /// connection get the message in their offline queue before it is
    /// published, so a recipient that connects meanwhile sees it live or on
    /// drain. The sender must be connected.
    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        outbound: OutboundMessage,
    ) -> Result<ConversationMessage, RealtimeError> {
        let client = self
            .supervisor
            .connected_client(conversation_id, &outbound.sender_id)
            .await
            .ok_or_else(|| RealtimeError::NotConnected {
                conversation_id: conversation_id.clone(),
                user_id: outbound.sender_id.clone(),
            })?;

        let sequence = self.sequences.get_next_sequence(conversation_id).await;
        let message = ConversationMessage {
            message_id: outbound.message_id.unwrap_or_else(MessageId::generate),
            conversation_id: conversation_id.clone(),
            sender_id: outbound.sender_id,
            sequence,
            recipients: outbound.recipients,
            payload: outbound.payload,
            priority: outbound.priority,
            sent_at: self.clock.now(),
        };

        let addressed: Vec<UserId> = message
            .recipients
            .iter()
            .filter(|recipient| message.is_addressed_to(recipient))
            .cloned()
            .collect();
        self.deliveries
            .create_delivery(&message.message_id, &addressed)
            .await;
        let data = serde_json::to_value(&message)?;

        let mut offline = Vec::new();
        for recipient in addressed {
            if !self.supervisor.is_connected(conversation_id, &recipient).await {
                self.offline_queue
                    .enqueue(&recipient, conversation_id, message.clone())
                    .await;
                offline.push(recipient);
            }
        }

        let published = client
            .publish(&conversation_channel(conversation_id), MESSAGE_EVENT_NAME, data)
            .await;
        if let Err(err) = published {
            for recipient in &offline {
                self.offline_queue
                    .acknowledge(recipient, conversation_id, slice::from_ref(&message.message_id))
                    .await;
            }
            return Err(RealtimeError::Transport(err));
        }
        let queued = offline.len();

        info!(
            %conversation_id,
            sender_id = %message.sender_id,
            message_id = %message.message_id,
            sequence,
            queued,
            "realtime: message sent"
        );
        Ok(message)
    }

    pub async fn confirm_delivery(&self, message_id: &MessageId, user_id: &UserId) -> bool {
        self.deliveries.confirm_delivery(message_id, user_id).await
    }

    pub async fn mark_read(&self, message_id: &MessageId, user_id: &UserId) -> bool {
        self.deliveries.mark_read(message_id, user_id).await
    }

    pub async fn get_delivery_status(
        &self,
        message_id: &MessageId,
    ) -> Option<BTreeMap<UserId, DeliveryStatus>> {
        self.deliveries.get_status(message_id).await
    }

    /// Full delivery record, retry count included.
    pub async fn get_delivery(&self, message_id: &MessageId) -> Option<MessageDelivery> {
        self.deliveries.get_delivery(message_id).await
    }

    /// Last sequence issued in the conversation, without advancing it.
    pub async fn current_sequence(
        &self,
        conversation_id: &ConversationId,
    ) -> Option<ConversationSequence> {
        self.sequences.current_sequence(conversation_id).await
    }

    /// Deliverable queued messages for the user; they stay queued until
    /// passed to [`RealtimeTransport::acknowledge_messages`].
    pub async fn get_undelivered_messages(
        &self,
        user_id: &UserId,
        conversation_id: &ConversationId,
    ) -> Vec<QueuedMessage> {
        self.offline_queue.drain(user_id, conversation_id).await
    }

    pub async fn acknowledge_messages(
        &self,
        user_id: &UserId,
        conversation_id: &ConversationId,
        message_ids: &[MessageId],
    ) -> usize {
        self.offline_queue
            .acknowledge(user_id, conversation_id, message_ids)
            .await
    }

    pub async fn offline_stats(&self) -> QueueStats {
        self.offline_queue.stats().await
    }

    /// Drops delivery records past retention and expired queued messages.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let retention = self.supervisor.settings().delivery_retention();
        MaintenanceReport {
            deliveries_pruned: self.deliveries.prune(retention).await,
            queued_expired: self.offline_queue.purge_expired().await,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.supervisor.subscribe_events()
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
