use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    ConnectionStatus, ConversationId, MessageId, MessagePriority, UserId,
};

/// Event name used for conversation messages on the conversation channel.
pub const MESSAGE_EVENT_NAME: &str = "conversation.message";

/// What a caller hands to the transport to send. The transport stamps the
/// sequence number and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    pub sender_id: UserId,
    pub recipients: Vec<UserId>,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: MessagePriority,
}

impl OutboundMessage {
    pub fn new(
        sender_id: UserId,
        recipients: Vec<UserId>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            message_id: None,
            sender_id,
            recipients,
            payload,
            priority: MessagePriority::default(),
        }
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_message_id(mut self, message_id: MessageId) -> Self {
        self.message_id = Some(message_id);
        self
    }
}

/// A sequenced message as published on `conversation:{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sequence: u64,
    pub recipients: Vec<UserId>,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: MessagePriority,
    pub sent_at: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn is_addressed_to(&self, user_id: &UserId) -> bool {
        self.sender_id != *user_id && self.recipients.contains(user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceAction {
    Joined,
    Reconnected,
    Left,
}

/// Metadata attached to presence enter/leave so observers can tell an
/// initial join from a recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceData {
    pub user_id: UserId,
    pub action: PresenceAction,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
}

/// Snapshot of one (conversation, user) connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub status: ConnectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connected: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}
