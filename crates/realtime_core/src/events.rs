use std::time::Duration;

use shared::{
    domain::{ConversationId, UserId},
    error::ApiError,
    protocol::{ConnectionState, ConversationMessage},
};

pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum RealtimeEvent {
    ConnectionStateChanged(ConnectionState),
    MessageReceived {
        user_id: UserId,
        message: ConversationMessage,
    },
    ReconnectScheduled {
        conversation_id: ConversationId,
        user_id: UserId,
        attempt: u32,
        delay: Duration,
    },
    /// Reconnection gave up; the connection stays failed until the user
    /// connects again.
    ConnectionFailed {
        conversation_id: ConversationId,
        user_id: UserId,
        error: ApiError,
    },
    Error(ApiError),
}
