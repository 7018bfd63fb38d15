use std::time::Duration;

use shared::{
    domain::{ConversationId, UserId},
    error::{ApiError, ErrorCode},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("connection for user {user_id} in conversation {conversation_id} timed out after {timeout:?}")]
    ConnectionTimeout {
        conversation_id: ConversationId,
        user_id: UserId,
        timeout: Duration,
    },
    #[error("connection for user {user_id} in conversation {conversation_id} failed after {attempts} reconnect attempts")]
    ConnectionFailed {
        conversation_id: ConversationId,
        user_id: UserId,
        attempts: u32,
    },
    #[error("transport rejected connection for user {user_id}: {reason}")]
    ConnectionRejected { user_id: UserId, reason: String },
    #[error("presence update on {channel} failed: {source}")]
    Presence {
        channel: String,
        source: anyhow::Error,
    },
    #[error("failed to issue capability token for user {user_id}: {source}")]
    Token {
        user_id: UserId,
        source: anyhow::Error,
    },
    #[error("transport error: {0}")]
    Transport(#[source] anyhow::Error),
    #[error("user {user_id} is not connected to conversation {conversation_id}")]
    NotConnected {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    #[error("invalid message payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RealtimeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ConnectionTimeout { .. } => ErrorCode::ConnectionTimeout,
            Self::ConnectionFailed { .. } => ErrorCode::ReconnectRequired,
            Self::ConnectionRejected { .. } | Self::Token { .. } => ErrorCode::Unauthorized,
            Self::NotConnected { .. } => ErrorCode::NotConnected,
            Self::Presence { .. } | Self::Transport(_) => ErrorCode::Transport,
            Self::Serialization(_) => ErrorCode::Internal,
        }
    }
}

impl From<&RealtimeError> for ApiError {
    fn from(value: &RealtimeError) -> Self {
        ApiError::new(value.code(), value.to_string())
    }
}
