use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ConnectionTimeout,
    /// The connection gave up reconnecting; only a user-initiated connect recovers it.
    ReconnectRequired,
    NotConnected,
    Unauthorized,
    Transport,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Whether the calling layer has to ask the user before connecting again.
    pub fn requires_user_action(&self) -> bool {
        matches!(self.code, ErrorCode::ReconnectRequired | ErrorCode::Unauthorized)
    }
}
