use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(ConversationId);
id_newtype!(UserId);
id_newtype!(MessageId);

impl MessageId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

/// Per-recipient delivery progress. The derived ordering follows the only
/// permitted direction of travel: `Pending < Delivered < Read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Conversation,
    Presence,
    Moderation,
    Coaching,
}

impl ChannelKind {
    /// Whether end users enter presence on this kind of channel when joining.
    pub fn is_user_facing(self) -> bool {
        matches!(self, Self::Conversation | Self::Presence)
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
}

pub fn conversation_channel(conversation_id: &ConversationId) -> String {
    format!("conversation:{conversation_id}")
}

pub fn presence_channel(conversation_id: &ConversationId) -> String {
    format!("presence:{conversation_id}")
}

pub fn moderation_channel(conversation_id: &ConversationId) -> String {
    format!("moderation:{conversation_id}")
}

pub fn coaching_channel(user_id: &UserId, conversation_id: &ConversationId) -> String {
    format!("coaching:{user_id}:{conversation_id}")
}

/// Classifies a channel name by its prefix. Unknown prefixes yield `None`.
pub fn channel_kind(channel_name: &str) -> Option<ChannelKind> {
    let (prefix, _) = channel_name.split_once(':')?;
    match prefix {
        "conversation" => Some(ChannelKind::Conversation),
        "presence" => Some(ChannelKind::Presence),
        "moderation" => Some(ChannelKind::Moderation),
        "coaching" => Some(ChannelKind::Coaching),
        _ => None,
    }
}
