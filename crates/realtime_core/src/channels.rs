use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use shared::domain::{
    channel_kind, coaching_channel, conversation_channel, moderation_channel, presence_channel,
    ChannelKind, ConversationId, UserId,
};
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
}

impl ConnectionKey {
    pub fn new(conversation_id: ConversationId, user_id: UserId) -> Self {
        Self {
            conversation_id,
            user_id,
        }
    }
}

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.conversation_id, self.user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedChannel {
    pub name: String,
    pub kind: ChannelKind,
    pub presence_entered: bool,
    pub joined_at: DateTime<Utc>,
}

/// The four channels every participant joins, in join order.
pub fn essential_channels(conversation_id: &ConversationId, user_id: &UserId) -> Vec<String> {
    vec![
        conversation_channel(conversation_id),
        presence_channel(conversation_id),
        moderation_channel(conversation_id),
        coaching_channel(user_id, conversation_id),
    ]
}

/// Which channels each connection has joined. This is the set replayed
/// after a reconnect.
#[derive(Default)]
pub struct ChannelRegistry {
    connections: RwLock<HashMap<ConnectionKey, BTreeMap<String, JoinedChannel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `channel` for the connection. Names without a known prefix
    /// are treated as conversation channels. Returns `false` if it was
    /// already joined.
    pub async fn join(&self, key: &ConnectionKey, channel: &str, now: DateTime<Utc>) -> bool {
        let mut connections = self.connections.write().await;
        let channels = connections.entry(key.clone()).or_default();
        if channels.contains_key(channel) {
            return false;
        }
        channels.insert(
            channel.to_string(),
            JoinedChannel {
                name: channel.to_string(),
                kind: channel_kind(channel).unwrap_or(ChannelKind::Conversation),
                presence_entered: false,
                joined_at: now,
            },
        );
        true
    }

    pub async fn leave(&self, key: &ConnectionKey, channel: &str) -> Option<JoinedChannel> {
        let mut connections = self.connections.write().await;
        let channels = connections.get_mut(key)?;
        let removed = channels.remove(channel);
        if channels.is_empty() {
            connections.remove(key);
        }
        removed
    }

    pub async fn set_presence(&self, key: &ConnectionKey, channel: &str, entered: bool) -> bool {
        let mut connections = self.connections.write().await;
        match connections
            .get_mut(key)
            .and_then(|channels| channels.get_mut(channel))
        {
            Some(joined) => {
                joined.presence_entered = entered;
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, key: &ConnectionKey, channel: &str) -> Option<JoinedChannel> {
        self.connections
            .read()
            .await
            .get(key)
            .and_then(|channels| channels.get(channel))
            .cloned()
    }

    pub async fn list_channels(&self, key: &ConnectionKey) -> Vec<JoinedChannel> {
        self.connections
            .read()
            .await
            .get(key)
            .map(|channels| channels.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn presence_channels(&self, key: &ConnectionKey) -> Vec<String> {
        self.list_channels(key)
            .await
            .into_iter()
            .filter(|channel| channel.presence_entered)
            .map(|channel| channel.name)
            .collect()
    }

    /// Forgets the connection entirely, returning what it had joined.
    pub async fn remove(&self, key: &ConnectionKey) -> Vec<JoinedChannel> {
        self.connections
            .write()
            .await
            .remove(key)
            .map(|channels| channels.into_values().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[path = "tests/channels_tests.rs"]
mod tests;
