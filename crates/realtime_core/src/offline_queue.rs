use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId, MessagePriority, UserId},
    protocol::ConversationMessage,
};
use tokio::sync::Mutex;
use tracing::debug;

use crate::clock::{Clock, SystemClock};

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
pub const DEFAULT_MESSAGE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub message: ConversationMessage,
    pub enqueued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub retry_count: u32,
    pub priority: MessagePriority,
}

impl QueuedMessage {
    pub fn message_id(&self) -> &MessageId {
        &self.message.message_id
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfflineQueueConfig {
    pub capacity: usize,
    pub ttl: Duration,
}

impl Default for OfflineQueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            ttl: DEFAULT_MESSAGE_TTL,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: usize,
    pub evicted: u64,
    pub expired: u64,
}

type QueueKey = (UserId, ConversationId);

#[derive(Default)]
struct QueueState {
    queues: HashMap<QueueKey, VecDeque<QueuedMessage>>,
    evicted: u64,
    expired: u64,
}

/// Messages held for recipients who are offline, one bounded FIFO per
/// (user, conversation).
///
/// Removal is acknowledgment based: `drain` hands out what is deliverable
/// and leaves it queued; only `acknowledge` removes entries, and only the
/// ids it is given.
pub struct OfflineQueue {
    config: OfflineQueueConfig,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
}

impl Default for OfflineQueue {
    fn default() -> Self {
        Self::new(OfflineQueueConfig::default(), Arc::new(SystemClock))
    }
}

impl OfflineQueue {
    pub fn new(config: OfflineQueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            ttl: chrono::Duration::from_std(config.ttl).unwrap_or(chrono::Duration::days(365)),
            clock,
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn config(&self) -> OfflineQueueConfig {
        self.config
    }

    /// Appends `message` for the recipient and returns the new queue length.
    /// At capacity the oldest entry is evicted first. Re-enqueueing an id
    /// that is already queued changes nothing.
    pub async fn enqueue(
        &self,
        user_id: &UserId,
        conversation_id: &ConversationId,
        message: ConversationMessage,
    ) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let state = &mut *state;
        let queue = state
            .queues
            .entry((user_id.clone(), conversation_id.clone()))
            .or_default();

        if queue
            .iter()
            .any(|queued| queued.message.message_id == message.message_id)
        {
            return queue.len();
        }

        while !queue.is_empty() && queue.len() >= self.config.capacity {
            if let Some(evicted) = queue.pop_front() {
                state.evicted += 1;
                debug!(
                    %user_id,
                    %conversation_id,
                    message_id = %evicted.message.message_id,
                    capacity = self.config.capacity,
                    "offline queue: capacity reached, evicted oldest message"
                );
            }
        }

        let priority = message.priority;
        queue.push_back(QueuedMessage {
            message,
            enqueued_at: now,
            expires_at: now + self.ttl,
            retry_count: 0,
            priority,
        });
        queue.len()
    }

    /// Returns the deliverable messages in enqueue order. Expired entries are
    /// discarded. Returned entries stay queued until acknowledged; each drain
    /// bumps their retry count.
    pub async fn drain(
        &self,
        user_id: &UserId,
        conversation_id: &ConversationId,
    ) -> Vec<QueuedMessage> {
        let now = self.clock.now();
        let key = (user_id.clone(), conversation_id.clone());
        let mut state = self.state.lock().await;
        let state = &mut *state;
        let Some(queue) = state.queues.get_mut(&key) else {
            return Vec::new();
        };

        let before = queue.len();
        queue.retain(|queued| !queued.is_expired(now));
        let expired = before - queue.len();
        if expired > 0 {
            state.expired += expired as u64;
            debug!(%user_id, %conversation_id, expired, "offline queue: discarded expired messages");
        }

        let drained = queue
            .iter_mut()
            .map(|queued| {
                let snapshot = queued.clone();
                queued.retry_count += 1;
                snapshot
            })
            .collect();

        if queue.is_empty() {
            state.queues.remove(&key);
        }
        drained
    }

    /// Removes exactly the given ids. Returns how many were removed.
    pub async fn acknowledge(
        &self,
        user_id: &UserId,
        conversation_id: &ConversationId,
        message_ids: &[MessageId],
    ) -> usize {
        let key = (user_id.clone(), conversation_id.clone());
        let mut state = self.state.lock().await;
        let Some(queue) = state.queues.get_mut(&key) else {
            return 0;
        };
        let before = queue.len();
        queue.retain(|queued| !message_ids.contains(&queued.message.message_id));
        let removed = before - queue.len();
        if queue.is_empty() {
            state.queues.remove(&key);
        }
        removed
    }

    pub async fn len(&self, user_id: &UserId, conversation_id: &ConversationId) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(&(user_id.clone(), conversation_id.clone()))
            .map_or(0, VecDeque::len)
    }

    /// Sweeps expired entries out of every queue.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let mut purged = 0;
        state.queues.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|queued| !queued.is_expired(now));
            purged += before - queue.len();
            !queue.is_empty()
        });
        state.expired += purged as u64;
        purged
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            queued: state.queues.values().map(VecDeque::len).sum(),
            evicted: state.evicted,
            expired: state.expired,
        }
    }
}

#[cfg(test)]
#[path = "tests/offline_queue_tests.rs"]
mod tests;
