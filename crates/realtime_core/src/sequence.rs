use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use shared::domain::ConversationId;
use tokio::sync::Mutex;

use crate::clock::{Clock, SystemClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversationSequence {
    pub current_sequence: u64,
    pub last_updated: DateTime<Utc>,
}

/// Issues per-conversation sequence numbers. Every increment goes through
/// the one mutex, so concurrent callers never share or skip a value.
pub struct SequenceAllocator {
    clock: Arc<dyn Clock>,
    sequences: Mutex<HashMap<ConversationId, ConversationSequence>>,
}

impl Default for SequenceAllocator {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl SequenceAllocator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            sequences: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_next_sequence(&self, conversation_id: &ConversationId) -> u64 {
        let now = self.clock.now();
        let mut sequences = self.sequences.lock().await;
        let entry = sequences
            .entry(conversation_id.clone())
            .or_insert(ConversationSequence {
                current_sequence: 0,
                last_updated: now,
            });
        entry.current_sequence += 1;
        entry.last_updated = now;
        entry.current_sequence
    }

    pub async fn current_sequence(&self, conversation_id: &ConversationId) -> Option<ConversationSequence> {
        self.sequences.lock().await.get(conversation_id).copied()
    }
}

#[cfg(test)]
#[path = "tests/sequence_tests.rs"]
mod tests;
