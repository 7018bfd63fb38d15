use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::domain::{DeliveryStatus, MessageId, UserId};
use tokio::sync::Mutex;
use tracing::debug;

use crate::clock::{Clock, SystemClock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDelivery {
    pub recipients: BTreeMap<UserId, DeliveryStatus>,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl MessageDelivery {
    pub fn fully_read(&self) -> bool {
        self.recipients
            .values()
            .all(|status| *status == DeliveryStatus::Read)
    }
}

/// Per-message, per-recipient delivery state.
///
/// Unknown message or recipient ids are answered with `false`/`None`:
/// receipts racing with pruning are expected, not bugs.
pub struct DeliveryTracker {
    clock: Arc<dyn Clock>,
    deliveries: Mutex<HashMap<MessageId, MessageDelivery>>,
}

impl Default for DeliveryTracker {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl DeliveryTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            deliveries: Mutex::new(HashMap::new()),
        }
    }

    /// Starts tracking `message_id` with every recipient `pending`. Returns
    /// `false` without touching anything if the id is already tracked.
    pub async fn create_delivery(&self, message_id: &MessageId, recipients: &[UserId]) -> bool {
        let mut deliveries = self.deliveries.lock().await;
        if deliveries.contains_key(message_id) {
            return false;
        }
        deliveries.insert(
            message_id.clone(),
            MessageDelivery {
                recipients: recipients
                    .iter()
                    .map(|user_id| (user_id.clone(), DeliveryStatus::Pending))
                    .collect(),
                created_at: self.clock.now(),
                retry_count: 0,
            },
        );
        true
    }

    pub async fn confirm_delivery(&self, message_id: &MessageId, user_id: &UserId) -> bool {
        self.advance(message_id, user_id, DeliveryStatus::Delivered)
            .await
    }

    pub async fn mark_read(&self, message_id: &MessageId, user_id: &UserId) -> bool {
        self.advance(message_id, user_id, DeliveryStatus::Read).await
    }

    /// Moves the recipient forward to `target`. Returns `true` only when the
    /// status actually changed.
    async fn advance(&self, message_id: &MessageId, user_id: &UserId, target: DeliveryStatus) -> bool {
        let mut deliveries = self.deliveries.lock().await;
        let Some(status) = deliveries
            .get_mut(message_id)
            .and_then(|delivery| delivery.recipients.get_mut(user_id))
        else {
            debug!(%message_id, %user_id, ?target, "delivery: receipt for unknown message or recipient");
            return false;
        };
        if *status >= target {
            return false;
        }
        *status = target;
        true
    }

    pub async fn get_status(&self, message_id: &MessageId) -> Option<BTreeMap<UserId, DeliveryStatus>> {
        self.deliveries
            .lock()
            .await
            .get(message_id)
            .map(|delivery| delivery.recipients.clone())
    }

    pub async fn get_delivery(&self, message_id: &MessageId) -> Option<MessageDelivery> {
        self.deliveries.lock().await.get(message_id).cloned()
    }

    pub async fn pending_recipients(&self, message_id: &MessageId) -> Vec<UserId> {
        self.deliveries
            .lock()
            .await
            .get(message_id)
            .map(|delivery| {
                delivery
                    .recipients
                    .iter()
                    .filter(|(_, status)| **status == DeliveryStatus::Pending)
                    .map(|(user_id, _)| user_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Bumps the retry counter; returns the new count.
    pub async fn record_retry(&self, message_id: &MessageId) -> Option<u32> {
        let mut deliveries = self.deliveries.lock().await;
        let delivery = deliveries.get_mut(message_id)?;
        delivery.retry_count += 1;
        Some(delivery.retry_count)
    }

    /// Drops records that every recipient has read, or that are older than
    /// `retention`. Returns how many were removed.
    pub async fn prune(&self, retention: Duration) -> usize {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let now = self.clock.now();
        let mut deliveries = self.deliveries.lock().await;
        let before = deliveries.len();
        deliveries.retain(|_, delivery| {
            !delivery.fully_read() && now.signed_duration_since(delivery.created_at) < retention
        });
        before - deliveries.len()
    }

    pub async fn len(&self) -> usize {
        self.deliveries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.deliveries.lock().await.is_empty()
    }
}

#[cfg(test)]
#[path = "tests/delivery_tests.rs"]
mod tests;
