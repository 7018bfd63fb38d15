use std::{
    collections::{HashMap, VecDeque},
    hash::Hash,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::domain::MessageId;
use tokio::sync::Mutex;

use crate::clock::{Clock, SystemClock};

pub const DEFAULT_DUPLICATE_WINDOW: Duration = Duration::from_secs(30);
pub const MAX_DUPLICATE_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Remembers processed ids for a fixed window.
///
/// Expiry is tracked in one time-ordered queue that is swept on every call,
/// so memory stays bounded without a timer per id. Once the window has
/// passed an id is forgotten and reads as new again.
pub struct DuplicateFilter<K = MessageId> {
    window: chrono::Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<FilterState<K>>,
}

struct FilterState<K> {
    expiries: HashMap<K, DateTime<Utc>>,
    order: VecDeque<(DateTime<Utc>, K)>,
}

impl<K> FilterState<K>
where
    K: Eq + Hash + Clone,
{
    fn sweep(&mut self, now: DateTime<Utc>) {
        while let Some((expires_at, _)) = self.order.front() {
            if *expires_at > now {
                break;
            }
            let Some((expires_at, key)) = self.order.pop_front() else {
                break;
            };
            // A re-marked id has a newer expiry; only drop the matching one.
            if self.expiries.get(&key) == Some(&expires_at) {
                self.expiries.remove(&key);
            }
        }
    }

    fn contains(&self, key: &K, now: DateTime<Utc>) -> bool {
        self.expiries
            .get(key)
            .is_some_and(|expires_at| *expires_at > now)
    }

    fn insert(&mut self, key: K, expires_at: DateTime<Utc>) {
        self.expiries.insert(key.clone(), expires_at);
        self.order.push_back((expires_at, key));
    }
}

impl<K> Default for DuplicateFilter<K>
where
    K: Eq + Hash + Clone + Send,
{
    fn default() -> Self {
        Self::new(DEFAULT_DUPLICATE_WINDOW, Arc::new(SystemClock))
    }
}

impl<K> DuplicateFilter<K>
where
    K: Eq + Hash + Clone + Send,
{
    pub fn new(window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            window: chrono::Duration::from_std(window.min(MAX_DUPLICATE_WINDOW))
                .unwrap_or_default(),
            clock,
            state: Mutex::new(FilterState {
                expiries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub async fn is_duplicate(&self, key: &K) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.sweep(now);
        state.contains(key, now)
    }

    pub async fn mark_processed(&self, key: K) {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.sweep(now);
        state.insert(key, now + self.window);
    }

    /// Atomically checks and records `key`. Returns `true` when it was
    /// already seen inside the window, in which case nothing changes.
    pub async fn check_and_mark(&self, key: K) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.sweep(now);
        if state.contains(&key, now) {
            return true;
        }
        state.insert(key, now + self.window);
        false
    }

    /// Drops `key` so it reads as new again. Its stale slot in the expiry
    /// queue is skipped by the sweep.
    pub async fn forget(&self, key: &K) {
        self.state.lock().await.expiries.remove(key);
    }

    /// Number of ids currently remembered.
    pub async fn len(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.sweep(now);
        state.expiries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
#[path = "tests/dedup_tests.rs"]
mod tests;
