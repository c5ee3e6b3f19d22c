//! Sliding window log.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use super::{Policy, RateLimitDecision, WindowAlgorithm};
use crate::clock::SharedClock;
use crate::store::{CounterStore, StoreError, WindowState};

/// Exact trailing-window limiting over a capped timestamp log.
///
/// State is `O(max)` per key and every check rewrites it, so this is meant
/// for low-volume endpoints such as authentication. The log is read and
/// written with separate store calls; concurrent checks on one key can
/// overwrite each other's entries and under-count.
pub struct SlidingLog {
    policy: Arc<Policy>,
    store: Arc<dyn CounterStore>,
    clock: SharedClock,
}

impl SlidingLog {
    pub fn new(policy: Arc<Policy>, store: Arc<dyn CounterStore>, clock: SharedClock) -> Self {
        Self {
            policy,
            store,
            clock,
        }
    }

    /// Current log for `key` with entries outside the window dropped.
    async fn live_history(&self, key: &str, now: u64) -> Result<Vec<u64>, StoreError> {
        let window_ms = self.policy.window_ms();
        let mut history = self
            .store
            .get(key)
            .await?
            .map(|state| state.history)
            .unwrap_or_default();

        history.retain(|&ts| ts.saturating_add(window_ms) > now);
        history.sort_unstable();
        Ok(history)
    }

    async fn save(&self, key: &str, history: Vec<u64>, now: u64) -> Result<(), StoreError> {
        if history.is_empty() {
            return self.store.reset(key).await;
        }

        let state = WindowState {
            count: history.len() as u64,
            reset_time: now.saturating_add(self.policy.window_ms()),
            history,
        };
        self.store.set(key, state, self.policy.window()).await
    }
}

#[async_trait]
impl WindowAlgorithm for SlidingLog {
    fn policy(&self) -> &Policy {
        &self.policy
    }

    async fn check(&self, key: &str) -> Result<RateLimitDecision, StoreError> {
        let key = self.policy.namespaced(key);
        let now = self.clock.now_millis();
        let window_ms = self.policy.window_ms();
        let max = self.policy.max();

        let mut history = self.live_history(&key, now).await?;
        let total = history.len() as u64;

        trace!(key = %key, count = total, limit = max, "Sliding log evaluated");

        if total >= max {
            // The oldest entry is the next to leave the window
            let reset_at = history[0].saturating_add(window_ms);
            return Ok(RateLimitDecision::deny(max, reset_at, now));
        }

        history.push(now);
        if history.len() as u64 > max {
            let excess = history.len() - max as usize;
            history.drain(..excess);
        }
        let used = history.len() as u64;
        let reset_at = history[0].saturating_add(window_ms);

        self.save(&key, history, now).await?;
        Ok(RateLimitDecision::allow(max, used, reset_at, now))
    }

    async fn undo(&self, key: &str, decision: &RateLimitDecision) -> Result<(), StoreError> {
        let Some(recorded_at) = decision.recorded_at else {
            return Ok(());
        };

        let key = self.policy.namespaced(key);
        let now = self.clock.now_millis();
        let mut history = self.live_history(&key, now).await?;

        match history.iter().position(|&ts| ts == recorded_at) {
            Some(index) => {
                history.remove(index);
                self.save(&key, history, now).await
            }
            None => Ok(()),
        }
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.store.reset(&self.policy.namespaced(key)).await
    }
}
