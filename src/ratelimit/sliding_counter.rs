//! Bucketed sliding window counter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use tracing::trace;

use super::{Policy, RateLimitDecision, WindowAlgorithm};
use crate::clock::SharedClock;
use crate::store::{CounterStore, StoreError};

/// Approximates a trailing window with `sub_window_count` fixed buckets.
///
/// Each bucket is an ordinary fixed-window counter stored under
/// `"<policy>:<subject>:<index>"`, where `index = now / sub_window_ms`.
/// A check reads the current bucket and the `sub_window_count - 1` before it,
/// so its cost grows with the bucket count rather than with `max`.
pub struct SlidingCounter {
    policy: Arc<Policy>,
    store: Arc<dyn CounterStore>,
    clock: SharedClock,
    sub_window_ms: u64,
}

impl SlidingCounter {
    pub fn new(policy: Arc<Policy>, store: Arc<dyn CounterStore>, clock: SharedClock) -> Self {
        let sub_window_ms = (policy.window_ms() / u64::from(policy.sub_window_count())).max(1);
        Self {
            policy,
            store,
            clock,
            sub_window_ms,
        }
    }

    /// Length of one bucket in milliseconds.
    pub fn sub_window_ms(&self) -> u64 {
        self.sub_window_ms
    }

    fn bucket_index(&self, now: u64) -> u64 {
        now / self.sub_window_ms
    }

    /// Indices of the buckets covering the window ending in bucket `current`, oldest first.
    fn window_indices(&self, current: u64) -> std::ops::RangeInclusive<u64> {
        let span = u64::from(self.policy.sub_window_count()) - 1;
        current.saturating_sub(span)..=current
    }

    fn bucket_key(namespaced: &str, index: u64) -> String {
        format!("{}:{}", namespaced, index)
    }
}

#[async_trait]
impl WindowAlgorithm for SlidingCounter {
    fn policy(&self) -> &Policy {
        &self.policy
    }

    async fn check(&self, key: &str) -> Result<RateLimitDecision, StoreError> {
        let key = self.policy.namespaced(key);
        let now = self.clock.now_millis();
        let window_ms = self.policy.window_ms();
        let max = self.policy.max();
        let current = self.bucket_index(now);
        let indices: Vec<u64> = self.window_indices(current).collect();

        let reads = indices.iter().map(|&index| {
            let bucket = Self::bucket_key(&key, index);
            async move { self.store.get(&bucket).await }
        });
        let states = try_join_all(reads).await?;

        let mut total = 0u64;
        let mut current_count = 0u64;
        let mut oldest_contributing = None;
        for (&index, state) in indices.iter().zip(&states) {
            let Some(state) = state else { continue };
            // Buckets older than the trailing window count as zero
            if state.reset_time.saturating_add(window_ms) <= now {
                continue;
            }
            total = total.saturating_add(state.count);
            if index == current {
                current_count = state.count;
            }
            if state.count > 0 && oldest_contributing.is_none() {
                oldest_contributing = Some(index);
            }
        }

        let sub_windows = u64::from(self.policy.sub_window_count());
        let reset_at = oldest_contributing
            .unwrap_or(current)
            .saturating_add(sub_windows)
            .saturating_mul(self.sub_window_ms);

        trace!(key = %key, count = total, limit = max, bucket = current, "Sliding counter evaluated");

        if total >= max {
            return Ok(RateLimitDecision::deny(max, reset_at, now));
        }

        let bucket = Self::bucket_key(&key, current);
        let state = self.store.increment(&bucket, self.policy.window()).await?;
        let used = total - current_count + state.count;

        Ok(RateLimitDecision::allow(max, used, reset_at, now))
    }

    async fn undo(&self, key: &str, decision: &RateLimitDecision) -> Result<(), StoreError> {
        let Some(recorded_at) = decision.recorded_at else {
            return Ok(());
        };

        let bucket = Self::bucket_key(&self.policy.namespaced(key), self.bucket_index(recorded_at));
        let now = self.clock.now_millis();
        let Some(mut state) = self.store.get(&bucket).await? else {
            return Ok(());
        };
        if state.is_expired(now) || state.count == 0 {
            return Ok(());
        }

        state.count -= 1;
        let ttl = Duration::from_millis(state.reset_time - now);
        self.store.set(&bucket, state, ttl).await
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        let key = self.policy.namespaced(key);
        let current = self.bucket_index(self.clock.now_millis());
        let deletes = self.window_indices(current).map(|index| {
            let bucket = Self::bucket_key(&key, index);
            async move { self.store.reset(&bucket).await }
        });
        try_join_all(deletes).await?;
        Ok(())
    }
}
