//! Fixed window counting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use super::{Policy, RateLimitDecision, WindowAlgorithm};
use crate::clock::SharedClock;
use crate::store::{CounterStore, StoreError};

/// One counter per key per window.
///
/// Every check increments, denied or not, so a caller hammering a closed
/// window keeps it closed. A burst straddling a window boundary can still
/// admit up to `2 * max` requests.
pub struct FixedWindow {
    policy: Arc<Policy>,
    store: Arc<dyn CounterStore>,
    clock: SharedClock,
}

impl FixedWindow {
    pub fn new(policy: Arc<Policy>, store: Arc<dyn CounterStore>, clock: SharedClock) -> Self {
        Self {
            policy,
            store,
            clock,
        }
    }
}

#[async_trait]
impl WindowAlgorithm for FixedWindow {
    fn policy(&self) -> &Policy {
        &self.policy
    }

    async fn check(&self, key: &str) -> Result<RateLimitDecision, StoreError> {
        let key = self.policy.namespaced(key);
        let state = self.store.increment(&key, self.policy.window()).await?;
        let now = self.clock.now_millis();
        let max = self.policy.max();

        trace!(key = %key, count = state.count, limit = max, "Fixed window incremented");

        if state.count > max {
            Ok(RateLimitDecision::deny(max, state.reset_time, now))
        } else {
            Ok(RateLimitDecision::allow(max, state.count, state.reset_time, now))
        }
    }

    async fn undo(&self, key: &str, decision: &RateLimitDecision) -> Result<(), StoreError> {
        if decision.recorded_at.is_none() {
            return Ok(());
        }

        let key = self.policy.namespaced(key);
        let now = self.clock.now_millis();
        let Some(mut state) = self.store.get(&key).await? else {
            return Ok(());
        };

        // Only the window the hit landed in may be decremented
        if state.reset_time != decision.reset_at_ms || state.is_expired(now) || state.count == 0 {
            return Ok(());
        }

        state.count -= 1;
        let ttl = Duration::from_millis(state.reset_time - now);
        self.store.set(&key, state, ttl).await
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.store.reset(&self.policy.namespaced(key)).await
    }
}
