//! Rate limiting algorithms and policy configuration.
//!
//! Algorithms hold no per-key state of their own. Everything they count lives
//! in a [`CounterStore`], keyed by `"<policy>:<subject>"`, so replicas that
//! share a store share their limits.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::SharedClock;
use crate::store::{CounterStore, StoreError};

mod fixed_window;
mod key;
mod policy;
mod sliding_counter;
mod sliding_log;
mod tiers;

pub use fixed_window::FixedWindow;
pub use key::{
    ClientAddr, CustomKeyFn, Identity, KeyGenerator, LoginPayload, RequestContext, API_KEY_HEADER,
    FORWARDED_FOR_HEADER, UNKNOWN_KEY,
};
pub use policy::{
    AlgorithmKind, HeaderStyle, KeyStrategy, Policy, PolicyBuilder, PolicyConfig, TimeUnit,
    DEFAULT_SUB_WINDOWS,
};
pub use sliding_counter::SlidingCounter;
pub use sliding_log::SlidingLog;
pub use tiers::{TierSelection, TieredPolicySelector, DEFAULT_TIER};

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// The policy's `max`
    pub limit: u64,
    /// Requests left in the current window, never above `limit`
    pub remaining: u64,
    /// When quota next frees up, epoch milliseconds
    pub reset_at_ms: u64,
    /// Set only on denial
    pub retry_after: Option<Duration>,
    /// Clock reading the decision was made at, epoch milliseconds
    pub evaluated_at_ms: u64,
    /// Timestamp of the hit this check recorded, if it recorded one
    pub recorded_at: Option<u64>,
}

impl RateLimitDecision {
    pub(crate) fn allow(limit: u64, used: u64, reset_at_ms: u64, now: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit.saturating_sub(used),
            reset_at_ms,
            retry_after: None,
            evaluated_at_ms: now,
            recorded_at: Some(now),
        }
    }

    pub(crate) fn deny(limit: u64, reset_at_ms: u64, now: u64) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_at_ms,
            retry_after: Some(Duration::from_millis(reset_at_ms.saturating_sub(now))),
            evaluated_at_ms: now,
            recorded_at: None,
        }
    }

    /// Reset instant as epoch seconds, rounded up.
    pub fn reset_at_epoch_seconds(&self) -> u64 {
        ceil_seconds(self.reset_at_ms)
    }

    /// Seconds until reset, rounded up.
    pub fn reset_after_seconds(&self) -> u64 {
        ceil_seconds(self.reset_at_ms.saturating_sub(self.evaluated_at_ms))
    }

    /// `Retry-After` value in whole seconds, at least one.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        self.retry_after
            .map(|wait| ceil_seconds(wait.as_millis() as u64).max(1))
    }
}

fn ceil_seconds(ms: u64) -> u64 {
    ms.div_ceil(1000)
}

/// A rate limiting algorithm bound to one policy.
///
/// `key` is always the un-namespaced subject key produced by a
/// [`KeyGenerator`]; implementations prefix it with the policy name.
#[async_trait]
pub trait WindowAlgorithm: Send + Sync {
    /// The policy this algorithm enforces.
    fn policy(&self) -> &Policy;

    /// Decide whether one more request from `key` is admitted, recording it if so.
    async fn check(&self, key: &str) -> Result<RateLimitDecision, StoreError>;

    /// Withdraw the hit recorded by an earlier allowed `decision`.
    ///
    /// Best effort: a hit whose window already rolled over is left alone.
    async fn undo(&self, key: &str, decision: &RateLimitDecision) -> Result<(), StoreError>;

    /// Forget everything recorded for `key`.
    async fn reset(&self, key: &str) -> Result<(), StoreError>;
}

/// Build the algorithm `policy` asks for over `store`.
pub fn build_algorithm(
    policy: Arc<Policy>,
    store: Arc<dyn CounterStore>,
    clock: SharedClock,
) -> Arc<dyn WindowAlgorithm> {
    match policy.algorithm() {
        AlgorithmKind::FixedWindow => Arc::new(FixedWindow::new(policy, store, clock)),
        AlgorithmKind::SlidingLog => Arc::new(SlidingLog::new(policy, store, clock)),
        AlgorithmKind::SlidingCounter => Arc::new(SlidingCounter::new(policy, store, clock)),
    }
}
