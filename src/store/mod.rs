//! Counter storage for rate limit state.
//!
//! Every piece of per-key mutable state lives behind [`CounterStore`], which is
//! how horizontally scaled replicas share limits. Two implementations ship
//! with the crate:
//!
//! - [`MemoryStore`]: single process, exact, reclaims expired keys with
//!   per-key reaper timers.
//! - [`RemoteStore`]: wraps any [`KvBackend`] (Redis via [`RedisBackend`]),
//!   eventually consistent and subject to lost updates when the backend has
//!   no native atomic increment.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod memory;
mod redis_kv;
mod remote;

pub use memory::MemoryStore;
pub use redis_kv::RedisBackend;
pub use remote::{KvBackend, RemoteStore};

/// Slack added on top of every logical TTL before a key physically expires.
pub const DEFAULT_EXPIRY_SLACK: Duration = Duration::from_secs(5);

/// Errors raised by counter stores.
///
/// The admission middleware treats every variant as "store unavailable".
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Transport or backend failure
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete before its deadline
    #[error("counter store call timed out after {0:?}")]
    Timeout(Duration),

    /// Stored state could not be decoded
    #[error("corrupt counter state: {0}")]
    Corrupt(String),
}

/// Per-key counting state.
///
/// `reset_time` is the logical end of the state's window in epoch
/// milliseconds. Stores keep the key readable until `reset_time` plus their
/// expiry slack, after which it is gone for good.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowState {
    /// Hits recorded in the current window
    pub count: u64,
    /// Logical expiry, epoch milliseconds
    pub reset_time: u64,
    /// Event timestamps for log-based algorithms, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<u64>,
}

impl WindowState {
    /// A fresh window holding a single hit.
    pub fn first_hit(now: u64, ttl: Duration) -> Self {
        Self {
            count: 1,
            reset_time: now.saturating_add(ttl.as_millis() as u64),
            history: Vec::new(),
        }
    }

    /// Whether the logical window has ended at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        self.reset_time <= now
    }

    /// Apply one increment at `now`, starting a new window when this one has ended.
    pub fn incremented(self, now: u64, ttl: Duration) -> Self {
        if self.is_expired(now) {
            Self::first_hit(now, ttl)
        } else {
            Self {
                count: self.count.saturating_add(1),
                ..self
            }
        }
    }
}

/// Abstract key-value counter with TTL.
///
/// `ttl` is always the logical window length. Implementations add their own
/// expiry slack so keys outlive the window they describe and still vanish
/// without further traffic.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Read the state for `key` without side effects.
    async fn get(&self, key: &str) -> Result<Option<WindowState>, StoreError>;

    /// Unconditionally overwrite the state for `key`.
    async fn set(&self, key: &str, state: WindowState, ttl: Duration) -> Result<(), StoreError>;

    /// Record one hit and return the updated state.
    ///
    /// Creates `{count: 1, reset_time: now + ttl}` when the key is absent or
    /// expired. Atomicity is implementation-defined: callers must tolerate
    /// under-counting from concurrent read-modify-write cycles.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<WindowState, StoreError>;

    /// Delete the state for `key` immediately.
    async fn reset(&self, key: &str) -> Result<(), StoreError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A store whose every call fails.
    #[derive(Debug, Default)]
    pub struct UnavailableStore;

    #[async_trait]
    impl CounterStore for UnavailableStore {
        async fn get(&self, _key: &str) -> Result<Option<WindowState>, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn set(&self, _key: &str, _state: WindowState, _ttl: Duration) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn increment(&self, _key: &str, _ttl: Duration) -> Result<WindowState, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn reset(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    /// A store that never answers.
    #[derive(Debug, Default)]
    pub struct HangingStore;

    #[async_trait]
    impl CounterStore for HangingStore {
        async fn get(&self, _key: &str) -> Result<Option<WindowState>, StoreError> {
            futures::future::pending().await
        }

        async fn set(&self, _key: &str, _state: WindowState, _ttl: Duration) -> Result<(), StoreError> {
            futures::future::pending().await
        }

        async fn increment(&self, _key: &str, _ttl: Duration) -> Result<WindowState, StoreError> {
            futures::future::pending().await
        }

        async fn reset(&self, _key: &str) -> Result<(), StoreError> {
            futures::future::pending().await
        }
    }
}
