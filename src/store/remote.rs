//! Counter store backed by a remote key-value service.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use super::{CounterStore, StoreError, WindowState, DEFAULT_EXPIRY_SLACK};
use crate::clock::{system_clock, SharedClock};

/// Default bound on a single backend round-trip.
const DEFAULT_OP_TIMEOUT: Duration = Duration::from_millis(250);

/// Minimal transport a remote key-value service must offer.
///
/// Values are opaque strings with a per-key TTL. Backends that can run an
/// increment server-side override [`KvBackend::atomic_increment`].
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Fetch a value, `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store a value that expires after `ttl`.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;

    /// Remove a value.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Apply [`WindowState::incremented`] to `key` atomically on the server.
    ///
    /// The key must be kept for `slack` beyond the resulting `reset_time`.
    /// Returns `Ok(None)` when the backend has no such primitive.
    async fn atomic_increment(
        &self,
        _key: &str,
        _now: u64,
        _ttl: Duration,
        _slack: Duration,
    ) -> Result<Option<WindowState>, StoreError> {
        Ok(None)
    }
}

/// Distributed, eventually consistent counter store.
///
/// Every operation is a network call bounded by `op_timeout`. Unless the
/// backend provides a native atomic increment, `increment` is a best-effort
/// read-modify-write: two replicas that read the same count concurrently will
/// both write `count + 1` and one hit is lost. Enforcement is therefore
/// approximate under contention.
pub struct RemoteStore<B> {
    backend: B,
    key_prefix: String,
    clock: SharedClock,
    expiry_slack: Duration,
    op_timeout: Duration,
    native_increment: bool,
}

impl<B: KvBackend> RemoteStore<B> {
    /// Wrap a backend with default settings.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            key_prefix: String::new(),
            clock: system_clock(),
            expiry_slack: DEFAULT_EXPIRY_SLACK,
            op_timeout: DEFAULT_OP_TIMEOUT,
            native_increment: true,
        }
    }

    /// Namespace every key under `prefix`.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Read time from `clock`.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Keep keys alive for `slack` beyond their logical window.
    pub fn with_expiry_slack(mut self, slack: Duration) -> Self {
        self.expiry_slack = slack;
        self
    }

    /// Bound each backend call.
    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    /// Use the backend's atomic increment when it has one.
    pub fn with_native_increment(mut self, enabled: bool) -> Self {
        self.native_increment = enabled;
        self
    }

    /// The wrapped backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn full_key(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.key_prefix, key)
        }
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.op_timeout, op)
            .await
            .map_err(|_| StoreError::Timeout(self.op_timeout))?
    }

    async fn read(&self, full_key: &str) -> Result<Option<WindowState>, StoreError> {
        match self.bounded(self.backend.get(full_key)).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StoreError::Corrupt(format!("{}: {}", full_key, e))),
            None => Ok(None),
        }
    }

    async fn write(&self, full_key: &str, state: &WindowState, ttl: Duration) -> Result<(), StoreError> {
        let raw = serde_json::to_string(state).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.bounded(self.backend.set(full_key, raw, ttl)).await
    }
}

#[async_trait]
impl<B: KvBackend> CounterStore for RemoteStore<B> {
    async fn get(&self, key: &str) -> Result<Option<WindowState>, StoreError> {
        self.read(&self.full_key(key)).await
    }

    async fn set(&self, key: &str, state: WindowState, ttl: Duration) -> Result<(), StoreError> {
        self.write(&self.full_key(key), &state, ttl + self.expiry_slack).await
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<WindowState, StoreError> {
        let full_key = self.full_key(key);
        let now = self.clock.now_millis();

        if self.native_increment {
            let native = self
                .bounded(self.backend.atomic_increment(&full_key, now, ttl, self.expiry_slack))
                .await?;
            if let Some(state) = native {
                return Ok(state);
            }
        }

        // Best-effort read-modify-write. Concurrent writers can overwrite each other.
        let next = match self.read(&full_key).await? {
            Some(current) => current.incremented(now, ttl),
            None => WindowState::first_hit(now, ttl),
        };
        let remaining = Duration::from_millis(next.reset_time.saturating_sub(now));
        self.write(&full_key, &next, remaining + self.expiry_slack).await?;

        trace!(key = %full_key, count = next.count, "Incremented remote counter");
        Ok(next)
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.bounded(self.backend.delete(&self.full_key(key))).await
    }
}
