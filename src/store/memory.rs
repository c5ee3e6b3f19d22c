//! In-process counter store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::trace;

use super::{CounterStore, StoreError, WindowState, DEFAULT_EXPIRY_SLACK};
use crate::clock::{system_clock, SharedClock};

/// A stored state plus the bookkeeping needed to reclaim it.
struct Slot {
    state: WindowState,
    /// Physical expiry, epoch milliseconds
    expires_at: u64,
    /// Distinguishes re-armed slots so a stale reaper never removes a newer one
    generation: u64,
    reaper: Option<JoinHandle<()>>,
}

impl Slot {
    fn is_live(&self, now: u64) -> bool {
        now < self.expires_at
    }

    fn cancel_reaper(&self) {
        if let Some(reaper) = &self.reaper {
            reaper.abort();
        }
    }
}

struct Inner {
    slots: DashMap<String, Slot>,
    clock: SharedClock,
    expiry_slack: Duration,
    generation: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            slot.cancel_reaper();
        }
    }
}

/// Single-node counter store with exact counts.
///
/// Each key owns a reaper task that deletes it once its physical TTL passes,
/// so idle keys are reclaimed even if nothing reads them again. Reapers are
/// owned by the store and cancelled when the last handle is dropped. Outside
/// a Tokio runtime no reapers are spawned and expiry is purely lazy.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("keys", &self.inner.slots.len())
            .field("expiry_slack", &self.inner.expiry_slack)
            .finish()
    }
}

impl MemoryStore {
    /// Create a store on the system clock with the default expiry slack.
    pub fn new() -> Self {
        Self::with_options(system_clock(), DEFAULT_EXPIRY_SLACK)
    }

    /// Create a store reading time from `clock`.
    pub fn with_clock(clock: SharedClock) -> Self {
        Self::with_options(clock, DEFAULT_EXPIRY_SLACK)
    }

    /// Create a store with an explicit clock and expiry slack.
    pub fn with_options(clock: SharedClock, expiry_slack: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: DashMap::new(),
                clock,
                expiry_slack,
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Number of keys currently held, expired or not.
    pub fn len(&self) -> usize {
        self.inner.slots.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.inner.slots.is_empty()
    }

    /// Drop every key and cancel all reapers.
    pub fn clear(&self) {
        self.inner.slots.retain(|_, slot| {
            slot.cancel_reaper();
            false
        });
    }

    fn new_slot(&self, key: &str, state: WindowState, now: u64, expires_at: u64) -> Slot {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let delay = Duration::from_millis(expires_at.saturating_sub(now));
        let reaper = spawn_reaper(Arc::downgrade(&self.inner), key.to_string(), generation, delay);
        Slot {
            state,
            expires_at,
            generation,
            reaper,
        }
    }

    fn slack_millis(&self) -> u64 {
        self.inner.expiry_slack.as_millis() as u64
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_reaper(
    inner: Weak<Inner>,
    key: String,
    generation: u64,
    delay: Duration,
) -> Option<JoinHandle<()>> {
    let runtime = tokio::runtime::Handle::try_current().ok()?;
    Some(runtime.spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(inner) = inner.upgrade() {
            if inner.slots.remove_if(&key, |_, slot| slot.generation == generation).is_some() {
                trace!(key = %key, "Reclaimed expired counter");
            }
        }
    }))
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<WindowState>, StoreError> {
        let now = self.inner.clock.now_millis();
        Ok(self
            .inner
            .slots
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.state.clone()))
    }

    async fn set(&self, key: &str, state: WindowState, ttl: Duration) -> Result<(), StoreError> {
        let now = self.inner.clock.now_millis();
        let expires_at = now
            .saturating_add(ttl.as_millis() as u64)
            .saturating_add(self.slack_millis());
        let slot = self.new_slot(key, state, now, expires_at);
        if let Some(previous) = self.inner.slots.insert(key.to_string(), slot) {
            previous.cancel_reaper();
        }
        Ok(())
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<WindowState, StoreError> {
        let now = self.inner.clock.now_millis();

        match self.inner.slots.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied)
                if occupied.get().is_live(now) && !occupied.get().state.is_expired(now) =>
            {
                let slot = occupied.get_mut();
                slot.state.count = slot.state.count.saturating_add(1);
                Ok(slot.state.clone())
            }
            MapEntry::Occupied(mut occupied) => {
                let state = WindowState::first_hit(now, ttl);
                let expires_at = state.reset_time.saturating_add(self.slack_millis());
                let slot = self.new_slot(key, state.clone(), now, expires_at);
                occupied.insert(slot).cancel_reaper();
                Ok(state)
            }
            MapEntry::Vacant(vacant) => {
                let state = WindowState::first_hit(now, ttl);
                let expires_at = state.reset_time.saturating_add(self.slack_millis());
                vacant.insert(self.new_slot(key, state.clone(), now, expires_at));
                Ok(state)
            }
        }
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        if let Some((_, slot)) = self.inner.slots.remove(key) {
            slot.cancel_reaper();
        }
        Ok(())
    }
}
