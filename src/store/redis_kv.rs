//! Redis transport for [`RemoteStore`](super::RemoteStore).

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config as RedisPoolConfig, Connection, Pool, PoolConfig, Runtime};
use redis::{AsyncCommands, Script};
use tracing::{debug, info};

use super::{KvBackend, StoreError, WindowState};

/// Server-side fixed-window increment.
const INCREMENT_SCRIPT: &str = include_str!("../../scripts/window_increment.lua");

fn unavailable(context: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable(format!("{}: {}", context, err))
}

/// Pooled Redis connection implementing [`KvBackend`].
///
/// `atomic_increment` runs a Lua script, so fixed-window counters stay exact
/// across replicas. Log and bucket state still goes through plain `GET`/`SET`.
pub struct RedisBackend {
    pool: Pool,
    script: Script,
}

impl RedisBackend {
    /// Build a pool for `url` and verify it answers `PING`.
    pub async fn connect(url: &str, max_connections: usize) -> Result<Self, StoreError> {
        info!(max_connections, "Creating Redis connection pool");

        let mut cfg = RedisPoolConfig::from_url(url);
        cfg.pool = Some(PoolConfig::new(max_connections));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| unavailable("pool creation failed", e))?;

        let backend = Self::from_pool(pool);
        backend.ping().await?;
        info!("Redis connection test successful");

        Ok(backend)
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: Pool) -> Self {
        Self {
            pool,
            script: Script::new(INCREMENT_SCRIPT),
        }
    }

    /// Round-trip a `PING`.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let response: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| unavailable("PING failed", e))?;

        if response != "PONG" {
            return Err(StoreError::Unavailable(format!(
                "unexpected PING response: {}",
                response
            )));
        }
        Ok(())
    }

    async fn connection(&self) -> Result<Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| unavailable("failed to get connection", e))
    }
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection().await?;
        conn.get(key).await.map_err(|e| unavailable("GET failed", e))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut *conn)
            .await
            .map_err(|e| unavailable("SET failed", e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn.del(key).await.map_err(|e| unavailable("DEL failed", e))?;
        Ok(())
    }

    async fn atomic_increment(
        &self,
        key: &str,
        now: u64,
        ttl: Duration,
        slack: Duration,
    ) -> Result<Option<WindowState>, StoreError> {
        let mut conn = self.connection().await?;
        let (count, reset_time): (u64, u64) = self
            .script
            .key(key)
            .arg(now)
            .arg(ttl.as_millis() as u64)
            .arg(slack.as_millis() as u64)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| unavailable("increment script failed", e))?;

        debug!(key = %key, count, reset_time, "Redis increment script executed");

        Ok(Some(WindowState {
            count,
            reset_time,
            history: Vec::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_is_embedded() {
        assert!(INCREMENT_SCRIPT.contains("redis.call('SET'"));
        assert!(!Script::new(INCREMENT_SCRIPT).get_hash().is_empty());
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_is_unavailable() {
        let result = RedisBackend::connect("redis://127.0.0.1:1/", 1).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
