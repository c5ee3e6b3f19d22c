//! Configuration management for Turnstile.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::clock::SharedClock;
use crate::error::{Result, TurnstileError};
use crate::ratelimit::PolicyConfig;
use crate::store::{CounterStore, MemoryStore, RedisBackend, RemoteStore};

/// Prefix for environment variable overrides, e.g. `TURNSTILE__STORE__BACKEND=redis`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Policy applied to every request when no tier table is set
    #[serde(default = "default_rate_limit")]
    pub rate_limit: PolicyConfig,

    /// Per-plan policies; must contain `default` when non-empty
    #[serde(default)]
    pub tiers: HashMap<String, PolicyConfig>,
}

impl Default for TurnstileConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            rate_limit: default_rate_limit(),
            tiers: HashMap::new(),
        }
    }
}

fn default_rate_limit() -> PolicyConfig {
    PolicyConfig::new("default", Duration::from_secs(60), 100)
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Map `x-user-id` / `x-user-plan` headers to a caller identity.
    /// Only safe behind a proxy that sets them.
    #[serde(default)]
    pub trust_identity_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            trust_identity_headers: false,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which counter store backs the limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process, exact, not shared between replicas
    #[default]
    Memory,
    /// Shared through Redis
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Redis pool size
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Prefix for every key written to a remote store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Deadline for a single remote store operation
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,

    /// How long keys outlive their window; must be non-zero
    #[serde(default = "default_expiry_slack_ms")]
    pub expiry_slack_ms: u64,

    /// Use the backend's atomic increment instead of read-modify-write
    #[serde(default = "default_native_increment")]
    pub native_increment: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            max_connections: default_max_connections(),
            key_prefix: default_key_prefix(),
            op_timeout_ms: default_op_timeout_ms(),
            expiry_slack_ms: default_expiry_slack_ms(),
            native_increment: default_native_increment(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_max_connections() -> usize {
    16
}

fn default_key_prefix() -> String {
    "turnstile".to_string()
}

fn default_op_timeout_ms() -> u64 {
    250
}

fn default_expiry_slack_ms() -> u64 {
    5_000
}

fn default_native_increment() -> bool {
    true
}

impl TurnstileConfig {
    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load configuration from an optional YAML file, then apply
    /// `TURNSTILE__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Yaml));
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| TurnstileError::Config(format!("Failed to load configuration: {}", e)))
    }
}

impl StoreConfig {
    /// Construct the configured counter store.
    ///
    /// Connects to Redis when that backend is selected, so a bad URL fails
    /// startup rather than the first request.
    pub async fn build(&self, clock: SharedClock) -> Result<Arc<dyn CounterStore>> {
        if self.expiry_slack_ms == 0 {
            return Err(TurnstileError::Config(
                "store.expiry_slack_ms must be greater than zero".to_string(),
            ));
        }
        let slack = Duration::from_millis(self.expiry_slack_ms);
        match self.backend {
            StoreBackend::Memory => {
                info!("Using in-memory counter store");
                Ok(Arc::new(MemoryStore::with_options(clock, slack)))
            }
            StoreBackend::Redis => {
                if self.max_connections == 0 {
                    return Err(TurnstileError::Config(
                        "store.max_connections must be greater than zero".to_string(),
                    ));
                }
                let backend = RedisBackend::connect(&self.redis_url, self.max_connections).await?;
                info!(
                    key_prefix = %self.key_prefix,
                    native_increment = self.native_increment,
                    "Using Redis counter store"
                );
                Ok(Arc::new(
                    RemoteStore::new(backend)
                        .with_key_prefix(self.key_prefix.clone())
                        .with_clock(clock)
                        .with_expiry_slack(slack)
                        .with_op_timeout(Duration::from_millis(self.op_timeout_ms))
                        .with_native_increment(self.native_increment),
                ))
            }
        }
    }
}
