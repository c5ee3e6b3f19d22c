//! Rate limit policies.
//!
//! A [`Policy`] is immutable once built. It is usually produced from a
//! [`PolicyConfig`] loaded from YAML; validation happens here so a bad policy
//! stops the service at startup instead of failing per request.

use std::time::Duration;

use http::StatusCode;
use serde::{Deserialize, Serialize};

use super::key::KeyGenerator;
use crate::error::{Result, TurnstileError};

/// Sub-window count used by the bucketed counter when none is configured.
pub const DEFAULT_SUB_WINDOWS: u32 = 10;

const DEFAULT_MESSAGE: &str = "Too many requests, please try again later.";
const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(1);

/// Which window algorithm enforces the policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    /// One counter per fixed, non-overlapping window
    #[default]
    FixedWindow,
    /// Exact trailing window over a capped timestamp log
    SlidingLog,
    /// Trailing window approximated by sub-window buckets
    SlidingCounter,
}

/// Shorthand window lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of this unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// Which rate limit headers are attached to responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderStyle {
    /// `X-RateLimit-*`, reset as epoch seconds
    #[default]
    Legacy,
    /// `RateLimit-*`, reset as seconds from now
    Standard,
    /// Both sets
    Both,
}

/// Built-in key derivation strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// Identity, then API key, then client address
    #[default]
    Auto,
    Ip,
    User,
    ApiKey,
    /// Target account named in the request body
    Login,
}

/// Serialized form of a policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Namespace for every key this policy writes
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub algorithm: AlgorithmKind,
    /// Window length in milliseconds (exclusive with `unit`)
    #[serde(default)]
    pub window_ms: Option<u64>,
    /// Window length as a unit (exclusive with `window_ms`)
    #[serde(default)]
    pub unit: Option<TimeUnit>,
    /// Requests permitted per window
    pub max: u64,
    /// Buckets per window for `sliding_counter`
    #[serde(default)]
    pub sub_window_count: Option<u32>,
    #[serde(default)]
    pub key: KeyStrategy,
    /// Body fields naming the target account for the `login` strategy
    #[serde(default = "default_login_fields")]
    pub login_fields: Vec<String>,
    #[serde(default = "default_message")]
    pub message: String,
    #[serde(default = "default_status_code")]
    pub status_code: u16,
    #[serde(default)]
    pub skip_successful_requests: bool,
    #[serde(default)]
    pub skip_failed_requests: bool,
    #[serde(default = "default_fail_open")]
    pub fail_open: bool,
    #[serde(default)]
    pub headers: HeaderStyle,
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    /// Prefer the first `X-Forwarded-For` hop over the socket address
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

fn default_name() -> String {
    "default".to_string()
}

fn default_login_fields() -> Vec<String> {
    vec!["email".to_string(), "username".to_string()]
}

fn default_message() -> String {
    DEFAULT_MESSAGE.to_string()
}

fn default_status_code() -> u16 {
    StatusCode::TOO_MANY_REQUESTS.as_u16()
}

fn default_fail_open() -> bool {
    true
}

fn default_store_timeout_ms() -> u64 {
    DEFAULT_STORE_TIMEOUT.as_millis() as u64
}

impl PolicyConfig {
    /// A fixed-window config with every other field at its default.
    pub fn new(name: impl Into<String>, window: Duration, max: u64) -> Self {
        Self {
            name: name.into(),
            algorithm: AlgorithmKind::default(),
            window_ms: Some(window.as_millis() as u64),
            unit: None,
            max,
            sub_window_count: None,
            key: KeyStrategy::default(),
            login_fields: default_login_fields(),
            message: default_message(),
            status_code: default_status_code(),
            skip_successful_requests: false,
            skip_failed_requests: false,
            fail_open: default_fail_open(),
            headers: HeaderStyle::default(),
            store_timeout_ms: default_store_timeout_ms(),
            trust_forwarded_for: false,
        }
    }
}

/// Validated, immutable rate limit policy.
#[derive(Debug, Clone)]
pub struct Policy {
    name: String,
    algorithm: AlgorithmKind,
    window: Duration,
    max: u64,
    sub_window_count: u32,
    key_generator: KeyGenerator,
    message: String,
    status_code: StatusCode,
    skip_successful_requests: bool,
    skip_failed_requests: bool,
    fail_open: bool,
    header_style: HeaderStyle,
    store_timeout: Duration,
}

impl Policy {
    /// Start building a policy named `name`.
    pub fn builder(name: impl Into<String>) -> PolicyBuilder {
        PolicyBuilder::new(name)
    }

    /// Validate a serialized policy.
    pub fn from_config(config: &PolicyConfig) -> Result<Self> {
        let name = &config.name;
        let window = match (config.window_ms, config.unit) {
            (Some(ms), None) => Duration::from_millis(ms),
            (None, Some(unit)) => unit.duration(),
            (Some(_), Some(_)) => {
                return Err(invalid(name, "set either window_ms or unit, not both"));
            }
            (None, None) => return Err(invalid(name, "one of window_ms or unit is required")),
        };

        let key_generator = match config.key {
            KeyStrategy::Auto => KeyGenerator::auto(),
            KeyStrategy::Ip => KeyGenerator::ip(),
            KeyStrategy::User => KeyGenerator::identity(),
            KeyStrategy::ApiKey => KeyGenerator::api_key(),
            KeyStrategy::Login => {
                if config.login_fields.is_empty() {
                    return Err(invalid(name, "the login key strategy needs at least one login field"));
                }
                KeyGenerator::login(config.login_fields.clone())
            }
        }
        .trust_forwarded_for(config.trust_forwarded_for);

        let mut builder = Policy::builder(name.clone())
            .algorithm(config.algorithm)
            .window(window)
            .max(config.max)
            .key_generator(key_generator)
            .message(config.message.clone())
            .status_code(config.status_code)
            .skip_successful_requests(config.skip_successful_requests)
            .skip_failed_requests(config.skip_failed_requests)
            .fail_open(config.fail_open)
            .header_style(config.headers)
            .store_timeout(Duration::from_millis(config.store_timeout_ms));
        if let Some(count) = config.sub_window_count {
            builder = builder.sub_window_count(count);
        }
        builder.build()
    }

    /// Policy name, also the store key namespace.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Which window algorithm enforces the policy.
    pub fn algorithm(&self) -> AlgorithmKind {
        self.algorithm
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Window length in milliseconds.
    pub fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }

    /// Requests admitted per window.
    pub fn max(&self) -> u64 {
        self.max
    }

    /// Bucket count for the sliding counter.
    pub fn sub_window_count(&self) -> u32 {
        self.sub_window_count
    }

    /// How request keys are derived.
    pub fn key_generator(&self) -> &KeyGenerator {
        &self.key_generator
    }

    /// Message returned in the rejection body.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Status code for denied requests.
    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }

    /// Withdraw hits whose response status is below 400.
    pub fn skip_successful_requests(&self) -> bool {
        self.skip_successful_requests
    }

    /// Withdraw hits whose response status is 400 or above.
    pub fn skip_failed_requests(&self) -> bool {
        self.skip_failed_requests
    }

    /// Admit requests when the counter store is unavailable.
    pub fn fail_open(&self) -> bool {
        self.fail_open
    }

    /// Which rate limit headers are attached.
    pub fn header_style(&self) -> HeaderStyle {
        self.header_style
    }

    /// Deadline for one admission check against the store.
    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }

    /// Prefix a subject key with this policy's namespace.
    pub fn namespaced(&self, subject: &str) -> String {
        format!("{}:{}", self.name, subject)
    }
}

/// Builder for [`Policy`].
#[derive(Debug, Clone)]
pub struct PolicyBuilder {
    name: String,
    algorithm: AlgorithmKind,
    window: Duration,
    max: u64,
    sub_window_count: u32,
    key_generator: KeyGenerator,
    message: String,
    status_code: u16,
    skip_successful_requests: bool,
    skip_failed_requests: bool,
    fail_open: bool,
    header_style: HeaderStyle,
    store_timeout: Duration,
}

impl PolicyBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            algorithm: AlgorithmKind::default(),
            window: Duration::ZERO,
            max: 0,
            sub_window_count: DEFAULT_SUB_WINDOWS,
            key_generator: KeyGenerator::auto(),
            message: default_message(),
            status_code: default_status_code(),
            skip_successful_requests: false,
            skip_failed_requests: false,
            fail_open: true,
            header_style: HeaderStyle::default(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Window algorithm, fixed window by default.
    pub fn algorithm(mut self, algorithm: AlgorithmKind) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Window length. Required.
    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Requests admitted per window. Required.
    pub fn max(mut self, max: u64) -> Self {
        self.max = max;
        self
    }

    /// Buckets per window for the sliding counter.
    pub fn sub_window_count(mut self, count: u32) -> Self {
        self.sub_window_count = count;
        self
    }

    /// Key derivation, [`KeyGenerator::auto`] by default.
    pub fn key_generator(mut self, key_generator: KeyGenerator) -> Self {
        self.key_generator = key_generator;
        self
    }

    /// Rejection body message.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Status code for denials, 429 by default.
    pub fn status_code(mut self, status_code: u16) -> Self {
        self.status_code = status_code;
        self
    }

    /// Don't count requests that end below 400.
    pub fn skip_successful_requests(mut self, skip: bool) -> Self {
        self.skip_successful_requests = skip;
        self
    }

    /// Don't count requests that end at 400 or above.
    pub fn skip_failed_requests(mut self, skip: bool) -> Self {
        self.skip_failed_requests = skip;
        self
    }

    /// Admit requests when the store fails. On by default.
    pub fn fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    /// Rate limit header flavor.
    pub fn header_style(mut self, style: HeaderStyle) -> Self {
        self.header_style = style;
        self
    }

    /// Deadline for one admission check against the store.
    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Validate and freeze the policy.
    pub fn build(self) -> Result<Policy> {
        let name = &self.name;
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(invalid(name, "name must be non-empty and contain no whitespace"));
        }
        if self.max == 0 {
            return Err(invalid(name, "max must be greater than zero"));
        }
        if self.window.as_millis() == 0 {
            return Err(invalid(name, "window must be at least one millisecond"));
        }
        if self.algorithm == AlgorithmKind::SlidingCounter {
            if self.sub_window_count == 0 {
                return Err(invalid(name, "sub_window_count must be greater than zero"));
            }
            if self.window.as_millis() < u128::from(self.sub_window_count) {
                return Err(invalid(name, "each sub-window must span at least one millisecond"));
            }
        }
        let status_code = StatusCode::from_u16(self.status_code)
            .ok()
            .filter(|code| code.is_client_error() || code.is_server_error())
            .ok_or_else(|| invalid(name, "status_code must be a 4xx or 5xx code"))?;
        if self.store_timeout.is_zero() {
            return Err(invalid(name, "store timeout must be greater than zero"));
        }

        Ok(Policy {
            name: self.name,
            algorithm: self.algorithm,
            window: self.window,
            max: self.max,
            sub_window_count: self.sub_window_count,
            key_generator: self.key_generator,
            message: self.message,
            status_code,
            skip_successful_requests: self.skip_successful_requests,
            skip_failed_requests: self.skip_failed_requests,
            fail_open: self.fail_open,
            header_style: self.header_style,
            store_timeout: self.store_timeout,
        })
    }
}

fn invalid(name: &str, reason: &str) -> TurnstileError {
    TurnstileError::Config(format!("policy '{}': {}", name, reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_unit_duration() {
        assert_eq!(TimeUnit::Second.duration(), Duration::from_secs(1));
        assert_eq!(TimeUnit::Minute.duration(), Duration::from_secs(60));
        assert_eq!(TimeUnit::Hour.duration(), Duration::from_secs(3600));
        assert_eq!(TimeUnit::Day.duration(), Duration::from_secs(86400));
    }

    #[test]
    fn test_builder_defaults() {
        let policy = Policy::builder("api")
            .window(Duration::from_secs(60))
            .max(5)
            .build()
            .unwrap();

        assert_eq!(policy.algorithm(), AlgorithmKind::FixedWindow);
        assert_eq!(policy.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert!(policy.fail_open());
        assert_eq!(policy.header_style(), HeaderStyle::Legacy);
        assert_eq!(policy.namespaced("ip:10.0.0.1"), "api:ip:10.0.0.1");
    }

    #[test]
    fn test_rejects_zero_max() {
        let err = Policy::builder("api")
            .window(Duration::from_secs(60))
            .max(0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("max must be greater than zero"));
    }

    #[test]
    fn test_rejects_zero_window() {
        let result = Policy::builder("api").max(5).build();
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }

    #[test]
    fn test_rejects_success_status_code() {
        let result = Policy::builder("api")
            .window(Duration::from_secs(1))
            .max(1)
            .status_code(200)
            .build();
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }

    #[test]
    fn test_rejects_sub_windows_finer_than_a_millisecond() {
        let result = Policy::builder("api")
            .algorithm(AlgorithmKind::SlidingCounter)
            .window(Duration::from_millis(5))
            .max(1)
            .sub_window_count(10)
            .build();
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }

    #[test]
    fn test_from_yaml_config() {
        let yaml = r#"
name: login
algorithm: sliding_log
unit: minute
max: 5
key: login
status_code: 429
fail_open: false
headers: both
"#;
        let config: PolicyConfig = serde_yaml::from_str(yaml).unwrap();
        let policy = Policy::from_config(&config).unwrap();

        assert_eq!(policy.name(), "login");
        assert_eq!(policy.algorithm(), AlgorithmKind::SlidingLog);
        assert_eq!(policy.window(), Duration::from_secs(60));
        assert!(!policy.fail_open());
        assert_eq!(policy.header_style(), HeaderStyle::Both);
        assert_eq!(policy.message(), DEFAULT_MESSAGE);
    }

    #[test]
    fn test_config_requires_exactly_one_window() {
        let mut config = PolicyConfig::new("api", Duration::from_secs(1), 10);
        config.unit = Some(TimeUnit::Second);
        assert!(Policy::from_config(&config).is_err());

        config.window_ms = None;
        config.unit = None;
        assert!(Policy::from_config(&config).is_err());
    }

    #[test]
    fn test_login_strategy_needs_fields() {
        let mut config = PolicyConfig::new("login", Duration::from_secs(60), 5);
        config.key = KeyStrategy::Login;
        config.login_fields.clear();
        assert!(Policy::from_config(&config).is_err());
    }
}
