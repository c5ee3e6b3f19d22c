//! Rate limit key derivation.
//!
//! A key names the subject a policy counts against. Keys from different
//! strategies carry distinct prefixes (`user:`, `apikey:`, `ip:`, `login:`)
//! and are namespaced by policy name before they reach a store.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use http::{HeaderMap, Method};

/// Header carrying a caller's API key.
pub const API_KEY_HEADER: &str = "x-api-key";
/// Header listing the proxies a request passed through.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
/// Key used when a request carries no usable origin.
pub const UNKNOWN_KEY: &str = "unknown";

/// Caller identity resolved by an upstream authentication layer.
///
/// Insert it into the request extensions to enable identity keys and tiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    /// Plan or role, used to pick a tier
    pub plan: Option<String>,
}

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            plan: None,
        }
    }

    pub fn with_plan(mut self, plan: impl Into<String>) -> Self {
        self.plan = Some(plan.into());
        self
    }
}

/// Peer address of the connection, inserted into request extensions by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

/// Parsed JSON body made available to the login key strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct LoginPayload(pub serde_json::Value);

/// The request attributes key derivation may look at.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub client_ip: Option<IpAddr>,
    pub identity: Option<Identity>,
    pub body: Option<serde_json::Value>,
}

impl RequestContext {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            ..Default::default()
        }
    }

    /// Build a context from request parts and the extensions upstream layers attached.
    pub fn from_parts(parts: &http::request::Parts) -> Self {
        Self {
            method: parts.method.clone(),
            path: parts.uri.path().to_string(),
            headers: parts.headers.clone(),
            client_ip: parts.extensions.get::<ClientAddr>().map(|addr| addr.0.ip()),
            identity: parts.extensions.get::<Identity>().cloned(),
            body: parts.extensions.get::<LoginPayload>().map(|payload| payload.0.clone()),
        }
    }

    pub fn with_client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = value.parse() {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    fn api_key(&self) -> Option<&str> {
        self.headers
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }

    fn forwarded_ip(&self) -> Option<IpAddr> {
        self.headers
            .get(FORWARDED_FOR_HEADER)?
            .to_str()
            .ok()?
            .split(',')
            .next()?
            .trim()
            .parse()
            .ok()
    }

    fn login_target(&self, fields: &[String]) -> Option<String> {
        let body = self.body.as_ref()?;
        fields
            .iter()
            .filter_map(|field| body.get(field.as_str()).and_then(|v| v.as_str()))
            .map(|value| value.trim().to_lowercase())
            .find(|value| !value.is_empty())
    }
}

/// Caller-supplied key function. Returning `None` defers to the built-in chain.
pub type CustomKeyFn = Arc<dyn Fn(&RequestContext) -> Option<String> + Send + Sync>;

#[derive(Clone)]
enum KeySource {
    Auto,
    Ip,
    Identity,
    ApiKey,
    Login(Vec<String>),
    Custom(CustomKeyFn),
}

impl std::fmt::Debug for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Auto => write!(f, "Auto"),
            KeySource::Ip => write!(f, "Ip"),
            KeySource::Identity => write!(f, "Identity"),
            KeySource::ApiKey => write!(f, "ApiKey"),
            KeySource::Login(fields) => f.debug_tuple("Login").field(fields).finish(),
            KeySource::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Derives a rate limit key from a [`RequestContext`].
///
/// Every strategy falls back along the same chain when its own signal is
/// missing: identity (`user:<id>`), API key (`apikey:<key>`), client
/// address (`ip:<addr>`), and finally `"unknown"`.
#[derive(Debug, Clone)]
pub struct KeyGenerator {
    source: KeySource,
    trust_forwarded_for: bool,
}

impl KeyGenerator {
    fn with_source(source: KeySource) -> Self {
        Self {
            source,
            trust_forwarded_for: false,
        }
    }

    /// Identity, then API key, then client address.
    pub fn auto() -> Self {
        Self::with_source(KeySource::Auto)
    }

    /// Client address only.
    pub fn ip() -> Self {
        Self::with_source(KeySource::Ip)
    }

    /// Authenticated identity, falling back to the client address.
    pub fn identity() -> Self {
        Self::with_source(KeySource::Identity)
    }

    /// API key header, falling back to the client address.
    pub fn api_key() -> Self {
        Self::with_source(KeySource::ApiKey)
    }

    /// The account named by the first non-empty body field in `fields`.
    ///
    /// Repeated attempts against one account share a key regardless of which
    /// address they come from.
    pub fn login(fields: Vec<String>) -> Self {
        Self::with_source(KeySource::Login(fields))
    }

    /// A caller-supplied function, taking priority over every built-in strategy.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&RequestContext) -> Option<String> + Send + Sync + 'static,
    {
        Self::with_source(KeySource::Custom(Arc::new(f)))
    }

    /// Use the first `X-Forwarded-For` hop as the client address.
    pub fn trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }

    /// Whether keys depend on the request body.
    pub fn reads_body(&self) -> bool {
        matches!(self.source, KeySource::Login(_))
    }

    /// Derive the key for `ctx`.
    pub fn generate(&self, ctx: &RequestContext) -> String {
        let primary = match &self.source {
            KeySource::Auto => None,
            KeySource::Ip => return self.ip_key(ctx),
            KeySource::Identity => identity_key(ctx),
            KeySource::ApiKey => api_key(ctx),
            KeySource::Login(fields) => ctx.login_target(fields).map(|target| format!("login:{}", target)),
            KeySource::Custom(f) => f(ctx),
        };

        primary
            .or_else(|| identity_key(ctx))
            .or_else(|| api_key(ctx))
            .unwrap_or_else(|| self.ip_key(ctx))
    }

    fn ip_key(&self, ctx: &RequestContext) -> String {
        let forwarded = if self.trust_forwarded_for {
            ctx.forwarded_ip()
        } else {
            None
        };

        match forwarded.or(ctx.client_ip) {
            Some(ip) => format!("ip:{}", ip.to_canonical()),
            None => UNKNOWN_KEY.to_string(),
        }
    }
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::auto()
    }
}

fn identity_key(ctx: &RequestContext) -> Option<String> {
    ctx.identity.as_ref().map(|identity| format!("user:{}", identity.id))
}

fn api_key(ctx: &RequestContext) -> Option<String> {
    ctx.api_key().map(|key| format!("apikey:{}", key))
}
