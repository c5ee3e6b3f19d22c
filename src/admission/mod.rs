//! Per-request admission control.
//!
//! [`AdmissionMiddleware::evaluate`] runs one request through key derivation
//! and its window algorithm and yields an [`Admission`]. The admission knows
//! which headers to attach, whether to short-circuit with a rejection, and
//! whether the hit should be withdrawn once the handler's status is known.
//!
//! Store failures never escape this module. Each policy decides whether they
//! admit the request without headers (fail-open) or reject it with a 503
//! (fail-closed).

use std::sync::Arc;

use http::header::{HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderMap, Response, StatusCode};
use serde_json::json;
use tracing::{debug, trace, warn};

use crate::clock::SharedClock;
use crate::config::TurnstileConfig;
use crate::error::Result;
use crate::ratelimit::{
    build_algorithm, HeaderStyle, Policy, RateLimitDecision, RequestContext, TieredPolicySelector,
    WindowAlgorithm,
};
use crate::store::{CounterStore, StoreError};

mod body;
mod layer;

pub use body::{LoginPayloadLayer, LoginPayloadService, DEFAULT_MAX_BODY_BYTES};
pub use layer::{AdmissionLayer, AdmissionService};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
pub const RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
pub const RATELIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");

const STORE_FAILED_MESSAGE: &str = "Rate limiting is temporarily unavailable, please try again later.";

enum Limiter {
    Single(Arc<dyn WindowAlgorithm>),
    Tiered(TieredPolicySelector),
}

/// Admission control for one route or service.
///
/// Cheap to clone; clones share their algorithms and store.
#[derive(Clone)]
pub struct AdmissionMiddleware {
    limiter: Arc<Limiter>,
}

impl std::fmt::Debug for AdmissionMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.limiter.as_ref() {
            Limiter::Single(algorithm) => f
                .debug_struct("AdmissionMiddleware")
                .field("policy", &algorithm.policy().name())
                .finish(),
            Limiter::Tiered(selector) => f
                .debug_struct("AdmissionMiddleware")
                .field("selector", selector)
                .finish(),
        }
    }
}

/// How a request fared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Allowed(RateLimitDecision),
    Denied(RateLimitDecision),
    /// The store could not answer in time
    StoreFailed { error: StoreError, fail_open: bool },
}

/// The result of evaluating one request.
pub struct Admission {
    algorithm: Arc<dyn WindowAlgorithm>,
    tier: Option<String>,
    key: String,
    outcome: Outcome,
}

impl AdmissionMiddleware {
    /// Limit every request with one algorithm.
    pub fn new(algorithm: Arc<dyn WindowAlgorithm>) -> Self {
        Self {
            limiter: Arc::new(Limiter::Single(algorithm)),
        }
    }

    /// Limit each request with the algorithm of its caller's tier.
    pub fn tiered(selector: TieredPolicySelector) -> Self {
        Self {
            limiter: Arc::new(Limiter::Tiered(selector)),
        }
    }

    /// Build from configuration: the tier table when one is present, otherwise
    /// the single `rate_limit` policy.
    pub fn from_config(
        config: &TurnstileConfig,
        store: Arc<dyn CounterStore>,
        clock: SharedClock,
    ) -> Result<Self> {
        if config.tiers.is_empty() {
            let policy = Policy::from_config(&config.rate_limit)?;
            Ok(Self::new(build_algorithm(Arc::new(policy), store, clock)))
        } else {
            let selector = TieredPolicySelector::from_configs(&config.tiers, store, clock)?;
            Ok(Self::tiered(selector))
        }
    }

    /// Whether any policy keys on the request body.
    ///
    /// Such middleware needs a [`LoginPayloadLayer`] in front of it.
    pub fn reads_body(&self) -> bool {
        match self.limiter.as_ref() {
            Limiter::Single(algorithm) => algorithm.policy().key_generator().reads_body(),
            Limiter::Tiered(selector) => selector
                .algorithms()
                .any(|algorithm| algorithm.policy().key_generator().reads_body()),
        }
    }

    /// Decide whether the request described by `ctx` is admitted.
    pub async fn evaluate(&self, ctx: &RequestContext) -> Admission {
        let (algorithm, tier, key) = match self.limiter.as_ref() {
            Limiter::Single(algorithm) => {
                let key = algorithm.policy().key_generator().generate(ctx);
                (algorithm.clone(), None, key)
            }
            Limiter::Tiered(selector) => {
                let selection = selector.select(ctx.identity.as_ref());
                let subject = selection.algorithm.policy().key_generator().generate(ctx);
                let key = selection.salted_key(&subject);
                (selection.algorithm.clone(), Some(selection.tier.to_string()), key)
            }
        };

        let policy = algorithm.policy();
        let deadline = policy.store_timeout();

        trace!(
            policy = %policy.name(),
            key = %key,
            method = %ctx.method,
            path = %ctx.path,
            "Evaluating admission"
        );

        let checked = match tokio::time::timeout(deadline, algorithm.check(&key)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(deadline)),
        };

        let outcome = match checked {
            Ok(decision) if decision.allowed => Outcome::Allowed(decision),
            Ok(decision) => {
                debug!(
                    policy = %policy.name(),
                    key = %key,
                    limit = decision.limit,
                    retry_after_ms = decision.reset_at_ms.saturating_sub(decision.evaluated_at_ms),
                    "Rate limit exceeded"
                );
                Outcome::Denied(decision)
            }
            Err(error) => {
                warn!(
                    policy = %policy.name(),
                    key = %key,
                    error = %error,
                    fail_open = policy.fail_open(),
                    "Counter store failed during admission check"
                );
                Outcome::StoreFailed {
                    error,
                    fail_open: policy.fail_open(),
                }
            }
        };

        Admission {
            algorithm,
            tier,
            key,
            outcome,
        }
    }
}

impl Admission {
    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    /// The store-level subject key, tier salt included.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The tier the request was matched to, for tiered middleware.
    pub fn tier(&self) -> Option<&str> {
        self.tier.as_deref()
    }

    pub fn policy(&self) -> &Policy {
        self.algorithm.policy()
    }

    /// Whether the request may proceed to the handler.
    pub fn is_admitted(&self) -> bool {
        match &self.outcome {
            Outcome::Allowed(_) => true,
            Outcome::Denied(_) => false,
            Outcome::StoreFailed { fail_open, .. } => *fail_open,
        }
    }

    /// Attach rate limit headers in the policy's style.
    ///
    /// Store failures attach nothing.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        let decision = match &self.outcome {
            Outcome::Allowed(decision) | Outcome::Denied(decision) => decision,
            Outcome::StoreFailed { .. } => return,
        };

        let style = self.policy().header_style();
        if matches!(style, HeaderStyle::Legacy | HeaderStyle::Both) {
            headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
            headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
            headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_at_epoch_seconds()));
        }
        if matches!(style, HeaderStyle::Standard | HeaderStyle::Both) {
            headers.insert(RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
            headers.insert(RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
            headers.insert(RATELIMIT_RESET, HeaderValue::from(decision.reset_after_seconds()));
        }
        if let Some(retry_after) = decision.retry_after_seconds() {
            headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
        }
    }

    /// The response to send instead of calling the handler, if any.
    pub fn rejection<B: From<String>>(&self) -> Option<Response<B>> {
        let (status, body) = match &self.outcome {
            Outcome::Denied(decision) => {
                let policy = self.policy();
                let status = policy.status_code();
                let body = json!({
                    "error": status.canonical_reason().unwrap_or("Too Many Requests"),
                    "message": policy.message(),
                    "retryAfter": decision.retry_after_seconds().unwrap_or(1),
                });
                (status, body)
            }
            Outcome::StoreFailed {
                fail_open: false, ..
            } => {
                let status = StatusCode::SERVICE_UNAVAILABLE;
                let body = json!({
                    "error": "Service Unavailable",
                    "message": STORE_FAILED_MESSAGE,
                });
                (status, body)
            }
            _ => return None,
        };

        let mut response = Response::new(B::from(body.to_string()));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.apply_headers(response.headers_mut());
        Some(response)
    }

    /// Withdraw the recorded hit if the policy skips responses with `status`.
    ///
    /// Failures are logged and otherwise ignored.
    pub async fn complete(&self, status: StatusCode) {
        let Outcome::Allowed(decision) = &self.outcome else {
            return;
        };

        let policy = self.policy();
        let failed = status.is_client_error() || status.is_server_error();
        let skip = (policy.skip_successful_requests() && !failed) || (policy.skip_failed_requests() && failed);
        if !skip {
            return;
        }

        let deadline = policy.store_timeout();
        match tokio::time::timeout(deadline, self.algorithm.undo(&self.key, decision)).await {
            Ok(Ok(())) => {
                trace!(policy = %policy.name(), key = %self.key, status = status.as_u16(), "Withdrew skipped request");
            }
            Ok(Err(error)) => {
                warn!(policy = %policy.name(), key = %self.key, error = %error, "Failed to withdraw skipped request");
            }
            Err(_) => {
                warn!(policy = %policy.name(), key = %self.key, timeout = ?deadline, "Timed out withdrawing skipped request");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_test::assert_ok;

    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::{AlgorithmKind, Identity, KeyGenerator, PolicyBuilder, PolicyConfig};
    use crate::store::testing::{HangingStore, UnavailableStore};
    use crate::store::MemoryStore;

    fn ctx(ip: &str) -> RequestContext {
        RequestContext::new(http::Method::GET, "/v1/items").with_client_ip(ip.parse().unwrap())
    }

    fn middleware(builder: PolicyBuilder, store: Arc<dyn CounterStore>) -> (AdmissionMiddleware, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        let policy = Arc::new(builder.build().unwrap());
        let algorithm = build_algorithm(policy, store, Arc::new(clock.clone()));
        (AdmissionMiddleware::new(algorithm), clock)
    }

    fn memory(builder: PolicyBuilder) -> (AdmissionMiddleware, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));
        let policy = Arc::new(builder.build().unwrap());
        let algorithm = build_algorithm(policy, Arc::new(store), Arc::new(clock.clone()));
        (AdmissionMiddleware::new(algorithm), clock)
    }

    fn per_minute(max: u64) -> PolicyBuilder {
        Policy::builder("api").window(Duration::from_secs(60)).max(max)
    }

    fn header(headers: &HeaderMap, name: &str) -> Option<String> {
        headers.get(name).map(|v| v.to_str().unwrap().to_string())
    }

    #[tokio::test]
    async fn test_allowed_carries_legacy_headers() {
        let (middleware, _clock) = memory(per_minute(5));
        let admission = middleware.evaluate(&ctx("10.0.0.1")).await;

        assert!(admission.is_admitted());
        assert!(admission.rejection::<String>().is_none());
        assert_eq!(admission.key(), "ip:10.0.0.1");

        let mut headers = HeaderMap::new();
        admission.apply_headers(&mut headers);
        assert_eq!(header(&headers, "x-ratelimit-limit").as_deref(), Some("5"));
        assert_eq!(header(&headers, "x-ratelimit-remaining").as_deref(), Some("4"));
        assert_eq!(header(&headers, "x-ratelimit-reset").as_deref(), Some("1060"));
        assert!(headers.get(RETRY_AFTER).is_none());
        assert!(headers.get("ratelimit-limit").is_none());
    }

    #[tokio::test]
    async fn test_standard_headers_use_delta_seconds() {
        let (middleware, _clock) = memory(per_minute(5).header_style(HeaderStyle::Both));
        let admission = middleware.evaluate(&ctx("10.0.0.1")).await;

        let mut headers = HeaderMap::new();
        admission.apply_headers(&mut headers);
        assert_eq!(header(&headers, "ratelimit-reset").as_deref(), Some("60"));
        assert_eq!(header(&headers, "ratelimit-remaining").as_deref(), Some("4"));
        assert_eq!(header(&headers, "x-ratelimit-reset").as_deref(), Some("1060"));
    }

    #[tokio::test]
    async fn test_denied_rejection_contract() {
        let (middleware, clock) = memory(per_minute(1).message("Slow down."));
        middleware.evaluate(&ctx("10.0.0.1")).await;
        clock.advance(Duration::from_secs(15));

        let admission = middleware.evaluate(&ctx("10.0.0.1")).await;
        assert!(!admission.is_admitted());
        assert!(matches!(admission.outcome(), Outcome::Denied(_)));

        let response: Response<String> = admission.rejection().unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(response.headers(), "retry-after").as_deref(), Some("45"));
        assert_eq!(header(response.headers(), "x-ratelimit-remaining").as_deref(), Some("0"));
        assert_eq!(
            header(response.headers(), "content-type").as_deref(),
            Some("application/json")
        );

        let body: serde_json::Value = serde_json::from_str(response.body()).unwrap();
        assert_eq!(body["error"], "Too Many Requests");
        assert_eq!(body["message"], "Slow down.");
        assert_eq!(body["retryAfter"], 45);
    }

    #[tokio::test]
    async fn test_custom_status_code() {
        let (middleware, _clock) = memory(per_minute(1).status_code(503));
        middleware.evaluate(&ctx("10.0.0.1")).await;

        let response: Response<String> = middleware.evaluate(&ctx("10.0.0.1")).await.rejection().unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_fail_open_admits_everything_without_headers() {
        let (middleware, _clock) = middleware(per_minute(1), Arc::new(UnavailableStore));

        for _ in 0..100 {
            let admission = middleware.evaluate(&ctx("10.0.0.1")).await;
            assert!(admission.is_admitted());
            assert!(admission.rejection::<String>().is_none());

            let mut headers = HeaderMap::new();
            admission.apply_headers(&mut headers);
            assert!(headers.is_empty());
        }
    }

    #[tokio::test]
    async fn test_fail_closed_rejects_everything_with_503() {
        let (middleware, _clock) = middleware(per_minute(1000).fail_open(false), Arc::new(UnavailableStore));

        for _ in 0..100 {
            let admission = middleware.evaluate(&ctx("10.0.0.1")).await;
            assert!(!admission.is_admitted());

            let response: Response<String> = admission.rejection().unwrap();
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
            assert!(response.headers().get("x-ratelimit-limit").is_none());
        }
    }

    #[tokio::test]
    async fn test_hanging_store_times_out() {
        let builder = per_minute(5).store_timeout(Duration::from_millis(20));
        let (middleware, _clock) = middleware(builder, Arc::new(HangingStore));

        let admission = middleware.evaluate(&ctx("10.0.0.1")).await;
        match admission.outcome() {
            Outcome::StoreFailed { error, fail_open } => {
                assert_eq!(*error, StoreError::Timeout(Duration::from_millis(20)));
                assert!(*fail_open);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remaining_stays_within_limit() {
        for kind in [
            AlgorithmKind::FixedWindow,
            AlgorithmKind::SlidingLog,
            AlgorithmKind::SlidingCounter,
        ] {
            let (middleware, clock) = memory(per_minute(7).algorithm(kind));
            for i in 0..50 {
                let admission = middleware.evaluate(&ctx("10.0.0.1")).await;
                let mut headers = HeaderMap::new();
                admission.apply_headers(&mut headers);

                let remaining: u64 = header(&headers, "x-ratelimit-remaining").unwrap().parse().unwrap();
                assert!(remaining <= 7, "{:?} request {}", kind, i);
                clock.advance(Duration::from_secs(3));
            }
        }
    }

    #[tokio::test]
    async fn test_skip_failed_requests_gives_quota_back() {
        let (middleware, _clock) = memory(per_minute(2).skip_failed_requests(true));

        for _ in 0..5 {
            let admission = middleware.evaluate(&ctx("10.0.0.1")).await;
            assert!(admission.is_admitted());
            admission.complete(StatusCode::UNAUTHORIZED).await;
        }

        let admission = middleware.evaluate(&ctx("10.0.0.1")).await;
        admission.complete(StatusCode::OK).await;
        let admission = middleware.evaluate(&ctx("10.0.0.1")).await;
        admission.complete(StatusCode::OK).await;
        assert!(!middleware.evaluate(&ctx("10.0.0.1")).await.is_admitted());
    }

    #[tokio::test]
    async fn test_skip_successful_requests_counts_only_failures() {
        let (middleware, _clock) = memory(
            per_minute(1)
                .algorithm(AlgorithmKind::SlidingLog)
                .skip_successful_requests(true),
        );

        for _ in 0..3 {
            middleware.evaluate(&ctx("10.0.0.1")).await.complete(StatusCode::OK).await;
        }
        let admission = middleware.evaluate(&ctx("10.0.0.1")).await;
        assert!(admission.is_admitted());
        admission.complete(StatusCode::FORBIDDEN).await;

        assert!(!middleware.evaluate(&ctx("10.0.0.1")).await.is_admitted());
    }

    #[tokio::test]
    async fn test_undo_failure_is_swallowed() {
        let (middleware, _clock) = middleware(per_minute(1).skip_failed_requests(true), Arc::new(UnavailableStore));
        let admission = middleware.evaluate(&ctx("10.0.0.1")).await;
        admission.complete(StatusCode::INTERNAL_SERVER_ERROR).await;
        assert!(admission.is_admitted());
    }

    #[tokio::test]
    async fn test_tiered_middleware_salts_keys() {
        let clock = ManualClock::new(0);
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));

        let mut config = TurnstileConfig::default();
        let mut free = PolicyConfig::new("api", Duration::from_secs(60), 1);
        free.key = crate::ratelimit::KeyStrategy::User;
        let mut pro = free.clone();
        pro.max = 10;
        config.tiers.insert("default".to_string(), free);
        config.tiers.insert("pro".to_string(), pro);

        let middleware = assert_ok!(AdmissionMiddleware::from_config(
            &config,
            Arc::new(store.clone()),
            Arc::new(clock)
        ));

        let request = ctx("10.0.0.1").with_identity(Identity::new("42").with_plan("pro"));
        let admission = middleware.evaluate(&request).await;
        assert_eq!(admission.tier(), Some("pro"));
        assert_eq!(admission.key(), "tier:pro:user:42");
        assert!(store.get("api:tier:pro:user:42").await.unwrap().is_some());

        let anonymous = middleware.evaluate(&ctx("10.0.0.9")).await;
        assert_eq!(anonymous.tier(), Some("default"));
        assert_eq!(anonymous.key(), "tier:default:ip:10.0.0.9");
    }

    #[tokio::test]
    async fn test_reads_body_only_for_login_keys() {
        let (plain, _clock) = memory(per_minute(1));
        assert!(!plain.reads_body());

        let (login, _clock) = memory(per_minute(1).key_generator(KeyGenerator::login(vec!["email".to_string()])));
        assert!(login.reads_body());

        let mut config = TurnstileConfig::default();
        let free = PolicyConfig::new("api", Duration::from_secs(60), 1);
        let mut auth = free.clone();
        auth.key = crate::ratelimit::KeyStrategy::Login;
        config.tiers.insert("default".to_string(), free);
        config.tiers.insert("auth".to_string(), auth);
        let clock = ManualClock::new(0);
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));
        let tiered = assert_ok!(AdmissionMiddleware::from_config(&config, Arc::new(store), Arc::new(clock)));
        assert!(tiered.reads_body());
    }
}
