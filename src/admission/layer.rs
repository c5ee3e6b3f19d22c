//! Tower integration.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use http::{Request, Response};
use tower::{Layer, Service};

use super::AdmissionMiddleware;
use crate::ratelimit::RequestContext;

/// Applies an [`AdmissionMiddleware`] in front of an HTTP service.
#[derive(Clone, Debug)]
pub struct AdmissionLayer {
    middleware: AdmissionMiddleware,
}

impl AdmissionLayer {
    pub fn new(middleware: AdmissionMiddleware) -> Self {
        Self { middleware }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService {
            inner: service,
            middleware: self.middleware.clone(),
        }
    }
}

/// Service produced by [`AdmissionLayer`].
///
/// Rejected requests never reach the inner service. Admitted responses get
/// rate limit headers, and the skip options are applied once the inner
/// service's status is known.
#[derive(Clone, Debug)]
pub struct AdmissionService<S> {
    inner: S,
    middleware: AdmissionMiddleware,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for AdmissionService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let middleware = self.middleware.clone();
        // Take the service that was driven to readiness and leave a fresh clone behind
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let (parts, body) = request.into_parts();
            let ctx = RequestContext::from_parts(&parts);
            let request = Request::from_parts(parts, body);

            let admission = middleware.evaluate(&ctx).await;
            if let Some(rejection) = admission.rejection() {
                return Ok(rejection);
            }

            let mut response = inner.call(request).await?;
            admission.apply_headers(response.headers_mut());
            admission.complete(response.status()).await;
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use http::StatusCode;
    use tower::{service_fn, ServiceBuilder, ServiceExt};

    use super::*;
    use crate::clock::system_clock;
    use crate::ratelimit::{build_algorithm, ClientAddr, Identity, KeyGenerator, Policy};
    use crate::store::testing::UnavailableStore;
    use crate::store::{CounterStore, MemoryStore};

    fn admission(max: u64, store: Arc<dyn CounterStore>, fail_open: bool) -> AdmissionMiddleware {
        let clock = system_clock();
        let policy = Policy::builder("api")
            .window(Duration::from_secs(60))
            .max(max)
            .key_generator(KeyGenerator::identity())
            .fail_open(fail_open)
            .build()
            .unwrap();
        AdmissionMiddleware::new(build_algorithm(Arc::new(policy), store, clock))
    }

    fn request(user: &str) -> Request<String> {
        let mut request = Request::builder()
            .uri("/v1/items")
            .body(String::new())
            .unwrap();
        request
            .extensions_mut()
            .insert(ClientAddr("10.0.0.1:4000".parse().unwrap()));
        request.extensions_mut().insert(Identity::new(user));
        request
    }

    #[tokio::test]
    async fn test_denied_requests_skip_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = service_fn(move |_req: Request<String>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, Infallible>(Response::new("ok".to_string())) }
        });

        let middleware = admission(2, Arc::new(MemoryStore::new()), true);
        let service = ServiceBuilder::new()
            .layer(AdmissionLayer::new(middleware))
            .service(handler);

        for expected in ["1", "0"] {
            let response = service.clone().oneshot(request("42")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.body(), "ok");
            assert_eq!(response.headers()["x-ratelimit-remaining"], expected);
        }

        let response = service.clone().oneshot(request("42")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("retry-after"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Another identity has its own quota
        let response = service.clone().oneshot(request("43")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_store_outage_with_fail_open_passes_through() {
        let handler = service_fn(|_req: Request<String>| async {
            Ok::<_, Infallible>(Response::new("ok".to_string()))
        });
        let service = AdmissionLayer::new(admission(1, Arc::new(UnavailableStore), true)).layer(handler);

        let response = service.oneshot(request("42")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
    }

    #[tokio::test]
    async fn test_store_outage_with_fail_closed_rejects() {
        let handler = service_fn(|_req: Request<String>| async {
            Ok::<_, Infallible>(Response::new("ok".to_string()))
        });
        let service = AdmissionLayer::new(admission(1, Arc::new(UnavailableStore), false)).layer(handler);

        let response = service.oneshot(request("42")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
