//! Request body buffering for the login key strategy.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use serde_json::json;
use tower::{Layer, Service};
use tracing::debug;

use crate::ratelimit::LoginPayload;

/// Largest body buffered by default.
pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024;

/// Buffers request bodies and exposes JSON objects as a [`LoginPayload`].
///
/// Place it outside an [`AdmissionLayer`](super::AdmissionLayer) whose
/// policies key on login fields. The inner service receives the buffered
/// body unchanged.
#[derive(Clone, Debug)]
pub struct LoginPayloadLayer {
    max_body_bytes: usize,
}

impl LoginPayloadLayer {
    pub fn new() -> Self {
        Self {
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    /// Reject bodies larger than `limit` with 413.
    pub fn max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }
}

impl Default for LoginPayloadLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Layer<S> for LoginPayloadLayer {
    type Service = LoginPayloadService<S>;

    fn layer(&self, service: S) -> Self::Service {
        LoginPayloadService {
            inner: service,
            max_body_bytes: self.max_body_bytes,
        }
    }
}

/// Service produced by [`LoginPayloadLayer`].
#[derive(Clone, Debug)]
pub struct LoginPayloadService<S> {
    inner: S,
    max_body_bytes: usize,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for LoginPayloadService<S>
where
    S: Service<Request<Full<Bytes>>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Body + Send + 'static,
    ReqBody::Data: Send,
    ReqBody::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let max_body_bytes = self.max_body_bytes;
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let (mut parts, body) = request.into_parts();
            let bytes = match Limited::new(body, max_body_bytes).collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) if e.is::<LengthLimitError>() => {
                    return Ok(body_error(StatusCode::PAYLOAD_TOO_LARGE, "Request body is too large."));
                }
                Err(e) => {
                    debug!(error = %e, "Failed to read request body");
                    return Ok(body_error(StatusCode::BAD_REQUEST, "Request body could not be read."));
                }
            };

            if let Some(payload) = parse_payload(&bytes) {
                parts.extensions.insert(payload);
            }

            inner.call(Request::from_parts(parts, Full::new(bytes))).await
        })
    }
}

/// Only JSON objects name an account; anything else is left to the fallback chain.
fn parse_payload(bytes: &[u8]) -> Option<LoginPayload> {
    if bytes.is_empty() {
        return None;
    }
    serde_json::from_slice::<serde_json::Value>(bytes)
        .ok()
        .filter(serde_json::Value::is_object)
        .map(LoginPayload)
}

fn body_error<B: From<String>>(status: StatusCode, message: &str) -> Response<B> {
    let body = json!({
        "error": status.canonical_reason().unwrap_or("Bad Request"),
        "message": message,
    });
    let mut response = Response::new(B::from(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
