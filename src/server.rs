//! HTTP server fronted by the admission layer.
//!
//! Serves a small JSON echo endpoint so a deployed policy can be exercised
//! end to end with any HTTP client.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, Request, Response};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use serde_json::json;
use tokio::net::TcpListener;
use tower::util::Either;
use tower::{service_fn, Layer, ServiceExt};
use tracing::{debug, info, warn};

use crate::admission::{AdmissionLayer, AdmissionMiddleware, LoginPayloadLayer};
use crate::error::Result;
use crate::ratelimit::{ClientAddr, Identity};

/// Header naming the caller when identity headers are trusted.
pub const USER_ID_HEADER: &str = "x-user-id";
/// Header naming the caller's plan when identity headers are trusted.
pub const USER_PLAN_HEADER: &str = "x-user-plan";

/// HTTP server for the admission middleware.
pub struct Server {
    /// Address to bind to
    addr: SocketAddr,
    middleware: AdmissionMiddleware,
    trust_identity_headers: bool,
}

impl Server {
    pub fn new(addr: SocketAddr, middleware: AdmissionMiddleware) -> Self {
        Self {
            addr,
            middleware,
            trust_identity_headers: false,
        }
    }

    /// Derive caller identity from `x-user-id` / `x-user-plan`.
    pub fn trust_identity_headers(mut self, trust: bool) -> Self {
        self.trust_identity_headers = trust;
        self
    }

    /// Bind and serve until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve_listener(listener, signal).await
    }

    /// Serve connections from an already bound listener until `signal` resolves.
    ///
    /// Connections in flight when the signal fires are left to finish on their own.
    pub async fn serve_listener<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        info!(addr = %listener.local_addr()?, "HTTP server listening");
        tokio::pin!(signal);

        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("HTTP server shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };
                    self.spawn_connection(stream, peer);
                }
            }
        }

        Ok(())
    }

    fn spawn_connection(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let admission = AdmissionLayer::new(self.middleware.clone());
        let admitted = if self.middleware.reads_body() {
            Either::Left(LoginPayloadLayer::new().layer(admission.layer(service_fn(echo::<Full<Bytes>>))))
        } else {
            Either::Right(admission.layer(service_fn(echo::<Incoming>)))
        };
        let trust_identity_headers = self.trust_identity_headers;

        tokio::spawn(async move {
            let svc = hyper::service::service_fn(move |mut request: Request<Incoming>| {
                request.extensions_mut().insert(ClientAddr(peer));
                if trust_identity_headers {
                    if let Some(identity) = identity_from_headers(request.headers()) {
                        request.extensions_mut().insert(identity);
                    }
                }
                admitted.clone().oneshot(request)
            });

            let builder = ConnBuilder::new(TokioExecutor::new());
            if let Err(e) = builder.serve_connection(TokioIo::new(stream), svc).await {
                debug!(%peer, error = %e, "Connection closed with error");
            }
        });
    }
}

/// Build an [`Identity`] from trusted upstream headers.
pub fn identity_from_headers(headers: &HeaderMap) -> Option<Identity> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    let mut identity = Identity::new(header(USER_ID_HEADER)?);
    identity.plan = header(USER_PLAN_HEADER).map(str::to_string);
    Some(identity)
}

async fn echo<B>(request: Request<B>) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let body = json!({
        "status": "ok",
        "method": request.method().as_str(),
        "path": request.uri().path(),
        "user": request.extensions().get::<Identity>().map(|identity| identity.id.clone()),
    });

    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(response)
}
