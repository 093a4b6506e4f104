//! Access logging and rate limiting as tower layers.
//!
//! Both wrap any service answering `Request<RequestBody>` with
//! `Response<ResponseBody>` and never fail, so they compose in either order.
//! The server stacks them as access log → router → rate limit → forwarder.

use crate::access_log::AccessLog;
use crate::body::{too_many_requests, RequestBody, ResponseBody};
use crate::rate_limit::IpRateLimiter;
use bytes::Bytes;
use futures_util::future::{self, BoxFuture};
use futures_util::FutureExt;
use http::header::USER_AGENT;
use http::{Request, Response};
use http_body::{Body, Frame, SizeHint};
use http_body_util::BodyExt;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::debug;

/// Remote address of the connection a request arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

/// Best-effort client IP.
///
/// With `trust_forwarded` the first `X-Forwarded-For` entry wins, then
/// `X-Real-IP`. Otherwise, or when neither is set, the peer address is used.
pub fn client_ip<B>(req: &Request<B>, trust_forwarded: bool) -> String {
    if trust_forwarded {
        let headers = req.headers();
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }

        let real_ip = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|ip| !ip.is_empty());
        if let Some(ip) = real_ip {
            return ip.to_string();
        }
    }

    match req.extensions().get::<PeerAddr>() {
        Some(PeerAddr(addr)) => addr.ip().to_string(),
        None => "unknown".to_string(),
    }
}

/// Rejects requests over the per-IP quota with 429
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<IpRateLimiter>,
    trust_forwarded: bool,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<IpRateLimiter>, trust_forwarded: bool) -> Self {
        Self {
            limiter,
            trust_forwarded,
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimit<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimit {
            inner,
            limiter: Arc::clone(&self.limiter),
            trust_forwarded: self.trust_forwarded,
        }
    }
}

#[derive(Clone)]
pub struct RateLimit<S> {
    inner: S,
    limiter: Arc<IpRateLimiter>,
    trust_forwarded: bool,
}

impl<S> Service<Request<RequestBody>> for RateLimit<S>
where
    S: Service<Request<RequestBody>, Response = Response<ResponseBody>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    type Response = Response<ResponseBody>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<RequestBody>) -> Self::Future {
        let ip = client_ip(&req, self.trust_forwarded);
        if !self.limiter.allow(&ip) {
            debug!(%ip, "rate limited");
            return Box::pin(async { Ok(too_many_requests()) });
        }

        // Use the instance that was polled ready and leave a fresh clone behind
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(future::lazy(move |_| inner.call(req)).flatten())
    }
}

/// Pending access line, recorded when dropped.
///
/// It travels with the request future and then with the response body, so
/// the line is written once the exchange is over or abandoned.
struct AccessEntry {
    log: AccessLog,
    ip: String,
    user_agent: String,
}

impl Drop for AccessEntry {
    fn drop(&mut self) {
        self.log.record(&self.ip, &self.user_agent);
    }
}

/// Response body carrying its request's access entry
struct Logged {
    inner: ResponseBody,
    _entry: AccessEntry,
}

impl Body for Logged {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Enqueues one access line per request, once its response body is done
#[derive(Clone)]
pub struct AccessLogLayer {
    log: AccessLog,
    trust_forwarded: bool,
}

impl AccessLogLayer {
    pub fn new(log: AccessLog, trust_forwarded: bool) -> Self {
        Self {
            log,
            trust_forwarded,
        }
    }
}

impl<S> Layer<S> for AccessLogLayer {
    type Service = AccessLogService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AccessLogService {
            inner,
            log: self.log.clone(),
            trust_forwarded: self.trust_forwarded,
        }
    }
}

#[derive(Clone)]
pub struct AccessLogService<S> {
    inner: S,
    log: AccessLog,
    trust_forwarded: bool,
}

impl<S> Service<Request<RequestBody>> for AccessLogService<S>
where
    S: Service<Request<RequestBody>, Response = Response<ResponseBody>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    type Response = Response<ResponseBody>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<RequestBody>) -> Self::Future {
        // Captured before the forwarder replaces the User-Agent
        let ip = client_ip(&req, self.trust_forwarded);
        let user_agent = req
            .headers()
            .get(USER_AGENT)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .unwrap_or_default();

        let entry = AccessEntry {
            log: self.log.clone(),
            ip,
            user_agent,
        };
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(future::lazy(move |_| inner.call(req)).flatten().map(move |resp| {
            let resp = resp?;
            Ok::<_, Infallible>(resp.map(|body| {
                Logged {
                    inner: body,
                    _entry: entry,
                }
                .boxed_unsync()
            }))
        }))
    }
}
