//! Inbound side: routing, middleware composition and the accept loop.

use crate::access_log::AccessLog;
use crate::body::{text_response, DeadlineBody, RequestBody, ResponseBody};
use crate::connection::ConnectionTracker;
use crate::forward::Forwarder;
use crate::middleware::{AccessLogLayer, AccessLogService, PeerAddr, RateLimit, RateLimitLayer};
use crate::rate_limit::IpRateLimiter;
use chrono::{Local, SecondsFormat};
use futures_util::future::{self, BoxFuture};
use futures_util::FutureExt;
use http::{Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceBuilder, ServiceExt};
use tracing::{debug, info, warn};

pub const HEALTH_PATH: &str = "/healthz";

/// Deadline for a complete request head; also ends idle keep-alive connections
pub const READ_HEADER_TIMEOUT: Duration = Duration::from_secs(15);

/// Deadline for the request body, counted from the request head
pub const READ_BODY_TIMEOUT: Duration = Duration::from_secs(15);

/// Deadline for writing the whole response, counted from the request head
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(60);

/// Largest request head accepted
pub const MAX_HEADER_BYTES: usize = 1 << 20;

/// How long shutdown waits for in-flight connections
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Limits applied to every inbound connection
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub read_header: Duration,
    pub read_body: Duration,
    pub write: Duration,
    pub max_header_bytes: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            read_header: READ_HEADER_TIMEOUT,
            read_body: READ_BODY_TIMEOUT,
            write: WRITE_TIMEOUT,
            max_header_bytes: MAX_HEADER_BYTES,
        }
    }
}

/// Complete per-request stack
pub type ProxyService = AccessLogService<Router<RateLimit<Forwarder>>>;

/// Answers the health check itself and hands everything else to `proxy`
#[derive(Clone)]
pub struct Router<S> {
    proxy: S,
}

impl<S> Router<S> {
    pub fn new(proxy: S) -> Self {
        Self { proxy }
    }
}

impl<S> Service<Request<RequestBody>> for Router<S>
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
        self.proxy.poll_ready(cx)
    }

    fn call(&mut self, req: Request<RequestBody>) -> Self::Future {
        // Health checks are never rate limited
        if req.uri().path() == HEALTH_PATH {
            return Box::pin(async { Ok(healthz()) });
        }

        let clone = self.proxy.clone();
        let mut proxy = std::mem::replace(&mut self.proxy, clone);
        Box::pin(future::lazy(move |_| proxy.call(req)).flatten())
    }
}

/// `ok <RFC3339 local time>`
pub fn healthz() -> Response<ResponseBody> {
    let now = Local::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    text_response(StatusCode::OK, format!("ok {}", now))
}

/// Compose access log → router → rate limit → forwarder
pub fn build_service(
    forwarder: Forwarder,
    limiter: Arc<IpRateLimiter>,
    access_log: AccessLog,
    trust_forwarded: bool,
) -> ProxyService {
    ServiceBuilder::new()
        .layer(AccessLogLayer::new(access_log, trust_forwarded))
        .layer_fn(Router::new)
        .layer(RateLimitLayer::new(limiter, trust_forwarded))
        .service(forwarder)
}

/// HTTP/1.1 listener serving one [`ProxyService`]
pub struct Server {
    listener: TcpListener,
    service: ProxyService,
    limits: ConnectionLimits,
    connections: ConnectionTracker,
}

impl Server {
    pub fn new(listener: TcpListener, service: ProxyService, limits: ConnectionLimits) -> Self {
        Self {
            listener,
            service,
            limits,
            connections: ConnectionTracker::new(),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until `shutdown` fires, then wait up to `grace` for open
    /// connections.
    ///
    /// Returns the number of connections still open when the grace period
    /// ran out.
    pub async fn run(self, shutdown: CancellationToken, grace: Duration) -> usize {
        let Server {
            listener,
            service,
            limits,
            connections,
        } = self;

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer_addr) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Accept error: {} (continuing)", e);
                    continue;
                }
            };

            let guard = connections.track();
            let service = service.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                serve_connection(stream, peer_addr, service, limits, shutdown).await;
                drop(guard);
            });
        }

        info!("Stopped accepting connections");
        drop(listener);
        drop(service);
        connections.drain(grace).await
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    service: ProxyService,
    limits: ConnectionLimits,
    shutdown: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay failed for {}: {}", peer_addr, e);
    }

    let io = TokioIo::new(stream);
    let svc = hyper::service::service_fn(move |req: Request<Incoming>| {
        // Body deadlines count from the moment the head was parsed
        let started = Instant::now();
        let (mut parts, body) = req.into_parts();
        parts.extensions.insert(PeerAddr(peer_addr));
        let body = DeadlineBody::until(body, started + limits.read_body, limits.read_body);
        let req = Request::from_parts(parts, body.boxed_unsync());

        let responding = service.clone().oneshot(req);
        let fut: BoxFuture<'static, Result<_, Infallible>> = Box::pin(responding.map(move |resp| {
            let resp = resp?;
            Ok::<_, Infallible>(resp.map(|body| {
                DeadlineBody::until(body, started + limits.write, limits.write)
                    .map_err(io::Error::other)
                    .boxed_unsync()
            }))
        }));
        fut
    });

    let mut builder = http1::Builder::new();
    builder
        .timer(TokioTimer::new())
        .header_read_timeout(limits.read_header)
        .max_buf_size(limits.max_header_bytes);
    let conn = builder.serve_connection(io, svc);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.as_mut().await
        }
    };

    if let Err(err) = result {
        // Only log connection errors, not normal endings
        if !err.is_incomplete_message() {
            debug!("Connection from {} error: {}", peer_addr, err);
        }
    }
}
