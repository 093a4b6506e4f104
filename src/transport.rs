//! Outbound transport to the fixed upstream.
//!
//! The client is built once at startup and shared by every forwarded
//! request. Egress is chosen once as well:
//!
//! - with a SOCKS5 upstream configured, every dial goes through it;
//! - otherwise the usual proxy environment variables are consulted for the
//!   upstream and, when one applies, dials are tunneled through it with
//!   CONNECT (plain `http://` proxies) or SOCKS5;
//! - otherwise dials are direct.
//!
//! TLS (rustls, native roots) and HTTP/2 negotiation sit on top of whichever
//! dialer was chosen.

use crate::auth::Auth;
use crate::body::RequestBody;
use crate::config::Socks5Upstream;
use crate::socks::SocksConnector;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::proxy::Tunnel;
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use hyper_util::client::legacy::Client;
use hyper_util::client::proxy::matcher::Matcher;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tower::Service;
use tracing::info;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// TCP dial timeout, also bounding the SOCKS5 handshake
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound on a complete connect: dial, proxy handshake and TLS
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
pub const POOL_MAX_IDLE_PER_HOST: usize = 256;
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

pub type OutboundConnector = HandshakeTimeout<HttpsConnector<UpstreamConnector>>;

/// Shared client used for every forwarded request
pub type HttpClient = Client<OutboundConnector, RequestBody>;

/// Errors building the transport; all of them abort startup
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to load native TLS roots: {0}")]
    TlsRoots(#[source] io::Error),

    #[error("unsupported proxy {proxy} from environment: {reason}")]
    UnsupportedEnvProxy { proxy: String, reason: &'static str },
}

#[derive(Debug, thiserror::Error)]
#[error("connect timed out after {0:?}")]
pub struct ConnectTimeout(pub Duration);

/// How outbound connections leave the process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Egress {
    Direct,
    HttpProxy(String),
    Socks5 { addr: String, user: Option<String> },
}

impl fmt::Display for Egress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Egress::Direct => write!(f, "direct"),
            Egress::HttpProxy(proxy) => write!(f, "HTTP proxy {} (from environment)", proxy),
            Egress::Socks5 { addr, user } => write!(f, "SOCKS5 proxy {} (user={:?})", addr, user),
        }
    }
}

/// Stream produced by [`UpstreamConnector`]
pub enum UpstreamStream {
    Tcp(TokioIo<TcpStream>),
    Socks(TokioIo<Socks5Stream<TcpStream>>),
}

impl Read for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            UpstreamStream::Socks(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl Write for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            UpstreamStream::Socks(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            UpstreamStream::Socks(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            UpstreamStream::Socks(s) => Pin::new(s).poll_shutdown(cx),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            UpstreamStream::Tcp(s) => s.is_write_vectored(),
            UpstreamStream::Socks(s) => s.is_write_vectored(),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Tcp(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            UpstreamStream::Socks(s) => Pin::new(s).poll_write_vectored(cx, bufs),
        }
    }
}

impl Connection for UpstreamStream {
    fn connected(&self) -> Connected {
        match self {
            UpstreamStream::Tcp(s) => s.connected(),
            UpstreamStream::Socks(_) => Connected::new(),
        }
    }
}

/// Plain-TCP dialer beneath TLS: direct, CONNECT tunnel or SOCKS5
#[derive(Clone)]
pub enum UpstreamConnector {
    Direct(HttpConnector),
    Tunnel(Tunnel<HttpConnector>),
    Socks(SocksConnector),
}

impl Service<http::Uri> for UpstreamConnector {
    type Response = UpstreamStream;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<UpstreamStream, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        match self {
            UpstreamConnector::Direct(c) => c.poll_ready(cx).map_err(Into::into),
            UpstreamConnector::Tunnel(t) => t.poll_ready(cx).map_err(Into::into),
            UpstreamConnector::Socks(_) => Poll::Ready(Ok(())),
        }
    }

    fn call(&mut self, dst: http::Uri) -> Self::Future {
        match self {
            UpstreamConnector::Direct(c) => {
                let connecting = c.call(dst);
                Box::pin(async move { Ok(UpstreamStream::Tcp(connecting.await?)) })
            }
            UpstreamConnector::Tunnel(t) => {
                let tunneling = t.call(dst);
                Box::pin(async move { Ok(UpstreamStream::Tcp(tunneling.await?)) })
            }
            UpstreamConnector::Socks(s) => {
                let socks = s.clone();
                Box::pin(async move {
                    let stream = socks.connect_uri(&dst).await?;
                    Ok(UpstreamStream::Socks(TokioIo::new(stream)))
                })
            }
        }
    }
}

/// Fails a connect that does not finish within `timeout`
#[derive(Debug, Clone)]
pub struct HandshakeTimeout<C> {
    inner: C,
    timeout: Duration,
}

impl<C> HandshakeTimeout<C> {
    pub fn new(inner: C, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl<C> Service<http::Uri> for HandshakeTimeout<C>
where
    C: Service<http::Uri>,
    C::Response: Send + 'static,
    C::Error: Into<BoxError>,
    C::Future: Send + 'static,
{
    type Response = C::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<C::Response, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, dst: http::Uri) -> Self::Future {
        let timeout = self.timeout;
        let connecting = self.inner.call(dst);
        Box::pin(async move {
            match tokio::time::timeout(timeout, connecting).await {
                Ok(result) => result.map_err(Into::into),
                Err(_) => Err(ConnectTimeout(timeout).into()),
            }
        })
    }
}

fn tcp_connector() -> HttpConnector {
    let mut http = HttpConnector::new();
    // TLS is layered on top, so https destinations must pass through
    http.enforce_http(false);
    http.set_connect_timeout(Some(DIAL_TIMEOUT));
    http.set_keepalive(Some(TCP_KEEPALIVE));
    http.set_nodelay(true);
    http
}

/// Choose the dialer for `upstream`.
///
/// `env_proxy` is the environment's proxy matcher; `None` skips the
/// environment entirely.
pub fn select_connector(
    upstream: &http::Uri,
    socks5: Option<&Socks5Upstream>,
    env_proxy: Option<&Matcher>,
) -> Result<(UpstreamConnector, Egress), TransportError> {
    if let Some(socks5) = socks5 {
        let egress = Egress::Socks5 {
            addr: socks5.addr.clone(),
            user: socks5.auth.as_ref().map(|a| a.username.clone()),
        };
        return Ok((
            UpstreamConnector::Socks(SocksConnector::new(socks5, DIAL_TIMEOUT)),
            egress,
        ));
    }

    let Some(intercept) = env_proxy.and_then(|m| m.intercept(upstream)) else {
        return Ok((UpstreamConnector::Direct(tcp_connector()), Egress::Direct));
    };

    let proxy_uri = intercept.uri().clone();
    let host = proxy_uri.host().unwrap_or_default();
    let unsupported = |reason: &'static str| TransportError::UnsupportedEnvProxy {
        proxy: format!("{}://{}", proxy_uri.scheme_str().unwrap_or("?"), host),
        reason,
    };
    match proxy_uri.scheme_str() {
        Some("http") => {
            let mut tunnel = Tunnel::new(proxy_uri.clone(), tcp_connector());
            if let Some(auth) = intercept.basic_auth() {
                tunnel = tunnel.with_auth(auth.clone());
            }
            let shown = format!("{}:{}", host, proxy_uri.port_u16().unwrap_or(80));
            Ok((UpstreamConnector::Tunnel(tunnel), Egress::HttpProxy(shown)))
        }
        Some("socks5") | Some("socks5h") => {
            let socks5 = Socks5Upstream {
                addr: format!("{}:{}", host, proxy_uri.port_u16().unwrap_or(1080)),
                auth: intercept
                    .raw_auth()
                    .map(|(user, pass)| Auth::new(user.to_string(), pass.to_string())),
            };
            select_connector(upstream, Some(&socks5), None)
        }
        // The CONNECT dialer speaks plain TCP to the proxy
        Some("https") => Err(unsupported("TLS to the proxy itself is not supported, use http://")),
        _ => Err(unsupported("only http, socks5 and socks5h proxies are supported")),
    }
}

/// Wrap a dialer with TLS, HTTP/2 negotiation and the connect bound
pub fn outbound_connector(dialer: UpstreamConnector) -> Result<OutboundConnector, TransportError> {
    // Only ring is compiled in; an error means a provider is already set
    let _ = rustls::crypto::ring::default_provider().install_default();

    let https = HttpsConnectorBuilder::new()
        .with_native_roots()
        .map_err(TransportError::TlsRoots)?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(dialer);

    Ok(HandshakeTimeout::new(https, TLS_HANDSHAKE_TIMEOUT))
}

/// Build the shared client for `upstream`
pub fn build_client(
    upstream: &http::Uri,
    socks5: Option<&Socks5Upstream>,
    env_proxy: Option<&Matcher>,
) -> Result<(HttpClient, Egress), TransportError> {
    let (dialer, egress) = select_connector(upstream, socks5, env_proxy)?;
    let connector = outbound_connector(dialer)?;

    let client = Client::builder(TokioExecutor::new())
        .pool_timer(TokioTimer::new())
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .build(connector);

    info!(%egress, upstream = %upstream, "outbound transport ready");
    Ok((client, egress))
}
