//! Forwarding to the fixed upstream.
//!
//! Requests are rewritten to look like they came straight from a browser:
//! proxy fingerprints and hop-by-hop headers are dropped, the User-Agent is
//! replaced and missing language/encoding preferences are filled in.

use crate::body::{bad_gateway, RequestBody, ResponseBody};
use crate::buffer_pool::{BufferLease, BufferPool};
use crate::transport::{BoxError, HttpClient};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{future, StreamExt, TryStreamExt};
use http::header::{HeaderName, ACCEPT_ENCODING, ACCEPT_LANGUAGE, CONNECTION, HOST, USER_AGENT};
use http::uri::{PathAndQuery, Uri};
use http::{HeaderMap, HeaderValue, Request, Response, Version};
use http_body::{Body, Frame};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyStream;
use std::convert::Infallible;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_util::io::{poll_read_buf, StreamReader};
use tower::Service;
use tracing::{error, warn};

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
pub const DEFAULT_ACCEPT_LANGUAGE: &str = "zh-CN,zh;q=0.9,en;q=0.8";
pub const DEFAULT_ACCEPT_ENCODING: &str = "gzip, deflate, br";

/// Headers that reveal a proxy in the path
const FINGERPRINT_HEADERS: [&str; 7] = [
    "x-real-ip",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
    "forwarded",
    "via",
    "proxy-connection",
];

const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("invalid upstream request")]
    InvalidRequest(#[from] http::Error),

    #[error("upstream request failed")]
    Request(#[from] hyper_util::client::legacy::Error),

    #[error("no upstream response within {0:?}")]
    Timeout(Duration),
}

/// Forwards requests to one upstream through the shared client
#[derive(Clone)]
pub struct Forwarder {
    client: HttpClient,
    upstream: Uri,
    pool: Arc<BufferPool>,
    response_timeout: Duration,
}

impl Forwarder {
    pub fn new(
        client: HttpClient,
        upstream: Uri,
        pool: Arc<BufferPool>,
        response_timeout: Duration,
    ) -> Self {
        Self {
            client,
            upstream,
            pool,
            response_timeout,
        }
    }

    /// Forward `req` and return the upstream response, or a generic 502
    pub async fn forward(&self, req: Request<RequestBody>) -> Response<ResponseBody> {
        let method = req.method().clone();
        let path = req
            .uri()
            .path_and_query()
            .map_or("/", PathAndQuery::as_str)
            .to_string();

        match self.send(req).await {
            Ok(resp) => self.relay(resp),
            Err(err) => {
                error!(%method, %path, error = %error_chain(&err), "proxy error");
                bad_gateway()
            }
        }
    }

    async fn send(
        &self,
        req: Request<RequestBody>,
    ) -> Result<Response<hyper::body::Incoming>, UpstreamError> {
        let req = rewrite_request(req, &self.upstream)?;
        match tokio::time::timeout(self.response_timeout, self.client.request(req)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(UpstreamError::Timeout(self.response_timeout)),
        }
    }

    fn relay(&self, resp: Response<hyper::body::Incoming>) -> Response<ResponseBody> {
        let (mut parts, body) = resp.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        let body = PooledBody::new(body, Arc::clone(&self.pool));
        Response::from_parts(parts, UnsyncBoxBody::new(body))
    }
}

impl Service<Request<RequestBody>> for Forwarder {
    type Response = Response<ResponseBody>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<RequestBody>) -> Self::Future {
        let forwarder = self.clone();
        Box::pin(async move { Ok(forwarder.forward(req).await) })
    }
}

/// Point `req` at the upstream and disguise it
pub fn rewrite_request(
    req: Request<RequestBody>,
    upstream: &Uri,
) -> Result<Request<RequestBody>, http::Error> {
    let (mut parts, body) = req.into_parts();
    parts.uri = upstream_uri(upstream, &parts.uri)?;
    // The pooled client picks HTTP/1.1 or h2 per connection
    parts.version = Version::HTTP_11;
    disguise_headers(&mut parts.headers);
    Ok(Request::from_parts(parts, body))
}

/// Join the inbound path and query onto the upstream base
pub fn upstream_uri(upstream: &Uri, inbound: &Uri) -> Result<Uri, http::Error> {
    let base_path = upstream.path();
    let path = inbound.path();
    let joined = match (base_path.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base_path, &path[1..]),
        (false, false) => format!("{}/{}", base_path, path),
        _ => format!("{}{}", base_path, path),
    };

    let path_and_query = match (upstream.query(), inbound.query()) {
        (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => format!("{}?{}&{}", joined, a, b),
        (Some(q), _) | (_, Some(q)) if !q.is_empty() => format!("{}?{}", joined, q),
        _ => joined,
    };

    let mut builder = Uri::builder();
    if let Some(scheme) = upstream.scheme() {
        builder = builder.scheme(scheme.clone());
    }
    if let Some(authority) = upstream.authority() {
        builder = builder.authority(authority.clone());
    }
    builder.path_and_query(path_and_query).build()
}

/// Header rewrites applied to every forwarded request
pub fn disguise_headers(headers: &mut HeaderMap) {
    strip_hop_by_hop(headers);
    for name in FINGERPRINT_HEADERS {
        headers.remove(name);
    }
    // The client derives Host from the upstream URI
    headers.remove(HOST);

    headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
    if is_missing(headers, &ACCEPT_LANGUAGE) {
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static(DEFAULT_ACCEPT_LANGUAGE));
    }
    if is_missing(headers, &ACCEPT_ENCODING) {
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static(DEFAULT_ACCEPT_ENCODING));
    }
}

fn is_missing(headers: &HeaderMap, name: &HeaderName) -> bool {
    headers.get(name).map_or(true, HeaderValue::is_empty)
}

/// Remove hop-by-hop headers, including any named by `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

/// Response body copied through one pooled block.
///
/// Each frame is a frozen slice of the block, so once the connection has
/// written and dropped it the next frame reuses the same memory. The block
/// goes back to the pool when the body is dropped, whether it was read to
/// the end or the client went away.
pub struct PooledBody {
    reader: StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>,
    lease: BufferLease,
    done: bool,
}

impl PooledBody {
    pub fn new<B>(body: B, pool: Arc<BufferPool>) -> Self
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let data = BodyStream::new(body)
            .map_err(|e| {
                let e: BoxError = e.into();
                warn!(error = %e, "upstream body interrupted");
                io::Error::other(e)
            })
            // Trailers are not relayed
            .try_filter_map(|frame| future::ready(Ok(frame.into_data().ok())))
            .boxed();

        Self {
            reader: StreamReader::new(data),
            lease: BufferLease::new(pool),
            done: false,
        }
    }
}

impl Body for PooledBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        let block = this.lease.block_mut();
        match poll_read_buf(Pin::new(&mut this.reader), cx, block) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => {
                this.done = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(Ok(0)) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Ok(_)) => Poll::Ready(Some(Ok(Frame::data(block.split().freeze())))),
        }
    }

    fn is_end_stream(&self) -> bool {
        self.done
    }
}
