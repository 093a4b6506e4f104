use crate::transport::BoxError;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS};
use http::{HeaderValue, Response, StatusCode};
use http_body::{Body, Frame, SizeHint};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep};

/// Body of requests sent upstream
pub type RequestBody = UnsyncBoxBody<Bytes, BoxError>;

/// Body of every response written to clients
pub type ResponseBody = UnsyncBoxBody<Bytes, std::io::Error>;

pub fn full_request<T: Into<Bytes>>(chunk: T) -> RequestBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn full<T: Into<Bytes>>(chunk: T) -> ResponseBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// `text/plain` response with the given status
pub fn text_response(status: StatusCode, text: impl Into<Bytes>) -> Response<ResponseBody> {
    let mut resp = Response::new(full(text));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

/// Generic 502 that never carries upstream detail
pub fn bad_gateway() -> Response<ResponseBody> {
    let mut resp = text_response(StatusCode::BAD_GATEWAY, "Upstream error\n");
    resp.headers_mut()
        .insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    resp
}

pub fn too_many_requests() -> Response<ResponseBody> {
    text_response(StatusCode::TOO_MANY_REQUESTS, "Too Many Requests\n")
}

#[derive(Debug, thiserror::Error)]
#[error("body not completed within {0:?}")]
pub struct BodyTimeout(pub Duration);

/// Body that fails with [`BodyTimeout`] once `deadline` passes before its
/// last frame.
pub struct DeadlineBody<B> {
    inner: B,
    sleep: Pin<Box<Sleep>>,
    limit: Duration,
}

impl<B> DeadlineBody<B> {
    /// `limit` is only reported in the error; the clock runs to `deadline`
    pub fn until(inner: B, deadline: Instant, limit: Duration) -> Self {
        Self {
            inner,
            sleep: Box::pin(tokio::time::sleep_until(deadline)),
            limit,
        }
    }
}

impl<B> Body for DeadlineBody<B>
where
    B: Body + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = B::Data;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if let Poll::Ready(frame) = Pin::new(&mut this.inner).poll_frame(cx) {
            return Poll::Ready(frame.map(|r| r.map_err(Into::into)));
        }
        match this.sleep.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(Some(Err(BodyTimeout(this.limit).into()))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use http_body_util::StreamBody;
    use std::convert::Infallible;

    async fn body_string(resp: Response<ResponseBody>) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn bad_gateway_is_generic() {
        let resp = bad_gateway();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(resp.headers()[CONTENT_TYPE], "text/plain; charset=utf-8");
        assert_eq!(resp.headers()[X_CONTENT_TYPE_OPTIONS], "nosniff");
        assert_eq!(body_string(resp).await, "Upstream error\n");
    }

    #[tokio::test]
    async fn too_many_requests_body() {
        let resp = too_many_requests();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()[CONTENT_TYPE], "text/plain; charset=utf-8");
        assert_eq!(body_string(resp).await, "Too Many Requests\n");
    }

    #[tokio::test]
    async fn stalled_body_fails_at_its_deadline() {
        let stalled = StreamBody::new(stream::pending::<Result<Frame<Bytes>, Infallible>>());
        let limit = Duration::from_millis(100);
        let body = DeadlineBody::until(stalled, Instant::now() + limit, limit);

        let started = std::time::Instant::now();
        let err = body.collect().await.unwrap_err();
        assert!(err.is::<BodyTimeout>());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn body_finished_in_time_passes_through() {
        let limit = Duration::from_secs(5);
        let body = DeadlineBody::until(Full::new(Bytes::from_static(b"payload")), Instant::now() + limit, limit);

        assert!(!body.is_end_stream());
        let bytes = body.collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"payload");
    }
}
