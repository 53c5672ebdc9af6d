//! Request and response bodies.
//!
//! [`Body`] is what callers send: a fixed buffer, nothing at all, or any
//! streaming [`http_body::Body`]. [`Incoming`] is what the engine hands back
//! for responses; it is pull-driven, so the connection reads no faster than
//! the caller consumes.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::Body as _;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt;
use http_body_util::{Empty, Full};

use crate::BoxError;

mod incoming;
pub use self::incoming::Incoming;
pub(crate) use self::incoming::BodySender;

/// An http request using [Body] as the body.
pub type Request = http::Request<Body>;

/// An http response using [Incoming] as the body.
pub type Response = http::Response<Incoming>;

/// An outgoing request body.
///
/// Bodies can be created from [`Bytes`](bytes::Bytes), [`String`](std::string::String),
/// or [`&'static str`](str) using [`From`](std::convert::From) implementations,
/// and from any streaming body with [`Body::wrap`].
#[derive(Debug)]
#[pin_project::pin_project]
pub struct Body {
    #[pin]
    inner: InnerBody,
}

impl Body {
    /// Create a new empty body.
    pub fn empty() -> Self {
        Self {
            inner: InnerBody::Empty,
        }
    }

    /// Create a new body from something which can be converted into [`Bytes`].
    pub fn full<D>(data: D) -> Self
    where
        D: Into<Bytes>,
    {
        Self {
            inner: InnerBody::Full(Full::new(data.into())),
        }
    }

    /// Wrap a streaming body.
    ///
    /// Streaming bodies are sent with chunked framing on HTTP/1.1 unless
    /// their size hint is exact, and cannot be replayed on retry.
    pub fn wrap<B>(body: B) -> Self
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        Self {
            inner: InnerBody::Streaming(UnsyncBoxBody::new(body.map_err(Into::into))),
        }
    }

    /// Try to clone this body. Only buffered bodies can be cloned.
    pub fn try_clone(&self) -> Option<Self> {
        match &self.inner {
            InnerBody::Full(body) => Some(Self {
                inner: InnerBody::Full(body.clone()),
            }),
            InnerBody::Empty => Some(Self {
                inner: InnerBody::Empty,
            }),
            InnerBody::Streaming(_) => None,
        }
    }

    /// The exact length of this body, when known up front.
    pub fn content_length(&self) -> Option<u64> {
        self.size_hint().exact()
    }
}

impl Default for Body {
    fn default() -> Self {
        Self {
            inner: InnerBody::Empty,
        }
    }
}

impl From<Bytes> for Body {
    fn from(body: Bytes) -> Self {
        Self {
            inner: InnerBody::Full(body.into()),
        }
    }
}

impl From<String> for Body {
    fn from(body: String) -> Self {
        Self { inner: body.into() }
    }
}

impl From<&'static str> for Body {
    fn from(body: &'static str) -> Self {
        Self {
            inner: InnerBody::Full(body.into()),
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(body: Vec<u8>) -> Self {
        Self {
            inner: InnerBody::Full(body.into()),
        }
    }
}

impl From<Full<Bytes>> for Body {
    fn from(body: Full<Bytes>) -> Self {
        Self {
            inner: InnerBody::Full(body),
        }
    }
}

impl From<Empty<Bytes>> for Body {
    fn from(_body: Empty<Bytes>) -> Self {
        Self {
            inner: InnerBody::Empty,
        }
    }
}

#[pin_project::pin_project(project = InnerBodyProj)]
enum InnerBody {
    Empty,
    Full(#[pin] Full<Bytes>),
    Streaming(#[pin] UnsyncBoxBody<Bytes, BoxError>),
}

impl From<String> for InnerBody {
    fn from(body: String) -> Self {
        if body.is_empty() {
            Self::Empty
        } else {
            Self::Full(body.into())
        }
    }
}

impl http_body::Body for Body {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        match this.inner.project() {
            InnerBodyProj::Empty => Poll::Ready(None),
            InnerBodyProj::Full(body) => body
                .poll_frame(cx)
                .map(|opt| opt.map(|res| res.map_err(|never| match never {}))),
            InnerBodyProj::Streaming(body) => body.poll_frame(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self.inner {
            InnerBody::Empty => true,
            InnerBody::Full(ref body) => body.is_end_stream(),
            InnerBody::Streaming(ref body) => body.is_end_stream(),
        }
    }

    fn size_hint(&self) -> http_body::SizeHint {
        match self.inner {
            InnerBody::Empty => http_body::SizeHint::with_exact(0),
            InnerBody::Full(ref body) => body.size_hint(),
            InnerBody::Streaming(ref body) => body.size_hint(),
        }
    }
}

impl fmt::Debug for InnerBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InnerBody::Empty => f.debug_struct("Empty").finish(),
            InnerBody::Full(_) => f.debug_struct("Full").finish(),
            InnerBody::Streaming(_) => f.debug_struct("Streaming").finish(),
        }
    }
}

/// Extension trait to help clone a request that contains a `Body`.
pub trait TryCloneRequest {
    /// Try to clone the request. If the body can't be cloned, `None` is returned.
    fn try_clone_request(&self) -> Option<Self>
    where
        Self: Sized;
}

impl TryCloneRequest for http::Request<Body> {
    fn try_clone_request(&self) -> Option<Self> {
        let body = self.body().try_clone()?;
        let mut req = http::Request::new(body);
        *req.method_mut() = self.method().clone();
        *req.uri_mut() = self.uri().clone();
        *req.version_mut() = self.version();
        *req.headers_mut() = self.headers().clone();
        *req.extensions_mut() = self.extensions().clone();
        Some(req)
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use http_body::Body as HttpBody;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Body: HttpBody, Send);

    #[test]
    fn check_body_from_string() {
        let body = Body::from("Hello, World!".to_string());
        assert_eq!(body.content_length(), Some(13));
        assert!(!body.is_end_stream());
    }

    #[test]
    fn check_body_from_empty_string() {
        let body = Body::from("".to_string());
        assert_eq!(body.content_length(), Some(0));
        assert!(body.is_end_stream());
    }

    #[test]
    fn check_body_empty() {
        let body = Body::empty();
        assert_eq!(body.size_hint().upper(), Some(0));
        assert!(body.is_end_stream());
    }

    #[test]
    fn streaming_body_is_not_cloneable() {
        let stream = http_body_util::StreamBody::new(futures_util::stream::iter(vec![Ok::<
            _,
            std::io::Error,
        >(
            http_body::Frame::data(Bytes::from_static(b"chunk")),
        )]));
        let body = Body::wrap(stream);
        assert!(body.try_clone().is_none());
        assert_eq!(body.content_length(), None);
    }

    #[test]
    fn clone_request_keeps_parts() {
        let req = http::Request::post("http://example.com/upload")
            .header("x-test", "1")
            .body(Body::from("payload"))
            .unwrap();
        let copy = req.try_clone_request().unwrap();
        assert_eq!(copy.method(), http::Method::POST);
        assert_eq!(copy.uri(), req.uri());
        assert_eq!(copy.headers()["x-test"], "1");
        assert_eq!(copy.body().content_length(), Some(7));
    }

    #[tokio::test]
    async fn full_body_yields_data() {
        let body = Body::from("abc");
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from_static(b"abc"));
    }
}
