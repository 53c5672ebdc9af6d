//! Transport streams for connecting to remote servers.
//!
//! Transports are responsible for establishing a connection to a remote server and
//! shuffling bytes back and forth. Anything which is a [`tower::Service`] from a
//! [`Uri`] to a [`TransportStream`] can be used as a transport.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use http::Uri;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tower::ServiceExt as _;

use crate::info::{ConnectionInfo, HasConnectionInfo};

pub mod duplex;
pub mod tcp;
#[cfg(feature = "tls")]
pub mod tls;

/// Byte streams a connection can run over.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// An established byte stream plus what is known about it.
pub struct TransportStream {
    stream: Box<dyn Io>,
    info: ConnectionInfo,
}

impl fmt::Debug for TransportStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportStream")
            .field("info", &self.info)
            .finish()
    }
}

impl TransportStream {
    /// Wrap an established stream.
    pub fn new<S: Io>(stream: S, info: ConnectionInfo) -> Self {
        Self {
            stream: Box::new(stream),
            info,
        }
    }

    /// Split into the raw stream and its info.
    pub fn into_parts(self) -> (Box<dyn Io>, ConnectionInfo) {
        (self.stream, self.info)
    }
}

impl HasConnectionInfo for TransportStream {
    fn info(&self) -> ConnectionInfo {
        self.info.clone()
    }
}

impl AsyncRead for TransportStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TransportStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.stream).poll_shutdown(cx)
    }
}

/// A way to open byte streams to a URI's authority.
///
/// Implemented for every cloneable [`tower::Service`] from [`Uri`] to
/// [`TransportStream`].
pub trait Transport: Send + Sync + 'static {
    /// Open a stream to `uri`'s host and port.
    fn connect(&self, uri: Uri) -> BoxFuture<'static, io::Result<TransportStream>>;
}

impl<T> Transport for T
where
    T: tower::Service<Uri, Response = TransportStream, Error = io::Error>
        + Clone
        + Send
        + Sync
        + 'static,
    T::Future: Send + 'static,
{
    fn connect(&self, uri: Uri) -> BoxFuture<'static, io::Result<TransportStream>> {
        Box::pin(self.clone().oneshot(uri))
    }
}

/// Host and port from a URI, with scheme-default ports.
pub(crate) fn host_and_port(uri: &Uri) -> io::Result<(Box<str>, u16)> {
    let host = uri
        .host()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "missing host"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = match uri.port_u16() {
        Some(port) => port,
        None => match uri.scheme_str() {
            Some("http") => 80,
            Some("https") => 443,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "missing port",
                ))
            }
        },
    };

    Ok((host.into(), port))
}
