//! In-memory transport, mostly for tests.
//!
//! [`pair`] returns a [`DuplexTransport`] for the client and a
//! [`DuplexIncoming`] for whoever plays the server; every connection the
//! client opens shows up on the incoming side as the other half of a
//! [`tokio::io::DuplexStream`].

use std::io;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use http::Uri;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use super::TransportStream;
use crate::info::{ConnectionInfo, Protocol, TlsConnectionInfo};

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Create a connected transport and acceptor.
pub fn pair() -> (DuplexTransport, DuplexIncoming) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        DuplexTransport {
            max_buf_size: DEFAULT_BUFFER_SIZE,
            protocol: None,
            tls: None,
            tx,
        },
        DuplexIncoming { rx },
    )
}

/// Transport via duplex stream
#[derive(Debug, Clone)]
pub struct DuplexTransport {
    max_buf_size: usize,
    protocol: Option<Protocol>,
    tls: Option<TlsConnectionInfo>,
    tx: mpsc::UnboundedSender<(Uri, DuplexStream)>,
}

impl DuplexTransport {
    /// Set the in-memory buffer size of each connection.
    pub fn with_buffer_size(mut self, max_buf_size: usize) -> Self {
        self.max_buf_size = max_buf_size;
        self
    }

    /// Report `protocol` as fixed by the transport, as if negotiated out of band.
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Report connections as already secured, with `alpn` negotiated.
    pub fn with_tls(mut self, alpn: Option<Protocol>) -> Self {
        self.tls = Some(TlsConnectionInfo::new_client(alpn));
        self
    }
}

impl tower::Service<Uri> for DuplexTransport {
    type Response = TransportStream;

    type Error = io::Error;

    type Future = BoxFuture<'static, Result<TransportStream, io::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Uri) -> Self::Future {
        let (client, server) = tokio::io::duplex(self.max_buf_size);
        let sent = self.tx.send((req, server));
        let info = ConnectionInfo {
            protocol: self.protocol.clone(),
            tls: self.tls.clone(),
            ..Default::default()
        };

        Box::pin(async move {
            sent.map_err(|_| {
                io::Error::new(io::ErrorKind::ConnectionRefused, "duplex acceptor closed")
            })?;
            tracing::trace!("duplex connected");
            Ok(TransportStream::new(client, info))
        })
    }
}

/// The accepting side of a duplex [`pair`].
#[derive(Debug)]
pub struct DuplexIncoming {
    rx: mpsc::UnboundedReceiver<(Uri, DuplexStream)>,
}

impl DuplexIncoming {
    /// Wait for the next connection. `None` once every transport is dropped.
    pub async fn accept(&mut self) -> Option<DuplexStream> {
        self.rx.recv().await.map(|(_, stream)| stream)
    }

    /// Like [`accept`](Self::accept), also returning the URI the client dialed.
    pub async fn accept_with_uri(&mut self) -> Option<(Uri, DuplexStream)> {
        self.rx.recv().await
    }

    /// Take a connection if one is already waiting.
    pub fn try_accept(&mut self) -> Option<DuplexStream> {
        self.rx.try_recv().ok().map(|(_, stream)| stream)
    }
}
