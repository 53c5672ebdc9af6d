//! TCP transport implementation for client connections.
//!
//! This module contains the [`TcpTransport`] type, which is a [`tower::Service`] that connects to
//! remote addresses using TCP, and the [`TcpTransportConfig`] type, which is used to
//! configure TCP connections.
//!
//! Normally, you will not need to use this module directly: the [`Client`][crate::client::Client]
//! uses the [`TcpTransport`] unless another transport is supplied.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future::BoxFuture;
use http::Uri;
use tokio::net::{TcpSocket, TcpStream};
use tracing::{trace, warn, Instrument};

use super::{host_and_port, TransportStream};
use crate::info::ConnectionInfo;

/// A TCP connector for client connections.
///
/// Hostnames are resolved with the system resolver, and each resolved
/// address is tried in turn until one accepts.
///
/// # Example
/// ```no_run
/// # use switchyard::client::conn::transport::tcp::TcpTransport;
/// # use tower::ServiceExt as _;
///
/// # async fn run() {
/// let transport = TcpTransport::default();
///
/// let uri = "http://example.com".parse().unwrap();
/// let stream = transport.oneshot(uri).await.unwrap();
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: Arc<TcpTransportConfig>,
}

impl TcpTransport {
    /// Create a TCP transport with the given configuration.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Get the configuration for the TCP connector.
    pub fn config(&self) -> &TcpTransportConfig {
        &self.config
    }

    async fn connect(&self, host: Box<str>, port: u16) -> io::Result<TcpStream> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((&*host, port)).await?.collect();
        trace!(count = addrs.len(), "resolved");

        let mut last_error = None;
        for addr in addrs {
            match connect(&addr, &self.config).await {
                Ok(stream) => return Ok(stream),
                Err(error) => {
                    trace!(%addr, %error, "address failed");
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {host}"))
        }))
    }
}

impl tower::Service<Uri> for TcpTransport {
    type Response = TransportStream;
    type Error = io::Error;
    type Future = BoxFuture<'static, Result<TransportStream, io::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Uri) -> Self::Future {
        let (host, port) = match host_and_port(&req) {
            Ok((host, port)) => (host, port),
            Err(e) => return Box::pin(std::future::ready(Err(e))),
        };

        let transport = self.clone();
        let span = tracing::trace_span!("tcp", host = %host, port = %port);

        Box::pin(
            async move {
                let stream = transport.connect(host, port).await?;
                let info = ConnectionInfo {
                    remote_addr: stream.peer_addr().ok(),
                    local_addr: stream.local_addr().ok(),
                    ..Default::default()
                };

                if let Some(peer) = info.remote_addr {
                    trace!(peer.addr = %peer, "tcp connected");
                }

                Ok(TransportStream::new(stream, info))
            }
            .instrument(span),
        )
    }
}

/// Configuration for TCP connections.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// The timeout for each individual address attempt.
    pub connect_timeout: Option<Duration>,

    /// Idle time before TCP keep-alive probes are sent.
    pub keep_alive_timeout: Option<Duration>,

    /// The local IPv4 address to bind to.
    pub local_address_ipv4: Option<Ipv4Addr>,

    /// The local IPv6 address to bind to.
    pub local_address_ipv6: Option<Ipv6Addr>,

    /// Whether to disable Nagle's algorithm.
    pub nodelay: bool,

    /// Whether to reuse the local address.
    pub reuse_address: bool,

    /// The size of the send buffer.
    pub send_buffer_size: Option<usize>,

    /// The size of the receive buffer.
    pub recv_buffer_size: Option<usize>,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(10)),
            keep_alive_timeout: Some(Duration::from_secs(90)),
            local_address_ipv4: None,
            local_address_ipv6: None,
            nodelay: true,
            reuse_address: true,
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }
}

fn bind_local_address(
    socket: &TcpSocket,
    dst_addr: &SocketAddr,
    config: &TcpTransportConfig,
) -> io::Result<()> {
    match (*dst_addr, config.local_address_ipv4, config.local_address_ipv6) {
        (SocketAddr::V4(_), Some(addr), _) => socket.bind(SocketAddr::new(addr.into(), 0)),
        (SocketAddr::V6(_), _, Some(addr)) => socket.bind(SocketAddr::new(addr.into(), 0)),
        _ => Ok(()),
    }
}

#[tracing::instrument(skip(config), level = "debug")]
async fn connect(addr: &SocketAddr, config: &TcpTransportConfig) -> io::Result<TcpStream> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    trace!("tcp socket opened");

    {
        let _guard = tracing::trace_span!("socket_options").entered();

        if let Some(dur) = config.keep_alive_timeout {
            let conf = socket2::TcpKeepalive::new().with_time(dur);
            if let Err(e) = socket2::SockRef::from(&socket).set_tcp_keepalive(&conf) {
                warn!("tcp set_keepalive error: {}", e);
            }
        }

        if config.reuse_address {
            if let Err(e) = socket.set_reuseaddr(true) {
                warn!("tcp set_reuse_address error: {}", e);
            }
        }

        if let Some(size) = config.send_buffer_size {
            if let Err(e) = socket.set_send_buffer_size(size.try_into().unwrap_or(u32::MAX)) {
                warn!("tcp set_buffer_size error: {}", e);
            }
        }

        if let Some(size) = config.recv_buffer_size {
            if let Err(e) = socket.set_recv_buffer_size(size.try_into().unwrap_or(u32::MAX)) {
                warn!("tcp set_recv_buffer_size error: {}", e);
            }
        }

        bind_local_address(&socket, addr, config)?;
    }

    let connect = socket.connect(*addr);
    let stream = match config.connect_timeout {
        Some(dur) => match tokio::time::timeout(dur, connect).await {
            Ok(result) => result?,
            Err(_) => {
                trace!(timeout = ?dur, "connection timed out");
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    ConnectTimedOut(dur),
                ));
            }
        },
        None => connect.await?,
    };

    if config.nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("tcp set_nodelay error: {}", e);
        }
    }

    Ok(stream)
}

#[derive(Debug)]
struct ConnectTimedOut(Duration);

impl fmt::Display for ConnectTimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp connect timed out after {:?}", self.0)
    }
}

impl std::error::Error for ConnectTimedOut {}

#[cfg(test)]
mod test {
    use tokio::net::TcpListener;
    use tower::ServiceExt as _;

    use super::*;
    use crate::info::HasConnectionInfo as _;

    #[tokio::test]
    async fn test_tcp_transport() {
        let _ = tracing_subscriber::fmt::try_init();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let transport = TcpTransport::default();
        let uri: Uri = format!("http://127.0.0.1:{}", addr.port()).parse().unwrap();

        let (stream, accepted) = tokio::join!(transport.oneshot(uri), listener.accept());
        let stream = stream.unwrap();
        let (_, peer) = accepted.unwrap();

        let info = stream.info();
        assert_eq!(info.remote_addr, Some(addr));
        assert_eq!(info.local_addr, Some(peer));
        assert!(!info.is_secure());
    }

    #[tokio::test]
    async fn test_tcp_invalid_uri() {
        let transport = TcpTransport::default();
        let err = transport
            .oneshot("/no-authority".parse().unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_tcp_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = TcpTransport::default();
        let uri: Uri = format!("http://127.0.0.1:{}", addr.port()).parse().unwrap();
        assert!(transport.oneshot(uri).await.is_err());
    }
}
