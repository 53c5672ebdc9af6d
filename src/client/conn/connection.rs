//! Finding a connection for a request.
//!
//! A [`Connector`] turns a request URI into a [`Route`] (direct, through a
//! forwarding proxy, or through a CONNECT tunnel), then hands out a shared
//! HTTP/2 connection, a pooled HTTP/1.1 connection which still looks alive,
//! or a freshly established one.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::uri::Scheme;
use http::Uri;
use tracing::{debug, trace};

use super::protocol::http1::exchange::Home;
use super::protocol::http1::{Http1Config, Http1Connection};
use super::protocol::http2::connection::{Handshake, Http2Connection};
use super::protocol::http2::registry::Http2Registry;
use super::protocol::http2::stream::Stream;
use super::protocol::http2::Http2Config;
use super::protocol::HttpProtocol;
use super::proxy::{Proxy, SharedProxySelector};
use super::transport::{host_and_port, Transport, TransportStream};
use super::tube::{Probe, Tube};
use super::tunnel;
use crate::client::pool::{CacheKey, Pool};
use crate::client::tracker::OperationTracker;
use crate::client::Error;
use crate::info::{HasConnectionInfo, Protocol};

/// How a connection reaches its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// Plain HTTP straight to the origin.
    PlainDirect,
    /// Plain HTTP forwarded by a proxy.
    PlainProxy,
    /// Plain HTTP through a CONNECT tunnel.
    PlainTunnel,
    /// TLS straight to the origin.
    SecureDirect,
    /// TLS through a CONNECT tunnel.
    SecureTunnel,
}

impl ConnectionKind {
    /// Whether the connection is encrypted end to end.
    pub fn is_secure(&self) -> bool {
        matches!(self, Self::SecureDirect | Self::SecureTunnel)
    }

    /// Whether a CONNECT tunnel is set up first.
    pub fn is_tunnel(&self) -> bool {
        matches!(self, Self::PlainTunnel | Self::SecureTunnel)
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PlainDirect => "plain",
            Self::PlainProxy => "plain-proxy",
            Self::PlainTunnel => "plain-tunnel",
            Self::SecureDirect => "secure",
            Self::SecureTunnel => "secure-tunnel",
        };
        f.write_str(name)
    }
}

/// Where one request goes.
#[derive(Debug, Clone)]
pub(crate) struct Route {
    pub(crate) kind: ConnectionKind,
    pub(crate) key: CacheKey,
    pub(crate) destination: Uri,
    pub(crate) proxy: Option<Proxy>,
}

impl Route {
    pub(crate) fn new(uri: &Uri, proxies: Option<&SharedProxySelector>) -> Result<Self, Error> {
        let secure = match uri.scheme() {
            Some(scheme) if *scheme == Scheme::HTTPS => true,
            Some(scheme) if *scheme == Scheme::HTTP => false,
            Some(scheme) => return Err(Error::UnsupportedProtocol(scheme.to_string())),
            None => return Err(Error::InvalidRequest(format!("no scheme in {uri}"))),
        };
        let (host, port) =
            host_and_port(uri).map_err(|error| Error::InvalidRequest(error.to_string()))?;

        let proxy = proxies.and_then(|proxies| proxies.select(uri));
        let kind = match (&proxy, secure) {
            (None, false) => ConnectionKind::PlainDirect,
            (None, true) => ConnectionKind::SecureDirect,
            (Some(_), true) => ConnectionKind::SecureTunnel,
            (Some(proxy), false) if proxy.tunnels_plain() => ConnectionKind::PlainTunnel,
            (Some(_), false) => ConnectionKind::PlainProxy,
        };

        let key = CacheKey::new(kind, &host, port, proxy.as_ref().map(Proxy::authority));
        Ok(Self {
            kind,
            key,
            destination: uri.clone(),
            proxy,
        })
    }

    /// Headers added to requests forwarded by a plain proxy.
    pub(crate) fn proxy_headers(&self) -> Option<&http::HeaderMap> {
        match (&self.proxy, self.kind) {
            (Some(proxy), ConnectionKind::PlainProxy) => Some(proxy.headers()),
            _ => None,
        }
    }
}

/// A connection ready to carry an exchange.
#[derive(Debug)]
pub(crate) enum HttpConnection {
    /// An HTTP/1.1 connection, exclusively held until the exchange ends.
    Http1 {
        conn: Http1Connection,
        home: Home,
        /// Offer `Upgrade: h2c` on this exchange.
        upgrade: bool,
        /// Taken from the pool rather than freshly connected.
        pooled: bool,
    },
    /// A shared HTTP/2 connection.
    Http2(Arc<Http2Connection>),
}

/// Establishes and recycles connections for a client.
#[derive(Clone)]
pub(crate) struct Connector {
    transport: Arc<dyn Transport>,
    #[cfg(feature = "tls")]
    tls: Option<super::transport::tls::TlsConnector>,
    pool: Pool<Http1Connection>,
    registry: Http2Registry,
    http1: Arc<Http1Config>,
    http2: Http2Config,
    tracker: OperationTracker,
    prior_knowledge: bool,
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("pool", &self.pool)
            .field("registry", &self.registry)
            .field("prior_knowledge", &self.prior_knowledge)
            .finish()
    }
}

/// Everything a [`Connector`] needs besides the transport.
#[derive(Debug, Clone, Default)]
pub(crate) struct ConnectorParts {
    pub(crate) pool: crate::client::pool::Config,
    pub(crate) http1: Http1Config,
    pub(crate) http2: Http2Config,
    pub(crate) prior_knowledge: bool,
    #[cfg(feature = "tls")]
    pub(crate) tls: Option<super::transport::tls::TlsConnector>,
}

impl Connector {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        parts: ConnectorParts,
        tracker: OperationTracker,
    ) -> Self {
        Self {
            transport,
            #[cfg(feature = "tls")]
            tls: parts.tls,
            pool: Pool::new(parts.pool),
            registry: Http2Registry::default(),
            http1: Arc::new(parts.http1),
            http2: parts.http2.normalized(),
            tracker,
            prior_knowledge: parts.prior_knowledge,
        }
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &Pool<Http1Connection> {
        &self.pool
    }

    pub(crate) fn registry(&self) -> &Http2Registry {
        &self.registry
    }

    pub(crate) fn http1_config(&self) -> &Http1Config {
        &self.http1
    }

    pub(crate) fn http2_config(&self) -> &Http2Config {
        &self.http2
    }

    pub(crate) fn tracker(&self) -> &OperationTracker {
        &self.tracker
    }

    /// A connection for `route`, speaking `version` where the server
    /// allows it.
    #[cfg_attr(not(tarpaulin), tracing::instrument(skip_all, fields(key = %route.key, kind = %route.kind), level = "debug"))]
    pub(crate) async fn get_connection(
        &self,
        route: &Route,
        version: HttpProtocol,
    ) -> Result<HttpConnection, Error> {
        let wants_h2 = version == HttpProtocol::Http2 && route.kind != ConnectionKind::PlainProxy;

        if wants_h2 {
            if let Some(conn) = self.registry.get(&route.key) {
                trace!(conn = conn.id(), streams = conn.active_streams(), "reusing http2 connection");
                return Ok(HttpConnection::Http2(conn));
            }
        }

        let home = Home {
            pool: self.pool.clone(),
            key: route.key.clone(),
        };
        let upgrade = wants_h2
            && route.kind == ConnectionKind::PlainDirect
            && !self.prior_knowledge
            && !self.registry.is_http1_only(&route.key);

        while let Some(conn) = self.pool.pop(&route.key) {
            match conn.probe().await {
                Probe::Alive => {
                    trace!(conn = conn.id(), exchanges = conn.exchanges(), "reusing pooled connection");
                    return Ok(HttpConnection::Http1 {
                        conn,
                        home,
                        upgrade,
                        pooled: true,
                    });
                }
                probe => {
                    debug!(conn = conn.id(), ?probe, "discarding stale pooled connection");
                    conn.close();
                }
            }
        }

        let stream = self.connect(route, wants_h2).await?;
        let info = stream.info();
        let alpn_h2 = info.alpn().is_some_and(Protocol::is_h2);

        if alpn_h2 || (wants_h2 && self.prior_knowledge) {
            let handshake = if info.is_secure() {
                Handshake::Tls
            } else {
                Handshake::PriorKnowledge
            };
            let (conn, _) = Http2Connection::handshake(
                Tube::spawn(stream),
                self.http2.clone(),
                self.tracker.clone(),
                handshake,
            )
            .await?;
            self.registry.insert(route.key.clone(), conn.clone());
            return Ok(HttpConnection::Http2(conn));
        }

        let proxied = route.kind == ConnectionKind::PlainProxy;
        Ok(HttpConnection::Http1 {
            conn: Http1Connection::handshake(stream, self.http1.clone(), proxied),
            home,
            upgrade: upgrade && !info.is_secure(),
            pooled: false,
        })
    }

    async fn connect(&self, route: &Route, offer_h2: bool) -> Result<TransportStream, Error> {
        let target = match &route.proxy {
            Some(proxy) => proxy.uri(),
            None => route.destination.clone(),
        };

        let mut stream = self
            .transport
            .connect(target)
            .await
            .map_err(Error::connect)?;
        trace!(info = ?stream.info(), "transport connected");

        if route.kind.is_tunnel() {
            let headers = route
                .proxy
                .as_ref()
                .map(|proxy| proxy.headers().clone())
                .unwrap_or_default();
            stream = tunnel::establish(stream, &route.destination, &headers).await?;
        }

        if route.kind.is_secure() && !stream.info().is_secure() {
            stream = self.secure(stream, route, offer_h2).await?;
        }
        Ok(stream)
    }

    #[cfg(feature = "tls")]
    async fn secure(
        &self,
        stream: TransportStream,
        route: &Route,
        offer_h2: bool,
    ) -> Result<TransportStream, Error> {
        let Some(tls) = &self.tls else {
            return Err(Error::UnsupportedProtocol("https without a TLS configuration".into()));
        };
        let (host, _) = host_and_port(&route.destination)
            .map_err(|error| Error::InvalidRequest(error.to_string()))?;
        tls.handshake(stream, &host, offer_h2)
            .await
            .map_err(Error::connect)
    }

    #[cfg(not(feature = "tls"))]
    async fn secure(
        &self,
        _stream: TransportStream,
        _route: &Route,
        _offer_h2: bool,
    ) -> Result<TransportStream, Error> {
        Err(Error::UnsupportedProtocol(
            "https requires the `tls` feature".into(),
        ))
    }

    /// Switch an HTTP/1.1 connection to HTTP/2 after `101 Switching
    /// Protocols`. Returns stream 1, which carries the upgraded response.
    pub(crate) async fn upgraded(
        &self,
        key: &CacheKey,
        tube: Tube,
        buffered: Bytes,
        head_only: bool,
    ) -> Result<Arc<Stream>, Error> {
        let (conn, stream) = Http2Connection::handshake(
            tube,
            self.http2.clone(),
            self.tracker.clone(),
            Handshake::Upgrade {
                buffered,
                head_only,
            },
        )
        .await?;
        self.registry.insert(key.clone(), conn);
        stream.ok_or(Error::Closed)
    }

    /// Close idle connections and retire shared ones.
    pub(crate) fn close(&self) {
        self.pool.close();
        self.registry.close_all();
    }
}

#[cfg(test)]
mod tests {
    use http::uri::Authority;

    use super::*;

    #[test]
    fn routes() {
        let uri: Uri = "https://example.com/".parse().unwrap();
        let route = Route::new(&uri, None).unwrap();
        assert_eq!(route.kind, ConnectionKind::SecureDirect);
        assert!(route.key.is_secure());

        let proxies = SharedProxySelector::new(Proxy::new(Authority::from_static("proxy:8080")));
        let route = Route::new(&uri, Some(&proxies)).unwrap();
        assert_eq!(route.kind, ConnectionKind::SecureTunnel);

        let plain: Uri = "http://example.com/".parse().unwrap();
        let route = Route::new(&plain, Some(&proxies)).unwrap();
        assert_eq!(route.kind, ConnectionKind::PlainProxy);
        assert!(route.proxy_headers().is_some());

        let tunnels = SharedProxySelector::new(
            Proxy::new(Authority::from_static("proxy:8080")).tunnel_plain(true),
        );
        let route = Route::new(&plain, Some(&tunnels)).unwrap();
        assert_eq!(route.kind, ConnectionKind::PlainTunnel);
        assert!(route.proxy_headers().is_none());

        assert!(matches!(
            Route::new(&"ftp://example.com/".parse().unwrap(), None),
            Err(Error::UnsupportedProtocol(_))
        ));
    }
}
