use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "tls")]
use rustls::ClientConfig;

use super::conn::transport::duplex::DuplexTransport;
use super::conn::transport::tcp::{TcpTransport, TcpTransportConfig};
#[cfg(feature = "tls")]
use super::conn::transport::tls::TlsConnector;
use super::conn::{
    ConnectorParts, Http1Config, Http2Config, HttpProtocol, ProxySelector, SharedProxySelector,
    Transport,
};
use super::filter::{Filter, RedirectFilter};
use super::{Client, Config, PoolConfig};

#[cfg(feature = "tls")]
#[derive(Debug)]
enum TlsSetting {
    NativeRoots,
    Custom(TlsConnector),
    Disabled,
}

/// A builder for a client.
///
/// ```no_run
/// # use std::time::Duration;
/// # use switchyard::client::Builder;
/// let client = Builder::new()
///     .with_timeout(Duration::from_secs(30))
///     .with_max_redirects(3)
///     .build();
/// # drop(client);
/// ```
pub struct Builder {
    transport: Option<Arc<dyn Transport>>,
    tcp: TcpTransportConfig,
    pool: PoolConfig,
    http1: Http1Config,
    http2: Http2Config,
    config: Config,
    proxies: Option<SharedProxySelector>,
    filters: Vec<Arc<dyn Filter>>,
    redirects: bool,
    #[cfg(feature = "tls")]
    tls: TlsSetting,
}

impl std::fmt::Debug for Builder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("tcp", &self.tcp)
            .field("pool", &self.pool)
            .field("http1", &self.http1)
            .field("http2", &self.http2)
            .field("config", &self.config)
            .field("proxies", &self.proxies)
            .field("filters", &self.filters.len())
            .field("redirects", &self.redirects)
            .finish()
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// Create a builder with default settings: TCP transport, pooled
    /// HTTP/1.1 connections, HTTP/2 where the server agrees, and standard
    /// redirects.
    pub fn new() -> Self {
        Self {
            transport: None,
            tcp: TcpTransportConfig::default(),
            pool: PoolConfig::default(),
            http1: Http1Config::default(),
            http2: Http2Config::default(),
            config: Config::default(),
            proxies: None,
            filters: Vec::new(),
            redirects: true,
            #[cfg(feature = "tls")]
            tls: TlsSetting::NativeRoots,
        }
    }

    /// Use the provided TCP configuration.
    pub fn with_tcp(mut self, config: TcpTransportConfig) -> Self {
        self.tcp = config;
        self.transport = None;
        self
    }

    /// TCP configuration, used unless a custom transport is set.
    pub fn tcp(&mut self) -> &mut TcpTransportConfig {
        &mut self.tcp
    }

    /// Provide a custom transport.
    pub fn with_transport<T: Transport>(mut self, transport: T) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Connect over in-memory streams.
    pub fn with_duplex(self, transport: DuplexTransport) -> Self {
        self.with_transport(transport)
    }

    /// Use the provided connection pool configuration.
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Connection pool configuration.
    pub fn pool(&mut self) -> &mut PoolConfig {
        &mut self.pool
    }

    /// Use the provided HTTP/1.1 configuration.
    pub fn with_http1(mut self, config: Http1Config) -> Self {
        self.http1 = config;
        self
    }

    /// HTTP/1.1 configuration.
    pub fn http1(&mut self) -> &mut Http1Config {
        &mut self.http1
    }

    /// Use the provided HTTP/2 configuration.
    pub fn with_http2(mut self, config: Http2Config) -> Self {
        self.http2 = config;
        self
    }

    /// HTTP/2 configuration.
    pub fn http2(&mut self) -> &mut Http2Config {
        &mut self.http2
    }

    /// Use the provided request configuration.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Request configuration.
    pub fn config(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Set the preferred protocol.
    pub fn with_version(mut self, version: HttpProtocol) -> Self {
        self.config.version = version;
        self
    }

    /// Speak HTTP/2 on plain connections without an upgrade.
    pub fn with_http2_prior_knowledge(mut self) -> Self {
        self.config.version = HttpProtocol::Http2;
        self.config.http2_prior_knowledge = true;
        self
    }

    /// Set a timeout for each attempt.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    /// Remove the attempt timeout.
    pub fn without_timeout(mut self) -> Self {
        self.config.timeout = None;
        self
    }

    /// Set a limit on finding or establishing a connection.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = Some(timeout);
        self
    }

    /// Set the number of redirects followed.
    pub fn with_max_redirects(mut self, max: usize) -> Self {
        self.config.max_redirects = max;
        self
    }

    /// Set the number of attempts, counting retries and redirects.
    pub fn with_max_attempts(mut self, max: usize) -> Self {
        self.config.max_attempts = max;
        self
    }

    /// Do not follow redirects.
    pub fn without_redirects(mut self) -> Self {
        self.redirects = false;
        self
    }

    /// Number of server pushes accepted at once. Zero disables push.
    pub fn max_concurrent_pushes(mut self, max: u32) -> Self {
        self.http2.max_concurrent_pushes = max;
        self
    }

    /// Whether a `WINDOW_UPDATE` with a zero increment on the connection is
    /// ignored rather than treated as a protocol error.
    pub fn lenient_window_update(mut self, lenient: bool) -> Self {
        self.http2.lenient_window_update = lenient;
        self
    }

    /// Route requests through proxies chosen by `selector`.
    pub fn with_proxy<P: ProxySelector>(mut self, selector: P) -> Self {
        self.proxies = Some(SharedProxySelector::new(selector));
        self
    }

    /// Add a filter. Request hooks run in the order filters are added,
    /// response hooks in reverse.
    pub fn with_filter<F: Filter>(mut self, filter: F) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }
}

#[cfg(feature = "tls")]
impl Builder {
    /// Disable TLS. Secure requests fail with
    /// [`Error::UnsupportedProtocol`](super::Error::UnsupportedProtocol).
    pub fn without_tls(mut self) -> Self {
        self.tls = TlsSetting::Disabled;
        self
    }

    /// Use the provided TLS configuration.
    pub fn with_tls(mut self, config: ClientConfig) -> Self {
        self.tls = TlsSetting::Custom(TlsConnector::new(config));
        self
    }

    /// Trust the platform's native root certificates.
    pub fn with_default_tls(mut self) -> Self {
        self.tls = TlsSetting::NativeRoots;
        self
    }

    fn tls_connector(&self) -> Option<TlsConnector> {
        match &self.tls {
            TlsSetting::Custom(connector) => Some(connector.clone()),
            TlsSetting::Disabled => None,
            TlsSetting::NativeRoots => match TlsConnector::native_roots() {
                Ok(connector) => Some(connector),
                Err(error) => {
                    tracing::warn!(%error, "TLS disabled: native roots unavailable");
                    None
                }
            },
        }
    }
}

#[cfg(not(feature = "tls"))]
impl Builder {
    /// Disable TLS
    pub fn without_tls(self) -> Self {
        self
    }
}

impl Builder {
    /// Build the client.
    pub fn build(self) -> Client {
        #[cfg(feature = "tls")]
        let tls = self.tls_connector();

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(TcpTransport::new(self.tcp)));

        let mut filters = self.filters;
        if self.redirects {
            filters.insert(0, Arc::new(RedirectFilter::new()));
        }

        let parts = ConnectorParts {
            pool: self.pool,
            http1: self.http1,
            http2: self.http2,
            prior_knowledge: self.config.http2_prior_knowledge,
            #[cfg(feature = "tls")]
            tls,
        };

        Client::from_parts(transport, parts, self.config, filters, self.proxies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_default_compiles() {
        let _ = Builder::new().build();
    }

    #[test]
    fn knobs_land_in_config() {
        let mut builder = Builder::new()
            .with_max_redirects(2)
            .with_timeout(Duration::from_secs(1))
            .max_concurrent_pushes(0)
            .lenient_window_update(false)
            .with_http2_prior_knowledge();
        assert_eq!(builder.config().max_redirects, 2);
        assert_eq!(builder.config().timeout, Some(Duration::from_secs(1)));
        assert!(builder.config().http2_prior_knowledge);
        assert_eq!(builder.http2().max_concurrent_pushes, 0);
        assert!(!builder.http2().lenient_window_update);
    }
}
