//! HTTP client.
//!
//! There are two levels of available APIs in this library:
//!
//! 1. The high-level [`Client`] API. It finds or opens connections, follows
//!    redirects, retries requests which never reached the server and
//!    enforces timeouts. `Client` is also a [`tower::Service`], so it can be
//!    wrapped by middleware from the tower ecosystem.
//! 2. The [connection][self::conn] API, which describes transports,
//!    proxies and the per-protocol configuration.

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};

use self::conn::{Connector, ConnectorParts, SharedProxySelector, Transport};
use self::exchange::multi::MultiExchange;
use self::filter::Filter;

mod builder;
mod config;
pub mod conn;
mod error;
mod exchange;
pub mod filter;
mod future;
pub mod pool;
pub(crate) mod tracker;

pub use self::builder::Builder;
pub use self::config::Config;
pub use self::error::{Error, ProtocolError};
pub use self::future::{CancelHandle, ResponseFuture};
pub use self::pool::Config as PoolConfig;

struct ClientRef {
    connector: Connector,
    config: Arc<Config>,
    filters: Arc<[Arc<dyn Filter>]>,
    proxies: Option<SharedProxySelector>,
}

/// A high-level async HTTP client.
///
/// Clones share connections, configuration and filters.
///
/// # Example
/// ```no_run
/// # use switchyard::Client;
/// # async fn run() -> Result<(), switchyard::Error> {
/// let client = Client::builder().build();
/// let response = client.get("http://example.com".parse().unwrap()).await?;
/// println!("Response: {:?}", response);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientRef>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("connector", &self.inner.connector)
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Default for Client {
    fn default() -> Self {
        Builder::default().build()
    }
}

impl Client {
    /// Create a new builder with default settings.
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub(crate) fn from_parts(
        transport: Arc<dyn Transport>,
        parts: ConnectorParts,
        config: Config,
        filters: Vec<Arc<dyn Filter>>,
        proxies: Option<SharedProxySelector>,
    ) -> Self {
        let connector = Connector::new(transport, parts, Default::default());
        Client {
            inner: Arc::new(ClientRef {
                connector,
                config: Arc::new(config),
                filters: filters.into(),
                proxies,
            }),
        }
    }

    /// Send a request, returning a future which can be cancelled.
    ///
    /// The request starts when the future is first polled.
    pub fn send_async(&self, request: crate::body::Request) -> ResponseFuture {
        let multi = MultiExchange::new(
            self.inner.connector.clone(),
            self.inner.config.clone(),
            self.inner.filters.clone(),
            self.inner.proxies.clone(),
        );
        let guard = self.inner.connector.tracker().guard();
        ResponseFuture::new(multi, request, guard)
    }

    /// Send a request and wait for the response head.
    pub async fn request(&self, request: crate::body::Request) -> Result<crate::body::Response, Error> {
        self.send_async(request).await
    }

    /// Make a GET request to the given URI.
    pub async fn get(&self, uri: http::Uri) -> Result<crate::body::Response, Error> {
        let mut request = http::Request::new(crate::Body::empty());
        *request.uri_mut() = uri;
        self.request(request).await
    }

    /// Requests in flight plus open HTTP/2 streams.
    pub fn pending_operations(&self) -> usize {
        self.inner.connector.tracker().pending()
    }

    /// Whether nothing is in flight.
    pub fn is_idle(&self) -> bool {
        self.pending_operations() == 0
    }

    /// Close idle connections and stop accepting streams on shared ones.
    /// Requests in flight finish normally.
    pub fn close(&self) {
        tracing::debug!("closing client connections");
        self.inner.connector.close();
    }
}

impl tower::Service<crate::body::Request> for Client {
    type Response = crate::body::Response;
    type Error = Error;
    type Future = ResponseFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: crate::body::Request) -> Self::Future {
        self.send_async(request)
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use crate::client::{CancelHandle, ResponseFuture};
    use crate::Client;

    assert_impl_all!(Client: Send, Sync, Clone);
    assert_impl_all!(ResponseFuture: Send, Unpin);
    assert_impl_all!(CancelHandle: Send, Sync);
}
