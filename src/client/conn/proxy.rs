//! Choosing a proxy per request.

use std::fmt;
use std::sync::Arc;

use http::uri::{Authority, Scheme};
use http::{HeaderMap, HeaderName, HeaderValue, Uri};

/// A forward proxy.
///
/// Secure requests always go through a CONNECT tunnel. Plain requests are
/// forwarded with an absolute-form target unless tunnelling is enabled
/// with [`tunnel_plain`](Proxy::tunnel_plain).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proxy {
    authority: Authority,
    headers: HeaderMap,
    tunnel_plain: bool,
}

impl Proxy {
    /// A proxy listening at `authority`.
    pub fn new(authority: Authority) -> Self {
        Self {
            authority,
            headers: HeaderMap::new(),
            tunnel_plain: false,
        }
    }

    /// Add a header sent to the proxy itself, on CONNECT requests and on
    /// forwarded plain requests. Typically `Proxy-Authorization`.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Tunnel plain HTTP requests too, instead of forwarding them.
    pub fn tunnel_plain(mut self, tunnel: bool) -> Self {
        self.tunnel_plain = tunnel;
        self
    }

    /// The proxy's address.
    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    pub(crate) fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub(crate) fn tunnels_plain(&self) -> bool {
        self.tunnel_plain
    }

    /// The URI a transport connects to for this proxy.
    pub(crate) fn uri(&self) -> Uri {
        Uri::builder()
            .scheme(Scheme::HTTP)
            .authority(self.authority.clone())
            .path_and_query("/")
            .build()
            .unwrap_or_default()
    }
}

/// Picks the proxy for each request, if any.
pub trait ProxySelector: Send + Sync + 'static {
    /// The proxy to reach `uri` through, or `None` to connect directly.
    fn select(&self, uri: &Uri) -> Option<Proxy>;
}

impl<F> ProxySelector for F
where
    F: Fn(&Uri) -> Option<Proxy> + Send + Sync + 'static,
{
    fn select(&self, uri: &Uri) -> Option<Proxy> {
        self(uri)
    }
}

impl ProxySelector for Proxy {
    fn select(&self, _uri: &Uri) -> Option<Proxy> {
        Some(self.clone())
    }
}

/// A shared [`ProxySelector`].
#[derive(Clone)]
pub(crate) struct SharedProxySelector(Arc<dyn ProxySelector>);

impl SharedProxySelector {
    pub(crate) fn new<P: ProxySelector>(selector: P) -> Self {
        Self(Arc::new(selector))
    }

    pub(crate) fn select(&self, uri: &Uri) -> Option<Proxy> {
        self.0.select(uri)
    }
}

impl fmt::Debug for SharedProxySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedProxySelector").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_select_per_uri() {
        let selector = SharedProxySelector::new(|uri: &Uri| {
            (uri.host() != Some("localhost")).then(|| Proxy::new(Authority::from_static("proxy:3128")))
        });
        assert!(selector.select(&"http://localhost/".parse().unwrap()).is_none());
        let proxy = selector.select(&"http://example.com/".parse().unwrap()).unwrap();
        assert_eq!(proxy.uri(), "http://proxy:3128/");
    }
}
