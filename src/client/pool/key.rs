use std::fmt;

use http::uri::Authority;

use crate::client::conn::ConnectionKind;

/// Identifies which idle connections can serve a request.
///
/// Connections through a plain (non-tunneling) proxy are keyed by the proxy
/// alone, since any request can be forwarded over them. Every other kind
/// is keyed by destination too.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct CacheKey {
    secure: bool,
    proxy: Option<Authority>,
    destination: Option<(Box<str>, u16)>,
}

impl CacheKey {
    pub(crate) fn new(
        kind: ConnectionKind,
        host: &str,
        port: u16,
        proxy: Option<&Authority>,
    ) -> Self {
        let destination = match kind {
            ConnectionKind::PlainProxy => None,
            _ => Some((host.to_ascii_lowercase().into_boxed_str(), port)),
        };

        Self {
            secure: kind.is_secure(),
            proxy: proxy.cloned(),
            destination,
        }
    }

    /// Whether connections under this key are encrypted.
    pub fn is_secure(&self) -> bool {
        self.secure
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "https" } else { "http" };
        match &self.destination {
            Some((host, port)) => write!(f, "{scheme}://{host}:{port}")?,
            None => write!(f, "{scheme}://*")?,
        }
        if let Some(proxy) = &self.proxy {
            write!(f, " via {proxy}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_key {
    use super::*;

    #[test]
    fn plain_proxy_ignores_destination() {
        let proxy = Authority::from_static("proxy:3128");
        let a = CacheKey::new(ConnectionKind::PlainProxy, "a.example", 80, Some(&proxy));
        let b = CacheKey::new(ConnectionKind::PlainProxy, "b.example", 80, Some(&proxy));
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "http://* via proxy:3128");
    }

    #[test]
    fn tunnels_keep_destination() {
        let proxy = Authority::from_static("proxy:3128");
        let a = CacheKey::new(ConnectionKind::SecureTunnel, "a.example", 443, Some(&proxy));
        let b = CacheKey::new(ConnectionKind::SecureTunnel, "b.example", 443, Some(&proxy));
        assert_ne!(a, b);
        assert!(a.is_secure());
        assert_eq!(a.to_string(), "https://a.example:443 via proxy:3128");
    }

    #[test]
    fn host_is_case_insensitive() {
        let a = CacheKey::new(ConnectionKind::PlainDirect, "Example.COM", 80, None);
        let b = CacheKey::new(ConnectionKind::PlainDirect, "example.com", 80, None);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "http://example.com:80");
    }
}
