//! Connection Information

use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

mod tls;
pub use self::tls::TlsConnectionInfo;

/// The application protocol carried by a connection.
///
/// Usually learned from ALPN during the TLS handshake, but transports which
/// pre-negotiate a protocol (e.g. an in-memory duplex) can set it directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Protocol {
    /// HTTP transports
    Http(http::Version),

    /// Other protocol
    Other(String),
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(version) if *version == http::Version::HTTP_2 => f.write_str("h2"),
            Self::Http(version) if *version == http::Version::HTTP_10 => f.write_str("http/1.0"),
            Self::Http(_) => f.write_str("http/1.1"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

impl Protocol {
    /// Create a new protocol with the given http version.
    pub fn http(version: http::Version) -> Self {
        Self::Http(version)
    }

    /// Whether this is the HTTP/2 ALPN token.
    pub fn is_h2(&self) -> bool {
        matches!(self, Self::Http(version) if *version == http::Version::HTTP_2)
    }
}

impl From<http::Version> for Protocol {
    fn from(version: http::Version) -> Self {
        Self::Http(version)
    }
}

impl FromStr for Protocol {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http/1.0" => Ok(Self::Http(http::Version::HTTP_10)),
            "http/1.1" => Ok(Self::Http(http::Version::HTTP_11)),
            "h2" => Ok(Self::Http(http::Version::HTTP_2)),
            _ => Ok(Self::Other(s.to_string())),
        }
    }
}

/// What is known about an established transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Address of the remote end, when the transport has one.
    pub remote_addr: Option<SocketAddr>,

    /// Address of the local end, when the transport has one.
    pub local_addr: Option<SocketAddr>,

    /// Present once the transport is wrapped in TLS.
    pub tls: Option<TlsConnectionInfo>,

    /// A protocol fixed by the transport without TLS, e.g. for duplex
    /// pipes which always speak HTTP/2.
    pub protocol: Option<Protocol>,
}

impl ConnectionInfo {
    /// Whether the transport is encrypted.
    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    /// The negotiated application protocol, from TLS first and then the
    /// transport itself.
    pub fn alpn(&self) -> Option<&Protocol> {
        self.tls
            .as_ref()
            .and_then(|tls| tls.alpn.as_ref())
            .or(self.protocol.as_ref())
    }
}

/// Types which can describe the connection they wrap.
pub trait HasConnectionInfo {
    /// Connection information for this value.
    fn info(&self) -> ConnectionInfo;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_from_alpn() {
        assert_eq!(
            "h2".parse::<Protocol>().unwrap(),
            Protocol::Http(http::Version::HTTP_2)
        );
        assert_eq!(
            "http/1.1".parse::<Protocol>().unwrap(),
            Protocol::Http(http::Version::HTTP_11)
        );
        assert_eq!(
            "spdy/3".parse::<Protocol>().unwrap(),
            Protocol::Other("spdy/3".into())
        );
    }

    #[test]
    fn protocol_display_round_trips_alpn() {
        for token in ["h2", "http/1.1", "http/1.0"] {
            assert_eq!(token.parse::<Protocol>().unwrap().to_string(), token);
        }
    }

    #[test]
    fn alpn_prefers_tls() {
        let info = ConnectionInfo {
            tls: Some(TlsConnectionInfo::new_client(Some(Protocol::http(
                http::Version::HTTP_11,
            )))),
            protocol: Some(Protocol::http(http::Version::HTTP_2)),
            ..Default::default()
        };
        assert!(info.is_secure());
        assert!(!info.alpn().unwrap().is_h2());
    }
}
