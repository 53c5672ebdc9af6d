//! Protocol describes how http requests and responses are transmitted over a connection.
//!
//! Two protocols are provided here: HTTP/1.1 and HTTP/2. Which one a
//! connection speaks is decided when it is established, from ALPN, prior
//! knowledge or an `Upgrade: h2c` exchange.

pub(crate) mod http1;
pub(crate) mod http2;

/// The HTTP protocol to use for a connection.
///
/// This differs from the HTTP version in that it is constrained to the two flavors of HTTP
/// protocol, HTTP/1.1 and HTTP/2. HTTP/3 is not supported. HTTP/1.0 servers are
/// handled by HTTP/1.1.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum HttpProtocol {
    /// Connect using HTTP/1.1
    Http1,

    /// Connect using HTTP/2
    Http2,
}

impl HttpProtocol {
    /// Does this protocol allow multiplexing?
    pub fn multiplex(&self) -> bool {
        matches!(self, Self::Http2)
    }

    /// HTTP Version
    ///
    /// For HTTP/1.1, this returns `::http::Version::HTTP_11`.
    /// For HTTP/2, this returns `::http::Version::HTTP_2`.
    pub fn version(&self) -> ::http::Version {
        match self {
            Self::Http1 => ::http::Version::HTTP_11,
            Self::Http2 => ::http::Version::HTTP_2,
        }
    }
}

impl TryFrom<::http::Version> for HttpProtocol {
    type Error = crate::client::Error;

    fn try_from(version: ::http::Version) -> Result<Self, Self::Error> {
        match version {
            ::http::Version::HTTP_11 | ::http::Version::HTTP_10 => Ok(Self::Http1),
            ::http::Version::HTTP_2 => Ok(Self::Http2),
            other => Err(crate::client::Error::UnsupportedProtocol(format!(
                "{other:?}"
            ))),
        }
    }
}
