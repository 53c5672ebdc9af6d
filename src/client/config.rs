use std::time::Duration;

use crate::client::conn::HttpProtocol;

/// Request-level behavior of a [`Client`](super::Client).
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// Redirects followed before the redirect response itself is returned.
    pub max_redirects: usize,

    /// Attempts made for one request, counting redirects and retries.
    pub max_attempts: usize,

    /// Limit on finding or establishing a connection.
    pub connect_timeout: Option<Duration>,

    /// Limit on each attempt, from sending the request until the response
    /// head arrives.
    pub timeout: Option<Duration>,

    /// Preferred protocol. HTTP/2 is negotiated with ALPN on secure
    /// connections and with an `h2c` upgrade on plain ones, falling back to
    /// HTTP/1.1 when the server declines.
    pub version: HttpProtocol,

    /// Retry once when a fresh connection cannot be established.
    pub retry_on_connect_failure: bool,

    /// Allow retrying requests whose method is not idempotent.
    pub retry_non_idempotent: bool,

    /// Speak HTTP/2 on plain connections without upgrading first.
    pub http2_prior_knowledge: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_redirects: 5,
            max_attempts: 10,
            connect_timeout: None,
            timeout: None,
            version: HttpProtocol::Http2,
            retry_on_connect_failure: true,
            retry_non_idempotent: false,
            http2_prior_knowledge: false,
        }
    }
}
