use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::client::conn::protocol::http2::ErrorCode;
use crate::BoxError;

/// Client error type.
///
/// Errors are cheap to clone, so that one failure can be reported to every
/// party waiting on a connection or stream. Wrapping kinds (timeouts,
/// cancellation, retry exhaustion) keep the original failure as their
/// [`source`](std::error::Error::source).
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// The transport could not be established.
    #[error("connect: {0}")]
    Connect(#[source] Arc<io::Error>),

    /// Establishing the transport took longer than the configured limit.
    #[error("connect timed out")]
    ConnectTimeout,

    /// The exchange took longer than the configured request timeout.
    #[error("request timed out")]
    Timeout,

    /// The exchange was cancelled, either by the caller or because of a
    /// failure while the caller had asked for cancellation.
    #[error("request cancelled")]
    Cancelled(#[source] Option<Arc<Error>>),

    /// A pooled connection turned out to be closed before it produced any
    /// response bytes. The request is safe to send again.
    #[error("connection expired")]
    ConnectionExpired(#[source] Arc<Error>),

    /// The TLS handshake did not select HTTP/2 when it was required.
    #[error("ALPN negotiated {0:?}, HTTP/2 required")]
    AlpnMismatch(Option<String>),

    /// The peer broke the HTTP framing rules.
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),

    /// An I/O error on an established connection.
    #[error("io: {0}")]
    Io(#[source] Arc<io::Error>),

    /// The peer reset the stream.
    #[error("stream reset by peer: {0}")]
    StreamReset(ErrorCode),

    /// The peer is shutting the connection down.
    #[error("connection going away: {code}")]
    GoAway {
        /// Error code carried by the GOAWAY frame.
        code: ErrorCode,
        /// Highest stream id the peer may have processed.
        last_stream_id: u32,
    },

    /// The peer refused the stream before doing any work on it.
    #[error("stream refused by peer")]
    RefusedStream,

    /// The retry budget was exhausted.
    #[error("too many retries")]
    TooManyRetries(#[source] Arc<Error>),

    /// A proxy answered CONNECT with 407.
    #[error("proxy authentication required")]
    ProxyAuthenticationRequired,

    /// A proxy answered CONNECT with something other than success.
    #[error("tunnel failed with status {0}")]
    TunnelFailed(http::StatusCode),

    /// The request cannot be sent as written.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Protocol is not supported by this client or transport.
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// The request body failed to produce data.
    #[error("body: {0}")]
    Body(#[source] Arc<dyn std::error::Error + Send + Sync>),

    /// The connection closed while the exchange still needed it.
    #[error("connection closed")]
    Closed,
}

impl Error {
    pub(crate) fn io(error: io::Error) -> Self {
        Error::Io(Arc::new(error))
    }

    pub(crate) fn connect(error: io::Error) -> Self {
        Error::Connect(Arc::new(error))
    }

    pub(crate) fn body(error: impl Into<BoxError>) -> Self {
        Error::Body(Arc::from(error.into()))
    }

    pub(crate) fn cancelled(cause: Option<Error>) -> Self {
        Error::Cancelled(cause.map(Arc::new))
    }

    pub(crate) fn expired(cause: Error) -> Self {
        Error::ConnectionExpired(Arc::new(cause))
    }

    /// Failed while establishing the transport.
    pub fn is_connect(&self) -> bool {
        matches!(self, Error::Connect(_) | Error::ConnectTimeout)
    }

    /// Failed because a deadline passed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout | Error::ConnectTimeout)
    }

    /// Failed because the exchange was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    /// Failed on a stale pooled connection before anything was received.
    pub fn is_connection_expired(&self) -> bool {
        matches!(self, Error::ConnectionExpired(_))
    }

    /// Whether the failure guarantees the peer did not act on the request,
    /// so sending it again cannot duplicate side effects.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ConnectionExpired(_) | Error::RefusedStream => true,
            Error::StreamReset(code) => *code == ErrorCode::REFUSED_STREAM,
            _ => false,
        }
    }

    /// Walk wrapping kinds down to the failure which started the chain.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Cancelled(Some(cause))
            | Error::ConnectionExpired(cause)
            | Error::TooManyRetries(cause) => cause.root_cause(),
            _ => self,
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::io(error)
    }
}

/// Violations of HTTP/1.1 or HTTP/2 framing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The status line could not be parsed.
    #[error("malformed status line")]
    StatusLine,

    /// A header line could not be parsed.
    #[error("malformed header line")]
    HeaderLine,

    /// The response head exceeded the size limit.
    #[error("response head larger than {0} bytes")]
    HeadTooLarge(usize),

    /// Content-Length was missing digits or contradicted itself.
    #[error("invalid content-length")]
    ContentLength,

    /// A chunk size line exceeded the size limit.
    #[error("chunk size line longer than {0} bytes")]
    ChunkLineTooLong(usize),

    /// A chunk size was not valid hexadecimal.
    #[error("invalid chunk size")]
    ChunkSize,

    /// Chunk data was not followed by CRLF.
    #[error("missing CRLF after chunk data")]
    ChunkTerminator,

    /// The connection closed before the body was complete.
    #[error("connection closed before the body was complete")]
    TruncatedBody,

    /// A response without a body declared a non-zero length.
    #[error("bodyless response declared content-length {0}")]
    BodylessContentLength(u64),

    /// The request body disagreed with its declared length.
    #[error("request body sent {sent} bytes, content-length declared {declared}")]
    ContentLengthMismatch {
        /// Declared length.
        declared: u64,
        /// Bytes actually produced.
        sent: u64,
    },

    /// A malformed HTTP/2 frame or connection-level violation.
    #[error("{code}: {reason}")]
    Http2 {
        /// Error code that was, or will be, sent to the peer.
        code: ErrorCode,
        /// What was wrong.
        reason: &'static str,
    },

    /// The header block could not be decoded.
    #[error("header compression: {0}")]
    Compression(&'static str),

    /// A pseudo-header was unknown, repeated, or out of place.
    #[error("invalid pseudo-header {0}")]
    PseudoHeader(String),

    /// A response header value or name was not valid HTTP.
    #[error("invalid header {0}")]
    InvalidHeader(String),

    /// A flow-control window grew past 2^31-1.
    #[error("flow-control window overflow")]
    WindowOverflow,

    /// An HTTP/1.1 to HTTP/2 upgrade could not be completed.
    #[error("upgrade failed: {0}")]
    Upgrade(&'static str),
}

impl ProtocolError {
    pub(crate) fn h2(code: ErrorCode, reason: &'static str) -> Self {
        ProtocolError::Http2 { code, reason }
    }

    /// The HTTP/2 error code to report for this violation.
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::Http2 { code, .. } => *code,
            ProtocolError::Compression(_) => ErrorCode::COMPRESSION_ERROR,
            ProtocolError::WindowOverflow => ErrorCode::FLOW_CONTROL_ERROR,
            _ => ErrorCode::PROTOCOL_ERROR,
        }
    }
}
