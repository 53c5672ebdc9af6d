//! Request heads and chunked framing, as written to the wire.

use std::fmt::Write as _;

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{self, HeaderMap, HeaderValue};
use http::{Method, Uri};

use crate::client::Error;

/// How the request line names its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestTarget {
    /// `/path?query`, for origin servers and tunnels.
    Origin,
    /// The full URI, for requests forwarded by a plain proxy.
    Absolute,
    /// `host:port`, for CONNECT.
    Authority,
}

/// How the request body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    /// No body, and no length header.
    None,
    /// `Content-Length` bytes follow the head.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
}

impl Framing {
    /// Pick the framing for a body whose exact length may be known.
    ///
    /// An empty body only announces `Content-Length: 0` for methods which
    /// normally carry one.
    pub(crate) fn for_body(method: &Method, length: Option<u64>) -> Self {
        match length {
            Some(0) if !expects_body(method) => Framing::None,
            Some(length) => Framing::Length(length),
            None => Framing::Chunked,
        }
    }

    pub(crate) fn is_none(&self) -> bool {
        matches!(self, Framing::None)
    }
}

fn expects_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// The `Host` header value for `uri`: the authority, without a port the
/// scheme implies.
pub(crate) fn host_header(uri: &Uri) -> Result<HeaderValue, Error> {
    let host = uri
        .host()
        .ok_or_else(|| Error::InvalidRequest(format!("no host in {uri}")))?;

    let default_port = match uri.scheme_str() {
        Some("https") => Some(443),
        Some("http") => Some(80),
        _ => None,
    };

    let value = match uri.port_u16() {
        Some(port) if Some(port) != default_port => format!("{host}:{port}"),
        _ => host.to_owned(),
    };
    HeaderValue::from_str(&value).map_err(|_| Error::InvalidRequest(format!("bad host {host}")))
}

fn request_target(uri: &Uri, target: RequestTarget) -> Result<String, Error> {
    match target {
        RequestTarget::Origin => Ok(uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|pq| !pq.is_empty())
            .unwrap_or("/")
            .to_owned()),
        RequestTarget::Absolute => Ok(uri.to_string()),
        RequestTarget::Authority => {
            let (host, port) = crate::client::conn::transport::host_and_port(uri)
                .map_err(|error| Error::InvalidRequest(error.to_string()))?;
            if host.contains(':') {
                Ok(format!("[{host}]:{port}"))
            } else {
                Ok(format!("{host}:{port}"))
            }
        }
    }
}

/// Serialize a request head.
///
/// Framing headers are always derived from `framing`: any `Content-Length`
/// or `Transfer-Encoding` the caller set is replaced. A `Host` header is
/// added when missing.
pub(crate) fn request_head(
    parts: &http::request::Parts,
    target: RequestTarget,
    framing: Framing,
) -> Result<Bytes, Error> {
    let target = request_target(&parts.uri, target)?;

    let mut head = String::with_capacity(256);
    let _ = write!(head, "{} {} HTTP/1.1\r\n", parts.method, target);
    let mut buf = BytesMut::from(head.as_bytes());

    if !parts.headers.contains_key(header::HOST) {
        let host = host_header(&parts.uri)?;
        put_header(&mut buf, header::HOST.as_str(), &host);
    }

    for (name, value) in &parts.headers {
        if name == header::CONTENT_LENGTH || name == header::TRANSFER_ENCODING {
            continue;
        }
        put_header(&mut buf, name.as_str(), value);
    }

    match framing {
        Framing::None => {}
        Framing::Length(length) => {
            put_header(&mut buf, header::CONTENT_LENGTH.as_str(), &HeaderValue::from(length));
        }
        Framing::Chunked => {
            put_header(
                &mut buf,
                header::TRANSFER_ENCODING.as_str(),
                &HeaderValue::from_static("chunked"),
            );
        }
    }

    buf.put_slice(b"\r\n");
    Ok(buf.freeze())
}

fn put_header(buf: &mut BytesMut, name: &str, value: &HeaderValue) {
    buf.put_slice(name.as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value.as_bytes());
    buf.put_slice(b"\r\n");
}

/// One chunk of a chunked body. Empty data produces nothing, since a
/// zero-length chunk would end the body.
pub(crate) fn chunk(data: Bytes) -> Vec<Bytes> {
    if data.is_empty() {
        return Vec::new();
    }
    let size = format!("{:X}\r\n", data.len());
    vec![Bytes::from(size), data, Bytes::from_static(b"\r\n")]
}

/// The zero-length chunk which ends a chunked body, with optional trailers.
pub(crate) fn last_chunk(trailers: Option<&HeaderMap>) -> Bytes {
    let mut buf = BytesMut::from(&b"0\r\n"[..]);
    if let Some(trailers) = trailers {
        for (name, value) in trailers {
            put_header(&mut buf, name.as_str(), value);
        }
    }
    buf.put_slice(b"\r\n");
    buf.freeze()
}
