//! Response heads, read incrementally off the wire.

use bytes::{Bytes, BytesMut};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Version};

use crate::client::ProtocolError;

/// A parsed status line and header block.
#[derive(Debug, Clone)]
pub(crate) struct ResponseHead {
    pub(crate) version: Version,
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
}

impl ResponseHead {
    /// Whether the server allows the connection to carry another exchange.
    pub(crate) fn keep_alive(&self) -> bool {
        let tokens = connection_tokens(&self.headers);
        if tokens.iter().any(|token| token == "close") {
            return false;
        }
        self.version != Version::HTTP_10 || tokens.iter().any(|token| token == "keep-alive")
    }

    pub(crate) fn into_response<B>(self, body: B) -> http::Response<B> {
        let mut response = http::Response::new(body);
        *response.status_mut() = self.status;
        *response.version_mut() = self.version;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Lower-cased tokens of every `Connection` header.
pub(crate) fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

/// Accumulates bytes until a full response head has arrived.
#[derive(Debug)]
pub(crate) struct HeadParser {
    buf: BytesMut,
    scanned: usize,
    max_size: usize,
}

impl HeadParser {
    pub(crate) fn new(max_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            scanned: 0,
            max_size,
        }
    }

    /// Take bytes from `input`. Returns the head once it is complete; bytes
    /// after the head are left in `input`.
    pub(crate) fn parse(&mut self, input: &mut Bytes) -> Result<Option<ResponseHead>, ProtocolError> {
        self.buf.extend_from_slice(input);
        *input = Bytes::new();

        let Some(end) = find_head_end(&self.buf, self.scanned) else {
            if self.buf.len() > self.max_size {
                return Err(ProtocolError::HeadTooLarge(self.max_size));
            }
            self.scanned = self.buf.len().saturating_sub(3);
            return Ok(None);
        };

        if end > self.max_size {
            return Err(ProtocolError::HeadTooLarge(self.max_size));
        }

        let head = self.buf.split_to(end);
        *input = self.buf.split().freeze();
        self.scanned = 0;
        parse_head(&head).map(Some)
    }
}

/// Index just past the blank line which ends the head. Bare LF line
/// endings are tolerated.
fn find_head_end(buf: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i < buf.len() {
        if buf[i] == b'\n' {
            match buf.get(i + 1) {
                Some(b'\n') => return Some(i + 2),
                Some(b'\r') if buf.get(i + 2) == Some(&b'\n') => return Some(i + 3),
                _ => {}
            }
        }
        i += 1;
    }
    None
}

fn lines(head: &[u8]) -> impl Iterator<Item = &[u8]> {
    head.split(|b| *b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
}

fn parse_head(head: &[u8]) -> Result<ResponseHead, ProtocolError> {
    let mut lines = lines(head);
    let status_line = lines.next().ok_or(ProtocolError::StatusLine)?;
    let (version, status) = parse_status_line(status_line)?;
    let headers = parse_headers(lines)?;
    Ok(ResponseHead {
        version,
        status,
        headers,
    })
}

fn parse_status_line(line: &[u8]) -> Result<(Version, StatusCode), ProtocolError> {
    let line = std::str::from_utf8(line).map_err(|_| ProtocolError::StatusLine)?;
    let mut parts = line.splitn(3, ' ');

    let version = match parts.next() {
        Some("HTTP/1.1") => Version::HTTP_11,
        Some("HTTP/1.0") => Version::HTTP_10,
        _ => return Err(ProtocolError::StatusLine),
    };

    let code = parts.next().ok_or(ProtocolError::StatusLine)?;
    if code.len() != 3 {
        return Err(ProtocolError::StatusLine);
    }
    let status = StatusCode::from_bytes(code.as_bytes()).map_err(|_| ProtocolError::StatusLine)?;
    Ok((version, status))
}

/// Parse `name: value` lines up to the first empty one.
pub(crate) fn parse_headers<'a>(
    lines: impl Iterator<Item = &'a [u8]>,
) -> Result<HeaderMap, ProtocolError> {
    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if line[0] == b' ' || line[0] == b'\t' {
            // Obsolete line folding.
            return Err(ProtocolError::HeaderLine);
        }
        let colon = line
            .iter()
            .position(|b| *b == b':')
            .ok_or(ProtocolError::HeaderLine)?;
        let name =
            HeaderName::from_bytes(&line[..colon]).map_err(|_| ProtocolError::HeaderLine)?;
        let value = trim(&line[colon + 1..]);
        let value = HeaderValue::from_bytes(value).map_err(|_| ProtocolError::HeaderLine)?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn trim(mut value: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    value
}

/// How a response body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyKind {
    /// No body follows the head.
    Empty,
    /// Exactly this many bytes follow.
    Fixed(u64),
    /// Chunked transfer coding.
    Chunked,
    /// The body runs until the server closes the connection.
    UntilClose,
}

/// Decide how the body of a response to `method` is framed.
pub(crate) fn body_kind(method: &Method, head: &ResponseHead) -> Result<BodyKind, ProtocolError> {
    let length = content_length(&head.headers)?;

    if head.status == StatusCode::NO_CONTENT {
        return match length {
            Some(length) if length > 0 => Err(ProtocolError::BodylessContentLength(length)),
            _ => Ok(BodyKind::Empty),
        };
    }

    if *method == Method::HEAD
        || head.status.is_informational()
        || head.status == StatusCode::NOT_MODIFIED
        || (*method == Method::CONNECT && head.status.is_success())
    {
        return Ok(BodyKind::Empty);
    }

    if is_chunked(&head.headers) {
        return Ok(BodyKind::Chunked);
    }

    Ok(match length {
        Some(0) => BodyKind::Empty,
        Some(length) => BodyKind::Fixed(length),
        None => BodyKind::UntilClose,
    })
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .last()
        .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

/// The declared content length. Repeated headers must agree.
pub(crate) fn content_length(headers: &HeaderMap) -> Result<Option<u64>, ProtocolError> {
    let mut length = None;
    for value in headers.get_all(header::CONTENT_LENGTH) {
        for item in value
            .to_str()
            .map_err(|_| ProtocolError::ContentLength)?
            .split(',')
        {
            let item = item.trim();
            if item.is_empty() || !item.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ProtocolError::ContentLength);
            }
            let parsed: u64 = item.parse().map_err(|_| ProtocolError::ContentLength)?;
            match length {
                Some(existing) if existing != parsed => return Err(ProtocolError::ContentLength),
                _ => length = Some(parsed),
            }
        }
    }
    Ok(length)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(raw: &'static [u8]) -> ResponseHead {
        let mut parser = HeadParser::new(1024);
        let mut input = Bytes::from_static(raw);
        parser.parse(&mut input).unwrap().unwrap()
    }

    #[test]
    fn parses_in_pieces_and_keeps_leftover() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\nX-A: 1\r\nX-A: 2\r\n\r\nabc";
        let mut parser = HeadParser::new(1024);

        let mut parsed = None;
        let mut leftover = Vec::new();
        for byte in raw.iter() {
            let mut input = Bytes::copy_from_slice(&[*byte]);
            if parsed.is_none() {
                parsed = parser.parse(&mut input).unwrap();
            }
            leftover.extend_from_slice(&input);
        }

        let head = parsed.unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.headers.get_all("x-a").iter().count(), 2);
        assert_eq!(&leftover[..], b"abc");
    }

    #[test]
    fn tolerates_bare_newlines() {
        let head = head(b"HTTP/1.0 404 Not Found\nServer: test\n\n");
        assert_eq!(head.version, Version::HTTP_10);
        assert_eq!(head.status, StatusCode::NOT_FOUND);
        assert!(!head.keep_alive());
    }

    #[test]
    fn rejects_bad_status_lines() {
        for raw in [
            &b"HTTP/2 200 OK\r\n\r\n"[..],
            b"HTTP/1.1 20 OK\r\n\r\n",
            b"ICY 200 OK\r\n\r\n",
        ] {
            let mut parser = HeadParser::new(1024);
            let mut input = Bytes::from_static(raw);
            assert_eq!(parser.parse(&mut input).unwrap_err(), ProtocolError::StatusLine);
        }
    }

    #[test]
    fn rejects_folded_headers() {
        let mut parser = HeadParser::new(1024);
        let mut input = Bytes::from_static(b"HTTP/1.1 200 OK\r\nA: b\r\n c\r\n\r\n");
        assert_eq!(parser.parse(&mut input).unwrap_err(), ProtocolError::HeaderLine);
    }

    #[test]
    fn head_size_is_capped() {
        let mut parser = HeadParser::new(16);
        let mut input = Bytes::from_static(b"HTTP/1.1 200 OK\r\nX-Long: aaaaaaaaaaaaaaaa");
        assert_eq!(
            parser.parse(&mut input).unwrap_err(),
            ProtocolError::HeadTooLarge(16)
        );
    }

    #[test]
    fn keep_alive_rules() {
        assert!(head(b"HTTP/1.1 200 OK\r\n\r\n").keep_alive());
        assert!(!head(b"HTTP/1.1 200 OK\r\nConnection: Close\r\n\r\n").keep_alive());
        assert!(head(b"HTTP/1.0 200 OK\r\nConnection: keep-alive\r\n\r\n").keep_alive());
    }

    #[test]
    fn body_framing() {
        let get = Method::GET;
        assert_eq!(
            body_kind(&get, &head(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n")).unwrap(),
            BodyKind::Fixed(5)
        );
        assert_eq!(
            body_kind(
                &get,
                &head(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n")
            )
            .unwrap(),
            BodyKind::Chunked
        );
        assert_eq!(
            body_kind(&get, &head(b"HTTP/1.1 200 OK\r\n\r\n")).unwrap(),
            BodyKind::UntilClose
        );
        assert_eq!(
            body_kind(&get, &head(b"HTTP/1.1 204 No Content\r\n\r\n")).unwrap(),
            BodyKind::Empty
        );
        assert_eq!(
            body_kind(&Method::HEAD, &head(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n"))
                .unwrap(),
            BodyKind::Empty
        );
        assert_eq!(
            body_kind(&get, &head(b"HTTP/1.1 304 Not Modified\r\nContent-Length: 5\r\n\r\n"))
                .unwrap(),
            BodyKind::Empty
        );
    }

    #[test]
    fn no_content_with_length_is_an_error() {
        let head = head(b"HTTP/1.1 204 No Content\r\nContent-Length: 12\r\n\r\n");
        assert_eq!(
            body_kind(&Method::GET, &head).unwrap_err(),
            ProtocolError::BodylessContentLength(12)
        );
    }

    #[test]
    fn conflicting_lengths_are_an_error() {
        let head = head(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\n");
        assert_eq!(
            body_kind(&Method::GET, &head).unwrap_err(),
            ProtocolError::ContentLength
        );

        let head = self::head(b"HTTP/1.1 200 OK\r\nContent-Length: 5, 5\r\n\r\n");
        assert_eq!(body_kind(&Method::GET, &head).unwrap(), BodyKind::Fixed(5));
    }
}
