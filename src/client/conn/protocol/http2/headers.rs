//! Converting between `http` types and HPACK header lists.

use bytes::Bytes;
use http::header::{self, HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode, Uri};

use super::hpack::HeaderField;
use crate::client::{Error, ProtocolError};

/// Headers which only make sense for a single HTTP/1.1 hop.
fn is_connection_specific(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "keep-alive"
            | "proxy-connection"
            | "http2-settings"
    )
}

fn field(name: &'static str, value: impl Into<Bytes>) -> HeaderField {
    HeaderField::new(Bytes::from_static(name.as_bytes()), value.into())
}

/// Build the header list for a request: pseudo-headers first, then every
/// regular header with connection-specific ones removed.
pub(super) fn request_fields(
    parts: &http::request::Parts,
    secure: bool,
    content_length: Option<u64>,
) -> Result<Vec<HeaderField>, Error> {
    let mut fields = Vec::with_capacity(parts.headers.len() + 5);

    let authority = match parts.uri.authority() {
        Some(authority) => Bytes::copy_from_slice(authority.as_str().as_bytes()),
        None => match parts.headers.get(header::HOST) {
            Some(host) => Bytes::copy_from_slice(host.as_bytes()),
            None => return Err(Error::InvalidRequest("request has no authority".into())),
        },
    };

    fields.push(field(":method", parts.method.as_str().to_owned()));
    if parts.method == Method::CONNECT {
        fields.push(field(":authority", authority));
    } else {
        let scheme = match parts.uri.scheme_str() {
            Some(scheme) => scheme.to_owned(),
            None if secure => "https".to_owned(),
            None => "http".to_owned(),
        };
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|pq| !pq.is_empty())
            .unwrap_or("/")
            .to_owned();
        fields.push(field(":scheme", scheme));
        fields.push(field(":authority", authority));
        fields.push(field(":path", path));
    }

    for (name, value) in parts.headers.iter() {
        if is_connection_specific(name) {
            continue;
        }
        if name == header::TE && value.as_bytes() != b"trailers" {
            continue;
        }
        fields.push(HeaderField::new(
            Bytes::copy_from_slice(name.as_str().as_bytes()),
            Bytes::copy_from_slice(value.as_bytes()),
        ));
    }

    if let Some(length) = content_length {
        if length > 0 && !parts.headers.contains_key(header::CONTENT_LENGTH) {
            fields.push(field("content-length", length.to_string()));
        }
    }

    Ok(fields)
}

/// Trailer fields for the end of a request body.
pub(super) fn trailer_fields(trailers: &HeaderMap) -> Vec<HeaderField> {
    trailers
        .iter()
        .filter(|(name, _)| !is_connection_specific(name))
        .map(|(name, value)| {
            HeaderField::new(
                Bytes::copy_from_slice(name.as_str().as_bytes()),
                Bytes::copy_from_slice(value.as_bytes()),
            )
        })
        .collect()
}

fn regular_header(field: &HeaderField) -> Result<(HeaderName, HeaderValue), ProtocolError> {
    let invalid = || ProtocolError::InvalidHeader(String::from_utf8_lossy(&field.name).into_owned());

    if field.name.iter().any(u8::is_ascii_uppercase) {
        return Err(invalid());
    }
    let name = HeaderName::from_bytes(&field.name).map_err(|_| invalid())?;
    if is_connection_specific(&name) && name != header::HOST {
        return Err(invalid());
    }
    let value = HeaderValue::from_maybe_shared(field.value.clone()).map_err(|_| invalid())?;
    Ok((name, value))
}

fn pseudo_error(field: &HeaderField) -> ProtocolError {
    ProtocolError::PseudoHeader(String::from_utf8_lossy(&field.name).into_owned())
}

/// A decoded response head.
#[derive(Debug)]
pub(super) struct ResponseHead {
    pub(super) status: StatusCode,
    pub(super) headers: HeaderMap,
}

/// Validate a response header list: exactly one `:status`, before any
/// regular header, and no other pseudo-header.
pub(super) fn response_head(fields: Vec<HeaderField>) -> Result<ResponseHead, ProtocolError> {
    let mut status = None;
    let mut headers = HeaderMap::with_capacity(fields.len());
    let mut regular_seen = false;

    for field in &fields {
        if field.name.starts_with(b":") {
            if regular_seen || &field.name[..] != b":status" || status.is_some() {
                return Err(pseudo_error(field));
            }
            status = Some(
                StatusCode::from_bytes(&field.value).map_err(|_| pseudo_error(field))?,
            );
        } else {
            regular_seen = true;
            let (name, value) = regular_header(field)?;
            headers.append(name, value);
        }
    }

    let status = status.ok_or_else(|| ProtocolError::PseudoHeader(":status missing".into()))?;
    Ok(ResponseHead { status, headers })
}

/// Trailers carry no pseudo-headers.
pub(super) fn trailers(fields: Vec<HeaderField>) -> Result<HeaderMap, ProtocolError> {
    let mut headers = HeaderMap::with_capacity(fields.len());
    for field in &fields {
        if field.name.starts_with(b":") {
            return Err(pseudo_error(field));
        }
        let (name, value) = regular_header(field)?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Rebuild the request a server promised to push.
pub(super) fn promised_request(fields: Vec<HeaderField>) -> Result<http::Request<()>, ProtocolError> {
    let mut method = None;
    let mut scheme = None;
    let mut authority = None;
    let mut path = None;
    let mut headers = HeaderMap::new();
    let mut regular_seen = false;

    for field in &fields {
        if field.name.starts_with(b":") {
            if regular_seen {
                return Err(pseudo_error(field));
            }
            let slot = match &field.name[..] {
                b":method" => &mut method,
                b":scheme" => &mut scheme,
                b":authority" => &mut authority,
                b":path" => &mut path,
                _ => return Err(pseudo_error(field)),
            };
            if slot.replace(field.value.clone()).is_some() {
                return Err(pseudo_error(field));
            }
        } else {
            regular_seen = true;
            let (name, value) = regular_header(field)?;
            headers.append(name, value);
        }
    }

    let missing = |name: &str| ProtocolError::PseudoHeader(format!("{name} missing"));
    let method = Method::from_bytes(&method.ok_or_else(|| missing(":method"))?)
        .map_err(|_| ProtocolError::PseudoHeader(":method".into()))?;
    let scheme = scheme.ok_or_else(|| missing(":scheme"))?;
    let path = path.ok_or_else(|| missing(":path"))?;

    let mut uri = Vec::with_capacity(scheme.len() + path.len() + 32);
    uri.extend_from_slice(&scheme);
    uri.extend_from_slice(b"://");
    if let Some(authority) = &authority {
        uri.extend_from_slice(authority);
    }
    uri.extend_from_slice(&path);
    let uri = Uri::try_from(uri).map_err(|_| ProtocolError::PseudoHeader(":path".into()))?;

    let mut request = http::Request::new(());
    *request.method_mut() = method;
    *request.uri_mut() = uri;
    *request.version_mut() = http::Version::HTTP_2;
    *request.headers_mut() = headers;
    Ok(request)
}
