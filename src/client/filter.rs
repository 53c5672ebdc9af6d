//! Request and response filters.
//!
//! Filters see every attempt a [`Client`](super::Client) makes. Request
//! filters run in registration order and may rewrite the outgoing head;
//! response filters run in reverse order and may ask for a follow-up
//! request, which is how redirects are implemented.

use std::fmt;

use http::header::{self, HeaderName};
use http::uri::{Parts as UriParts, PathAndQuery, Scheme};
use http::{Method, StatusCode, Uri};
use tracing::{debug, trace};

use super::Error;

/// Where in its life a request is when a filter sees it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterContext {
    attempt: usize,
    redirects: usize,
}

impl FilterContext {
    pub(crate) fn new(attempt: usize, redirects: usize) -> Self {
        Self { attempt, redirects }
    }

    /// Attempt number, starting at 1.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Redirects followed so far.
    pub fn redirects(&self) -> usize {
        self.redirects
    }
}

/// Hooks around each exchange.
pub trait Filter: Send + Sync + 'static {
    /// Adjust a request head before it is sent. Skipped when the request
    /// is being sent again unchanged, e.g. on a retry.
    fn request(&self, parts: &mut http::request::Parts, cx: &FilterContext) -> Result<(), Error> {
        let _ = (parts, cx);
        Ok(())
    }

    /// Look at a response head and optionally ask for a new request in its
    /// place. Returning `None` lets the response through.
    fn response(
        &self,
        response: &http::response::Parts,
        request: &http::request::Parts,
    ) -> Option<http::Request<()>>;
}

impl fmt::Debug for dyn Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter").finish()
    }
}

/// Follows `301`, `302`, `303`, `307` and `308` responses.
///
/// `303` turns every method but `HEAD` into `GET`; `301` and `302` do so
/// for `POST` only. Redirects from `https` to `http` are not followed.
/// Credentials are dropped when the redirect leaves the origin.
#[derive(Debug, Clone, Default)]
pub struct RedirectFilter {
    _priv: (),
}

impl RedirectFilter {
    /// The standard redirect policy.
    pub fn new() -> Self {
        Self::default()
    }
}

const CREDENTIALS: [HeaderName; 3] = [
    header::AUTHORIZATION,
    header::COOKIE,
    header::PROXY_AUTHORIZATION,
];

const BODY_HEADERS: [HeaderName; 4] = [
    header::CONTENT_TYPE,
    header::CONTENT_ENCODING,
    header::CONTENT_LANGUAGE,
    header::CONTENT_LOCATION,
];

impl Filter for RedirectFilter {
    fn response(
        &self,
        response: &http::response::Parts,
        request: &http::request::Parts,
    ) -> Option<http::Request<()>> {
        let method = match (response.status, &request.method) {
            (StatusCode::SEE_OTHER, &Method::HEAD) => Method::HEAD,
            (StatusCode::SEE_OTHER, _) => Method::GET,
            (StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND, &Method::POST) => Method::GET,
            (
                StatusCode::MOVED_PERMANENTLY
                | StatusCode::FOUND
                | StatusCode::TEMPORARY_REDIRECT
                | StatusCode::PERMANENT_REDIRECT,
                method,
            ) => method.clone(),
            _ => return None,
        };

        let location = response.headers.get(header::LOCATION)?.to_str().ok()?;
        let Some(uri) = resolve(&request.uri, location) else {
            debug!(%location, "ignoring unparseable redirect location");
            return None;
        };

        if request.uri.scheme() == Some(&Scheme::HTTPS) && uri.scheme() != Some(&Scheme::HTTPS) {
            debug!(%uri, "refusing redirect from https to http");
            return None;
        }

        let mut next = http::Request::new(());
        *next.uri_mut() = uri;
        *next.headers_mut() = request.headers.clone();
        *next.extensions_mut() = request.extensions.clone();

        let headers = next.headers_mut();
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::TRANSFER_ENCODING);
        if method != request.method {
            for name in &BODY_HEADERS {
                headers.remove(name);
            }
        }
        if !same_origin(&request.uri, next.uri()) {
            for name in &CREDENTIALS {
                next.headers_mut().remove(name);
            }
        }

        trace!(status = %response.status, %method, uri = %next.uri(), "following redirect");
        *next.method_mut() = method;
        Some(next)
    }
}

fn same_origin(a: &Uri, b: &Uri) -> bool {
    a.scheme() == b.scheme()
        && a.host().map(str::to_ascii_lowercase) == b.host().map(str::to_ascii_lowercase)
        && a.port_u16() == b.port_u16()
}

/// Resolve a `Location` value against the URI of the request it answers.
fn resolve(base: &Uri, location: &str) -> Option<Uri> {
    let location = location.split('#').next().unwrap_or_default();
    if location.is_empty() {
        return Some(base.clone());
    }

    let uri: Uri = if location.starts_with("//") {
        format!("{}:{}", base.scheme_str()?, location).parse().ok()?
    } else {
        let parsed: Uri = location.parse().ok()?;
        if parsed.scheme().is_some() {
            parsed
        } else {
            let path = if location.starts_with('/') {
                location.to_owned()
            } else {
                let base_path = base.path();
                let dir = &base_path[..base_path.rfind('/').map_or(0, |idx| idx + 1)];
                if dir.is_empty() {
                    format!("/{location}")
                } else {
                    format!("{dir}{location}")
                }
            };
            let mut parts = UriParts::default();
            parts.scheme = base.scheme().cloned();
            parts.authority = base.authority().cloned();
            parts.path_and_query = Some(PathAndQuery::try_from(path).ok()?);
            Uri::from_parts(parts).ok()?
        }
    };

    if uri.scheme().is_none() || uri.authority().is_none() {
        return None;
    }
    Some(uri)
}
