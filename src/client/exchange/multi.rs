//! One logical request across retries and redirects.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::Method;
use http_body::Body as _;
use http_body_util::BodyExt as _;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::Exchange;
use crate::body::{Body, Incoming, Request, Response};
use crate::client::conn::{Connector, HttpProtocol, Route, SharedProxySelector};
use crate::client::filter::{Filter, FilterContext};
use crate::client::{Config, Error};

/// Redirect bodies up to this size are read, so their connection can be
/// reused for the next hop.
const DRAIN_LIMIT: u64 = 64 * 1024;

/// How long a redirect body may take to arrive before it is abandoned.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct CancelState {
    cancelled: bool,
    current: Option<Arc<Exchange>>,
}

/// Drives [`Exchange`] attempts for one request until a response is final.
pub(crate) struct MultiExchange {
    connector: Connector,
    config: Arc<Config>,
    filters: Arc<[Arc<dyn Filter>]>,
    proxies: Option<SharedProxySelector>,
    state: Mutex<CancelState>,
}

impl fmt::Debug for MultiExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MultiExchange")
            .field("cancelled", &state.cancelled)
            .field("current", &state.current)
            .finish()
    }
}

impl MultiExchange {
    pub(crate) fn new(
        connector: Connector,
        config: Arc<Config>,
        filters: Arc<[Arc<dyn Filter>]>,
        proxies: Option<SharedProxySelector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            connector,
            config,
            filters,
            proxies,
            state: Mutex::new(CancelState::default()),
        })
    }

    /// Stop making attempts. With `may_interrupt`, the attempt in flight is
    /// torn down too; otherwise it is allowed to finish and its outcome is
    /// final.
    pub(crate) fn cancel(&self, may_interrupt: bool) {
        let current = {
            let mut state = self.state.lock();
            state.cancelled = true;
            if may_interrupt {
                state.current.clone()
            } else {
                None
            }
        };
        if let Some(exchange) = current {
            debug!("interrupting exchange in flight");
            exchange.cancel(Error::cancelled(None));
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    fn begin(&self, exchange: &Arc<Exchange>) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.cancelled {
            return Err(Error::cancelled(None));
        }
        state.current = Some(exchange.clone());
        Ok(())
    }

    fn finish(&self) {
        self.state.lock().current = None;
    }

    fn connect_deadline(&self) -> Option<Instant> {
        self.config
            .connect_timeout
            .map(|timeout| Instant::now() + timeout)
    }

    /// Send `request`, following redirects and retrying where it is safe.
    pub(crate) async fn response(self: Arc<Self>, request: Request) -> Result<Response, Error> {
        let (mut parts, body) = request.into_parts();
        let mut template = body.try_clone();
        let mut body = Some(body);

        let mut attempts = 0usize;
        let mut redirects = 0usize;
        let mut retried = false;
        let mut filtered = false;
        let mut last_error: Option<Error> = None;
        let mut connect_deadline = self.connect_deadline();

        loop {
            attempts += 1;
            if attempts > self.config.max_attempts {
                let cause = last_error
                    .take()
                    .unwrap_or_else(|| Error::InvalidRequest("redirected too many times".into()));
                debug!(attempts, "giving up");
                return Err(Error::TooManyRetries(Arc::new(cause)));
            }

            if !filtered {
                let cx = FilterContext::new(attempts, redirects);
                for filter in self.filters.iter() {
                    filter.request(&mut parts, &cx)?;
                }
                filtered = true;
            }

            let version = parts
                .extensions
                .get::<HttpProtocol>()
                .copied()
                .unwrap_or(self.config.version);
            let route = Route::new(&parts.uri, self.proxies.as_ref())?;
            let exchange = Exchange::new(self.connector.clone(), route, version);
            self.begin(&exchange)?;

            let request = rebuild(
                &parts,
                body.take()
                    .or_else(|| template.as_ref().and_then(Body::try_clone))
                    .unwrap_or_default(),
            );
            trace!(attempts, method = %parts.method, uri = %parts.uri, ?version, "sending attempt");

            let attempt = exchange.response(request, connect_deadline);
            let result = match self.config.timeout {
                Some(timeout) => {
                    let deadline = Instant::now() + timeout;
                    tokio::select! {
                        result = attempt => result,
                        _ = tokio::time::sleep_until(deadline) => {
                            debug!(?timeout, "request timed out");
                            exchange.cancel(Error::Timeout);
                            Err(Error::Timeout)
                        }
                    }
                }
                None => attempt.await,
            };
            self.finish();

            let error = match result {
                Ok(response) => {
                    trace!(status = %response.status(), upgraded = exchange.is_upgraded(), "response head");
                    if self.is_cancelled() {
                        return Ok(response);
                    }

                    let (head, incoming) = response.into_parts();
                    let Some(next) = self
                        .filters
                        .iter()
                        .rev()
                        .find_map(|filter| filter.response(&head, &parts))
                    else {
                        return Ok(Response::from_parts(head, incoming));
                    };

                    if head.status.is_redirection() {
                        redirects += 1;
                        if redirects > self.config.max_redirects {
                            debug!(redirects, "redirect limit reached");
                            return Ok(Response::from_parts(head, incoming));
                        }
                    }

                    let (next, ()) = next.into_parts();
                    let resend = next.method == parts.method
                        && next.method != Method::GET
                        && next.method != Method::HEAD;
                    if resend {
                        let Some(next_body) = template.as_ref().and_then(Body::try_clone) else {
                            debug!("request body cannot be sent again");
                            return Ok(Response::from_parts(head, incoming));
                        };
                        body = Some(next_body);
                    } else {
                        template = Some(Body::empty());
                        body = Some(Body::empty());
                    }

                    trace!(status = %head.status, uri = %next.uri, "filter replaced request");
                    drain(incoming).await;
                    parts = next;
                    filtered = false;
                    last_error = None;
                    connect_deadline = self.connect_deadline();
                    continue;
                }
                Err(error) => error,
            };

            if self.is_cancelled() {
                if error.is_cancelled() || error.is_timeout() {
                    return Err(error);
                }
                return Err(Error::cancelled(Some(error)));
            }

            let recoverable = error.is_retryable()
                || (self.config.retry_on_connect_failure
                    && error.is_connect()
                    && !error.is_timeout());
            let allowed = is_idempotent(&parts.method) || self.config.retry_non_idempotent;
            if retried || !recoverable || !allowed || template.is_none() {
                return Err(error);
            }

            debug!(%error, "retrying request");
            retried = true;
            if !error.is_connect() {
                connect_deadline = self.connect_deadline();
            }
            last_error = Some(error);
        }
    }
}

fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE | Method::PUT | Method::DELETE
    )
}

/// Read and discard a small response body. Larger or slower bodies are
/// dropped, which closes their connection.
async fn drain(mut body: Incoming) {
    if body.is_end_stream() {
        return;
    }
    if body.size_hint().upper().is_some_and(|upper| upper > DRAIN_LIMIT) {
        trace!("redirect body too large to drain");
        return;
    }

    let read = async {
        let mut read = 0u64;
        while let Some(Ok(frame)) = body.frame().await {
            if let Some(data) = frame.data_ref() {
                read += data.len() as u64;
                if read > DRAIN_LIMIT {
                    trace!("redirect body too large to drain");
                    return;
                }
            }
        }
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, read).await.is_err() {
        trace!("redirect body did not arrive in time");
    }
}

fn rebuild(parts: &http::request::Parts, body: Body) -> Request {
    let mut request = http::Request::new(body);
    *request.method_mut() = parts.method.clone();
    *request.uri_mut() = parts.uri.clone();
    *request.version_mut() = parts.version;
    *request.headers_mut() = parts.headers.clone();
    *request.extensions_mut() = parts.extensions.clone();
    request
}
