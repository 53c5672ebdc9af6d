//! One request/response exchange on an HTTP/1.1 connection.

use std::fmt;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use http::Method;
use http_body_util::BodyExt as _;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tracing::{debug, trace};

use super::content::{ContentParser, Step};
use super::decode::{self, BodyKind, HeadParser, ResponseHead};
use super::encode::{self, Framing, RequestTarget};
use super::receiver::{Delegate, Flow};
use super::Http1Connection;
use crate::body::{Body, BodySender, Incoming};
use crate::client::conn::tube::Tube;
use crate::client::pool::{CacheKey, Pool};
use crate::client::{Error, ProtocolError};

/// Where an HTTP/1.1 exchange sends its connection when it is done.
#[derive(Debug, Clone)]
pub(crate) struct Home {
    pub(crate) pool: Pool<Http1Connection>,
    pub(crate) key: CacheKey,
}

/// Progress of an exchange. `Completed` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExchangeState {
    Initial,
    Headers,
    Body,
    Completing,
    Completed,
    Error,
}

impl ExchangeState {
    fn is_terminal(self) -> bool {
        matches!(self, ExchangeState::Completed | ExchangeState::Error)
    }
}

/// Drives one request over an [`Http1Connection`].
pub(crate) struct Http1Exchange {
    conn: Http1Connection,
    home: Option<Home>,
    state: Mutex<ExchangeState>,
    stop: watch::Sender<bool>,
    cause: OnceLock<Error>,
    request_done: AtomicBool,
    keep_alive: AtomicBool,
    reusable: AtomicBool,
}

impl fmt::Debug for Http1Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http1Exchange")
            .field("conn", &self.conn.id())
            .field("state", &self.state())
            .finish()
    }
}

impl Http1Exchange {
    pub(crate) fn new(conn: Http1Connection, home: Option<Home>) -> Arc<Self> {
        let reused = conn.begin_exchange();
        trace!(conn = conn.id(), reused, "http1 exchange");
        Arc::new(Self {
            conn,
            home,
            state: Mutex::new(ExchangeState::Initial),
            stop: watch::channel(false).0,
            cause: OnceLock::new(),
            request_done: AtomicBool::new(false),
            keep_alive: AtomicBool::new(true),
            reusable: AtomicBool::new(true),
        })
    }

    pub(crate) fn state(&self) -> ExchangeState {
        *self.state.lock()
    }

    pub(crate) fn connection(&self) -> &Http1Connection {
        &self.conn
    }

    fn advance(&self, to: ExchangeState) {
        let mut state = self.state.lock();
        if !state.is_terminal() {
            *state = to;
        }
    }

    fn failure(&self) -> Error {
        self.cause.get().cloned().unwrap_or(Error::Closed)
    }

    /// Terminal failure: the connection is closed and everyone waiting on
    /// it learns about `error`. Returns the first recorded cause.
    pub(crate) fn fail(&self, error: Error) -> Error {
        {
            let mut state = self.state.lock();
            if *state == ExchangeState::Completed {
                return error;
            }
            *state = ExchangeState::Error;
        }
        if self.cause.set(error.clone()).is_ok() {
            debug!(conn = self.conn.id(), %error, "http1 exchange failed");
        }
        let cause = self.failure();
        self.stop.send_replace(true);
        self.conn.receiver().fail(cause.clone());
        self.conn.close();
        cause
    }

    /// Cancel the exchange. Unread response bytes make the connection
    /// unusable, so it is always closed.
    pub(crate) fn cancel(&self, cause: Error) {
        if self.state().is_terminal() {
            return;
        }
        self.fail(cause);
    }

    async fn write(&self, bufs: Vec<Bytes>) -> Result<(), Error> {
        let mut stop = self.stop.subscribe();
        let result = tokio::select! {
            result = self.conn.tube().write(bufs) => result,
            _ = stop.wait_for(|stop| *stop) => Err(self.failure()),
        };
        result.map_err(|error| self.fail(error))
    }

    /// Write the request head.
    pub(crate) async fn send_headers(
        &self,
        parts: &http::request::Parts,
        framing: Framing,
    ) -> Result<(), Error> {
        {
            let mut state = self.state.lock();
            if *state == ExchangeState::Error {
                return Err(self.failure());
            }
            if *state != ExchangeState::Initial {
                return Err(Error::InvalidRequest("request head already sent".into()));
            }
            *state = ExchangeState::Headers;
        }

        let target = if parts.method == Method::CONNECT {
            RequestTarget::Authority
        } else if self.conn.is_proxied() {
            RequestTarget::Absolute
        } else {
            RequestTarget::Origin
        };
        let head = encode::request_head(parts, target, framing).map_err(|error| self.fail(error))?;
        trace!(conn = self.conn.id(), method = %parts.method, uri = %parts.uri, "sending request head");
        self.write(vec![head]).await?;

        if framing.is_none() {
            self.request_sent();
        }
        Ok(())
    }

    /// Stream the request body with the framing announced in the head.
    pub(crate) async fn send_body(&self, body: Body, framing: Framing) -> Result<(), Error> {
        if framing.is_none() {
            return Ok(());
        }
        self.advance(ExchangeState::Body);

        match self.send_body_inner(body, framing).await {
            Ok(()) => {
                self.request_sent();
                Ok(())
            }
            // The response finished first and the connection was retired.
            Err(_) if self.state() == ExchangeState::Completed => Ok(()),
            Err(error) => Err(self.fail(error)),
        }
    }

    async fn send_body_inner(&self, body: Body, framing: Framing) -> Result<(), Error> {
        let mut body = pin!(body);
        let mut stop = self.stop.subscribe();
        let mut sent: u64 = 0;

        let declared = match framing {
            Framing::Length(length) => Some(length),
            _ => None,
        };
        let mismatch = |sent: u64| match declared {
            Some(declared) if sent != declared => Err(Error::from(
                ProtocolError::ContentLengthMismatch { declared, sent },
            )),
            _ => Ok(()),
        };

        loop {
            let frame = tokio::select! {
                frame = body.frame() => frame,
                _ = stop.wait_for(|stop| *stop) => return Err(self.failure()),
            };
            let Some(frame) = frame else {
                break;
            };
            let frame = frame.map_err(Error::body)?;

            let frame = match frame.into_data() {
                Ok(data) => {
                    sent += data.len() as u64;
                    if declared.is_some_and(|declared| sent > declared) {
                        mismatch(sent)?;
                    }
                    let bufs = match framing {
                        Framing::Chunked => encode::chunk(data),
                        _ => vec![data],
                    };
                    if !bufs.is_empty() {
                        self.write(bufs).await?;
                    }
                    continue;
                }
                Err(frame) => frame,
            };

            if let Ok(trailers) = frame.into_trailers() {
                mismatch(sent)?;
                if framing == Framing::Chunked {
                    self.write(vec![encode::last_chunk(Some(&trailers))]).await?;
                }
                return Ok(());
            }
        }

        mismatch(sent)?;
        if framing == Framing::Chunked {
            self.write(vec![encode::last_chunk(None)]).await?;
        }
        Ok(())
    }

    /// The request was sent in full.
    fn request_sent(&self) {
        self.request_done.store(true, Ordering::SeqCst);
        self.advance(ExchangeState::Completing);
        trace!(conn = self.conn.id(), "request sent");
    }

    /// The request body will never be sent, e.g. after a final response to
    /// `Expect: 100-continue`. The connection cannot be reused.
    pub(crate) fn skip_body(&self) {
        self.reusable.store(false, Ordering::SeqCst);
        self.request_sent();
    }

    /// Wait for the next response head. Informational heads are returned
    /// too; the caller decides whether to read again.
    pub(crate) async fn read_head(&self) -> Result<ResponseHead, Error> {
        if self.state().is_terminal() {
            return Err(self.failure());
        }

        let (tx, rx) = oneshot::channel();
        self.conn.receiver().register(Box::new(HeadDelegate {
            parser: HeadParser::new(self.conn.config().max_head_size),
            tx: Some(tx),
        }));

        let mut stop = self.stop.subscribe();
        let result = tokio::select! {
            result = rx => result.unwrap_or(Err(Error::Closed)),
            _ = stop.wait_for(|stop| *stop) => Err(self.failure()),
        };

        match result {
            Ok(head) => {
                trace!(conn = self.conn.id(), status = %head.status, "response head");
                Ok(head)
            }
            Err(error) => Err(self.fail(error)),
        }
    }

    /// Start reading the body of a final response to `method`.
    pub(crate) fn read_body(
        self: &Arc<Self>,
        head: &ResponseHead,
        method: &Method,
    ) -> Result<Incoming, Error> {
        let kind = decode::body_kind(method, head)
            .map_err(|error| self.fail(Error::Protocol(error)))?;
        self.keep_alive.store(head.keep_alive(), Ordering::SeqCst);

        if kind == BodyKind::Empty {
            self.response_finished(true);
            return Ok(Incoming::empty());
        }

        let length = match kind {
            BodyKind::Fixed(length) => Some(length),
            _ => None,
        };
        let (sender, body) = Incoming::channel(length);

        let receiver = Arc::downgrade(self.conn.receiver());
        sender.on_demand(move || {
            if let Some(receiver) = receiver.upgrade() {
                receiver.schedule();
            }
        });
        let exchange = Arc::downgrade(self);
        sender.on_cancel(move || {
            if let Some(exchange) = exchange.upgrade() {
                trace!(conn = exchange.conn.id(), "response body dropped");
                exchange.cancel(Error::cancelled(None));
            }
        });

        self.conn.receiver().register(Box::new(BodyDelegate {
            parser: ContentParser::new(kind, self.conn.config().max_chunk_line_size),
            sender,
            exchange: self.clone(),
        }));
        Ok(body)
    }

    /// The response body ended. Runs before the reader sees the end.
    fn response_finished(&self, reusable: bool) {
        let request_done = self.request_done.load(Ordering::SeqCst);
        {
            let mut state = self.state.lock();
            if state.is_terminal() {
                return;
            }
            *state = ExchangeState::Completed;
        }
        self.stop.send_replace(true);

        let reuse = reusable
            && request_done
            && self.keep_alive.load(Ordering::SeqCst)
            && self.reusable.load(Ordering::SeqCst);

        match (&self.home, reuse) {
            (Some(home), true) => {
                self.conn
                    .clone()
                    .close_or_return_to_cache(&home.pool, home.key.clone());
            }
            _ => {
                trace!(conn = self.conn.id(), "connection not reusable");
                self.conn.close();
            }
        }
    }

    /// Take the connection over for another protocol after `101 Switching
    /// Protocols`, along with any bytes that arrived after the head.
    pub(crate) fn upgrade(&self) -> (Tube, Bytes) {
        self.advance(ExchangeState::Completed);
        let buffered = self.conn.receiver().detach();
        (self.conn.tube().clone(), buffered)
    }
}

/// Parses one response head.
struct HeadDelegate {
    parser: HeadParser,
    tx: Option<oneshot::Sender<Result<ResponseHead, Error>>>,
}

impl HeadDelegate {
    fn finish(&mut self, result: Result<ResponseHead, Error>) -> Flow {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(result);
        }
        Flow::Finished
    }
}

impl Delegate for HeadDelegate {
    fn has_demand(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    fn on_data(&mut self, data: &mut Bytes) -> Flow {
        match self.parser.parse(data) {
            Ok(Some(head)) => self.finish(Ok(head)),
            Ok(None) => Flow::Continue,
            Err(error) => self.finish(Err(error.into())),
        }
    }

    fn on_eof(&mut self) {
        self.finish(Err(Error::Closed));
    }

    fn on_error(&mut self, error: Error) {
        self.finish(Err(error));
    }
}

/// Feeds a response body to its reader, one demanded piece at a time.
struct BodyDelegate {
    parser: ContentParser,
    sender: BodySender,
    exchange: Arc<Http1Exchange>,
}

impl BodyDelegate {
    fn complete(&mut self) -> Flow {
        if let Some(trailers) = self.parser.take_trailers() {
            self.sender.send_trailers(trailers);
        }
        self.exchange.response_finished(self.parser.reusable());
        self.sender.complete();
        Flow::Finished
    }

    fn error(&mut self, error: Error) -> Flow {
        let error = self.exchange.fail(error);
        self.sender.fail(error);
        Flow::Finished
    }

    fn pump(&mut self, data: &mut Bytes) -> Flow {
        loop {
            if self.sender.is_cancelled() {
                return Flow::Finished;
            }
            if self.parser.at_data() && !self.sender.has_demand() {
                return Flow::Continue;
            }
            match self.parser.next(data) {
                Ok(Step::Data(chunk)) => {
                    if let Err(chunk) = self.sender.try_send(chunk) {
                        // Demand was checked above and only this task consumes it.
                        debug!(len = chunk.len(), "body chunk dropped without demand");
                    }
                }
                Ok(Step::NeedMore) => return Flow::Continue,
                Ok(Step::Done) => return self.complete(),
                Err(error) => return self.error(error.into()),
            }
        }
    }
}

impl Delegate for BodyDelegate {
    fn has_demand(&self) -> bool {
        self.sender.is_cancelled() || !self.parser.at_data() || self.sender.has_demand()
    }

    fn on_data(&mut self, data: &mut Bytes) -> Flow {
        self.pump(data)
    }

    fn on_eof(&mut self) {
        match self.parser.on_eof() {
            Ok(()) => {
                self.pump(&mut Bytes::new());
            }
            Err(error) => {
                self.error(error.into());
            }
        }
    }

    fn on_error(&mut self, error: Error) {
        self.error(error);
    }
}
