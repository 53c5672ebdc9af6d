//! One HTTP/2 stream.
//!
//! Frames for a stream are queued by the connection's reader and drained by
//! a [`SequentialScheduler`], so DATA is handed to the body in arrival order
//! and a RST_STREAM queued behind DATA only takes effect after that DATA.

use std::collections::VecDeque;
use std::fmt;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use bytes::Bytes;
use http::{header, Method, StatusCode};
use http_body_util::BodyExt as _;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use super::connection::Http2Connection;
use super::headers;
use super::hpack::HeaderField;
use super::push::PushPromises;
use super::window::WindowUpdateSender;
use super::ErrorCode;
use crate::body::{Body, BodySender, Incoming, Response};
use crate::client::conn::protocol::http1::decode::content_length;
use crate::client::tracker::OperationGuard;
use crate::client::{Error, ProtocolError};
use crate::flow::SequentialScheduler;

/// A frame routed to a stream by the connection.
#[derive(Debug)]
pub(super) enum Inbound {
    Headers {
        fields: Vec<HeaderField>,
        end_stream: bool,
    },
    Data {
        data: Bytes,
        end_stream: bool,
        flow_len: u32,
    },
    Reset(ErrorCode),
}

type HeadSender = oneshot::Sender<Result<Response, Error>>;
type HeadReceiver = oneshot::Receiver<Result<Response, Error>>;

#[derive(Debug, Default)]
struct RecvState {
    head: Option<HeadSender>,
    body: Option<BodySender>,
    head_received: bool,
    end_stream: bool,
    head_only: bool,
}

/// Per-request (or per-push) HTTP/2 state.
pub(crate) struct Stream {
    id: AtomicU32,
    conn: Weak<Http2Connection>,
    pushed: bool,
    inbound: Mutex<VecDeque<Inbound>>,
    scheduler: Arc<SequentialScheduler>,
    recv: Mutex<RecvState>,
    head_rx: Mutex<Option<HeadReceiver>>,
    recv_window: Mutex<WindowUpdateSender>,
    push: Mutex<Option<PushPromises>>,

    closed: AtomicBool,
    cause: OnceLock<Error>,
    reset: OnceLock<ErrorCode>,
    request_sent: AtomicBool,
    response_received: AtomicBool,

    _operation: OperationGuard,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id())
            .field("closed", &self.is_closed())
            .field("reset", &self.reset.get())
            .finish()
    }
}

impl Stream {
    pub(super) fn new(
        conn: Weak<Http2Connection>,
        pushed: bool,
        recv_window: u32,
        operation: OperationGuard,
    ) -> Arc<Self> {
        let (head_tx, head_rx) = oneshot::channel();

        Arc::new_cyclic(|weak: &Weak<Stream>| {
            let weak = weak.clone();
            let scheduler = SequentialScheduler::new(move || {
                if let Some(stream) = weak.upgrade() {
                    stream.drain_inbound();
                }
            });

            Stream {
                id: AtomicU32::new(0),
                conn,
                pushed,
                inbound: Mutex::new(VecDeque::new()),
                scheduler,
                recv: Mutex::new(RecvState {
                    head: Some(head_tx),
                    ..Default::default()
                }),
                head_rx: Mutex::new(Some(head_rx)),
                recv_window: Mutex::new(WindowUpdateSender::new(recv_window)),
                push: Mutex::new(None),
                closed: AtomicBool::new(false),
                cause: OnceLock::new(),
                reset: OnceLock::new(),
                request_sent: AtomicBool::new(pushed),
                response_received: AtomicBool::new(false),
                _operation: operation,
            }
        })
    }

    /// Stream id, or zero before the HEADERS frame has been sent.
    pub(crate) fn id(&self) -> u32 {
        self.id.load(Ordering::Acquire)
    }

    pub(super) fn set_id(&self, id: u32) {
        self.id.store(id, Ordering::Release);
    }

    /// Responses to HEAD carry no body whatever their headers say.
    pub(super) fn set_head_only(&self, head_only: bool) {
        self.recv.lock().head_only = head_only;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(super) fn is_reset(&self) -> bool {
        self.reset.get().is_some()
    }

    pub(super) fn is_pushed(&self) -> bool {
        self.pushed
    }

    pub(super) fn push_handler(&self) -> Option<PushPromises> {
        self.push.lock().clone()
    }

    fn connection(&self) -> Result<Arc<Http2Connection>, Error> {
        self.conn.upgrade().ok_or(Error::Closed)
    }

    fn failure(&self) -> Error {
        self.cause.get().cloned().unwrap_or(Error::Closed)
    }

    /// Send the request head. The stream gets its id here.
    pub(crate) fn send_headers(
        self: &Arc<Self>,
        parts: &http::request::Parts,
        end_stream: bool,
        content_length: Option<u64>,
    ) -> Result<(), Error> {
        let conn = self.connection()?;
        if self.is_closed() {
            return Err(self.failure());
        }

        self.recv.lock().head_only = parts.method == Method::HEAD;
        if let Some(push) = parts.extensions.get::<PushPromises>() {
            *self.push.lock() = Some(push.clone());
        }

        let fields = headers::request_fields(parts, conn.is_secure(), content_length)?;
        conn.open_stream(self, &fields, end_stream)?;
        trace!(stream.id = self.id(), end_stream, "request headers sent");

        if end_stream {
            self.request_sent();
        }
        Ok(())
    }

    /// Stream the request body, one frame of the body at a time, bounded by
    /// the peer's frame size and the send windows.
    ///
    /// Failures reset the stream, so the response side sees them too.
    pub(crate) async fn send_body(
        self: Arc<Self>,
        body: Body,
        declared: Option<u64>,
    ) -> Result<(), Error> {
        let result = self.send_body_inner(body, declared).await;
        if let Err(error) = &result {
            debug!(stream.id = self.id(), %error, "request body failed");
            let code = match error {
                Error::Protocol(protocol) => protocol.code(),
                _ => ErrorCode::CANCEL,
            };
            self.fail(error.clone(), Some(code));
        }
        result
    }

    async fn send_body_inner(&self, body: Body, declared: Option<u64>) -> Result<(), Error> {
        let conn = self.connection()?;
        let id = self.id();
        let mut body = pin!(body);
        let mut sent: u64 = 0;

        let mismatch = |sent: u64| match declared {
            Some(declared) if sent != declared => Err(Error::from(
                ProtocolError::ContentLengthMismatch { declared, sent },
            )),
            _ => Ok(()),
        };

        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(Error::body)?;

            let frame = match frame.into_data() {
                Ok(mut data) => {
                    sent += data.len() as u64;
                    if declared.is_some_and(|declared| sent > declared) {
                        mismatch(sent)?;
                    }

                    while !data.is_empty() {
                        if self.is_closed() || self.is_reset() {
                            return Err(self.failure());
                        }
                        let wanted = data.len().min(conn.max_send_frame_size());
                        let granted = conn.windows().acquire(id, wanted).await?;
                        let chunk = data.split_to(granted);
                        conn.send_data(self, chunk, false)?;
                    }
                    continue;
                }
                Err(frame) => frame,
            };

            if let Ok(trailers) = frame.into_trailers() {
                mismatch(sent)?;
                conn.send_trailers(self, &trailers)?;
                self.request_sent();
                return Ok(());
            }
        }

        mismatch(sent)?;
        conn.send_data(self, Bytes::new(), true)?;
        self.request_sent();
        Ok(())
    }

    /// Wait for the final response head, skipping informational responses.
    pub(crate) async fn read_head(&self) -> Result<Response, Error> {
        let rx = self.head_rx.lock().take();
        let Some(rx) = rx else {
            return Err(Error::InvalidRequest(
                "response head already taken".into(),
            ));
        };
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self.failure()),
        }
    }

    /// Cancel the stream. Sends RST_STREAM(CANCEL) unless the stream was
    /// never opened or is already reset.
    pub(crate) fn cancel(&self, cause: Error) {
        let code = match &cause {
            Error::Closed => None,
            _ => Some(ErrorCode::CANCEL),
        };
        self.fail(cause, code);
    }

    /// The connection is gone; there is nobody left to reset.
    pub(super) fn connection_closed(&self, cause: Error) {
        self.fail(cause, None);
    }

    /// Queue an inbound frame and let the scheduler process it.
    pub(super) fn deliver(&self, inbound: Inbound) {
        if self.is_closed() {
            if let Inbound::Data { flow_len, .. } = inbound {
                self.release_connection_window(flow_len);
            }
            return;
        }
        self.inbound.lock().push_back(inbound);
        self.scheduler.run_or_schedule();
    }

    /// Terminal failure. Idempotent: only the first cause is kept.
    pub(super) fn fail(&self, cause: Error, reset: Option<ErrorCode>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.cause.set(cause.clone());
        trace!(stream.id = self.id(), %cause, "stream failed");

        let (head, body) = {
            let mut recv = self.recv.lock();
            (recv.head.take(), recv.body.take())
        };
        if let Some(head) = head {
            let _ = head.send(Err(cause.clone()));
        }
        if let Some(body) = body {
            body.fail(cause);
        }

        let id = self.id();
        if let (Some(code), true) = (reset, id != 0) {
            self.send_reset(code);
        }
        self.close();
    }

    fn send_reset(&self, code: ErrorCode) {
        if self.reset.set(code).is_err() {
            return;
        }
        if let Ok(conn) = self.connection() {
            conn.send_reset(self.id(), code);
        }
    }

    /// Remove the stream from its connection and return the window held by
    /// frames nobody will read.
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.scheduler.stop();

        let unread: u32 = self
            .inbound
            .lock()
            .drain(..)
            .map(|inbound| match inbound {
                Inbound::Data { flow_len, .. } => flow_len,
                _ => 0,
            })
            .sum();
        self.release_connection_window(unread);

        if let Ok(conn) = self.connection() {
            conn.remove_stream(self.id());
        }
    }

    fn release_connection_window(&self, len: u32) {
        if len == 0 {
            return;
        }
        if let Ok(conn) = self.connection() {
            conn.release_connection_window(len);
        }
    }

    fn release_window(&self, len: u32, end_stream: bool) {
        if len == 0 {
            return;
        }
        if !end_stream {
            let update = self.recv_window.lock().consume(len);
            if let (Some(increment), Ok(conn)) = (update, self.connection()) {
                conn.send_window_update(self.id(), increment);
            }
        }
        self.release_connection_window(len);
    }

    pub(super) fn request_sent(&self) {
        self.request_sent.store(true, Ordering::SeqCst);
        self.maybe_finish();
    }

    fn response_received(&self) {
        self.response_received.store(true, Ordering::SeqCst);
        if !self.request_sent.load(Ordering::SeqCst) {
            // The response is complete; the rest of the request body is moot.
            self.send_reset(ErrorCode::NO_ERROR);
            self.request_sent.store(true, Ordering::SeqCst);
        }
        self.maybe_finish();
    }

    fn maybe_finish(&self) {
        if self.request_sent.load(Ordering::SeqCst)
            && self.response_received.load(Ordering::SeqCst)
            && !self.closed.swap(true, Ordering::AcqRel)
        {
            trace!(stream.id = self.id(), "stream complete");
            self.close();
        }
    }

    /// Whether the front of the queue can be processed now.
    fn ready(&self, front: &Inbound) -> bool {
        let Inbound::Data { data, .. } = front else {
            return true;
        };
        if data.is_empty() {
            return true;
        }
        let recv = self.recv.lock();
        match &recv.body {
            Some(body) => body.is_cancelled() || body.has_demand(),
            None => true,
        }
    }

    fn drain_inbound(self: Arc<Self>) {
        loop {
            if self.is_closed() {
                return;
            }

            let next = {
                let mut inbound = self.inbound.lock();
                match inbound.front() {
                    Some(front) if self.ready(front) => inbound.pop_front(),
                    _ => None,
                }
            };
            let Some(next) = next else {
                return;
            };

            let result = match next {
                Inbound::Headers { fields, end_stream } => self.on_headers(fields, end_stream),
                Inbound::Data {
                    data,
                    end_stream,
                    flow_len,
                } => self.on_data(data, end_stream, flow_len),
                Inbound::Reset(code) => {
                    self.on_reset(code);
                    Ok(())
                }
            };

            if let Err(error) = result {
                debug!(stream.id = self.id(), %error, "malformed response");
                let code = error.code();
                self.fail(Error::Protocol(error), Some(code));
                return;
            }
        }
    }

    fn on_headers(self: &Arc<Self>, fields: Vec<HeaderField>, end_stream: bool) -> Result<(), ProtocolError> {
        let head_received = self.recv.lock().head_received;

        if head_received {
            if !end_stream {
                return Err(ProtocolError::h2(
                    ErrorCode::PROTOCOL_ERROR,
                    "trailers without END_STREAM",
                ));
            }
            let trailers = headers::trailers(fields)?;
            let body = {
                let mut recv = self.recv.lock();
                recv.end_stream = true;
                recv.body.take()
            };
            if let Some(body) = body {
                body.send_trailers(trailers);
                body.complete();
            }
            self.response_received();
            return Ok(());
        }

        let head = headers::response_head(fields)?;
        if head.status.is_informational() {
            if end_stream {
                return Err(ProtocolError::h2(
                    ErrorCode::PROTOCOL_ERROR,
                    "informational response ends the stream",
                ));
            }
            trace!(stream.id = self.id(), status = %head.status, "skipping informational response");
            return Ok(());
        }
        if head.status == StatusCode::NO_CONTENT {
            if let Some(length) = content_length(&head.headers)?.filter(|length| *length > 0) {
                return Err(ProtocolError::BodylessContentLength(length));
            }
        }

        let head_only = self.recv.lock().head_only;
        let bodyless = head_only
            || head.status == StatusCode::NO_CONTENT
            || head.status == StatusCode::NOT_MODIFIED;

        let body = if end_stream {
            Incoming::empty()
        } else {
            let length = if bodyless {
                Some(0)
            } else {
                head.headers
                    .get(header::CONTENT_LENGTH)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<u64>().ok())
            };
            let (sender, body) = Incoming::channel(length);

            let scheduler = self.scheduler.clone();
            sender.on_demand(move || scheduler.run_or_schedule());
            let stream = Arc::downgrade(self);
            sender.on_cancel(move || {
                if let Some(stream) = stream.upgrade() {
                    stream.cancel(Error::cancelled(None));
                }
            });

            self.recv.lock().body = Some(sender);
            body
        };

        let mut response = http::Response::new(body);
        *response.status_mut() = head.status;
        *response.version_mut() = http::Version::HTTP_2;
        *response.headers_mut() = head.headers;

        let sender = {
            let mut recv = self.recv.lock();
            recv.head_received = true;
            recv.end_stream = end_stream;
            recv.head.take()
        };
        if let Some(sender) = sender {
            let _ = sender.send(Ok(response));
        }

        if end_stream {
            self.response_received();
        }
        Ok(())
    }

    fn on_data(&self, data: Bytes, end_stream: bool, flow_len: u32) -> Result<(), ProtocolError> {
        {
            let mut recv = self.recv.lock();
            if !recv.head_received {
                return Err(ProtocolError::h2(
                    ErrorCode::PROTOCOL_ERROR,
                    "DATA before response headers",
                ));
            }
            if let Some(sender) = &recv.body {
                if !data.is_empty() && !sender.is_cancelled() {
                    // The scheduler only pops DATA once the reader asked for it.
                    let _ = sender.try_send(data);
                }
            }
            recv.end_stream |= end_stream;
        }

        self.release_window(flow_len, end_stream);

        if end_stream {
            let body = self.recv.lock().body.take();
            if let Some(body) = body {
                body.complete();
            }
            self.response_received();
        }
        Ok(())
    }

    fn on_reset(&self, code: ErrorCode) {
        if self.recv.lock().end_stream {
            trace!(stream.id = self.id(), %code, "ignoring reset after end of stream");
            return;
        }
        // The peer reset it, so we must not reset it back.
        let _ = self.reset.set(code);
        let error = if code == ErrorCode::REFUSED_STREAM {
            Error::RefusedStream
        } else {
            Error::StreamReset(code)
        };
        self.fail(error, None);
    }
}
