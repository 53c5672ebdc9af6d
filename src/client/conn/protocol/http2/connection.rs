//! The HTTP/2 connection: frame dispatch, stream table and HPACK state.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, trace, Instrument as _};

use super::frame::{Frame, FrameDecoder, PREFACE, MAX_WINDOW_SIZE};
use super::headers;
use super::hpack::{Decoder, Encoder, HeaderField};
use super::push::PushRefusal;
use super::settings::{PeerSettings, Settings, DEFAULT_INITIAL_WINDOW_SIZE};
use super::stream::{Inbound, Stream};
use super::window::{WindowController, WindowUpdateSender};
use super::{ErrorCode, Http2Config};
use crate::client::conn::tube::{ReadSubscriber, Tube};
use crate::client::tracker::OperationTracker;
use crate::client::{Error, ProtocolError};
use crate::info::{ConnectionInfo, HasConnectionInfo};

/// How the connection came to speak HTTP/2.
#[derive(Debug)]
pub(crate) enum Handshake {
    /// Plain TCP, HTTP/2 known to be supported.
    PriorKnowledge,
    /// TLS with ALPN, which must have selected `h2`.
    Tls,
    /// HTTP/1.1 `Upgrade: h2c` answered with 101. Stream 1 carries the
    /// response to the upgraded request; `buffered` holds any bytes read
    /// past the 101 response.
    Upgrade { buffered: Bytes, head_only: bool },
}

#[derive(Debug)]
struct SendState {
    encoder: Encoder,
    next_stream_id: u32,
    last: bool,
}

/// Header block spread over HEADERS or PUSH_PROMISE plus CONTINUATION.
#[derive(Debug)]
enum BlockKind {
    Headers { stream_id: u32, end_stream: bool },
    PushPromise { stream_id: u32, promised_id: u32 },
}

#[derive(Debug)]
struct PartialBlock {
    kind: BlockKind,
    block: BytesMut,
}

impl PartialBlock {
    fn stream_id(&self) -> u32 {
        match self.kind {
            BlockKind::Headers { stream_id, .. } | BlockKind::PushPromise { stream_id, .. } => {
                stream_id
            }
        }
    }
}

#[derive(Debug)]
struct RecvState {
    decoder: Decoder,
    frames: FrameDecoder,
    partial: Option<PartialBlock>,
    next_push_id: u32,
}

#[derive(Debug, Default)]
struct PrefaceGate {
    sent: bool,
    pending: Vec<Bytes>,
}

/// A connection-level failure: GOAWAY is sent with `code`.
#[derive(Debug, Clone, Copy)]
struct ConnectionError {
    code: ErrorCode,
    reason: &'static str,
}

impl ConnectionError {
    fn new(code: ErrorCode, reason: &'static str) -> Self {
        Self { code, reason }
    }
}

type ShutdownHook = Box<dyn FnOnce() + Send>;

/// A multiplexed HTTP/2 connection.
///
/// All frame writes go through the send lock, so a HEADERS block and its
/// CONTINUATION frames are never interleaved with another stream's frames.
/// All frame reads happen on the tube's reader, in arrival order, which keeps
/// the HPACK decoder in step with the peer's encoder.
pub(crate) struct Http2Connection {
    tube: Tube,
    config: Http2Config,
    tracker: OperationTracker,
    secure: bool,

    send: Mutex<SendState>,
    recv: Mutex<RecvState>,
    recv_window: Mutex<WindowUpdateSender>,
    peer: Mutex<PeerSettings>,
    windows: WindowController,
    streams: Mutex<HashMap<u32, Arc<Stream>>>,
    client_streams: AtomicUsize,
    push_streams: AtomicUsize,
    last_push_id: AtomicU32,

    preface: Mutex<PrefaceGate>,
    closed: AtomicBool,
    retiring: AtomicBool,
    cause: Mutex<Option<Error>>,
    on_shutdown: Mutex<Option<ShutdownHook>>,
}

impl fmt::Debug for Http2Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http2Connection")
            .field("tube", &self.tube)
            .field("streams", &self.streams.lock().len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

struct ConnectionReader(Arc<Http2Connection>);

impl ReadSubscriber for ConnectionReader {
    fn on_next(&self, data: Bytes) {
        self.0.receive(data);
    }

    fn on_error(&self, error: Error) {
        self.0.shutdown(error);
    }

    fn on_complete(&self) {
        self.0.shutdown(Error::Closed);
    }
}

impl Http2Connection {
    fn new(tube: Tube, config: Http2Config, tracker: OperationTracker, next_stream_id: u32) -> Arc<Self> {
        let secure = tube.info().is_secure();
        let recv_window = config.initial_connection_window_size.max(DEFAULT_INITIAL_WINDOW_SIZE);

        let mut frames = FrameDecoder::default();
        frames.set_max_frame_size(config.max_frame_size);

        Arc::new(Self {
            tube,
            tracker,
            secure,
            send: Mutex::new(SendState {
                encoder: Encoder::default(),
                next_stream_id,
                last: false,
            }),
            recv: Mutex::new(RecvState {
                decoder: Decoder::new(config.header_table_size as usize),
                frames,
                partial: None,
                next_push_id: 2,
            }),
            recv_window: Mutex::new(WindowUpdateSender::new(recv_window)),
            peer: Mutex::new(PeerSettings::default()),
            windows: WindowController::new(DEFAULT_INITIAL_WINDOW_SIZE),
            streams: Mutex::new(HashMap::new()),
            client_streams: AtomicUsize::new(0),
            push_streams: AtomicUsize::new(0),
            last_push_id: AtomicU32::new(0),
            preface: Mutex::new(PrefaceGate::default()),
            closed: AtomicBool::new(false),
            retiring: AtomicBool::new(false),
            cause: Mutex::new(None),
            on_shutdown: Mutex::new(None),
            config,
        })
    }

    /// Start HTTP/2 on `tube`.
    ///
    /// Returns once the connection preface has been written. For an upgrade,
    /// the second value is stream 1.
    #[cfg_attr(not(tarpaulin), tracing::instrument(skip_all, fields(tube = tube.id())))]
    pub(crate) async fn handshake(
        tube: Tube,
        config: Http2Config,
        tracker: OperationTracker,
        handshake: Handshake,
    ) -> Result<(Arc<Self>, Option<Arc<Stream>>), Error> {
        match handshake {
            Handshake::PriorKnowledge => {
                let conn = Self::new(tube, config, tracker, 1);
                conn.start(None).await?;
                Ok((conn, None))
            }
            Handshake::Tls => {
                let alpn = tube.info().alpn().map(ToString::to_string);
                if alpn.as_deref() != Some("h2") {
                    debug!(?alpn, "ALPN did not select h2");
                    tube.close();
                    return Err(Error::AlpnMismatch(alpn));
                }
                let conn = Self::new(tube, config, tracker, 1);
                conn.start(None).await?;
                Ok((conn, None))
            }
            Handshake::Upgrade {
                buffered,
                head_only,
            } => {
                let conn = Self::new(tube, config, tracker, 3);
                let stream = conn.register_upgraded_stream(head_only);
                conn.start(Some(buffered)).await?;
                Ok((conn, Some(stream)))
            }
        }
    }

    fn register_upgraded_stream(self: &Arc<Self>, head_only: bool) -> Arc<Stream> {
        let stream = Stream::new(
            Arc::downgrade(self),
            false,
            self.config.initial_stream_window_size,
            self.tracker.guard(),
        );
        stream.set_id(1);
        stream.set_head_only(head_only);
        {
            let peer = self.peer.lock();
            self.windows.register_stream(1, peer.initial_window_size);
        }
        self.streams.lock().insert(1, stream.clone());
        self.client_streams.fetch_add(1, Ordering::AcqRel);
        // The request went out as HTTP/1.1.
        stream.request_sent();
        stream
    }

    /// The SETTINGS we advertise.
    pub(crate) fn local_settings(config: &Http2Config) -> Settings {
        let push = config.max_concurrent_pushes > 0;
        Settings {
            header_table_size: (config.header_table_size != 4096).then_some(config.header_table_size),
            enable_push: Some(push),
            max_concurrent_streams: push.then_some(config.max_concurrent_pushes),
            initial_window_size: Some(config.initial_stream_window_size),
            max_frame_size: Some(config.max_frame_size),
            max_header_list_size: None,
        }
    }

    async fn start(self: &Arc<Self>, buffered: Option<Bytes>) -> Result<(), Error> {
        if let Some(buffered) = buffered.filter(|b| !b.is_empty()) {
            self.preface.lock().pending.push(buffered);
        }
        self.tube
            .subscribe(Arc::new(ConnectionReader(self.clone())));
        self.tube.request_read(1);

        let mut preface = BytesMut::with_capacity(64);
        preface.extend_from_slice(PREFACE);
        Frame::Settings {
            ack: false,
            settings: Self::local_settings(&self.config),
        }
        .encode(&mut preface);
        let extra = self
            .config
            .initial_connection_window_size
            .saturating_sub(DEFAULT_INITIAL_WINDOW_SIZE);
        if extra > 0 {
            Frame::WindowUpdate {
                stream_id: 0,
                increment: extra,
            }
            .encode(&mut preface);
        }

        if let Err(error) = self.tube.write_priority(vec![preface.freeze()]).await {
            self.shutdown(error.clone());
            return Err(error);
        }
        trace!("preface sent");
        self.release_preface();

        if self.closed.load(Ordering::Acquire) {
            return Err(self.failure());
        }
        Ok(())
    }

    /// Replay everything read before our preface hit the wire, then let the
    /// reader process directly.
    fn release_preface(self: &Arc<Self>) {
        loop {
            let pending = {
                let mut gate = self.preface.lock();
                if gate.pending.is_empty() {
                    gate.sent = true;
                    return;
                }
                std::mem::take(&mut gate.pending)
            };
            for data in pending {
                self.process(data);
            }
        }
    }

    fn receive(self: &Arc<Self>, data: Bytes) {
        {
            let mut gate = self.preface.lock();
            if !gate.sent {
                gate.pending.push(data);
                drop(gate);
                self.tube.request_read(1);
                return;
            }
        }
        self.process(data);
        if !self.closed.load(Ordering::Acquire) {
            self.tube.request_read(1);
        }
    }

    pub(crate) fn is_secure(&self) -> bool {
        self.secure
    }

    pub(crate) fn id(&self) -> u64 {
        self.tube.id()
    }

    pub(super) fn windows(&self) -> &WindowController {
        &self.windows
    }

    pub(super) fn max_send_frame_size(&self) -> usize {
        self.peer.lock().max_frame_size as usize
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether new streams may be opened here.
    pub(crate) fn is_usable(&self) -> bool {
        !self.is_closed() && !self.retiring.load(Ordering::Acquire) && !self.send.lock().last
    }

    /// Number of open streams, pushes included.
    pub(crate) fn active_streams(&self) -> usize {
        self.streams.lock().len()
    }

    fn failure(&self) -> Error {
        self.cause.lock().clone().unwrap_or(Error::Closed)
    }

    /// Run `hook` once when the connection shuts down.
    pub(crate) fn on_shutdown<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_closed() {
            hook();
            return;
        }
        *self.on_shutdown.lock() = Some(Box::new(hook));
    }

    /// Create a stream. It gets an id when its headers are sent.
    pub(crate) fn new_stream(self: &Arc<Self>) -> Result<Arc<Stream>, Error> {
        if self.is_closed() {
            return Err(self.failure());
        }
        Ok(Stream::new(
            Arc::downgrade(self),
            false,
            self.config.initial_stream_window_size,
            self.tracker.guard(),
        ))
    }

    /// Allocate the next client stream id.
    ///
    /// Fewer than two ids left marks the connection as last: the id is
    /// handed out but the pool must open a replacement connection.
    fn reserve_stream(&self, send: &mut SendState) -> Result<u32, Error> {
        if send.last || send.next_stream_id > MAX_WINDOW_SIZE {
            return Err(Error::io(io::Error::new(
                io::ErrorKind::Other,
                "connection has no stream ids left",
            )));
        }

        let limit = self.peer.lock().max_concurrent_streams;
        if let Some(limit) = limit {
            if self.client_streams.load(Ordering::Acquire) >= limit as usize {
                return Err(Error::io(io::Error::new(
                    io::ErrorKind::Other,
                    "peer's concurrent stream limit reached",
                )));
            }
        }

        let id = send.next_stream_id;
        send.next_stream_id += 2;
        if (MAX_WINDOW_SIZE - id) / 2 < 2 {
            debug!(stream.id = id, "stream ids exhausted, connection is final");
            send.last = true;
        }
        Ok(id)
    }

    /// Allocate an id for `stream` and send its header block.
    pub(super) fn open_stream(
        &self,
        stream: &Arc<Stream>,
        fields: &[HeaderField],
        end_stream: bool,
    ) -> Result<u32, Error> {
        let mut send = self.send.lock();
        if self.is_closed() {
            return Err(self.failure());
        }
        let id = self.reserve_stream(&mut send)?;

        stream.set_id(id);
        self.streams.lock().insert(id, stream.clone());
        self.client_streams.fetch_add(1, Ordering::AcqRel);
        let max_frame_size = {
            let peer = self.peer.lock();
            self.windows.register_stream(id, peer.initial_window_size);
            peer.max_frame_size as usize
        };

        let frames = encode_header_block(&mut send.encoder, id, fields, end_stream, max_frame_size);
        if let Err(error) = self.tube.send(frames) {
            drop(send);
            self.remove_stream(id);
            return Err(error);
        }
        drop(send);

        // Cancelled while the id was being assigned.
        if stream.is_closed() {
            self.send_reset(id, ErrorCode::CANCEL);
            self.remove_stream(id);
            return Err(Error::cancelled(None));
        }
        Ok(id)
    }

    pub(super) fn send_data(&self, stream: &Stream, data: Bytes, end_stream: bool) -> Result<(), Error> {
        let _send = self.send.lock();
        if stream.is_reset() {
            return Err(Error::Closed);
        }
        trace!(stream.id = stream.id(), len = data.len(), end_stream, "send data");
        self.tube
            .send(vec![Frame::data(stream.id(), data, end_stream).to_bytes()])
    }

    pub(super) fn send_trailers(&self, stream: &Stream, trailers: &http::HeaderMap) -> Result<(), Error> {
        let fields = headers::trailer_fields(trailers);
        let mut send = self.send.lock();
        if stream.is_reset() {
            return Err(Error::Closed);
        }
        let max_frame_size = self.peer.lock().max_frame_size as usize;
        let frames = encode_header_block(&mut send.encoder, stream.id(), &fields, true, max_frame_size);
        self.tube.send(frames)
    }

    pub(crate) fn send_reset(&self, stream_id: u32, code: ErrorCode) {
        trace!(stream.id = stream_id, %code, "send reset");
        let _send = self.send.lock();
        let _ = self
            .tube
            .send(vec![Frame::Reset { stream_id, code }.to_bytes()]);
    }

    pub(super) fn send_window_update(&self, stream_id: u32, increment: u32) {
        let _ = self.tube.send_priority(vec![Frame::WindowUpdate {
            stream_id,
            increment,
        }
        .to_bytes()]);
    }

    /// Account bytes read on the connection window, granting more when due.
    pub(super) fn release_connection_window(&self, len: u32) {
        let update = self.recv_window.lock().consume(len);
        if let Some(increment) = update {
            self.send_window_update(0, increment);
        }
    }

    pub(super) fn remove_stream(&self, stream_id: u32) {
        if stream_id == 0 {
            return;
        }
        let (removed, empty) = {
            let mut streams = self.streams.lock();
            let removed = streams.remove(&stream_id);
            (removed, streams.is_empty())
        };
        if removed.is_some() {
            if stream_id % 2 == 1 {
                self.client_streams.fetch_sub(1, Ordering::AcqRel);
            } else {
                self.push_streams.fetch_sub(1, Ordering::AcqRel);
            }
            self.windows.remove_stream(stream_id);
        }
        if empty && self.retiring.load(Ordering::Acquire) {
            self.shutdown(Error::Closed);
        }
    }

    /// Stop taking new streams and close once the open ones finish.
    pub(crate) fn retire(&self) {
        self.retiring.store(true, Ordering::Release);
        if self.streams.lock().is_empty() {
            self.shutdown(Error::Closed);
        }
    }

    /// Close the connection and fail every stream with `cause`.
    ///
    /// Only the first call has any effect.
    pub(crate) fn shutdown(&self, cause: Error) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(conn = self.tube.id(), %cause, "http2 connection shutting down");
        *self.cause.lock() = Some(cause.clone());

        let hook = self.on_shutdown.lock().take();
        if let Some(hook) = hook {
            hook();
        }

        self.windows.close(cause.clone());
        let streams: Vec<Arc<Stream>> = self.streams.lock().drain().map(|(_, s)| s).collect();
        for stream in streams {
            stream.connection_closed(cause.clone());
        }
        self.tube.close_gracefully();
    }

    fn connection_error(&self, error: ConnectionError) {
        debug!(code = %error.code, reason = error.reason, "http2 connection error");
        let last_stream_id = self.last_push_id.load(Ordering::Acquire);
        let _ = self.tube.send_priority(vec![Frame::GoAway {
            last_stream_id,
            code: error.code,
            debug: Bytes::from_static(error.reason.as_bytes()),
        }
        .to_bytes()]);

        let protocol = if error.code == ErrorCode::COMPRESSION_ERROR {
            ProtocolError::Compression(error.reason)
        } else {
            ProtocolError::h2(error.code, error.reason)
        };
        self.shutdown(Error::Protocol(protocol));
    }

    fn stream(&self, stream_id: u32) -> Option<Arc<Stream>> {
        self.streams.lock().get(&stream_id).cloned()
    }

    /// Whether `stream_id` belongs to a stream that existed and is gone.
    fn is_closed_id(&self, recv: &RecvState, stream_id: u32) -> bool {
        if stream_id % 2 == 1 {
            stream_id < self.send.lock().next_stream_id
        } else {
            stream_id < recv.next_push_id
        }
    }

    /// Reset a stream because of a stream-level protocol violation.
    fn stream_error(&self, stream_id: u32, code: ErrorCode, reason: &'static str) {
        debug!(stream.id = stream_id, %code, reason, "stream error");
        match self.stream(stream_id) {
            Some(stream) => stream.fail(Error::Protocol(ProtocolError::h2(code, reason)), Some(code)),
            None => self.send_reset(stream_id, code),
        }
    }

    fn process(self: &Arc<Self>, data: Bytes) {
        if self.is_closed() {
            return;
        }

        let result = {
            let mut recv = self.recv.lock();
            recv.frames.extend(&data);
            loop {
                if self.is_closed() {
                    break Ok(());
                }
                match recv.frames.next_frame() {
                    None => break Ok(()),
                    Some(Ok(frame)) => {
                        trace!(?frame, "recv");
                        if let Err(error) = self.process_frame(&mut recv, frame) {
                            break Err(error);
                        }
                    }
                    // Nothing may interrupt a header block.
                    Some(Err(error)) if error.is_connection_error() || recv.partial.is_some() => {
                        break Err(ConnectionError::new(error.code, error.reason));
                    }
                    Some(Err(error)) => {
                        if error.flow_len > 0 {
                            self.release_connection_window(error.flow_len);
                        }
                        self.stream_error(error.stream_id, error.code, error.reason);
                    }
                }
            }
        };

        if let Err(error) = result {
            self.connection_error(error);
        }
    }

    fn process_frame(self: &Arc<Self>, recv: &mut RecvState, frame: Frame) -> Result<(), ConnectionError> {
        if let Some(partial) = &recv.partial {
            let continues = matches!(
                &frame,
                Frame::Continuation { stream_id, .. } if *stream_id == partial.stream_id()
            );
            if !continues {
                return Err(ConnectionError::new(
                    ErrorCode::PROTOCOL_ERROR,
                    "header block interrupted",
                ));
            }
        }

        match frame {
            Frame::Settings { ack: true, .. } => trace!("settings acknowledged"),
            Frame::Settings {
                ack: false,
                settings,
            } => self.apply_settings(&settings)?,
            Frame::Ping { ack: false, payload } => {
                let _ = self
                    .tube
                    .send_priority(vec![Frame::Ping { ack: true, payload }.to_bytes()]);
            }
            Frame::Ping { ack: true, .. } => {}
            Frame::GoAway {
                last_stream_id,
                code,
                ..
            } => {
                debug!(last_stream_id, %code, "received GOAWAY");
                self.shutdown(Error::GoAway {
                    code,
                    last_stream_id,
                });
            }
            Frame::WindowUpdate {
                stream_id: 0,
                increment,
            } => {
                if increment == 0 && !self.config.lenient_window_update {
                    return Err(ConnectionError::new(
                        ErrorCode::PROTOCOL_ERROR,
                        "zero WINDOW_UPDATE increment",
                    ));
                }
                self.windows.increase_connection(increment).map_err(|_| {
                    ConnectionError::new(ErrorCode::FLOW_CONTROL_ERROR, "connection window overflow")
                })?;
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                if increment == 0 {
                    if !self.config.lenient_window_update {
                        self.stream_error(stream_id, ErrorCode::PROTOCOL_ERROR, "zero WINDOW_UPDATE increment");
                    }
                } else if self.windows.increase_stream(stream_id, increment).is_err() {
                    self.stream_error(stream_id, ErrorCode::FLOW_CONTROL_ERROR, "stream window overflow");
                }
            }
            Frame::Headers {
                stream_id,
                block,
                end_stream,
                end_headers,
            } => {
                let kind = BlockKind::Headers {
                    stream_id,
                    end_stream,
                };
                self.header_fragment(recv, kind, block, end_headers)?;
            }
            Frame::PushPromise {
                stream_id,
                promised_id,
                block,
                end_headers,
            } => {
                let kind = BlockKind::PushPromise {
                    stream_id,
                    promised_id,
                };
                self.header_fragment(recv, kind, block, end_headers)?;
            }
            Frame::Continuation {
                block, end_headers, ..
            } => {
                let Some(mut partial) = recv.partial.take() else {
                    return Err(ConnectionError::new(
                        ErrorCode::PROTOCOL_ERROR,
                        "CONTINUATION without a header block",
                    ));
                };
                partial.block.extend_from_slice(&block);
                if end_headers {
                    self.complete_block(recv, partial.kind, partial.block.freeze())?;
                } else {
                    recv.partial = Some(partial);
                }
            }
            Frame::Data {
                stream_id,
                data,
                end_stream,
                flow_len,
            } => match self.stream(stream_id) {
                Some(stream) => stream.deliver(Inbound::Data {
                    data,
                    end_stream,
                    flow_len,
                }),
                None => {
                    self.release_connection_window(flow_len);
                    if !self.is_closed_id(recv, stream_id) {
                        self.send_reset(stream_id, ErrorCode::PROTOCOL_ERROR);
                    }
                }
            },
            Frame::Reset { stream_id, code } => {
                // Never answer a reset with a reset.
                if let Some(stream) = self.stream(stream_id) {
                    stream.deliver(Inbound::Reset(code));
                }
            }
            Frame::Priority { .. } | Frame::Unknown { .. } => {}
        }
        Ok(())
    }

    fn header_fragment(
        self: &Arc<Self>,
        recv: &mut RecvState,
        kind: BlockKind,
        block: Bytes,
        end_headers: bool,
    ) -> Result<(), ConnectionError> {
        if end_headers {
            return self.complete_block(recv, kind, block);
        }
        recv.partial = Some(PartialBlock {
            kind,
            block: BytesMut::from(&block[..]),
        });
        Ok(())
    }

    /// Decode a complete header block and route it.
    ///
    /// Blocks are always decoded, even for streams we no longer know, so
    /// the decoder's table keeps matching the peer's encoder.
    fn complete_block(
        self: &Arc<Self>,
        recv: &mut RecvState,
        kind: BlockKind,
        block: Bytes,
    ) -> Result<(), ConnectionError> {
        let fields = recv.decoder.decode(&block).map_err(|error| {
            debug!(%error, "header block failed to decode");
            ConnectionError::new(ErrorCode::COMPRESSION_ERROR, "header block failed to decode")
        })?;

        match kind {
            BlockKind::Headers {
                stream_id,
                end_stream,
            } => match self.stream(stream_id) {
                Some(stream) => stream.deliver(Inbound::Headers { fields, end_stream }),
                None => {
                    if !self.is_closed_id(recv, stream_id) {
                        self.send_reset(stream_id, ErrorCode::PROTOCOL_ERROR);
                    }
                }
            },
            BlockKind::PushPromise {
                stream_id,
                promised_id,
            } => self.push_promise(recv, stream_id, promised_id, fields),
        }
        Ok(())
    }

    fn push_promise(
        self: &Arc<Self>,
        recv: &mut RecvState,
        parent_id: u32,
        promised_id: u32,
        fields: Vec<HeaderField>,
    ) {
        if let Err(refusal) = self.accept_push(recv, parent_id, promised_id, fields) {
            debug!(parent = parent_id, promised = promised_id, ?refusal, "push refused");
            self.send_reset(promised_id, refusal.code());
        }
    }

    fn reserve_push(&self, recv: &mut RecvState, promised_id: u32) -> Result<(), PushRefusal> {
        if promised_id != recv.next_push_id || promised_id > MAX_WINDOW_SIZE - 1 {
            return Err(PushRefusal::OutOfSequence);
        }
        recv.next_push_id = promised_id + 2;
        if (MAX_WINDOW_SIZE - 1 - promised_id) / 2 < 2 {
            debug!(promised = promised_id, "push ids exhausted, connection is final");
            self.send.lock().last = true;
        }
        if self.push_streams.load(Ordering::Acquire) >= self.config.max_concurrent_pushes as usize {
            return Err(PushRefusal::LimitReached);
        }
        Ok(())
    }

    fn accept_push(
        self: &Arc<Self>,
        recv: &mut RecvState,
        parent_id: u32,
        promised_id: u32,
        fields: Vec<HeaderField>,
    ) -> Result<(), PushRefusal> {
        let handler = self
            .stream(parent_id)
            .filter(|parent| !parent.is_pushed())
            .and_then(|parent| parent.push_handler());

        self.reserve_push(recv, promised_id)?;
        let handler = handler.ok_or(PushRefusal::NotAccepting)?;

        let request = match headers::promised_request(fields) {
            Ok(request) => request,
            Err(error) => {
                debug!(%error, "malformed push promise");
                return Err(PushRefusal::OutOfSequence);
            }
        };
        if !handler.accept(&request) {
            return Err(PushRefusal::Declined);
        }

        let stream = Stream::new(
            Arc::downgrade(self),
            true,
            self.config.initial_stream_window_size,
            self.tracker.guard(),
        );
        stream.set_id(promised_id);
        stream.set_head_only(request.method() == http::Method::HEAD);
        self.streams.lock().insert(promised_id, stream.clone());
        self.push_streams.fetch_add(1, Ordering::AcqRel);
        self.last_push_id.store(promised_id, Ordering::Release);
        trace!(parent = parent_id, promised = promised_id, "push accepted");

        let span = tracing::trace_span!("push", stream.id = promised_id);
        tokio::spawn(
            async move {
                let response = stream.read_head().await;
                handler.pushed(request, response);
            }
            .instrument(span),
        );
        Ok(())
    }

    fn apply_settings(&self, settings: &Settings) -> Result<(), ConnectionError> {
        {
            let mut peer = self.peer.lock();
            let mut updated = *peer;
            let delta = updated.apply(settings);
            self.windows.adjust_initial(delta).map_err(|_| {
                ConnectionError::new(ErrorCode::FLOW_CONTROL_ERROR, "stream window overflow")
            })?;
            *peer = updated;
            trace!(settings = ?updated, "peer settings");
        }

        let mut send = self.send.lock();
        if let Some(size) = settings.header_table_size {
            send.encoder.set_max_table_size(size as usize);
        }
        let _ = self.tube.send(vec![Frame::Settings {
            ack: true,
            settings: Settings::default(),
        }
        .to_bytes()]);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_next_stream_id(&self, id: u32) {
        self.send.lock().next_stream_id = id;
    }

    #[cfg(test)]
    pub(crate) fn set_next_push_id(&self, id: u32) {
        self.recv.lock().next_push_id = id;
    }
}

impl HasConnectionInfo for Http2Connection {
    fn info(&self) -> ConnectionInfo {
        self.tube.info()
    }
}

/// Encode a header block as HEADERS followed by as many CONTINUATION frames
/// as the peer's frame size requires.
fn encode_header_block(
    encoder: &mut Encoder,
    stream_id: u32,
    fields: &[HeaderField],
    end_stream: bool,
    max_frame_size: usize,
) -> Vec<Bytes> {
    let mut block = BytesMut::new();
    encoder.encode(fields, &mut block);
    let mut block = block.freeze();

    let mut frames = Vec::with_capacity(1 + block.len() / max_frame_size);
    let first = block.split_to(block.len().min(max_frame_size));
    frames.push(
        Frame::Headers {
            stream_id,
            block: first,
            end_stream,
            end_headers: block.is_empty(),
        }
        .to_bytes(),
    );
    while !block.is_empty() {
        let next = block.split_to(block.len().min(max_frame_size));
        frames.push(
            Frame::Continuation {
                stream_id,
                block: next,
                end_headers: block.is_empty(),
            }
            .to_bytes(),
        );
    }
    frames
}
