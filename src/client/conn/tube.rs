//! The byte pipe under every HTTP connection.
//!
//! A [`Tube`] owns a transport stream and runs two tasks over its halves. The
//! writer drains a queue of buffers, always taking the priority lane before
//! the ordered lane. The reader only reads when a subscriber has asked for
//! data, and hands each chunk to the current [`ReadSubscriber`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use futures_util::FutureExt as _;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{trace, Instrument as _};

use super::transport::{Io, TransportStream};
use crate::client::Error;
use crate::flow::Demand;
use crate::info::{ConnectionInfo, HasConnectionInfo};

const READ_BUFFER_SIZE: usize = 16 * 1024;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Receives what the reader task reads.
///
/// Calls come from the reader task, one at a time. After `on_error` or
/// `on_complete` nothing more is delivered.
pub(crate) trait ReadSubscriber: Send + Sync + 'static {
    fn on_next(&self, data: Bytes);
    fn on_error(&self, error: Error);
    fn on_complete(&self);
}

/// Result of checking an idle connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Probe {
    /// No data and no EOF: the connection looks usable.
    Alive,
    /// The peer closed, or the connection failed.
    Closed,
    /// Bytes arrived while nothing was expected.
    UnexpectedData,
}

#[derive(Debug, Clone)]
enum Terminal {
    Eof,
    Failed(Error),
}

enum Item {
    Write {
        bufs: Vec<Bytes>,
        ack: Option<oneshot::Sender<Result<(), Error>>>,
    },
    Shutdown,
}

#[derive(Default)]
struct Outgoing {
    priority: VecDeque<Item>,
    ordered: VecDeque<Item>,
    closed: bool,
}

impl Outgoing {
    fn pop(&mut self) -> Option<Item> {
        self.priority.pop_front().or_else(|| self.ordered.pop_front())
    }
}

/// Handle to a connection's reader and writer tasks.
///
/// The tasks stop once every clone of the handle is dropped.
#[derive(Clone)]
pub(crate) struct Tube {
    inner: Arc<Inner>,
    _handle: Arc<Handle>,
}

struct Handle(Arc<Inner>);

/// A tube handle which does not keep the tasks running.
#[derive(Clone)]
pub(crate) struct WeakTube {
    inner: Weak<Inner>,
    handle: Weak<Handle>,
}

impl fmt::Debug for WeakTube {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakTube").finish()
    }
}

impl WeakTube {
    pub(crate) fn upgrade(&self) -> Option<Tube> {
        Some(Tube {
            inner: self.inner.upgrade()?,
            _handle: self.handle.upgrade()?,
        })
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.0.close(Error::Closed);
    }
}

struct Inner {
    id: u64,
    info: ConnectionInfo,
    outgoing: Mutex<Outgoing>,
    write_ready: Notify,
    read_demand: Demand,
    read_ready: Notify,
    subscriber: Mutex<Option<Arc<dyn ReadSubscriber>>>,
    terminal: Mutex<Option<Terminal>>,
    probes: mpsc::UnboundedSender<oneshot::Sender<Probe>>,
    poisoned: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl fmt::Debug for Tube {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tube")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Tube {
    /// Start the reader and writer tasks for `stream`.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn(stream: TransportStream) -> Self {
        let (io, info) = stream.into_parts();
        let (reader, writer) = tokio::io::split(io);
        let (probes, probe_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            info,
            outgoing: Mutex::new(Outgoing::default()),
            write_ready: Notify::new(),
            read_demand: Demand::new(),
            read_ready: Notify::new(),
            subscriber: Mutex::new(None),
            terminal: Mutex::new(None),
            probes,
            poisoned: AtomicBool::new(false),
            shutdown,
        });

        let span = tracing::trace_span!("tube", id = inner.id);
        tokio::spawn(read_loop(inner.clone(), reader, probe_rx).instrument(span.clone()));
        tokio::spawn(write_loop(inner.clone(), writer).instrument(span));

        Tube {
            _handle: Arc::new(Handle(inner.clone())),
            inner,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn downgrade(&self) -> WeakTube {
        WeakTube {
            inner: Arc::downgrade(&self.inner),
            handle: Arc::downgrade(&self._handle),
        }
    }

    /// Replace the read subscriber. A subscriber which arrives after the
    /// stream ended is told so immediately.
    pub(crate) fn subscribe(&self, subscriber: Arc<dyn ReadSubscriber>) {
        {
            let terminal = self.inner.terminal.lock();
            if terminal.is_none() {
                *self.inner.subscriber.lock() = Some(subscriber);
                return;
            }
        }
        let terminal = self.inner.terminal.lock().clone();
        match terminal {
            Some(Terminal::Eof) => subscriber.on_complete(),
            Some(Terminal::Failed(error)) => subscriber.on_error(error),
            None => {}
        }
    }

    /// Allow `n` more reads.
    pub(crate) fn request_read(&self, n: u64) {
        if self.inner.read_demand.increase(n) {
            self.inner.read_ready.notify_one();
        }
    }

    /// Queue buffers on the ordered lane.
    pub(crate) fn send(&self, bufs: Vec<Bytes>) -> Result<(), Error> {
        self.enqueue(false, bufs, None)
    }

    /// Queue buffers on the priority lane, ahead of ordered writes not yet
    /// started.
    pub(crate) fn send_priority(&self, bufs: Vec<Bytes>) -> Result<(), Error> {
        self.enqueue(true, bufs, None)
    }

    /// Queue buffers on the ordered lane and wait until they are flushed.
    pub(crate) async fn write(&self, bufs: Vec<Bytes>) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(false, bufs, Some(tx))?;
        rx.await.unwrap_or(Err(Error::Closed))
    }

    /// Queue buffers on the priority lane and wait until they are flushed.
    pub(crate) async fn write_priority(&self, bufs: Vec<Bytes>) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(true, bufs, Some(tx))?;
        rx.await.unwrap_or(Err(Error::Closed))
    }

    fn enqueue(
        &self,
        priority: bool,
        bufs: Vec<Bytes>,
        ack: Option<oneshot::Sender<Result<(), Error>>>,
    ) -> Result<(), Error> {
        {
            let mut outgoing = self.inner.outgoing.lock();
            if outgoing.closed {
                return Err(self.inner.failure());
            }
            let item = Item::Write { bufs, ack };
            if priority {
                outgoing.priority.push_back(item);
            } else {
                outgoing.ordered.push_back(item);
            }
        }
        self.inner.write_ready.notify_one();
        Ok(())
    }

    /// Check an idle connection without blocking.
    pub(crate) async fn probe(&self) -> Probe {
        if let Some(state) = self.inner.quick_probe() {
            return state;
        }
        let (tx, rx) = oneshot::channel();
        if self.inner.probes.send(tx).is_err() {
            return Probe::Closed;
        }
        rx.await.unwrap_or(Probe::Closed)
    }

    /// Mark the connection as unsafe to reuse.
    pub(crate) fn poison(&self) {
        self.inner.poisoned.store(true, Ordering::Release);
    }

    pub(crate) fn is_poisoned(&self) -> bool {
        self.inner.poisoned.load(Ordering::Acquire)
    }

    /// Whether the tube can no longer carry traffic.
    pub(crate) fn is_closed(&self) -> bool {
        self.inner.terminal.lock().is_some() || self.inner.outgoing.lock().closed
    }

    /// Close immediately. Queued writes fail and the subscriber is told.
    pub(crate) fn close(&self) {
        self.inner.close(Error::Closed);
    }

    /// Close once everything already queued has been written.
    pub(crate) fn close_gracefully(&self) {
        {
            let mut outgoing = self.inner.outgoing.lock();
            if outgoing.closed {
                return;
            }
            outgoing.ordered.push_back(Item::Shutdown);
        }
        self.inner.write_ready.notify_one();
    }
}

impl HasConnectionInfo for Tube {
    fn info(&self) -> ConnectionInfo {
        self.inner.info.clone()
    }
}

impl Inner {
    fn subscriber(&self) -> Option<Arc<dyn ReadSubscriber>> {
        self.subscriber.lock().clone()
    }

    /// The subscriber hears about the end of the stream exactly once, and is
    /// released afterwards so it may hold the tube without a cycle.
    fn take_subscriber(&self) -> Option<Arc<dyn ReadSubscriber>> {
        self.subscriber.lock().take()
    }

    fn failure(&self) -> Error {
        match &*self.terminal.lock() {
            Some(Terminal::Failed(error)) => error.clone(),
            _ => Error::Closed,
        }
    }

    fn quick_probe(&self) -> Option<Probe> {
        if self.poisoned.load(Ordering::Acquire) {
            return Some(Probe::UnexpectedData);
        }
        if self.terminal.lock().is_some() || self.outgoing.lock().closed {
            return Some(Probe::Closed);
        }
        None
    }

    /// Record the end of the read side. Returns `false` if it had already ended.
    fn terminate(&self, terminal: Terminal) -> bool {
        let mut slot = self.terminal.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(terminal);
        true
    }

    fn close(&self, error: Error) {
        let pending: Vec<Item> = {
            let mut outgoing = self.outgoing.lock();
            outgoing.closed = true;
            let mut pending: Vec<Item> = outgoing.priority.drain(..).collect();
            pending.extend(outgoing.ordered.drain(..));
            pending
        };

        for item in pending {
            if let Item::Write { ack: Some(ack), .. } = item {
                let _ = ack.send(Err(error.clone()));
            }
        }

        self.shutdown.send_replace(true);
        self.write_ready.notify_one();
        self.read_ready.notify_one();

        if self.terminate(Terminal::Failed(error.clone())) {
            trace!(id = self.id, %error, "tube closed");
            if let Some(subscriber) = self.take_subscriber() {
                subscriber.on_error(error);
            }
        }
    }
}

fn probe_now(reader: &mut ReadHalf<Box<dyn Io>>) -> Probe {
    let mut byte = [0u8; 1];
    match reader.read(&mut byte).now_or_never() {
        None => Probe::Alive,
        Some(Ok(0)) | Some(Err(_)) => Probe::Closed,
        Some(Ok(_)) => Probe::UnexpectedData,
    }
}

async fn read_loop(
    inner: Arc<Inner>,
    mut reader: ReadHalf<Box<dyn Io>>,
    mut probes: mpsc::UnboundedReceiver<oneshot::Sender<Probe>>,
) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        while inner.read_demand.is_fulfilled() {
            tokio::select! {
                _ = inner.read_ready.notified() => {}
                Some(reply) = probes.recv() => {
                    let state = probe_now(&mut reader);
                    match state {
                        Probe::Closed => inner.close(Error::Closed),
                        Probe::UnexpectedData => inner.poisoned.store(true, Ordering::Release),
                        Probe::Alive => {}
                    }
                    let _ = reply.send(state);
                    if state == Probe::Closed {
                        return;
                    }
                }
                _ = shutdown.wait_for(|closed| *closed) => return,
            }
        }

        if !inner.read_demand.try_decrement() {
            continue;
        }

        buf.reserve(READ_BUFFER_SIZE);
        let result = loop {
            tokio::select! {
                result = reader.read_buf(&mut buf) => break result,
                Some(reply) = probes.recv() => { let _ = reply.send(Probe::Alive); }
                _ = shutdown.wait_for(|closed| *closed) => return,
            }
        };

        match result {
            Ok(0) => {
                trace!("eof");
                if inner.terminate(Terminal::Eof) {
                    if let Some(subscriber) = inner.take_subscriber() {
                        subscriber.on_complete();
                    }
                }
                return;
            }
            Ok(n) => {
                trace!(bytes = n, "read");
                let data = buf.split().freeze();
                match inner.subscriber() {
                    Some(subscriber) => subscriber.on_next(data),
                    None => inner.poisoned.store(true, Ordering::Release),
                }
            }
            Err(error) => {
                trace!(%error, "read failed");
                let error = Error::io(error);
                if inner.terminate(Terminal::Failed(error.clone())) {
                    if let Some(subscriber) = inner.take_subscriber() {
                        subscriber.on_error(error);
                    }
                }
                return;
            }
        }
    }
}

async fn write_loop(inner: Arc<Inner>, mut writer: WriteHalf<Box<dyn Io>>) {
    let mut shutdown = inner.shutdown.subscribe();

    loop {
        let next = inner.outgoing.lock().pop();
        match next {
            Some(Item::Write { bufs, ack }) => {
                let mut result = Ok(());
                for buf in &bufs {
                    if let Err(error) = writer.write_all(buf).await {
                        result = Err(error);
                        break;
                    }
                }
                if result.is_ok() {
                    result = writer.flush().await;
                }

                match result {
                    Ok(()) => {
                        if let Some(ack) = ack {
                            let _ = ack.send(Ok(()));
                        }
                    }
                    Err(error) => {
                        trace!(%error, "write failed");
                        let error = Error::io(error);
                        if let Some(ack) = ack {
                            let _ = ack.send(Err(error.clone()));
                        }
                        inner.close(error);
                        return;
                    }
                }
            }
            Some(Item::Shutdown) => {
                let _ = writer.shutdown().await;
                inner.close(Error::Closed);
                return;
            }
            None => {
                if *shutdown.borrow() {
                    return;
                }
                tokio::select! {
                    _ = inner.write_ready.notified() => {}
                    _ = shutdown.wait_for(|closed| *closed) => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc::UnboundedSender;

    use super::*;

    #[derive(Debug)]
    enum Event {
        Data(Bytes),
        Error,
        Complete,
    }

    struct Recorder(UnboundedSender<Event>);

    impl ReadSubscriber for Recorder {
        fn on_next(&self, data: Bytes) {
            let _ = self.0.send(Event::Data(data));
        }

        fn on_error(&self, _error: Error) {
            let _ = self.0.send(Event::Error);
        }

        fn on_complete(&self) {
            let _ = self.0.send(Event::Complete);
        }
    }

    fn tube() -> (Tube, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(1024);
        (
            Tube::spawn(TransportStream::new(client, ConnectionInfo::default())),
            server,
        )
    }

    #[tokio::test]
    async fn priority_writes_jump_the_queue() {
        let (tube, mut server) = tube();
        tube.send(vec![Bytes::from_static(b"A")]).unwrap();
        tube.send(vec![Bytes::from_static(b"B")]).unwrap();
        tube.send_priority(vec![Bytes::from_static(b"P")]).unwrap();
        tube.write(vec![Bytes::from_static(b"C")]).await.unwrap();

        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PABC");
    }

    #[tokio::test]
    async fn reads_wait_for_demand() {
        let (tube, mut server) = tube();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tube.subscribe(Arc::new(Recorder(tx)));

        server.write_all(b"hello").await.unwrap();
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());

        tube.request_read(1);
        match rx.recv().await.unwrap() {
            Event::Data(data) => assert_eq!(data, Bytes::from_static(b"hello")),
            other => panic!("unexpected {other:?}"),
        }

        drop(server);
        tube.request_read(1);
        assert!(matches!(rx.recv().await.unwrap(), Event::Complete));
    }

    #[tokio::test]
    async fn probe_reports_state() {
        let (tube, mut server) = tube();
        assert_eq!(tube.probe().await, Probe::Alive);

        server.write_all(b"x").await.unwrap();
        assert_eq!(tube.probe().await, Probe::UnexpectedData);
        assert!(tube.is_poisoned());

        let (tube, server) = self::tube();
        drop(server);
        assert_eq!(tube.probe().await, Probe::Closed);
        assert!(tube.is_closed());
    }

    #[tokio::test]
    async fn close_fails_writes_and_notifies() {
        let (tube, _server) = tube();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tube.subscribe(Arc::new(Recorder(tx)));

        tube.close();
        assert!(matches!(rx.recv().await.unwrap(), Event::Error));
        assert!(tube.send(vec![Bytes::from_static(b"late")]).is_err());
        assert!(tube.is_closed());

        // A late subscriber learns about the failure immediately.
        let (tx, mut rx) = mpsc::unbounded_channel();
        tube.subscribe(Arc::new(Recorder(tx)));
        assert!(matches!(rx.try_recv().unwrap(), Event::Error));
    }

    #[tokio::test]
    async fn weak_handle_does_not_keep_tube_open() {
        let (tube, _server) = tube();
        let weak = tube.downgrade();
        assert!(weak.upgrade().is_some());

        let inner = tube.inner.clone();
        drop(tube);
        assert!(weak.upgrade().is_none());
        assert!(inner.outgoing.lock().closed);
    }

    #[tokio::test]
    async fn graceful_close_flushes_first() {
        let (tube, mut server) = tube();
        tube.send(vec![Bytes::from_static(b"bye")]).unwrap();
        tube.close_gracefully();

        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"bye");
    }
}
