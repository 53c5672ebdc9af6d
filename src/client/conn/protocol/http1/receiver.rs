//! The read side of an HTTP/1.1 connection.
//!
//! Bytes from the tube are queued and handed to one [`Delegate`] at a time:
//! first a head parser, then a body parser. The queue is drained by a
//! [`SequentialScheduler`], and the tube is only asked for more when the
//! queue is empty and the current delegate can take bytes.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::trace;

use crate::client::conn::tube::{ReadSubscriber, Tube, WeakTube};
use crate::client::Error;
use crate::flow::SequentialScheduler;

/// Whether a delegate is finished with the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Flow {
    /// Keep the delegate registered.
    Continue,
    /// The delegate is done; bytes it left belong to the next one.
    Finished,
}

/// Consumes response bytes on behalf of one exchange.
pub(super) trait Delegate: Send + 'static {
    /// Whether the delegate can take bytes right now.
    fn has_demand(&self) -> bool;

    /// Consume what it can from the front of `data`.
    fn on_data(&mut self, data: &mut Bytes) -> Flow;

    /// The server closed the connection.
    fn on_eof(&mut self);

    /// Reading failed. The delegate is dropped afterwards.
    fn on_error(&mut self, error: Error);
}

#[derive(Debug, Clone)]
enum Upstream {
    Eof,
    Failed(Error),
    /// Closed on purpose by this side; never reported as an expired
    /// connection.
    Local(Error),
}

#[derive(Default)]
struct State {
    queue: VecDeque<Bytes>,
    delegate: Option<Box<dyn Delegate>>,
    upstream: Option<Upstream>,
    reading: bool,
    received: u64,
    reused: bool,
    detached: bool,
}

/// Reads responses for an HTTP/1.1 connection.
pub(crate) struct Http1Receiver {
    tube: WeakTube,
    state: Mutex<State>,
    scheduler: Arc<SequentialScheduler>,
}

impl fmt::Debug for Http1Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Http1Receiver")
            .field("queued", &state.queue.len())
            .field("delegate", &state.delegate.is_some())
            .field("received", &state.received)
            .finish()
    }
}

impl Http1Receiver {
    /// Create a receiver and subscribe it to `tube`.
    pub(crate) fn attach(tube: &Tube) -> Arc<Self> {
        let receiver = Arc::new_cyclic(|weak: &Weak<Http1Receiver>| {
            let weak = weak.clone();
            Http1Receiver {
                tube: tube.downgrade(),
                state: Mutex::new(State::default()),
                scheduler: SequentialScheduler::new(move || {
                    if let Some(receiver) = weak.upgrade() {
                        receiver.drain();
                    }
                }),
            }
        });
        tube.subscribe(receiver.clone());
        receiver
    }

    /// Start counting bytes for a new exchange. Failures on a reused
    /// connection before any byte arrives are reported as expired.
    pub(crate) fn begin(&self, reused: bool) {
        let mut state = self.state.lock();
        state.received = 0;
        state.reused = reused;
    }

    /// Hand the byte queue to `delegate`, replacing any current one.
    pub(super) fn register(&self, delegate: Box<dyn Delegate>) {
        self.state.lock().delegate = Some(delegate);
        self.schedule();
    }

    /// Run the drain loop, e.g. because the delegate gained demand.
    pub(crate) fn schedule(&self) {
        self.scheduler.run_or_schedule();
    }

    /// Fail the current and any later delegate with `error`.
    pub(crate) fn fail(&self, error: Error) {
        {
            let mut state = self.state.lock();
            if state.upstream.is_none() {
                state.upstream = Some(Upstream::Local(error));
            }
        }
        self.schedule();
    }

    /// Bytes are waiting with nobody expecting them.
    pub(crate) fn has_unread(&self) -> bool {
        let state = self.state.lock();
        state.delegate.is_none() && !state.queue.is_empty()
    }

    /// The read side has ended.
    pub(crate) fn is_ended(&self) -> bool {
        self.state.lock().upstream.is_some()
    }

    /// Stop reading and return whatever was received but not consumed.
    pub(crate) fn detach(&self) -> Bytes {
        self.scheduler.stop();
        let mut state = self.state.lock();
        state.detached = true;
        state.delegate = None;

        let mut buffered = BytesMut::new();
        for chunk in state.queue.drain(..) {
            buffered.extend_from_slice(&chunk);
        }
        buffered.freeze()
    }

    fn drain(&self) {
        loop {
            let mut state = self.state.lock();
            if state.detached {
                return;
            }
            let Some(mut delegate) = state.delegate.take() else {
                return;
            };

            if let Some(mut data) = state.queue.pop_front() {
                if !delegate.has_demand() {
                    state.queue.push_front(data);
                    state.delegate = Some(delegate);
                    return;
                }
                drop(state);

                let flow = delegate.on_data(&mut data);

                let mut state = self.state.lock();
                if !data.is_empty() {
                    state.queue.push_front(data);
                }
                if flow == Flow::Continue && state.delegate.is_none() {
                    state.delegate = Some(delegate);
                }
                continue;
            }

            if let Some(upstream) = state.upstream.clone() {
                let expired = state.reused && state.received == 0;
                drop(state);
                match upstream {
                    Upstream::Eof if expired => delegate.on_error(Error::expired(Error::Closed)),
                    Upstream::Eof => delegate.on_eof(),
                    Upstream::Failed(error) if expired => delegate.on_error(Error::expired(error)),
                    Upstream::Failed(error) | Upstream::Local(error) => delegate.on_error(error),
                }
                continue;
            }

            let read = delegate.has_demand() && !state.reading;
            if read {
                state.reading = true;
            }
            state.delegate = Some(delegate);
            drop(state);

            if read {
                match self.tube.upgrade() {
                    Some(tube) => tube.request_read(1),
                    None => {
                        self.state.lock().upstream = Some(Upstream::Failed(Error::Closed));
                        continue;
                    }
                }
            }
            return;
        }
    }
}

impl ReadSubscriber for Http1Receiver {
    fn on_next(&self, data: Bytes) {
        {
            let mut state = self.state.lock();
            state.reading = false;
            state.received += data.len() as u64;
            trace!(bytes = data.len(), queued = state.queue.len(), "http1 read");
            state.queue.push_back(data);
        }
        self.schedule();
    }

    fn on_error(&self, error: Error) {
        {
            let mut state = self.state.lock();
            state.reading = false;
            if state.upstream.is_none() {
                state.upstream = Some(Upstream::Failed(error));
            }
        }
        self.schedule();
    }

    fn on_complete(&self) {
        {
            let mut state = self.state.lock();
            state.reading = false;
            if state.upstream.is_none() {
                state.upstream = Some(Upstream::Eof);
            }
        }
        self.schedule();
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt as _;
    use tokio::sync::mpsc;

    use super::*;
    use crate::client::conn::transport::TransportStream;
    use crate::info::ConnectionInfo;

    #[derive(Debug)]
    enum Event {
        Data(Bytes),
        Eof,
        Error(Error),
    }

    /// Takes `limit` bytes, then finishes.
    struct Taker {
        limit: usize,
        taken: usize,
        demand: bool,
        events: mpsc::UnboundedSender<Event>,
    }

    impl Delegate for Taker {
        fn has_demand(&self) -> bool {
            self.demand
        }

        fn on_data(&mut self, data: &mut Bytes) -> Flow {
            let n = (self.limit - self.taken).min(data.len());
            self.taken += n;
            let _ = self.events.send(Event::Data(data.split_to(n)));
            if self.taken == self.limit {
                Flow::Finished
            } else {
                Flow::Continue
            }
        }

        fn on_eof(&mut self) {
            let _ = self.events.send(Event::Eof);
        }

        fn on_error(&mut self, error: Error) {
            let _ = self.events.send(Event::Error(error));
        }
    }

    fn taker(limit: usize) -> (Box<Taker>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Box::new(Taker {
                limit,
                taken: 0,
                demand: true,
                events: tx,
            }),
            rx,
        )
    }

    fn setup() -> (Tube, Arc<Http1Receiver>, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(1024);
        let tube = Tube::spawn(TransportStream::new(client, ConnectionInfo::default()));
        let receiver = Http1Receiver::attach(&tube);
        (tube, receiver, server)
    }

    #[tokio::test]
    async fn leftover_bytes_go_to_next_delegate() {
        let (_tube, receiver, mut server) = setup();
        let (first, mut first_rx) = taker(3);
        receiver.register(first);
        server.write_all(b"abcdef").await.unwrap();

        match first_rx.recv().await.unwrap() {
            Event::Data(data) => assert_eq!(&data[..], b"abc"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(receiver.has_unread());

        let (second, mut second_rx) = taker(3);
        receiver.register(second);
        match second_rx.recv().await.unwrap() {
            Event::Data(data) => assert_eq!(&data[..], b"def"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!receiver.has_unread());
    }

    #[tokio::test]
    async fn no_bytes_without_demand() {
        let (_tube, receiver, mut server) = setup();
        let (mut idle, mut rx) = taker(10);
        idle.demand = false;
        receiver.register(idle);
        server.write_all(b"abc").await.unwrap();
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn eof_on_reused_connection_is_expired() {
        let (_tube, receiver, server) = setup();
        receiver.begin(true);
        let (delegate, mut rx) = taker(10);
        receiver.register(delegate);
        drop(server);

        match rx.recv().await.unwrap() {
            Event::Error(error) => assert!(error.is_connection_expired()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn eof_on_fresh_connection_is_eof() {
        let (_tube, receiver, server) = setup();
        receiver.begin(false);
        let (delegate, mut rx) = taker(10);
        receiver.register(delegate);
        drop(server);
        assert!(matches!(rx.recv().await.unwrap(), Event::Eof));
    }

    #[tokio::test]
    async fn error_waits_for_queue_to_drain() {
        let (_tube, receiver, mut server) = setup();
        receiver.begin(true);
        let (delegate, mut rx) = taker(10);
        receiver.register(delegate);

        server.write_all(b"ab").await.unwrap();
        match rx.recv().await.unwrap() {
            Event::Data(data) => assert_eq!(&data[..], b"ab"),
            other => panic!("unexpected {other:?}"),
        }
        drop(server);

        // Bytes already arrived, so the failure is not an expiry.
        assert!(matches!(rx.recv().await.unwrap(), Event::Eof));
    }

    #[tokio::test]
    async fn local_failure_is_not_expired() {
        let (_tube, receiver, _server) = setup();
        receiver.begin(true);
        let (delegate, mut rx) = taker(10);
        receiver.register(delegate);
        receiver.fail(Error::cancelled(None));

        match rx.recv().await.unwrap() {
            Event::Error(error) => assert!(error.is_cancelled()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn detach_returns_buffered_bytes() {
        let (_tube, receiver, mut server) = setup();
        let (delegate, mut rx) = taker(2);
        receiver.register(delegate);
        server.write_all(b"HIrest").await.unwrap();
        rx.recv().await.unwrap();
        assert_eq!(&receiver.detach()[..], b"rest");
    }
}
