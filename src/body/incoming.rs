use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::task::AtomicWaker;
use http::HeaderMap;
use http_body::{Frame, SizeHint};
use parking_lot::Mutex;

use crate::client::Error;
use crate::flow::Demand;

type DemandHook = Arc<dyn Fn() + Send + Sync>;
type CancelHook = Box<dyn FnOnce() + Send>;

/// A response body fed by a connection.
///
/// Every poll that finds no buffered data requests exactly one more item
/// from the connection, so a slow reader holds the connection (and, for
/// HTTP/2, the peer's flow-control window) back instead of buffering.
///
/// Dropping an unfinished `Incoming` cancels it: HTTP/1.1 connections are
/// closed, HTTP/2 streams are reset.
pub struct Incoming {
    shared: Option<Arc<Shared>>,
    finished: bool,
}

struct Shared {
    demand: Demand,
    state: Mutex<State>,
    waker: AtomicWaker,
    on_demand: Mutex<Option<DemandHook>>,
    on_cancel: Mutex<Option<CancelHook>>,
    length: Option<u64>,
}

#[derive(Default)]
struct State {
    items: VecDeque<Bytes>,
    trailers: Option<HeaderMap>,
    outcome: Option<Result<(), Error>>,
    requested: bool,
    cancelled: bool,
}

impl Incoming {
    /// A body which ends immediately.
    pub fn empty() -> Self {
        Self {
            shared: None,
            finished: true,
        }
    }

    pub(crate) fn channel(length: Option<u64>) -> (BodySender, Incoming) {
        let shared = Arc::new(Shared {
            demand: Demand::new(),
            state: Mutex::new(State::default()),
            waker: AtomicWaker::new(),
            on_demand: Mutex::new(None),
            on_cancel: Mutex::new(None),
            length,
        });

        (
            BodySender {
                shared: shared.clone(),
            },
            Incoming {
                shared: Some(shared),
                finished: false,
            },
        )
    }
}

impl fmt::Debug for Incoming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Incoming")
            .field("empty", &self.shared.is_none())
            .field("finished", &self.finished)
            .finish()
    }
}

impl http_body::Body for Incoming {
    type Data = Bytes;
    type Error = Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        let Some(shared) = this.shared.as_ref() else {
            return Poll::Ready(None);
        };

        shared.waker.register(cx.waker());
        let mut state = shared.state.lock();

        if let Some(data) = state.items.pop_front() {
            state.requested = false;
            return Poll::Ready(Some(Ok(Frame::data(data))));
        }

        match state.outcome.clone() {
            Some(Ok(())) => {
                if let Some(trailers) = state.trailers.take() {
                    return Poll::Ready(Some(Ok(Frame::trailers(trailers))));
                }
                this.finished = true;
                return Poll::Ready(None);
            }
            Some(Err(error)) => {
                this.finished = true;
                return Poll::Ready(Some(Err(error)));
            }
            None => {}
        }

        if !state.requested {
            state.requested = true;
            drop(state);
            if shared.demand.increase(1) {
                let hook = shared.on_demand.lock().clone();
                if let Some(hook) = hook {
                    hook();
                }
            }
        }

        Poll::Pending
    }

    fn is_end_stream(&self) -> bool {
        self.finished
    }

    fn size_hint(&self) -> SizeHint {
        match self.shared.as_ref() {
            None => SizeHint::with_exact(0),
            Some(shared) => shared
                .length
                .map(SizeHint::with_exact)
                .unwrap_or_default(),
        }
    }
}

impl Drop for Incoming {
    fn drop(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };

        {
            let mut state = shared.state.lock();
            if state.outcome.is_some() {
                return;
            }
            state.cancelled = true;
        }

        let hook = shared.on_cancel.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

/// The producing half of an [`Incoming`] body.
pub(crate) struct BodySender {
    shared: Arc<Shared>,
}

impl fmt::Debug for BodySender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodySender")
            .field("demand", &self.shared.demand.get())
            .finish()
    }
}

impl BodySender {
    /// Whether the reader has asked for an item that has not been sent.
    pub(crate) fn has_demand(&self) -> bool {
        !self.shared.demand.is_fulfilled()
    }

    /// Hand one chunk to the reader, consuming one unit of demand.
    ///
    /// Gives the chunk back when there is no demand.
    pub(crate) fn try_send(&self, data: Bytes) -> Result<(), Bytes> {
        if !self.shared.demand.try_decrement() {
            return Err(data);
        }
        self.shared.state.lock().items.push_back(data);
        self.shared.waker.wake();
        Ok(())
    }

    pub(crate) fn send_trailers(&self, trailers: HeaderMap) {
        self.shared.state.lock().trailers = Some(trailers);
    }

    /// Mark the body complete. Returns `false` if it had already finished.
    pub(crate) fn complete(&self) -> bool {
        self.finish(Ok(()))
    }

    /// Fail the body. Returns `false` if it had already finished.
    pub(crate) fn fail(&self, error: Error) -> bool {
        self.finish(Err(error))
    }

    fn finish(&self, outcome: Result<(), Error>) -> bool {
        {
            let mut state = self.shared.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome);
        }
        self.shared.on_cancel.lock().take();
        self.shared.waker.wake();
        true
    }

    /// Whether the reader dropped the body before it finished.
    pub(crate) fn is_cancelled(&self) -> bool {
        self.shared.state.lock().cancelled
    }

    /// Called whenever demand rises from zero.
    pub(crate) fn on_demand<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.shared.on_demand.lock() = Some(Arc::new(hook));
    }

    /// Called once if the reader drops the body before it finishes. Runs
    /// immediately if that already happened.
    pub(crate) fn on_cancel<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_cancelled() {
            hook();
            return;
        }
        *self.shared.on_cancel.lock() = Some(Box::new(hook));

        // The reader may have dropped between the check and the store.
        if self.is_cancelled() {
            if let Some(hook) = self.shared.on_cancel.lock().take() {
                hook();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use http_body_util::BodyExt;

    use super::*;

    use static_assertions::assert_impl_all;

    assert_impl_all!(Incoming: http_body::Body, Send, Sync, Unpin);

    #[tokio::test]
    async fn empty_body_ends() {
        let body = Incoming::empty();
        let collected = body.collect().await.unwrap().to_bytes();
        assert!(collected.is_empty());
    }

    #[tokio::test]
    async fn sender_requires_demand() {
        let (tx, mut rx) = Incoming::channel(None);
        assert!(!tx.has_demand());
        assert!(tx.try_send(Bytes::from_static(b"early")).is_err());

        let wakes = Arc::new(AtomicUsize::new(0));
        let counter = wakes.clone();
        tx.on_demand(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let next = tokio::spawn(async move {
            let frame = rx.frame().await.unwrap().unwrap();
            (frame.into_data().unwrap(), rx)
        });

        while !tx.has_demand() {
            tokio::task::yield_now().await;
        }
        assert_eq!(wakes.load(Ordering::SeqCst), 1);
        tx.try_send(Bytes::from_static(b"hello")).unwrap();
        assert!(!tx.has_demand());

        let (data, rx) = next.await.unwrap();
        assert_eq!(data, Bytes::from_static(b"hello"));

        tx.complete();
        assert!(!tx.complete());
        let rest = rx.collect().await.unwrap().to_bytes();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn error_is_delivered_once() {
        let (tx, mut rx) = Incoming::channel(Some(10));
        assert_eq!(http_body::Body::size_hint(&rx).exact(), Some(10));
        tx.fail(Error::Closed);
        assert!(matches!(rx.frame().await, Some(Err(Error::Closed))));
        assert!(rx.frame().await.is_none());
    }

    #[test]
    fn dropping_unfinished_body_cancels() {
        let (tx, rx) = Incoming::channel(None);
        let cancelled = Arc::new(AtomicUsize::new(0));
        let counter = cancelled.clone();
        tx.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(rx);
        assert!(tx.is_cancelled());
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_finished_body_does_not_cancel() {
        let (tx, rx) = Incoming::channel(None);
        let cancelled = Arc::new(AtomicUsize::new(0));
        let counter = cancelled.clone();
        tx.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tx.complete();
        drop(rx);
        assert!(!tx.is_cancelled());
        assert_eq!(cancelled.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_hook_registered_late_runs_immediately() {
        let (tx, rx) = Incoming::channel(None);
        drop(rx);
        let cancelled = Arc::new(AtomicUsize::new(0));
        let counter = cancelled.clone();
        tx.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }
}
