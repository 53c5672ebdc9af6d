use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_core::future::BoxFuture;
use futures_util::FutureExt as _;

use super::exchange::multi::MultiExchange;
use super::tracker::OperationGuard;
use super::Error;
use crate::body::{Request, Response};

/// A future that resolves to an HTTP response.
///
/// Dropping the future abandons the request. Use [`cancel`](Self::cancel)
/// or a [`CancelHandle`] to stop it while still observing the outcome.
pub struct ResponseFuture {
    inner: BoxFuture<'static, Result<Response, Error>>,
    handle: CancelHandle,
}

impl fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFuture")
            .field("handle", &self.handle)
            .finish()
    }
}

impl ResponseFuture {
    pub(super) fn new(multi: Arc<MultiExchange>, request: Request, guard: OperationGuard) -> Self {
        let handle = CancelHandle {
            multi: multi.clone(),
        };
        let inner = async move {
            let _guard = guard;
            multi.response(request).await
        }
        .boxed();
        Self { inner, handle }
    }

    /// Cancel the request. See [`CancelHandle::cancel`].
    pub fn cancel(&self, may_interrupt: bool) {
        self.handle.cancel(may_interrupt);
    }

    /// A handle which can cancel the request from elsewhere.
    pub fn handle(&self) -> CancelHandle {
        self.handle.clone()
    }
}

impl Future for ResponseFuture {
    type Output = Result<Response, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

/// Cancels a request sent with [`Client::send_async`](super::Client::send_async).
#[derive(Clone)]
pub struct CancelHandle {
    multi: Arc<MultiExchange>,
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.multi.is_cancelled())
            .finish()
    }
}

impl CancelHandle {
    /// Stop the request. No further attempts (retries or redirects) are
    /// made. With `may_interrupt` the attempt in flight is torn down and
    /// the request fails with a cancellation error; otherwise the attempt
    /// in flight is allowed to finish.
    pub fn cancel(&self, may_interrupt: bool) {
        self.multi.cancel(may_interrupt);
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.multi.is_cancelled()
    }
}
