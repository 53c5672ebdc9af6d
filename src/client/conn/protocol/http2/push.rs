//! Server push.
//!
//! Pushes are only accepted for requests which carry a [`PushPromises`]
//! extension. Everything else is refused on arrival.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::body::Response;
use crate::client::Error;

/// Receives server pushes for one request.
pub trait PushPromiseHandler: Send + Sync + 'static {
    /// Whether to accept the promised request. Declined promises are
    /// cancelled.
    fn accept(&self, request: &http::Request<()>) -> bool;

    /// An accepted push, once its response head has arrived (or failed).
    fn pushed(&self, request: http::Request<()>, response: Result<Response, Error>);
}

/// Request extension which opts a request in to server push.
#[derive(Clone)]
pub struct PushPromises(Arc<dyn PushPromiseHandler>);

impl PushPromises {
    /// Wrap a handler.
    pub fn new<H: PushPromiseHandler>(handler: H) -> Self {
        Self(Arc::new(handler))
    }

    /// Accept every push and deliver it on a channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PushedResponse>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(ChannelHandler(tx)), rx)
    }

    pub(crate) fn accept(&self, request: &http::Request<()>) -> bool {
        self.0.accept(request)
    }

    pub(crate) fn pushed(&self, request: http::Request<()>, response: Result<Response, Error>) {
        self.0.pushed(request, response)
    }
}

impl fmt::Debug for PushPromises {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PushPromises").finish()
    }
}

/// A promised request and its response.
pub type PushedResponse = (http::Request<()>, Result<Response, Error>);

struct ChannelHandler(mpsc::UnboundedSender<PushedResponse>);

impl PushPromiseHandler for ChannelHandler {
    fn accept(&self, _request: &http::Request<()>) -> bool {
        !self.0.is_closed()
    }

    fn pushed(&self, request: http::Request<()>, response: Result<Response, Error>) {
        let _ = self.0.send((request, response));
    }
}

/// Why a push promise was turned down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum PushRefusal {
    /// The promised id was not the next even id.
    OutOfSequence,
    /// The parent request did not ask for pushes.
    NotAccepting,
    /// Too many pushes are already open.
    LimitReached,
    /// The handler declined this promise.
    Declined,
}

impl PushRefusal {
    pub(super) fn code(self) -> super::ErrorCode {
        use super::ErrorCode;
        match self {
            PushRefusal::OutOfSequence => ErrorCode::PROTOCOL_ERROR,
            PushRefusal::NotAccepting | PushRefusal::LimitReached => ErrorCode::REFUSED_STREAM,
            PushRefusal::Declined => ErrorCode::CANCEL,
        }
    }
}
