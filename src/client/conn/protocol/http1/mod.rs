//! HTTP/1.1 client engine.
//!
//! An [`Http1Connection`] runs one exchange at a time over a tube. Request
//! heads and bodies are written straight to the tube; responses are read
//! through an [`Http1Receiver`](receiver::Http1Receiver) which hands bytes
//! to a head parser and then a body parser, only as fast as the body's
//! reader asks for them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

mod content;
pub(crate) mod decode;
pub(crate) mod encode;
pub(crate) mod exchange;
mod receiver;

use self::receiver::Http1Receiver;
use crate::client::conn::transport::TransportStream;
use crate::client::conn::tube::{Probe, Tube};
use crate::client::pool::{CacheKey, Pool, PoolableConnection};
use crate::info::{ConnectionInfo, HasConnectionInfo};

/// HTTP/1.1 connection settings.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Http1Config {
    /// Largest response head accepted, in bytes.
    pub max_head_size: usize,

    /// Longest chunk-size line accepted in a chunked body.
    pub max_chunk_line_size: usize,

    /// How long to wait for `100 Continue` before sending the body anyway.
    /// `None` waits for the server's answer indefinitely.
    pub expect_continue_timeout: Option<Duration>,
}

impl Default for Http1Config {
    fn default() -> Self {
        Self {
            max_head_size: 64 * 1024,
            max_chunk_line_size: 4096,
            expect_continue_timeout: Some(Duration::from_secs(1)),
        }
    }
}

/// An HTTP/1.1 connection.
///
/// Clones share the same tube. While idle it lives in the pool; while an
/// exchange runs, the exchange holds it.
#[derive(Debug, Clone)]
pub(crate) struct Http1Connection {
    tube: Tube,
    receiver: Arc<Http1Receiver>,
    config: Arc<Http1Config>,
    proxied: bool,
    exchanges: Arc<AtomicUsize>,
}

impl Http1Connection {
    /// Start speaking HTTP/1.1 over `stream`. `proxied` means requests go
    /// to a plain proxy and use the absolute-form target.
    pub(crate) fn handshake(stream: TransportStream, config: Arc<Http1Config>, proxied: bool) -> Self {
        Self::from_tube(Tube::spawn(stream), config, proxied)
    }

    pub(crate) fn from_tube(tube: Tube, config: Arc<Http1Config>, proxied: bool) -> Self {
        let receiver = Http1Receiver::attach(&tube);
        trace!(conn = tube.id(), proxied, "http1 connection");
        Self {
            tube,
            receiver,
            config,
            proxied,
            exchanges: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.tube.id()
    }

    pub(crate) fn tube(&self) -> &Tube {
        &self.tube
    }

    pub(super) fn receiver(&self) -> &Arc<Http1Receiver> {
        &self.receiver
    }

    pub(crate) fn config(&self) -> &Http1Config {
        &self.config
    }

    pub(crate) fn is_proxied(&self) -> bool {
        self.proxied
    }

    /// Count a new exchange. Returns whether the connection was used before.
    fn begin_exchange(&self) -> bool {
        let reused = self.exchanges.fetch_add(1, Ordering::AcqRel) > 0;
        self.receiver.begin(reused);
        reused
    }

    /// Number of exchanges started on this connection.
    pub(crate) fn exchanges(&self) -> usize {
        self.exchanges.load(Ordering::Acquire)
    }

    /// Check an idle connection before reuse.
    pub(crate) async fn probe(&self) -> Probe {
        if self.receiver.has_unread() {
            self.tube.poison();
            return Probe::UnexpectedData;
        }
        if self.receiver.is_ended() {
            return Probe::Closed;
        }
        self.tube.probe().await
    }

    pub(crate) fn close(&self) {
        self.tube.close();
    }

    /// Park the connection in `pool` if it can serve another exchange,
    /// otherwise close it.
    pub(crate) fn close_or_return_to_cache(self, pool: &Pool<Self>, key: CacheKey) {
        if self.is_open() {
            trace!(conn = self.id(), %key, "returning connection to pool");
            pool.push(key, self);
        } else {
            self.close();
        }
    }
}

impl PoolableConnection for Http1Connection {
    fn is_open(&self) -> bool {
        !self.tube.is_closed()
            && !self.tube.is_poisoned()
            && !self.receiver.has_unread()
            && !self.receiver.is_ended()
    }

    fn close(&self) {
        self.tube.close();
    }
}

impl HasConnectionInfo for Http1Connection {
    fn info(&self) -> ConnectionInfo {
        self.tube.info()
    }
}
