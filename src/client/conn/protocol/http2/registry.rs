//! Shared HTTP/2 connections.
//!
//! An HTTP/2 connection serves any number of exchanges at once, so it is
//! never checked out of the idle pool. It lives here, keyed like the pool,
//! from the moment its handshake succeeds until it shuts down.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use super::connection::Http2Connection;
use crate::client::pool::CacheKey;

#[derive(Default)]
struct Inner {
    connections: HashMap<CacheKey, Vec<Arc<Http2Connection>>>,
    http1_only: HashSet<CacheKey>,
}

/// Every open HTTP/2 connection a client owns.
#[derive(Clone, Default)]
pub(crate) struct Http2Registry {
    inner: Arc<Mutex<Inner>>,
}

impl fmt::Debug for Http2Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Http2Registry")
            .field("keys", &inner.connections.len())
            .field("http1_only", &inner.http1_only.len())
            .finish()
    }
}

impl Http2Registry {
    /// A connection for `key` which can take another stream.
    pub(crate) fn get(&self, key: &CacheKey) -> Option<Arc<Http2Connection>> {
        let mut inner = self.inner.lock();
        let connections = inner.connections.get_mut(key)?;
        connections.retain(|conn| !conn.is_closed());
        let found = connections.iter().find(|conn| conn.is_usable()).cloned();
        if connections.is_empty() {
            inner.connections.remove(key);
        }
        found
    }

    /// Share `conn` under `key` until it shuts down.
    pub(crate) fn insert(&self, key: CacheKey, conn: Arc<Http2Connection>) {
        trace!(%key, conn = conn.id(), "registering http2 connection");
        self.inner
            .lock()
            .connections
            .entry(key.clone())
            .or_default()
            .push(conn.clone());

        let registry: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        let id = conn.id();
        conn.on_shutdown(move || {
            if let Some(inner) = registry.upgrade() {
                Http2Registry { inner }.remove(&key, id);
            }
        });
    }

    fn remove(&self, key: &CacheKey, id: u64) {
        let mut inner = self.inner.lock();
        if let Some(connections) = inner.connections.get_mut(key) {
            connections.retain(|conn| conn.id() != id);
            if connections.is_empty() {
                inner.connections.remove(key);
            }
        }
    }

    /// Remember that `key` answered an upgrade attempt with HTTP/1.1.
    pub(crate) fn mark_http1_only(&self, key: CacheKey) {
        self.inner.lock().http1_only.insert(key);
    }

    pub(crate) fn is_http1_only(&self, key: &CacheKey) -> bool {
        self.inner.lock().http1_only.contains(key)
    }

    /// Retire every connection: each closes once its open streams finish.
    pub(crate) fn close_all(&self) {
        let connections: Vec<_> = self
            .inner
            .lock()
            .connections
            .drain()
            .flat_map(|(_, conns)| conns)
            .collect();
        for conn in connections {
            conn.retire();
        }
    }
}
