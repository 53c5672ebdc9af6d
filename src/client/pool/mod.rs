//! Connection Pooling for Clients
//!
//! Idle HTTP/1.1 connections wait here between exchanges, keyed by
//! [`CacheKey`]. HTTP/2 connections are never parked here: they stay shared
//! while open and are tracked by the HTTP/2 registry instead.
//!
//! Every idle connection carries a deadline. A background task wakes at the
//! nearest deadline and closes whatever has expired, so stale sockets are
//! released even if no request ever asks for that host again.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{trace, Instrument as _};

mod idle;
mod key;

use self::idle::IdleConnections;
pub use self::key::CacheKey;

/// A connection that can be parked in the pool.
///
/// Connections must report whether they remain open, and close when told
/// to, since the pool evicts without handing the connection back.
pub trait PoolableConnection: Send + Sized + 'static {
    /// Returns `true` if the connection is open.
    fn is_open(&self) -> bool;

    /// Close the connection.
    fn close(&self);
}

/// Configuration for a connection pool.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// How long a connection may sit idle before it is closed.
    pub idle_timeout: Option<Duration>,

    /// The maximum number of idle connections per key.
    pub max_idle_per_host: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            idle_timeout: Some(Duration::from_secs(90)),
            max_idle_per_host: 32,
        }
    }
}

/// A pool of idle connections to remote hosts.
pub(crate) struct Pool<C: PoolableConnection> {
    inner: Arc<Mutex<PoolInner<C>>>,
}

impl<C: PoolableConnection> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: PoolableConnection> fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Pool")
            .field("config", &inner.config)
            .field("keys", &inner.idle.len())
            .finish()
    }
}

struct PoolInner<C> {
    config: Config,
    idle: HashMap<CacheKey, IdleConnections<C>>,
    purger: Option<Arc<Notify>>,
    closed: bool,
}

impl<C> Drop for PoolInner<C> {
    fn drop(&mut self) {
        if let Some(purger) = self.purger.take() {
            purger.notify_one();
        }
    }
}

impl<C: PoolableConnection> Pool<C> {
    pub(crate) fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                config,
                idle: HashMap::new(),
                purger: None,
                closed: false,
            })),
        }
    }

    /// Take an idle connection for `key`, if one is usable.
    #[cfg_attr(not(tarpaulin), tracing::instrument(skip_all, fields(%key), level = "trace"))]
    pub(crate) fn pop(&self, key: &CacheKey) -> Option<C> {
        let mut inner = self.inner.lock();
        let idle_timeout = inner.config.idle_timeout;

        let idle = inner.idle.get_mut(key)?;
        let connection = idle.pop(idle_timeout);
        if idle.is_empty() {
            trace!("removing empty idle list");
            inner.idle.remove(key);
        }
        connection
    }

    /// Park a connection until it is needed again or expires.
    #[cfg_attr(not(tarpaulin), tracing::instrument(skip_all, fields(%key), level = "trace"))]
    pub(crate) fn push(&self, key: CacheKey, connection: C) {
        let mut inner = self.inner.lock();
        if inner.closed || !connection.is_open() {
            trace!("connection not returned to pool");
            drop(inner);
            connection.close();
            return;
        }

        let max = inner.config.max_idle_per_host;
        if max == 0 {
            drop(inner);
            connection.close();
            return;
        }

        trace!("open connection returned to pool");
        inner.idle.entry(key).or_default().push(connection, max);

        let purger = match &inner.purger {
            Some(purger) => purger.clone(),
            None if inner.config.idle_timeout.is_some() => {
                let purger = Arc::new(Notify::new());
                inner.purger = Some(purger.clone());
                drop(inner);
                self.spawn_purger(purger.clone());
                purger
            }
            None => return,
        };
        purger.notify_one();
    }

    /// Close expired connections. Returns how long until the next one
    /// expires, or `None` when nothing in the pool has a deadline.
    pub(crate) fn purge_expired(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let idle_timeout = inner.config.idle_timeout;

        let mut next: Option<Instant> = None;
        inner.idle.retain(|_, idle| {
            if let Some(deadline) = idle.purge(now, idle_timeout) {
                next = Some(next.map_or(deadline, |n| n.min(deadline)));
            }
            !idle.is_empty()
        });

        next.map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Close every idle connection and refuse new ones.
    pub(crate) fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        for (_, mut idle) in inner.idle.drain() {
            idle.close_all();
        }
        if let Some(purger) = inner.purger.take() {
            purger.notify_one();
        }
    }

    /// Number of idle connections across all keys.
    #[cfg(test)]
    pub(crate) fn idle_count(&self) -> usize {
        self.inner.lock().idle.values().map(IdleConnections::len).sum()
    }

    fn spawn_purger(&self, notify: Arc<Notify>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            trace!("no runtime, idle connections expire on checkout only");
            return;
        };

        let weak: Weak<Mutex<PoolInner<C>>> = Arc::downgrade(&self.inner);
        let span = tracing::trace_span!("pool-purge");
        handle.spawn(
            async move {
                loop {
                    let wait = {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        let pool = Pool { inner };
                        if pool.inner.lock().closed {
                            break;
                        }
                        pool.purge_expired()
                    };

                    match wait {
                        Some(wait) => {
                            tokio::select! {
                                _ = tokio::time::sleep(wait) => {}
                                _ = notify.notified() => {}
                            }
                        }
                        None => notify.notified().await,
                    }
                }
                trace!("purge task finished");
            }
            .instrument(span),
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::client::conn::ConnectionKind;

    use super::*;

    #[derive(Debug, Clone)]
    pub(crate) struct MockConnection {
        pub(crate) id: u64,
        open: Arc<AtomicBool>,
    }

    impl MockConnection {
        pub(crate) fn open() -> Self {
            Self::with_id(0)
        }

        pub(crate) fn with_id(id: u64) -> Self {
            Self {
                id,
                open: Arc::new(AtomicBool::new(true)),
            }
        }
    }

    impl PoolableConnection for MockConnection {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.open.store(false, Ordering::SeqCst);
        }
    }

    fn key(host: &str) -> CacheKey {
        CacheKey::new(ConnectionKind::PlainDirect, host, 80, None)
    }

    #[test]
    fn pop_matches_key() {
        let pool = Pool::new(Config {
            idle_timeout: None,
            ..Default::default()
        });
        pool.push(key("a"), MockConnection::with_id(1));
        assert!(pool.pop(&key("b")).is_none());
        assert_eq!(pool.pop(&key("a")).unwrap().id, 1);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn closed_connections_are_not_pooled() {
        let pool = Pool::new(Config::default());
        let conn = MockConnection::open();
        conn.close();
        pool.push(key("a"), conn);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn close_drains() {
        let pool = Pool::new(Config {
            idle_timeout: None,
            ..Default::default()
        });
        let conn = MockConnection::open();
        let handle = conn.clone();
        pool.push(key("a"), conn);
        pool.close();
        assert!(!handle.is_open());

        let late = MockConnection::open();
        let handle = late.clone();
        pool.push(key("a"), late);
        assert!(!handle.is_open());
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_task_closes_expired() {
        let pool = Pool::new(Config {
            idle_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let conn = MockConnection::open();
        let handle = conn.clone();
        pool.push(key("a"), conn);

        assert!(pool.purge_expired().unwrap() <= Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;

        assert_eq!(pool.idle_count(), 0);
        assert!(!handle.is_open());
    }
}
