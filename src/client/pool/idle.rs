use std::time::Duration;

use tokio::time::Instant;

use tracing::trace;

use super::PoolableConnection;

#[derive(Debug)]
struct Idle<T> {
    at: Instant,
    inner: T,
}

impl<T> Idle<T> {
    fn new(inner: T) -> Self {
        Self {
            at: Instant::now(),
            inner,
        }
    }

    fn is_expired(&self, now: Instant, idle_timeout: Option<Duration>) -> bool {
        idle_timeout
            .filter(|timeout| !timeout.is_zero())
            .map(|timeout| now.saturating_duration_since(self.at) >= timeout)
            .unwrap_or(false)
    }
}

/// Idle connections for one key, oldest first.
#[derive(Debug)]
pub(super) struct IdleConnections<T> {
    inner: Vec<Idle<T>>,
}

impl<T> Default for IdleConnections<T> {
    fn default() -> Self {
        Self { inner: Vec::new() }
    }
}

impl<T> IdleConnections<T>
where
    T: PoolableConnection,
{
    /// Add a connection, evicting the oldest ones beyond `max`.
    pub(super) fn push(&mut self, inner: T, max: usize) {
        self.inner.push(Idle::new(inner));
        while self.inner.len() > max {
            let evicted = self.inner.remove(0);
            trace!("evicting oldest idle connection");
            evicted.inner.close();
        }
    }

    /// Take the most recently returned connection which is still usable.
    /// Expired and closed connections found on the way are closed and dropped.
    pub(super) fn pop(&mut self, idle_timeout: Option<Duration>) -> Option<T> {
        let now = Instant::now();
        trace!("checking {} idle connections", self.len());

        while let Some(entry) = self.inner.pop() {
            if entry.is_expired(now, idle_timeout) {
                trace!("found expired connection");
                entry.inner.close();
                continue;
            }

            if entry.inner.is_open() {
                trace!("found idle connection");
                return Some(entry.inner);
            }

            trace!("found closed connection");
        }

        None
    }

    /// Close and drop connections past their deadline. Returns when the next
    /// remaining connection will expire.
    pub(super) fn purge(&mut self, now: Instant, idle_timeout: Option<Duration>) -> Option<Instant> {
        self.inner.retain(|entry| {
            if entry.is_expired(now, idle_timeout) || !entry.inner.is_open() {
                entry.inner.close();
                false
            } else {
                true
            }
        });

        let timeout = idle_timeout.filter(|timeout| !timeout.is_zero())?;
        self.inner.iter().map(|entry| entry.at + timeout).min()
    }

    pub(super) fn close_all(&mut self) {
        for entry in self.inner.drain(..) {
            entry.inner.close();
        }
    }

    pub(super) fn len(&self) -> usize {
        self.inner.len()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
