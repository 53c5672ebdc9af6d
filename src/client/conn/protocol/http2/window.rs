//! Flow-control accounting.
//!
//! [`WindowController`] tracks how much we may send. [`WindowUpdateSender`]
//! tracks how much the peer has sent us and when to grant more.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::frame::MAX_WINDOW_SIZE;
use crate::client::{Error, ProtocolError};

#[derive(Debug)]
struct Windows {
    connection: i64,
    streams: HashMap<u32, i64>,
    closed: Option<Error>,
}

/// Send credit for the connection and each of its streams.
///
/// Stream windows may go negative when the peer shrinks
/// SETTINGS_INITIAL_WINDOW_SIZE; such a stream gets nothing until
/// WINDOW_UPDATE frames lift it back above zero.
#[derive(Debug)]
pub(crate) struct WindowController {
    windows: Mutex<Windows>,
    changed: Notify,
}

impl WindowController {
    pub(crate) fn new(connection: u32) -> Self {
        Self {
            windows: Mutex::new(Windows {
                connection: i64::from(connection),
                streams: HashMap::new(),
                closed: None,
            }),
            changed: Notify::new(),
        }
    }

    pub(crate) fn register_stream(&self, stream_id: u32, initial: u32) {
        self.windows
            .lock()
            .streams
            .insert(stream_id, i64::from(initial));
    }

    pub(crate) fn remove_stream(&self, stream_id: u32) {
        self.windows.lock().streams.remove(&stream_id);
        self.changed.notify_waiters();
    }

    /// Take up to `wanted` bytes of credit without waiting.
    ///
    /// Returns zero when either window is exhausted, and an error once the
    /// stream is gone or the connection has closed.
    pub(crate) fn try_acquire(&self, stream_id: u32, wanted: usize) -> Result<usize, Error> {
        let mut windows = self.windows.lock();
        if let Some(error) = &windows.closed {
            return Err(error.clone());
        }
        let connection = windows.connection;
        let Some(stream) = windows.streams.get_mut(&stream_id) else {
            return Err(Error::Closed);
        };

        let available = connection.min(*stream).max(0);
        let granted = (wanted as i64).min(available);
        *stream -= granted;
        windows.connection -= granted;
        Ok(granted as usize)
    }

    /// Take at least one byte of credit, waiting for WINDOW_UPDATE if needed.
    pub(crate) async fn acquire(&self, stream_id: u32, wanted: usize) -> Result<usize, Error> {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let granted = self.try_acquire(stream_id, wanted)?;
            if granted > 0 || wanted == 0 {
                return Ok(granted);
            }
            changed.await;
        }
    }

    pub(crate) fn increase_connection(&self, increment: u32) -> Result<(), ProtocolError> {
        {
            let mut windows = self.windows.lock();
            let updated = windows.connection + i64::from(increment);
            if updated > i64::from(MAX_WINDOW_SIZE) {
                return Err(ProtocolError::WindowOverflow);
            }
            windows.connection = updated;
        }
        self.changed.notify_waiters();
        Ok(())
    }

    /// Credit for a stream we no longer track is dropped.
    pub(crate) fn increase_stream(&self, stream_id: u32, increment: u32) -> Result<(), ProtocolError> {
        {
            let mut windows = self.windows.lock();
            let Some(window) = windows.streams.get_mut(&stream_id) else {
                return Ok(());
            };
            let updated = *window + i64::from(increment);
            if updated > i64::from(MAX_WINDOW_SIZE) {
                return Err(ProtocolError::WindowOverflow);
            }
            *window = updated;
        }
        self.changed.notify_waiters();
        Ok(())
    }

    /// Shift every stream window by the change in INITIAL_WINDOW_SIZE.
    pub(crate) fn adjust_initial(&self, delta: i64) -> Result<(), ProtocolError> {
        if delta == 0 {
            return Ok(());
        }
        {
            let mut windows = self.windows.lock();
            if windows
                .streams
                .values()
                .any(|window| window + delta > i64::from(MAX_WINDOW_SIZE))
            {
                return Err(ProtocolError::WindowOverflow);
            }
            for window in windows.streams.values_mut() {
                *window += delta;
            }
        }
        self.changed.notify_waiters();
        Ok(())
    }

    /// Fail every current and future acquisition.
    pub(crate) fn close(&self, error: Error) {
        {
            let mut windows = self.windows.lock();
            if windows.closed.is_none() {
                windows.closed = Some(error);
            }
        }
        self.changed.notify_waiters();
    }

    #[cfg(test)]
    pub(crate) fn stream_window(&self, stream_id: u32) -> Option<i64> {
        self.windows.lock().streams.get(&stream_id).copied()
    }

    #[cfg(test)]
    pub(crate) fn connection_window(&self) -> i64 {
        self.windows.lock().connection
    }
}

/// Receive-side accounting for one window.
///
/// Consumed bytes are returned to the peer in one WINDOW_UPDATE once half of
/// the window has been used.
#[derive(Debug, Clone)]
pub(crate) struct WindowUpdateSender {
    window: u32,
    consumed: u32,
}

impl WindowUpdateSender {
    pub(crate) fn new(window: u32) -> Self {
        Self {
            window,
            consumed: 0,
        }
    }

    /// Record `len` consumed bytes, returning the increment to send if one
    /// is due.
    pub(crate) fn consume(&mut self, len: u32) -> Option<u32> {
        self.consumed = self.consumed.saturating_add(len);
        if self.consumed > 0 && self.consumed >= self.window / 2 {
            return Some(std::mem::take(&mut self.consumed));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn never_grants_more_than_both_windows() {
        let windows = WindowController::new(100);
        windows.register_stream(1, 60);
        windows.register_stream(3, 60);

        assert_eq!(windows.try_acquire(1, 1000).unwrap(), 60);
        assert_eq!(windows.try_acquire(1, 1).unwrap(), 0);
        assert_eq!(windows.try_acquire(3, 1000).unwrap(), 40);
        assert_eq!(windows.connection_window(), 0);
        assert_eq!(windows.try_acquire(3, 1).unwrap(), 0);
    }

    #[test]
    fn unknown_stream_is_an_error() {
        let windows = WindowController::new(100);
        assert!(windows.try_acquire(5, 10).is_err());
    }

    #[test]
    fn initial_window_changes_are_relative() {
        let windows = WindowController::new(1 << 20);
        windows.register_stream(1, 65_535);
        assert_eq!(windows.try_acquire(1, 35_535).unwrap(), 35_535);

        windows.adjust_initial(-1000).unwrap();
        assert_eq!(windows.stream_window(1), Some(29_000));

        windows.adjust_initial(-40_000).unwrap();
        assert_eq!(windows.stream_window(1), Some(-11_000));
        assert_eq!(windows.try_acquire(1, 10).unwrap(), 0);
    }

    #[test]
    fn overflow_is_rejected() {
        let windows = WindowController::new(MAX_WINDOW_SIZE);
        windows.register_stream(1, 10);
        assert_eq!(
            windows.increase_connection(1),
            Err(ProtocolError::WindowOverflow)
        );
        assert_eq!(
            windows.increase_stream(1, MAX_WINDOW_SIZE),
            Err(ProtocolError::WindowOverflow)
        );
        assert_eq!(
            windows.adjust_initial(i64::from(MAX_WINDOW_SIZE)),
            Err(ProtocolError::WindowOverflow)
        );
        assert_eq!(windows.stream_window(1), Some(10));
    }

    #[tokio::test]
    async fn acquire_waits_for_window_update() {
        let windows = Arc::new(WindowController::new(10));
        windows.register_stream(1, 10);
        assert_eq!(windows.acquire(1, 10).await.unwrap(), 10);

        let waiter = tokio::spawn({
            let windows = windows.clone();
            async move { windows.acquire(1, 100).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        windows.increase_stream(1, 50).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        windows.increase_connection(20).unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), 20);
    }

    #[tokio::test]
    async fn removal_wakes_waiters() {
        let windows = Arc::new(WindowController::new(0));
        windows.register_stream(1, 10);
        let waiter = tokio::spawn({
            let windows = windows.clone();
            async move { windows.acquire(1, 1).await }
        });
        tokio::task::yield_now().await;
        windows.remove_stream(1);
        assert!(waiter.await.unwrap().is_err());
    }

    #[test]
    fn updates_are_batched() {
        let mut sender = WindowUpdateSender::new(100);
        assert_eq!(sender.consume(20), None);
        assert_eq!(sender.consume(29), None);
        assert_eq!(sender.consume(1), Some(50));
        assert_eq!(sender.consume(0), None);
        assert_eq!(sender.consume(60), Some(60));
    }
}
