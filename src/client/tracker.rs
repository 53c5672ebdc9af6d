//! Counting work that keeps a client busy.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counts outstanding operations (requests in flight and open HTTP/2
/// streams). Every operation holds an [`OperationGuard`]; the count drops
/// when the guard does.
#[derive(Clone, Default)]
pub(crate) struct OperationTracker {
    count: Arc<AtomicUsize>,
}

impl fmt::Debug for OperationTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationTracker")
            .field("pending", &self.pending())
            .finish()
    }
}

impl OperationTracker {
    pub(crate) fn guard(&self) -> OperationGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        OperationGuard {
            count: self.count.clone(),
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

/// Keeps one operation counted until dropped.
#[derive(Debug)]
pub(crate) struct OperationGuard {
    count: Arc<AtomicUsize>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_count_operations() {
        let tracker = OperationTracker::default();
        let first = tracker.guard();
        let second = tracker.clone().guard();
        assert_eq!(tracker.pending(), 2);
        drop(first);
        assert_eq!(tracker.pending(), 1);
        drop(second);
        assert_eq!(tracker.pending(), 0);
    }
}
