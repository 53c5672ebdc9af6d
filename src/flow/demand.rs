use std::sync::atomic::{AtomicU64, Ordering};

/// A saturating, lock-free counter of outstanding demand.
///
/// Consumers call [`Demand::increase`] to ask for more items and producers
/// call [`Demand::try_decrement`] before emitting one. The counter never
/// wraps: requesting more than `u64::MAX` saturates, which is treated as
/// unbounded demand.
#[derive(Debug, Default)]
pub struct Demand {
    value: AtomicU64,
}

impl Demand {
    /// Create a demand counter starting at zero.
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Add `n` units of demand.
    ///
    /// Returns `true` when the counter moved from zero to a positive value,
    /// which is the moment a stalled producer needs to be woken.
    ///
    /// # Panics
    ///
    /// Panics if `n` is zero.
    pub fn increase(&self, n: u64) -> bool {
        assert!(n > 0, "demand must be increased by a positive amount");
        let previous = self
            .value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_add(n))
            })
            .unwrap_or_else(|v| v);
        previous == 0
    }

    /// Consume one unit of demand, if any is available.
    pub fn try_decrement(&self) -> bool {
        self.value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
            .is_ok()
    }

    /// Whether all requested demand has been consumed.
    pub fn is_fulfilled(&self) -> bool {
        self.value.load(Ordering::Acquire) == 0
    }

    /// Current outstanding demand.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }
}
