use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::CachePadded;

/// Item counting policy.
///
/// Counting every insert and remove puts an atomic read-modify-write on the
/// hot path, so containers default to [`EmptyCounter`] and answer `empty()`
/// structurally. Select [`AtomicCounter`] when `len()` matters; the
/// split-ordered hash table requires it to drive resizing.
pub trait ItemCounter: Default + Send + Sync + 'static {
    /// Records one insertion.
    fn increment(&self);

    /// Records one removal.
    fn decrement(&self);

    /// Current count. The no-op counter always returns zero, so `empty()`
    /// must never be derived from this value.
    fn value(&self) -> usize;
}

/// A counter that counts nothing.
#[derive(Debug, Default)]
pub struct EmptyCounter;

impl ItemCounter for EmptyCounter {
    #[inline]
    fn increment(&self) {}

    #[inline]
    fn decrement(&self) {}

    #[inline]
    fn value(&self) -> usize {
        0
    }
}

/// A cache-padded atomic counter.
#[derive(Default)]
pub struct AtomicCounter {
    count: CachePadded<AtomicUsize>,
}

impl ItemCounter for AtomicCounter {
    #[inline]
    fn increment(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn decrement(&self) {
        self.count.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    fn value(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for AtomicCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicCounter")
            .field("count", &self.value())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_counter_tracks() {
        let c = AtomicCounter::default();
        c.increment();
        c.increment();
        c.decrement();
        assert_eq!(c.value(), 1);
    }

    #[test]
    fn empty_counter_stays_zero() {
        let c = EmptyCounter;
        c.increment();
        assert_eq!(c.value(), 0);
    }
}
