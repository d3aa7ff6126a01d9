use std::fmt;
use std::hint;
use std::thread;

/// A contention back-off strategy.
///
/// Containers call [`backoff`](Backoff::backoff) after each failed CAS in a
/// contended loop and [`reset`](Backoff::reset) once the loop makes
/// progress. The strategy is a compile-time choice per container, so the
/// empty strategy compiles down to nothing.
pub trait Backoff {
    /// Creates the strategy in its initial state.
    fn new() -> Self;

    /// Backs off once.
    fn backoff(&mut self);

    /// Resets the strategy to its initial state.
    #[inline]
    fn reset(&mut self) {}
}

/// No back-off: retry immediately.
#[derive(Debug, Default)]
pub struct NoBackoff;

impl Backoff for NoBackoff {
    #[inline]
    fn new() -> Self {
        NoBackoff
    }

    #[inline]
    fn backoff(&mut self) {}
}

/// Issues a single CPU pause hint per call.
#[derive(Debug, Default)]
pub struct PauseBackoff;

impl Backoff for PauseBackoff {
    #[inline]
    fn new() -> Self {
        PauseBackoff
    }

    #[inline]
    fn backoff(&mut self) {
        hint::spin_loop();
    }
}

/// Yields the scheduler once per call.
#[derive(Debug, Default)]
pub struct YieldBackoff;

impl Backoff for YieldBackoff {
    #[inline]
    fn new() -> Self {
        YieldBackoff
    }

    #[inline]
    fn backoff(&mut self) {
        thread::yield_now();
    }
}

/// Exponential back-off: spins doubling up to `CEILING`, then yields and
/// starts over.
///
/// `CEILING` is the log2 of the largest spin burst, so the default of 10
/// tops out at 1024 pause hints before falling back to a yield.
pub struct ExpBackoff<const CEILING: u32 = 10> {
    step: u32,
}

impl<const CEILING: u32> Backoff for ExpBackoff<CEILING> {
    #[inline]
    fn new() -> Self {
        ExpBackoff { step: 0 }
    }

    #[inline]
    fn backoff(&mut self) {
        if self.step <= CEILING {
            for _ in 0..1u32 << self.step {
                hint::spin_loop();
            }
            self.step += 1;
        } else {
            thread::yield_now();
            self.step = 0;
        }
    }

    #[inline]
    fn reset(&mut self) {
        self.step = 0;
    }
}

impl<const CEILING: u32> fmt::Debug for ExpBackoff<CEILING> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpBackoff").field("step", &self.step).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exp_backoff_doubles_then_wraps() {
        let mut b = ExpBackoff::<3>::new();
        for _ in 0..4 {
            b.backoff();
        }
        assert_eq!(b.step, 4);
        // Past the ceiling: yields and resets.
        b.backoff();
        assert_eq!(b.step, 0);
    }

    #[test]
    fn reset_restarts_the_ramp() {
        let mut b = ExpBackoff::<10>::new();
        b.backoff();
        b.backoff();
        b.reset();
        assert_eq!(b.step, 0);
    }
}
