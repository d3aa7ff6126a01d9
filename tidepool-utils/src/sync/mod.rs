//! Synchronization building blocks.

mod spin;

pub use spin::{SpinGuard, SpinLock};
