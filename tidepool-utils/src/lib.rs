//! Policy primitives shared by the tidepool crates.
//!
//! Every tidepool container is parameterized over a small set of orthogonal
//! policies: how to back off under contention, which memory-ordering regime
//! to run atomics under, and how (or whether) to count items. This crate
//! holds those policies together with a couple of low-level building blocks
//! (cache-line padding, a spin lock) so that the container crates agree on
//! a single definition of each.
//!
//! All policies are zero-sized or word-sized types selected at compile time;
//! none of them introduce an indirect call on a CAS loop's hot path.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

mod atomicity;
mod backoff;
mod cache_padded;
mod ordering;

pub use atomicity::{AtomicCounter, EmptyCounter, ItemCounter};
pub use backoff::{Backoff, ExpBackoff, NoBackoff, PauseBackoff, YieldBackoff};
pub use cache_padded::CachePadded;
pub use ordering::{failure_order, load_order, store_order, MemoryModel, RelaxedModel, SeqCstModel};

pub mod sync;
