//! Lock-free FIFO queues.
//!
//! Two algorithms with the same surface:
//!
//! - [`MsQueue`], the Michael–Scott queue: singly linked, the tail may lag
//!   by one node and any thread helps it forward.
//! - [`OptimisticQueue`], the Ladan-Mozes–Shavit queue: doubly linked,
//!   enqueue does a single CAS on the tail and writes the forward link
//!   lazily; dequeues repair the chain on the rare occasions it lags.
//!
//! Both are lock-free and reclaim dequeued nodes through
//! `tidepool-reclaim`. Policy choices — reclamation scheme, back-off,
//! item counting, memory model, statistics — are bundled in a
//! [`QueueTraits`] implementation, with [`DefaultQueueTraits`] the
//! hazard-pointer default:
//!
//! ```
//! use tidepool_queue::{MsQueue, QueueTraits};
//! use tidepool_reclaim::Ptb;
//! use tidepool_utils::{AtomicCounter, ExpBackoff, RelaxedModel};
//!
//! // A custom bundle: pass-the-buck reclamation, exponential back-off,
//! // a real item counter.
//! struct MyTraits;
//!
//! impl QueueTraits for MyTraits {
//!     type Gc = Ptb;
//!     type Backoff = ExpBackoff;
//!     type ItemCounter = AtomicCounter;
//!     type MemoryModel = RelaxedModel;
//!     type Stat = tidepool_queue::DummyQueueStat;
//! }
//!
//! let q: MsQueue<u32, MyTraits> = MsQueue::new();
//! assert_eq!(q.push(1), Ok(()));
//! assert_eq!(q.pop(), Some(1));
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

use tidepool_reclaim::{Gc, Hp};
use tidepool_utils::{Backoff, ItemCounter, MemoryModel};
use tidepool_utils::{EmptyCounter, NoBackoff, RelaxedModel};

mod msqueue;
mod optimistic;
mod stat;

pub use msqueue::MsQueue;
pub use optimistic::OptimisticQueue;
pub use stat::{CountingQueueStat, DummyQueueStat, QueueStat};

/// The policy bundle of a queue.
///
/// Implement this on a zero-sized marker type to pick a reclamation
/// scheme, back-off strategy, item counter, memory-ordering model and
/// statistics sink; all dispatch is static.
pub trait QueueTraits: 'static {
    /// Safe-memory-reclamation scheme.
    type Gc: Gc;
    /// Back-off applied after lost CASes.
    type Backoff: Backoff;
    /// Item counting policy. With [`EmptyCounter`], `len()` is always 0.
    type ItemCounter: ItemCounter;
    /// Memory-ordering policy for the linkage fields.
    type MemoryModel: MemoryModel;
    /// Statistics sink.
    type Stat: QueueStat;
}

/// Hazard pointers, no back-off, no item counting, acquire/release
/// orderings, no statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultQueueTraits;

impl QueueTraits for DefaultQueueTraits {
    type Gc = Hp;
    type Backoff = NoBackoff;
    type ItemCounter = EmptyCounter;
    type MemoryModel = RelaxedModel;
    type Stat = DummyQueueStat;
}
