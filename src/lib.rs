//! Tidepool: lock-free containers over safe memory reclamation.
//!
//! This crate re-exports the pieces of the tidepool workspace:
//!
//! - [`reclaim`]: the safe-memory-reclamation core — tagged atomic
//!   pointers, hazard-pointer and pass-the-buck schemes, guards.
//! - [`queue`]: Michael–Scott and Ladan-Mozes–Shavit lock-free FIFO
//!   queues.
//! - [`collections`]: the Heller lazy ordered list, a split-ordered hash
//!   map and the Ellen non-blocking binary search tree.
//! - [`utils`]: the policy primitives everything is parameterized by —
//!   back-off strategies, memory-order models, item counters, cache
//!   padding.
//!
//! # Quick start
//!
//! ```
//! use tidepool::queue::MsQueue;
//!
//! let q: MsQueue<i32> = MsQueue::new();
//! q.push(1).unwrap();
//! q.push(2).unwrap();
//! assert_eq!(q.pop(), Some(1));
//! assert_eq!(q.pop(), Some(2));
//! assert_eq!(q.pop(), None);
//! ```
//!
//! Every container takes a *traits bundle* choosing its reclamation
//! scheme (hazard pointers by default, pass-the-buck as the
//! alternative), back-off strategy, item counter, memory-ordering model
//! and statistics sink; see the member crates for the knobs.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub use tidepool_collections as collections;
pub use tidepool_queue as queue;
pub use tidepool_reclaim as reclaim;
pub use tidepool_utils as utils;

pub use tidepool_reclaim::{Gc, Guard, Hp, Ptb};
