//! Lock-free ordered collections.
//!
//! Three containers sharing one policy surface:
//!
//! - [`LazyList`], the Heller et al. lazy ordered list: per-node spin
//!   locks with optimistic validation for writers, lock-free reads that
//!   never take a lock.
//! - [`SplitListMap`], a split-ordered hash table: one lazy list ordered
//!   by bit-reversed hash, buckets as sentinel pointers into it, resize by
//!   table doubling without moving a single element.
//! - [`EllenTree`], the Ellen et al. non-blocking external binary search
//!   tree: keys live in leaves, pending operations are described by
//!   flag/mark descriptors that any thread can help to completion.
//!
//! All containers reclaim removed nodes through `tidepool-reclaim` and
//! take their policies — reclamation scheme, back-off, item counting,
//! memory model, statistics — from a traits bundle, with hazard-pointer
//! defaults.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

use std::hash::BuildHasher;

use tidepool_reclaim::{Gc, Hp};
use tidepool_utils::{AtomicCounter, Backoff, EmptyCounter, ItemCounter, MemoryModel};
use tidepool_utils::{ExpBackoff, NoBackoff, RelaxedModel};

mod bucket_table;
mod ellen_tree;
mod lazy_list;
mod split_list;
mod stat;

pub use bucket_table::{BucketTable, ExpandableBucketTable, StaticBucketTable};
pub use ellen_tree::{EllenTree, EllenTreeSet, KeyExtractor};
pub use lazy_list::LazyList;
pub use split_list::SplitListMap;
pub use stat::{CollectionStat, CountingCollectionStat, DummyCollectionStat};

/// The policy bundle of an ordered container.
pub trait CollectionTraits: 'static {
    /// Safe-memory-reclamation scheme.
    type Gc: Gc;
    /// Back-off applied on validation failures and lost CASes.
    type Backoff: Backoff;
    /// Item counting policy.
    type ItemCounter: ItemCounter;
    /// Memory-ordering policy for linkage fields.
    type MemoryModel: MemoryModel;
    /// Statistics sink.
    type Stat: CollectionStat;
}

/// Hazard pointers, no back-off, no item counting, acquire/release
/// orderings, no statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCollectionTraits;

impl CollectionTraits for DefaultCollectionTraits {
    type Gc = Hp;
    type Backoff = NoBackoff;
    type ItemCounter = EmptyCounter;
    type MemoryModel = RelaxedModel;
    type Stat = DummyCollectionStat;
}

/// The policy bundle of the split-ordered hash table.
///
/// Extends [`CollectionTraits`] with hashing, the bucket-table layout and
/// the load factor that triggers doubling. The item counter should be
/// real: with [`EmptyCounter`] the table never observes its load and never
/// resizes (the chain stays correct, just long).
pub trait SplitListTraits: 'static {
    /// Safe-memory-reclamation scheme.
    type Gc: Gc;
    /// Back-off applied on validation failures.
    type Backoff: Backoff;
    /// Item counting policy; drives resizing.
    type ItemCounter: ItemCounter;
    /// Memory-ordering policy.
    type MemoryModel: MemoryModel;
    /// Statistics sink.
    type Stat: CollectionStat;
    /// Hash factory.
    type Hasher: BuildHasher + Default + 'static;
    /// Bucket-table layout: static array or lazily allocated segments.
    type Table: BucketTable;
    /// Average chain length per bucket tolerated before doubling.
    const LOAD_FACTOR: usize = 1;
}

/// Hazard pointers, exponential back-off, atomic item counter (resizing
/// needs one), default hasher, expandable two-level bucket table.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSplitListTraits;

impl SplitListTraits for DefaultSplitListTraits {
    type Gc = Hp;
    type Backoff = ExpBackoff;
    type ItemCounter = AtomicCounter;
    type MemoryModel = RelaxedModel;
    type Stat = DummyCollectionStat;
    type Hasher = std::collections::hash_map::RandomState;
    type Table = ExpandableBucketTable;
}
