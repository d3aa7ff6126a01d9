use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use tidepool_utils::CachePadded;

/// Statistics sink for the ordered containers.
///
/// Counters are relaxed and advisory, like the queue sink.
pub trait CollectionStat: Default + Send + Sync {
    /// A key/value pair was inserted.
    fn on_insert(&self) {}
    /// An insert found its key already present.
    fn on_insert_exists(&self) {}
    /// An insert retried after failed validation or a lost CAS.
    fn on_insert_retry(&self) {}
    /// A pair was removed.
    fn on_remove(&self) {}
    /// A removal found nothing to remove.
    fn on_remove_miss(&self) {}
    /// A removal retried after failed validation or a lost CAS.
    fn on_remove_retry(&self) {}
    /// A lookup hit.
    fn on_find_hit(&self) {}
    /// A lookup miss.
    fn on_find_miss(&self) {}
    /// A pending operation was helped to completion (tree only).
    fn on_help(&self) {}
    /// The bucket table doubled (split-ordered hash only).
    fn on_resize(&self) {}
}

/// The no-op sink.
#[derive(Debug, Default)]
pub struct DummyCollectionStat;

impl CollectionStat for DummyCollectionStat {}

/// A sink counting every event.
#[derive(Default)]
pub struct CountingCollectionStat {
    insert: CachePadded<AtomicUsize>,
    insert_exists: CachePadded<AtomicUsize>,
    insert_retry: CachePadded<AtomicUsize>,
    remove: CachePadded<AtomicUsize>,
    remove_miss: CachePadded<AtomicUsize>,
    remove_retry: CachePadded<AtomicUsize>,
    find_hit: CachePadded<AtomicUsize>,
    find_miss: CachePadded<AtomicUsize>,
    help: CachePadded<AtomicUsize>,
    resize: CachePadded<AtomicUsize>,
}

macro_rules! getters {
    ($($(#[$doc:meta])* $getter:ident => $field:ident,)*) => {
        impl CountingCollectionStat {
            $(
                $(#[$doc])*
                pub fn $getter(&self) -> usize {
                    self.$field.load(Ordering::Relaxed)
                }
            )*
        }
    };
}

getters! {
    /// Completed inserts.
    inserts => insert,
    /// Inserts rejected as duplicates.
    insert_duplicates => insert_exists,
    /// Insert retries.
    insert_retries => insert_retry,
    /// Completed removals.
    removes => remove,
    /// Removals that missed.
    remove_misses => remove_miss,
    /// Removal retries.
    remove_retries => remove_retry,
    /// Lookup hits.
    find_hits => find_hit,
    /// Lookup misses.
    find_misses => find_miss,
    /// Helped operations.
    helps => help,
    /// Bucket-table doublings.
    resizes => resize,
}

impl CollectionStat for CountingCollectionStat {
    fn on_insert(&self) {
        self.insert.fetch_add(1, Ordering::Relaxed);
    }

    fn on_insert_exists(&self) {
        self.insert_exists.fetch_add(1, Ordering::Relaxed);
    }

    fn on_insert_retry(&self) {
        self.insert_retry.fetch_add(1, Ordering::Relaxed);
    }

    fn on_remove(&self) {
        self.remove.fetch_add(1, Ordering::Relaxed);
    }

    fn on_remove_miss(&self) {
        self.remove_miss.fetch_add(1, Ordering::Relaxed);
    }

    fn on_remove_retry(&self) {
        self.remove_retry.fetch_add(1, Ordering::Relaxed);
    }

    fn on_find_hit(&self) {
        self.find_hit.fetch_add(1, Ordering::Relaxed);
    }

    fn on_find_miss(&self) {
        self.find_miss.fetch_add(1, Ordering::Relaxed);
    }

    fn on_help(&self) {
        self.help.fetch_add(1, Ordering::Relaxed);
    }

    fn on_resize(&self) {
        self.resize.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for CountingCollectionStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountingCollectionStat")
            .field("inserts", &self.inserts())
            .field("insert_duplicates", &self.insert_duplicates())
            .field("insert_retries", &self.insert_retries())
            .field("removes", &self.removes())
            .field("remove_misses", &self.remove_misses())
            .field("remove_retries", &self.remove_retries())
            .field("find_hits", &self.find_hits())
            .field("find_misses", &self.find_misses())
            .field("helps", &self.helps())
            .field("resizes", &self.resizes())
            .finish()
    }
}
