use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use tidepool_utils::CachePadded;

/// Statistics sink for queue internals.
///
/// The dummy sink compiles to nothing; the counting sink is for profiling
/// contention, not for program logic — its counters are relaxed and may
/// trail the operations they count.
pub trait QueueStat: Default + Send + Sync {
    /// A value was enqueued.
    fn on_enqueue(&self) {}
    /// A value was dequeued.
    fn on_dequeue(&self) {}
    /// A dequeue observed an empty queue.
    fn on_empty(&self) {}
    /// An enqueue lost its linking CAS.
    fn on_enqueue_race(&self) {}
    /// A dequeue lost its head CAS.
    fn on_dequeue_race(&self) {}
    /// A lagging tail was helped forward.
    fn on_help_tail(&self) {}
    /// A dequeue repaired stale `prev` links (optimistic queue only).
    fn on_fix_list(&self) {}
}

/// The no-op sink.
#[derive(Debug, Default)]
pub struct DummyQueueStat;

impl QueueStat for DummyQueueStat {}

/// A sink counting every event.
#[derive(Default)]
pub struct CountingQueueStat {
    enqueue: CachePadded<AtomicUsize>,
    dequeue: CachePadded<AtomicUsize>,
    empty: CachePadded<AtomicUsize>,
    enqueue_race: CachePadded<AtomicUsize>,
    dequeue_race: CachePadded<AtomicUsize>,
    help_tail: CachePadded<AtomicUsize>,
    fix_list: CachePadded<AtomicUsize>,
}

impl CountingQueueStat {
    /// Completed enqueues.
    pub fn enqueues(&self) -> usize {
        self.enqueue.load(Ordering::Relaxed)
    }

    /// Completed dequeues.
    pub fn dequeues(&self) -> usize {
        self.dequeue.load(Ordering::Relaxed)
    }

    /// Dequeues that found the queue empty.
    pub fn empty_dequeues(&self) -> usize {
        self.empty.load(Ordering::Relaxed)
    }

    /// Lost enqueue CASes.
    pub fn enqueue_races(&self) -> usize {
        self.enqueue_race.load(Ordering::Relaxed)
    }

    /// Lost dequeue CASes.
    pub fn dequeue_races(&self) -> usize {
        self.dequeue_race.load(Ordering::Relaxed)
    }

    /// Times a lagging tail was helped forward.
    pub fn tail_helps(&self) -> usize {
        self.help_tail.load(Ordering::Relaxed)
    }

    /// Times the prev-link chain was repaired.
    pub fn fix_lists(&self) -> usize {
        self.fix_list.load(Ordering::Relaxed)
    }
}

impl QueueStat for CountingQueueStat {
    fn on_enqueue(&self) {
        self.enqueue.fetch_add(1, Ordering::Relaxed);
    }

    fn on_dequeue(&self) {
        self.dequeue.fetch_add(1, Ordering::Relaxed);
    }

    fn on_empty(&self) {
        self.empty.fetch_add(1, Ordering::Relaxed);
    }

    fn on_enqueue_race(&self) {
        self.enqueue_race.fetch_add(1, Ordering::Relaxed);
    }

    fn on_dequeue_race(&self) {
        self.dequeue_race.fetch_add(1, Ordering::Relaxed);
    }

    fn on_help_tail(&self) {
        self.help_tail.fetch_add(1, Ordering::Relaxed);
    }

    fn on_fix_list(&self) {
        self.fix_list.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for CountingQueueStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountingQueueStat")
            .field("enqueues", &self.enqueues())
            .field("dequeues", &self.dequeues())
            .field("empty_dequeues", &self.empty_dequeues())
            .field("enqueue_races", &self.enqueue_races())
            .field("dequeue_races", &self.dequeue_races())
            .field("tail_helps", &self.tail_helps())
            .field("fix_lists", &self.fix_lists())
            .finish()
    }
}
