use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::atomic::Ordering;

use tidepool_reclaim::{Atomic, Gc, Guard, Owned, Shared};
use tidepool_utils::{Backoff, CachePadded, ItemCounter, MemoryModel};

use crate::stat::QueueStat;
use crate::{DefaultQueueTraits, QueueTraits};

/// `next` links run from the tail toward the head and are written by the
/// enqueue CAS; `prev` links run the other way and are written lazily
/// after it, so they may briefly lag.
struct Node<T> {
    next: Atomic<Node<T>>,
    prev: Atomic<Node<T>>,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Node<T> {
    fn sentinel() -> Node<T> {
        Node {
            next: Atomic::null(),
            prev: Atomic::null(),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    fn new(value: T) -> Node<T> {
        Node {
            next: Atomic::null(),
            prev: Atomic::null(),
            value: UnsafeCell::new(MaybeUninit::new(value)),
        }
    }
}

/// The Ladan-Mozes–Shavit optimistic lock-free FIFO queue.
///
/// Where the Michael–Scott enqueue needs two CASes in the common case
/// (link, then swing the tail), the optimistic enqueue does one: it CASes
/// the tail directly and fills in the doubly-linked `prev` chain with a
/// plain store afterwards. Dequeues walk `prev` from the head sentinel;
/// when they catch the chain mid-repair they rebuild it from the tail
/// ([`fix_list`](Self::fix_list)), which costs O(length of the stale
/// window) and is counted by the statistics sink.
///
/// The head always points at a sentinel whose value slot is vacant, as in
/// the Michael–Scott queue, and dequeued sentinels go through the
/// reclamation scheme.
pub struct OptimisticQueue<T, Tr: QueueTraits = DefaultQueueTraits> {
    head: CachePadded<Atomic<Node<T>>>,
    tail: CachePadded<Atomic<Node<T>>>,
    counter: Tr::ItemCounter,
    stat: Tr::Stat,
    _marker: PhantomData<(T, Tr)>,
}

unsafe impl<T: Send, Tr: QueueTraits> Send for OptimisticQueue<T, Tr> {}
unsafe impl<T: Send, Tr: QueueTraits> Sync for OptimisticQueue<T, Tr> {}

impl<T, Tr: QueueTraits> Default for OptimisticQueue<T, Tr> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, Tr: QueueTraits> OptimisticQueue<T, Tr> {
    /// Creates an empty queue.
    pub fn new() -> OptimisticQueue<T, Tr> {
        let sentinel = Owned::new(Node::sentinel()).into_shared();
        OptimisticQueue {
            head: CachePadded::new(Atomic::from_shared(sentinel)),
            tail: CachePadded::new(Atomic::from_shared(sentinel)),
            counter: Tr::ItemCounter::default(),
            stat: Tr::Stat::default(),
            _marker: PhantomData,
        }
    }

    /// Enqueues `value` at the tail.
    ///
    /// Fails only when the calling thread's guard budget is exhausted, in
    /// which case the value is handed back and the queue is untouched.
    pub fn push(&self, value: T) -> Result<(), T> {
        let mut tail_guard = match Guard::<Tr::Gc>::new() {
            Some(g) => g,
            None => return Err(value),
        };
        let node = Owned::new(Node::new(value)).into_shared();
        let mut backoff = Tr::Backoff::new();

        loop {
            let tail = tail_guard.protect(&self.tail, Tr::MemoryModel::LOAD);
            // The forward link is in place before the node is published.
            unsafe { node.deref() }.next.store(tail, Tr::MemoryModel::STORE);
            match self.tail.compare_exchange(
                tail,
                node,
                Tr::MemoryModel::RMW_SUCCESS,
                Tr::MemoryModel::RMW_FAILURE,
            ) {
                Ok(_) => {
                    // The lazy backward link; dequeues repair it if they
                    // get here first.
                    unsafe { tail.deref() }.prev.store(node, Tr::MemoryModel::STORE);
                    self.counter.increment();
                    self.stat.on_enqueue();
                    return Ok(());
                }
                Err(_) => {
                    self.stat.on_enqueue_race();
                    backoff.backoff();
                }
            }
        }
    }

    /// Dequeues the value at the head, or `None` when the queue is empty
    /// (or the guard budget is exhausted).
    pub fn pop(&self) -> Option<T> {
        let mut head_guard = Guard::<Tr::Gc>::new()?;
        let mut tail_guard = Guard::<Tr::Gc>::new()?;
        let mut first_guard = Guard::<Tr::Gc>::new()?;
        let mut backoff = Tr::Backoff::new();

        loop {
            let head = head_guard.protect(&self.head, Tr::MemoryModel::LOAD);
            let tail = tail_guard.protect(&self.tail, Tr::MemoryModel::LOAD);
            let first = first_guard.protect(&unsafe { head.deref() }.prev, Tr::MemoryModel::LOAD);
            if self.head.load(Tr::MemoryModel::LOAD) != head {
                continue;
            }
            if head == tail {
                self.stat.on_empty();
                return None;
            }
            // While the head is unchanged, nothing between it and the
            // tail has been retired, so `first` is safe to inspect.
            if first.is_null() || unsafe { first.deref() }.next.load(Tr::MemoryModel::LOAD) != head
            {
                self.stat.on_fix_list();
                self.fix_list(tail, head);
                continue;
            }
            match self.head.compare_exchange(
                head,
                first,
                Tr::MemoryModel::RMW_SUCCESS,
                Tr::MemoryModel::RMW_FAILURE,
            ) {
                Ok(_) => {
                    let value = unsafe { (*first.deref().value.get()).assume_init_read() };
                    unsafe { Tr::Gc::retire(head) };
                    self.counter.decrement();
                    self.stat.on_dequeue();
                    return Some(value);
                }
                Err(_) => {
                    self.stat.on_dequeue_race();
                    backoff.backoff();
                }
            }
        }
    }

    /// Rebuilds stale `prev` links by walking the authoritative `next`
    /// chain from `tail` back to `head`.
    ///
    /// `tail` and `head` are protected by the caller. The walk re-checks
    /// that the head is unchanged before each step: while it is, no node
    /// on the chain has been retired, and the guard published on the next
    /// node keeps it alive from then on.
    fn fix_list(&self, tail: Shared<Node<T>>, head: Shared<Node<T>>) {
        let mut cur_guard = match Guard::<Tr::Gc>::new() {
            Some(g) => g,
            None => return,
        };
        let mut next_guard = match Guard::<Tr::Gc>::new() {
            Some(g) => g,
            None => return,
        };

        let mut cur = tail;
        cur_guard.assign(cur);
        while self.head.load(Tr::MemoryModel::LOAD) == head && cur != head {
            let next = next_guard.protect(&unsafe { cur.deref() }.next, Tr::MemoryModel::LOAD);
            if self.head.load(Tr::MemoryModel::LOAD) != head {
                return;
            }
            if next.is_null() {
                return;
            }
            unsafe { next.deref() }.prev.store(cur, Tr::MemoryModel::STORE);
            cur_guard.assign(next);
            cur = next;
        }
    }

    /// Returns `true` if the queue holds no values.
    ///
    /// The tail never lags in this algorithm, so a head/tail coincidence
    /// is the exact structural answer.
    pub fn empty(&self) -> bool {
        self.head.load(Tr::MemoryModel::LOAD) == self.tail.load(Tr::MemoryModel::LOAD)
    }

    /// Alias of [`empty`](OptimisticQueue::empty).
    pub fn is_empty(&self) -> bool {
        self.empty()
    }

    /// Number of values, per the item-counter policy.
    pub fn len(&self) -> usize {
        self.counter.value()
    }

    /// Dequeues until empty. Not atomic.
    pub fn clear(&self) {
        while self.pop().is_some() {}
    }

    /// The statistics sink.
    pub fn statistics(&self) -> &Tr::Stat {
        &self.stat
    }
}

impl<T, Tr: QueueTraits> Drop for OptimisticQueue<T, Tr> {
    fn drop(&mut self) {
        // Exclusive access. Walk the authoritative next chain from the
        // tail; the head node is the sentinel and holds no value.
        let head = self.head.load(Ordering::Relaxed);
        let mut cur = self.tail.load(Ordering::Relaxed);
        while !cur.is_null() {
            let node = unsafe { cur.into_box() };
            if cur != head {
                unsafe { node.value.into_inner().assume_init_drop() };
            }
            cur = node.next.load(Ordering::Relaxed);
        }
    }
}

impl<T, Tr: QueueTraits> fmt::Debug for OptimisticQueue<T, Tr> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("OptimisticQueue { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CountingQueueStat;
    use tidepool_reclaim::Ptb;
    use tidepool_utils::{AtomicCounter, PauseBackoff, RelaxedModel};

    struct PtbTraits;

    impl QueueTraits for PtbTraits {
        type Gc = Ptb;
        type Backoff = PauseBackoff;
        type ItemCounter = AtomicCounter;
        type MemoryModel = RelaxedModel;
        type Stat = CountingQueueStat;
    }

    #[test]
    fn empty_pop_returns_none() {
        let q: OptimisticQueue<i64> = OptimisticQueue::new();
        assert_eq!(q.pop(), None);
        assert!(q.empty());
    }

    #[test]
    fn fifo_round_trip() {
        let q: OptimisticQueue<i64> = OptimisticQueue::new();
        q.push(1).unwrap();
        q.push(2).unwrap();
        q.push(3).unwrap();
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn prev_links_recover_from_lag() {
        // Single-threaded, pushes interleaved with pops still exercise the
        // lazy prev write paths.
        let q: OptimisticQueue<usize, PtbTraits> = OptimisticQueue::new();
        for round in 0..100 {
            for i in 0..10 {
                q.push(round * 10 + i).unwrap();
            }
            for i in 0..10 {
                assert_eq!(q.pop(), Some(round * 10 + i));
            }
        }
        assert_eq!(q.len(), 0);
        assert_eq!(q.statistics().dequeues(), 1000);
    }

    #[test]
    fn drop_frees_pending_values() {
        let q: OptimisticQueue<String> = OptimisticQueue::new();
        for i in 0..5 {
            q.push(format!("pending-{}", i)).unwrap();
        }
        drop(q);
    }

    #[test]
    fn push_pop_many_spsc() {
        use crossbeam_utils::thread;

        const COUNT: i64 = 100_000;
        let q: OptimisticQueue<i64> = OptimisticQueue::new();

        thread::scope(|scope| {
            scope.spawn(|_| {
                let mut next = 0;
                while next < COUNT {
                    if let Some(v) = q.pop() {
                        assert_eq!(v, next);
                        next += 1;
                    }
                }
            });

            for i in 0..COUNT {
                q.push(i).unwrap();
            }
        })
        .unwrap();
    }

    #[test]
    fn push_pop_many_mpmc() {
        use crossbeam_utils::thread;
        use std::sync::atomic::{AtomicI64, Ordering};

        const COUNT: i64 = 20_000;
        const PRODUCERS: i64 = 2;
        let q: OptimisticQueue<i64> = OptimisticQueue::new();
        let sum = AtomicI64::new(0);
        let taken = AtomicI64::new(0);

        thread::scope(|scope| {
            for p in 0..PRODUCERS {
                let q = &q;
                scope.spawn(move |_| {
                    for i in 0..COUNT {
                        q.push(p * COUNT + i).unwrap();
                    }
                });
            }
            for _ in 0..3 {
                let q = &q;
                let sum = &sum;
                let taken = &taken;
                scope.spawn(move |_| {
                    while taken.load(Ordering::Relaxed) < PRODUCERS * COUNT {
                        if let Some(v) = q.pop() {
                            sum.fetch_add(v, Ordering::Relaxed);
                            taken.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        })
        .unwrap();

        let n = PRODUCERS * COUNT;
        assert_eq!(sum.load(Ordering::Relaxed), n * (n - 1) / 2);
        assert!(q.empty());
    }
}
