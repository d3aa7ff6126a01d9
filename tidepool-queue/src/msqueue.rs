use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::atomic::Ordering;

use tidepool_reclaim::{Atomic, Gc, Guard, Owned, Shared};
use tidepool_utils::{Backoff, CachePadded, ItemCounter, MemoryModel};

use crate::stat::QueueStat;
use crate::{DefaultQueueTraits, QueueTraits};

struct Node<T> {
    next: Atomic<Node<T>>,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Node<T> {
    fn sentinel() -> Node<T> {
        Node {
            next: Atomic::null(),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    fn new(value: T) -> Node<T> {
        Node {
            next: Atomic::null(),
            value: UnsafeCell::new(MaybeUninit::new(value)),
        }
    }
}

/// The Michael–Scott lock-free FIFO queue.
///
/// `head` always points at a sentinel: the node most recently dequeued,
/// whose value slot is vacant. A dequeue that wins the `head` CAS gains
/// unique access to the next node's value and turns that node into the new
/// sentinel. `tail` may lag behind the last linked node by at most one;
/// both enqueuers and dequeuers help it forward.
///
/// Dequeued sentinels are retired through the traits bundle's reclamation
/// scheme, so a concurrent reader never touches freed memory.
pub struct MsQueue<T, Tr: QueueTraits = DefaultQueueTraits> {
    head: CachePadded<Atomic<Node<T>>>,
    tail: CachePadded<Atomic<Node<T>>>,
    counter: Tr::ItemCounter,
    stat: Tr::Stat,
    _marker: PhantomData<(T, Tr)>,
}

unsafe impl<T: Send, Tr: QueueTraits> Send for MsQueue<T, Tr> {}
unsafe impl<T: Send, Tr: QueueTraits> Sync for MsQueue<T, Tr> {}

impl<T, Tr: QueueTraits> Default for MsQueue<T, Tr> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, Tr: QueueTraits> MsQueue<T, Tr> {
    /// Creates an empty queue.
    pub fn new() -> MsQueue<T, Tr> {
        let sentinel = Owned::new(Node::sentinel()).into_shared();
        MsQueue {
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
            let next = unsafe { tail.deref() }.next.load(Tr::MemoryModel::LOAD);
            if self.tail.load(Tr::MemoryModel::LOAD) != tail {
                continue;
            }
            if !next.is_null() {
                // Tail lags: help it forward before retrying.
                self.stat.on_help_tail();
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Tr::MemoryModel::RMW_SUCCESS,
                    Tr::MemoryModel::RMW_FAILURE,
                );
                continue;
            }
            match unsafe { tail.deref() }.next.compare_exchange(
                Shared::null(),
                node,
                Tr::MemoryModel::RMW_SUCCESS,
                Tr::MemoryModel::RMW_FAILURE,
            ) {
                Ok(_) => {
                    // Best effort: a failed swing means someone helped.
                    let _ = self.tail.compare_exchange(
                        tail,
                        node,
                        Tr::MemoryModel::RMW_SUCCESS,
                        Tr::MemoryModel::RMW_FAILURE,
                    );
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
        let mut next_guard = Guard::<Tr::Gc>::new()?;
        let mut backoff = Tr::Backoff::new();

        loop {
            let head = head_guard.protect(&self.head, Tr::MemoryModel::LOAD);
            let next = next_guard.protect(&unsafe { head.deref() }.next, Tr::MemoryModel::LOAD);
            if self.head.load(Tr::MemoryModel::LOAD) != head {
                continue;
            }
            let tail = self.tail.load(Tr::MemoryModel::LOAD);
            if head == tail {
                if next.is_null() {
                    self.stat.on_empty();
                    return None;
                }
                // A linked node the tail has not caught up with yet.
                self.stat.on_help_tail();
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Tr::MemoryModel::RMW_SUCCESS,
                    Tr::MemoryModel::RMW_FAILURE,
                );
                continue;
            }
            debug_assert!(!next.is_null());
            match self.head.compare_exchange(
                head,
                next,
                Tr::MemoryModel::RMW_SUCCESS,
                Tr::MemoryModel::RMW_FAILURE,
            ) {
                Ok(_) => {
                    // Winning the CAS grants unique access to the new
                    // sentinel's value slot; `next_guard` keeps the node
                    // alive even if it is dequeued-past immediately.
                    let value = unsafe { (*next.deref().value.get()).assume_init_read() };
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

    /// Returns `true` if the queue holds no values.
    ///
    /// Answered structurally, never via the item counter.
    pub fn empty(&self) -> bool {
        match Guard::<Tr::Gc>::new() {
            Some(mut guard) => {
                let head = guard.protect(&self.head, Tr::MemoryModel::LOAD);
                unsafe { head.deref() }
                    .next
                    .load(Tr::MemoryModel::LOAD)
                    .is_null()
            }
            // Without a guard the sentinel cannot be dereferenced; a
            // coinciding head and tail is the conservative answer.
            None => {
                self.head.load(Tr::MemoryModel::LOAD) == self.tail.load(Tr::MemoryModel::LOAD)
            }
        }
    }

    /// Number of values, per the item-counter policy. The empty counter
    /// always reports 0.
    pub fn len(&self) -> usize {
        self.counter.value()
    }

    /// Returns `true` if the queue holds no values (alias of [`empty`](MsQueue::empty)
    /// for iterator-style call sites).
    pub fn is_empty(&self) -> bool {
        self.empty()
    }

    /// Dequeues until empty. Not atomic: concurrent pushes may land while
    /// the drain runs.
    pub fn clear(&self) {
        while self.pop().is_some() {}
    }

    /// The statistics sink.
    pub fn statistics(&self) -> &Tr::Stat {
        &self.stat
    }
}

impl<T, Tr: QueueTraits> Drop for MsQueue<T, Tr> {
    fn drop(&mut self) {
        // Exclusive access: plain walk, no guards. The first node is the
        // sentinel and holds no value.
        let mut cur = self.head.load(Ordering::Relaxed);
        let mut is_sentinel = true;
        while !cur.is_null() {
            let node = unsafe { cur.into_box() };
            if !is_sentinel {
                unsafe { node.value.into_inner().assume_init_drop() };
            }
            is_sentinel = false;
            cur = node.next.load(Ordering::Relaxed);
        }
    }
}

impl<T, Tr: QueueTraits> fmt::Debug for MsQueue<T, Tr> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("MsQueue { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CountingQueueStat;
    use tidepool_reclaim::Hp;
    use tidepool_utils::{AtomicCounter, ExpBackoff, RelaxedModel, SeqCstModel};

    struct CountingTraits;

    impl QueueTraits for CountingTraits {
        type Gc = Hp;
        type Backoff = ExpBackoff;
        type ItemCounter = AtomicCounter;
        type MemoryModel = RelaxedModel;
        type Stat = CountingQueueStat;
    }

    struct SeqCstTraits;

    impl QueueTraits for SeqCstTraits {
        type Gc = Hp;
        type Backoff = ExpBackoff;
        type ItemCounter = AtomicCounter;
        type MemoryModel = SeqCstModel;
        type Stat = CountingQueueStat;
    }

    #[test]
    fn empty_pop_returns_none() {
        let q: MsQueue<i64> = MsQueue::new();
        assert_eq!(q.pop(), None);
        assert!(q.empty());
    }

    #[test]
    fn push_pop_round_trip() {
        let q: MsQueue<i64> = MsQueue::new();
        q.push(1).unwrap();
        q.push(2).unwrap();
        q.push(3).unwrap();
        assert!(!q.empty());
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
        assert!(q.empty());
    }

    #[test]
    fn push_pop_many_seq() {
        let q: MsQueue<i64, CountingTraits> = MsQueue::new();
        for i in 0..200 {
            q.push(i).unwrap();
        }
        assert_eq!(q.len(), 200);
        for i in 0..200 {
            assert_eq!(q.pop(), Some(i));
        }
        assert_eq!(q.len(), 0);
        assert_eq!(q.statistics().enqueues(), 200);
        assert_eq!(q.statistics().dequeues(), 200);
    }

    #[test]
    fn clear_drains() {
        let q: MsQueue<String> = MsQueue::new();
        for i in 0..10 {
            q.push(format!("v{}", i)).unwrap();
        }
        q.clear();
        assert!(q.empty());
    }

    #[test]
    fn drop_frees_pending_values() {
        let q: MsQueue<Vec<u8>> = MsQueue::new();
        q.push(vec![1, 2, 3]).unwrap();
        q.push(vec![4, 5]).unwrap();
        // Drop with values still queued; Miri/ASan would flag a leak or
        // double free.
        drop(q);
    }

    #[test]
    fn seq_cst_model_round_trip() {
        let q: MsQueue<u32, SeqCstTraits> = MsQueue::new();
        q.push(7).unwrap();
        assert_eq!(q.pop(), Some(7));
    }

    #[test]
    fn push_pop_many_spsc() {
        use crossbeam_utils::thread;

        const COUNT: i64 = 100_000;
        let q: MsQueue<i64> = MsQueue::new();

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

        #[derive(Debug, Clone, Copy)]
        enum Lr {
            Left(i64),
            Right(i64),
        }

        const COUNT: i64 = 20_000;
        let q: MsQueue<Lr> = MsQueue::new();

        thread::scope(|scope| {
            scope.spawn(|_| {
                for i in 0..COUNT {
                    q.push(Lr::Left(i)).unwrap();
                }
            });
            scope.spawn(|_| {
                for i in 0..COUNT {
                    q.push(Lr::Right(i)).unwrap();
                }
            });
            for _ in 0..2 {
                scope.spawn(|_| {
                    let mut last_left = -1;
                    let mut last_right = -1;
                    let mut seen = 0;
                    while seen < COUNT / 2 {
                        match q.pop() {
                            Some(Lr::Left(x)) => {
                                // Per-producer order survives interleaving.
                                assert!(x > last_left);
                                last_left = x;
                                seen += 1;
                            }
                            Some(Lr::Right(x)) => {
                                assert!(x > last_right);
                                last_right = x;
                                seen += 1;
                            }
                            None => {}
                        }
                    }
                });
            }
        })
        .unwrap();
    }
}
