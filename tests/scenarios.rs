//! End-to-end scenarios across the workspace surface.

use crossbeam_utils::thread;
use tidepool::collections::{EllenTree, LazyList, SplitListMap};
use tidepool::queue::{MsQueue, OptimisticQueue, QueueTraits};
use tidepool::{Guard, Hp};
use tidepool_utils::{AtomicCounter, NoBackoff, RelaxedModel};

struct CountedQueue;

impl QueueTraits for CountedQueue {
    type Gc = Hp;
    type Backoff = NoBackoff;
    type ItemCounter = AtomicCounter;
    type MemoryModel = RelaxedModel;
    type Stat = tidepool::queue::DummyQueueStat;
}

#[test]
fn empty_dequeue() {
    let q: MsQueue<u32> = MsQueue::new();
    assert_eq!(q.pop(), None);
    assert!(q.empty());
}

#[test]
fn queue_round_trip() {
    let q: MsQueue<u32> = MsQueue::new();
    q.push(1).unwrap();
    q.push(2).unwrap();
    q.push(3).unwrap();
    assert_eq!(q.pop(), Some(1));
    assert_eq!(q.pop(), Some(2));
    assert_eq!(q.pop(), Some(3));
    assert_eq!(q.pop(), None);
}

#[test]
fn optimistic_queue_round_trip() {
    let q: OptimisticQueue<u32> = OptimisticQueue::new();
    q.push(1).unwrap();
    q.push(2).unwrap();
    q.push(3).unwrap();
    assert_eq!(q.pop(), Some(1));
    assert_eq!(q.pop(), Some(2));
    assert_eq!(q.pop(), Some(3));
    assert_eq!(q.pop(), None);
}

#[test]
fn set_dedup() {
    let set: LazyList<i32, i32> = LazyList::new();
    assert!(set.insert(5, 5));
    assert!(!set.insert(5, 5));
    assert!(set.remove(&5));
    assert!(!set.contains(&5));

    let map: SplitListMap<i32, i32> = SplitListMap::new();
    assert!(map.insert(5, 5));
    assert!(!map.insert(5, 5));
    assert_eq!(map.len(), 1);
    assert!(map.remove(&5));
    assert!(!map.contains(&5));
}

#[test]
fn tree_ordered_extraction() {
    let tree: EllenTree<i32, i32> = EllenTree::new();
    for k in [3, 1, 4, 1, 5, 9, 2, 6] {
        tree.insert(k, k);
    }
    let mut order = Vec::new();
    for _ in 0..6 {
        let mut guard = Guard::<Hp>::new().unwrap();
        order.push(*tree.extract_min(&mut guard).unwrap());
    }
    // Duplicate 1 was rejected on insert.
    assert_eq!(order, vec![1, 2, 3, 4, 5, 6]);
}

#[test]
fn lazy_list_reads_progress_under_writes() {
    let list: LazyList<i32, i32> = LazyList::new();
    list.insert(10, 10);
    list.insert(30, 30);

    let inserted_flag = std::sync::atomic::AtomicBool::new(false);
    thread::scope(|scope| {
        let inserted = &inserted_flag;
        let list = &list;
        scope.spawn(move |_| {
            list.insert(20, 20);
            inserted.store(true, std::sync::atomic::Ordering::Release);
            // Churn the neighbors while the readers poll.
            for _ in 0..1000 {
                list.remove(&10);
                list.insert(10, 10);
            }
        });
        scope.spawn(move |_| {
            // Every lookup returns; once the insert is visible, every
            // subsequent lookup must hit.
            while !inserted.load(std::sync::atomic::Ordering::Acquire) {
                let _ = list.contains(&20);
            }
            for _ in 0..1000 {
                assert!(list.contains(&20));
            }
        });
    })
    .unwrap();
}

#[test]
fn guard_exhaustion_and_recovery() {
    // Hold every slot but two, then exercise an operation that needs
    // three: it must fail cleanly, and releasing one slot must let it
    // succeed.
    let q: MsQueue<u32, CountedQueue> = MsQueue::new();
    q.push(7).unwrap();

    let mut held: Vec<Guard<Hp>> = Vec::new();
    while let Some(g) = Guard::new() {
        held.push(g);
    }
    // Pop needs two guards; with zero left it reports empty-handed
    // without touching the queue.
    assert_eq!(q.pop(), None);
    assert_eq!(q.len(), 1);

    held.truncate(held.len() - 2);
    assert_eq!(q.pop(), Some(7));
    assert_eq!(q.len(), 0);
}

#[test]
fn mixed_containers_under_concurrency() {
    let q: MsQueue<u32> = MsQueue::new();
    let map: SplitListMap<u32, u32> = SplitListMap::new();
    let tree: EllenTree<u32, u32> = EllenTree::new();

    thread::scope(|scope| {
        for t in 0..3u32 {
            let q = &q;
            let map = &map;
            let tree = &tree;
            scope.spawn(move |_| {
                let base = t * 1000;
                for k in base..base + 1000 {
                    q.push(k).unwrap();
                    map.insert(k, k);
                    tree.insert(k, k);
                }
            });
        }
    })
    .unwrap();

    let mut drained = 0;
    while q.pop().is_some() {
        drained += 1;
    }
    assert_eq!(drained, 3000);
    for k in 0..3000u32 {
        assert!(map.contains(&k));
        assert!(tree.contains(&k));
    }
}
