//! The Heller et al. lazy ordered list.

use std::borrow::Borrow;
use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::marker::PhantomData;
use std::mem;

use tidepool_reclaim::{Atomic, Gc, Guard, Owned, Shared};
use tidepool_utils::sync::SpinLock;
use tidepool_utils::{Backoff, ItemCounter, MemoryModel};

use crate::stat::CollectionStat;
use crate::{CollectionTraits, DefaultCollectionTraits};

/// Mark bit: set in a node's own `next` field when the node is logically
/// deleted.
const MARKED: usize = 1;

/// Sentinel-aware key. `Head` sorts before every key, `Tail` after.
pub(crate) enum Bound<K> {
    Head,
    Key(K),
    Tail,
}

impl<K> Bound<K> {
    /// Position of this key relative to a search target.
    fn order_by(&self, cmp: &impl Fn(&K) -> CmpOrdering) -> CmpOrdering {
        match self {
            Bound::Head => CmpOrdering::Less,
            Bound::Key(k) => cmp(k),
            Bound::Tail => CmpOrdering::Greater,
        }
    }
}

pub(crate) struct Node<K, V> {
    key: Bound<K>,
    value: Option<V>,
    lock: SpinLock<()>,
    next: Atomic<Node<K, V>>,
}

impl<K, V> Node<K, V> {
    pub(crate) fn new(key: Bound<K>, value: Option<V>) -> Node<K, V> {
        Node {
            key,
            value,
            lock: SpinLock::new(()),
            next: Atomic::null(),
        }
    }

    pub(crate) fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    pub(crate) fn key(&self) -> Option<&K> {
        match &self.key {
            Bound::Key(k) => Some(k),
            _ => None,
        }
    }

    fn is_marked(&self, ord: std::sync::atomic::Ordering) -> bool {
        self.next.load(ord).tag() == MARKED
    }
}

/// A located pair of adjacent nodes: `curr` is the first node whose key is
/// not less than the target, `pred` its predecessor. Both are protected by
/// the guards the search ran with.
pub(crate) struct Position<K, V> {
    pub(crate) pred: Shared<Node<K, V>>,
    pub(crate) curr: Shared<Node<K, V>>,
}

/// Outcome of the internal insert loop.
pub(crate) enum InsertOutcome<K, V> {
    /// The node was linked; the pointer is only safe to dereference if a
    /// guard was passed in to keep it.
    Inserted(Shared<Node<K, V>>),
    /// The key is present and unmarked; the node comes back.
    Exists(Shared<Node<K, V>>, Box<Node<K, V>>),
    /// Guard budget exhausted; nothing was changed.
    NoGuards(Box<Node<K, V>>),
}

/// The Heller et al. lazy ordered list.
///
/// An ordered map from `K` to `V`. Writers locate a window optimistically
/// without locks, then lock the two adjacent nodes and re-validate them;
/// readers never lock at all. Removal is two-phase: the mark bit in the
/// victim's `next` field is the logical delete that readers observe
/// instantly, the unlink that follows is bookkeeping.
///
/// Removed nodes are retired through the traits bundle's reclamation
/// scheme. Traversals protect each step with hazard guards and restart
/// from the head when a neighbor was removed mid-step, so reads are
/// lock-free (and, absent adjacent removals, complete in one pass).
pub struct LazyList<K, V, Tr: CollectionTraits = DefaultCollectionTraits> {
    head: Atomic<Node<K, V>>,
    tail: Atomic<Node<K, V>>,
    counter: Tr::ItemCounter,
    stat: Tr::Stat,
    _marker: PhantomData<Tr>,
}

unsafe impl<K: Send + Sync, V: Send + Sync, Tr: CollectionTraits> Send for LazyList<K, V, Tr> {}
unsafe impl<K: Send + Sync, V: Send + Sync, Tr: CollectionTraits> Sync for LazyList<K, V, Tr> {}

impl<K: 'static, V: 'static, Tr: CollectionTraits> LazyList<K, V, Tr> {
    /// Creates an empty list.
    pub fn new() -> LazyList<K, V, Tr> {
        let tail = Owned::new(Node::new(Bound::Tail, None)).into_shared();
        let head = Owned::new(Node::new(Bound::Head, None)).into_shared();
        unsafe { head.deref() }
            .next
            .store(tail, std::sync::atomic::Ordering::Relaxed);
        LazyList {
            head: Atomic::from_shared(head),
            tail: Atomic::from_shared(tail),
            counter: Tr::ItemCounter::default(),
            stat: Tr::Stat::default(),
            _marker: PhantomData,
        }
    }

    pub(crate) fn head_node(&self) -> Shared<Node<K, V>> {
        self.head.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub(crate) fn counter(&self) -> &Tr::ItemCounter {
        &self.counter
    }

    pub(crate) fn stat(&self) -> &Tr::Stat {
        &self.stat
    }

    /// Walks from `head` to the first node whose key is not less than the
    /// target described by `cmp`.
    ///
    /// Guard discipline: `g_pred` covers `pred`, `g_curr` covers `curr` at
    /// every step. Advancing protects the successor with the guard being
    /// vacated, validates that the node being left is still unmarked (the
    /// tag of its re-read `next`), and restarts from `head` otherwise —
    /// a marked node's successor may already be unlinked and reclaimed.
    pub(crate) fn search_at(
        &self,
        head: Shared<Node<K, V>>,
        cmp: &impl Fn(&K) -> CmpOrdering,
        g_pred: &mut Guard<Tr::Gc>,
        g_curr: &mut Guard<Tr::Gc>,
    ) -> Position<K, V> {
        'retry: loop {
            let mut pred = head;
            g_pred.assign(pred);
            let mut curr = g_curr.protect(&unsafe { pred.deref() }.next, Tr::MemoryModel::LOAD);
            loop {
                debug_assert!(!curr.is_null());
                let node = unsafe { curr.deref() };
                if node.key.order_by(cmp) == CmpOrdering::Less {
                    let next = g_pred.protect(&node.next, Tr::MemoryModel::LOAD);
                    if next.tag() == MARKED {
                        continue 'retry;
                    }
                    pred = curr;
                    curr = next;
                    mem::swap(g_pred, g_curr);
                } else {
                    return Position { pred, curr };
                }
            }
        }
    }

    /// Links a pre-built node at its ordered position under `head`.
    ///
    /// When `keep` is given, the affected node (inserted or existing) is
    /// published in it before return, making the returned pointer safe to
    /// dereference while that guard is held.
    pub(crate) fn insert_node_at(
        &self,
        head: Shared<Node<K, V>>,
        mut node: Box<Node<K, V>>,
        mut keep: Option<&mut Guard<Tr::Gc>>,
    ) -> InsertOutcome<K, V>
    where
        K: Ord,
    {
        let (mut g_pred, mut g_curr) = match (Guard::new(), Guard::new()) {
            (Some(a), Some(b)) => (a, b),
            _ => return InsertOutcome::NoGuards(node),
        };
        let mut backoff = Tr::Backoff::new();

        // The key lives in the node's heap allocation, whose address is
        // stable across the later `Box::into_raw`.
        let key: *const K = node.key().expect("insert requires a keyed node");
        let cmp = move |k: &K| k.cmp(unsafe { &*key });

        loop {
            let pos = self.search_at(head, &cmp, &mut g_pred, &mut g_curr);
            let curr_node = unsafe { pos.curr.deref() };

            if curr_node.key.order_by(&cmp) == CmpOrdering::Equal {
                if curr_node.is_marked(Tr::MemoryModel::LOAD) {
                    // Logically deleted but not yet unlinked; wait for the
                    // remover to finish and retry.
                    backoff.backoff();
                    continue;
                }
                if let Some(g) = keep.as_deref_mut() {
                    g.assign(pos.curr);
                }
                self.stat.on_insert_exists();
                return InsertOutcome::Exists(pos.curr, node);
            }

            let pred_node = unsafe { pos.pred.deref() };
            let _pred_lock = pred_node.lock.lock();
            let _curr_lock = curr_node.lock.lock();
            if !self.validate(pred_node, pos.curr) {
                drop(_curr_lock);
                drop(_pred_lock);
                self.stat.on_insert_retry();
                backoff.backoff();
                continue;
            }

            node.next.store(pos.curr, std::sync::atomic::Ordering::Relaxed);
            let linked = Shared::from_raw(Box::into_raw(node));
            if let Some(g) = keep.as_deref_mut() {
                g.assign(linked);
            }
            pred_node.next.store(linked, Tr::MemoryModel::STORE);
            self.counter.increment();
            self.stat.on_insert();
            return InsertOutcome::Inserted(linked);
        }
    }

    /// `pred` and `curr` are a valid window: both unmarked and adjacent.
    /// Called with both locks held.
    fn validate(&self, pred_node: &Node<K, V>, curr: Shared<Node<K, V>>) -> bool {
        let link = pred_node.next.load(Tr::MemoryModel::LOAD);
        link.tag() == 0
            && link.as_raw() == curr.as_raw()
            && !unsafe { curr.deref() }.is_marked(Tr::MemoryModel::LOAD)
    }

    /// Removes the first node matching `cmp` under `head`.
    ///
    /// `before_retire` runs after the unlink with the node still protected
    /// by a guard, and the node is retired afterwards even if the callback
    /// panics.
    pub(crate) fn remove_at(
        &self,
        head: Shared<Node<K, V>>,
        cmp: &impl Fn(&K) -> CmpOrdering,
        before_retire: impl FnOnce(Shared<Node<K, V>>),
    ) -> bool {
        let (mut g_pred, mut g_curr) = match (Guard::new(), Guard::new()) {
            (Some(a), Some(b)) => (a, b),
            _ => return false,
        };
        let mut backoff = Tr::Backoff::new();

        loop {
            let pos = self.search_at(head, cmp, &mut g_pred, &mut g_curr);
            let curr_node = unsafe { pos.curr.deref() };

            if curr_node.key.order_by(cmp) != CmpOrdering::Equal {
                self.stat.on_remove_miss();
                return false;
            }
            if curr_node.is_marked(Tr::MemoryModel::LOAD) {
                // Another remover got here first; it counts as absent once
                // the unlink completes.
                backoff.backoff();
                continue;
            }

            let pred_node = unsafe { pos.pred.deref() };
            let _pred_lock = pred_node.lock.lock();
            let _curr_lock = curr_node.lock.lock();
            if !self.validate(pred_node, pos.curr) {
                drop(_curr_lock);
                drop(_pred_lock);
                self.stat.on_remove_retry();
                backoff.backoff();
                continue;
            }

            // Logical delete first: readers observe the mark immediately.
            let succ = curr_node.next.fetch_or(MARKED, Tr::MemoryModel::RMW_SUCCESS);
            pred_node.next.store(succ.with_tag(0), Tr::MemoryModel::STORE);
            drop(_curr_lock);
            drop(_pred_lock);
            self.counter.decrement();
            self.stat.on_remove();

            let retire = scopeguard::guard(pos.curr, |node| unsafe {
                Tr::Gc::retire(node);
            });
            before_retire(*retire);
            return true;
        }
    }

    /// Looks up `cmp`'s target under `head` and runs `with` on the node
    /// while it is protected. Lock-free; never blocks on node locks.
    ///
    /// The miss/hit decision is the acquire load of the node's mark bit.
    pub(crate) fn find_at<R>(
        &self,
        head: Shared<Node<K, V>>,
        cmp: &impl Fn(&K) -> CmpOrdering,
        with: impl FnOnce(&Node<K, V>) -> R,
    ) -> Option<R> {
        let (mut g_pred, mut g_curr) = match (Guard::new(), Guard::new()) {
            (Some(a), Some(b)) => (a, b),
            _ => return None,
        };
        let pos = self.search_at(head, cmp, &mut g_pred, &mut g_curr);
        let node = unsafe { pos.curr.deref() };
        if node.key.order_by(cmp) == CmpOrdering::Equal && !node.is_marked(Tr::MemoryModel::LOAD) {
            self.stat.on_find_hit();
            Some(with(node))
        } else {
            self.stat.on_find_miss();
            None
        }
    }

    /// Looks up `cmp`'s target and publishes the hit in `keep`.
    pub(crate) fn get_at(
        &self,
        head: Shared<Node<K, V>>,
        cmp: &impl Fn(&K) -> CmpOrdering,
        keep: &mut Guard<Tr::Gc>,
    ) -> Option<Shared<Node<K, V>>> {
        self.find_at(head, cmp, |node| {
            let shared = Shared::from_raw(node as *const Node<K, V>);
            keep.assign(shared);
            shared
        })
    }

    /// Walks to the first value-bearing (non-sentinel) node under `head`.
    fn first_user_at(
        &self,
        head: Shared<Node<K, V>>,
        g_pred: &mut Guard<Tr::Gc>,
        g_curr: &mut Guard<Tr::Gc>,
    ) -> Option<Position<K, V>> {
        'retry: loop {
            let mut pred = head;
            g_pred.assign(pred);
            let mut curr = g_curr.protect(&unsafe { pred.deref() }.next, Tr::MemoryModel::LOAD);
            loop {
                let node = unsafe { curr.deref() };
                if matches!(node.key, Bound::Tail) {
                    return None;
                }
                if node.value.is_some() && !node.is_marked(Tr::MemoryModel::LOAD) {
                    return Some(Position { pred, curr });
                }
                let next = g_pred.protect(&node.next, Tr::MemoryModel::LOAD);
                if next.tag() == MARKED {
                    continue 'retry;
                }
                pred = curr;
                curr = next;
                mem::swap(g_pred, g_curr);
            }
        }
    }

    /// Removes the first value-bearing node under `head`. Used by
    /// `clear`.
    pub(crate) fn remove_first_at(&self, head: Shared<Node<K, V>>) -> bool {
        let (mut g_pred, mut g_curr) = match (Guard::new(), Guard::new()) {
            (Some(a), Some(b)) => (a, b),
            _ => return false,
        };
        let mut backoff = Tr::Backoff::new();

        loop {
            let pos = match self.first_user_at(head, &mut g_pred, &mut g_curr) {
                Some(pos) => pos,
                None => return false,
            };
            let pred_node = unsafe { pos.pred.deref() };
            let curr_node = unsafe { pos.curr.deref() };
            let _pred_lock = pred_node.lock.lock();
            let _curr_lock = curr_node.lock.lock();
            if !self.validate(pred_node, pos.curr) {
                drop(_curr_lock);
                drop(_pred_lock);
                self.stat.on_remove_retry();
                backoff.backoff();
                continue;
            }
            let succ = curr_node.next.fetch_or(MARKED, Tr::MemoryModel::RMW_SUCCESS);
            pred_node.next.store(succ.with_tag(0), Tr::MemoryModel::STORE);
            drop(_curr_lock);
            drop(_pred_lock);
            self.counter.decrement();
            self.stat.on_remove();
            unsafe { Tr::Gc::retire(pos.curr) };
            return true;
        }
    }

    /// Returns `true` if no value-bearing node is reachable from `head`.
    pub(crate) fn empty_at(&self, head: Shared<Node<K, V>>) -> bool {
        let (mut g_pred, mut g_curr) = match (Guard::new(), Guard::new()) {
            (Some(a), Some(b)) => (a, b),
            _ => return true,
        };
        self.first_user_at(head, &mut g_pred, &mut g_curr).is_none()
    }
}

impl<K, V, Tr> LazyList<K, V, Tr>
where
    K: Ord + 'static,
    V: 'static,
    Tr: CollectionTraits,
{
    /// Inserts `key → value` if the key is absent. The pair is dropped
    /// when the key is already present.
    pub fn insert(&self, key: K, value: V) -> bool {
        let node = Box::new(Node::new(Bound::Key(key), Some(value)));
        matches!(
            self.insert_node_at(self.head_node(), node, None),
            InsertOutcome::Inserted(_)
        )
    }

    /// Inserts and, on success, runs `init` on the value after it is
    /// linked and visible to other threads.
    pub fn insert_with(&self, key: K, value: V, init: impl FnOnce(&V)) -> bool {
        let mut guard = match Guard::new() {
            Some(g) => g,
            None => return false,
        };
        let node = Box::new(Node::new(Bound::Key(key), Some(value)));
        match self.insert_node_at(self.head_node(), node, Some(&mut guard)) {
            InsertOutcome::Inserted(linked) => {
                // Protected by `guard`.
                init(unsafe { linked.deref() }.value().expect("user node"));
                true
            }
            _ => false,
        }
    }

    /// Builds the value with `make` and inserts it if the key is absent.
    pub fn emplace(&self, key: K, make: impl FnOnce() -> V) -> bool {
        self.insert(key, make())
    }

    /// Upsert. Inserts if absent, otherwise leaves the existing value in
    /// place; `f` receives `(inserted, &value)` for the winning node.
    ///
    /// Returns `(ok, inserted)`: `ok` is `false` only when the guard
    /// budget is exhausted, in which case nothing happened.
    pub fn update(&self, key: K, value: V, f: impl FnOnce(bool, &V)) -> (bool, bool) {
        let mut guard = match Guard::new() {
            Some(g) => g,
            None => return (false, false),
        };
        let node = Box::new(Node::new(Bound::Key(key), Some(value)));
        match self.insert_node_at(self.head_node(), node, Some(&mut guard)) {
            InsertOutcome::Inserted(linked) => {
                f(true, unsafe { linked.deref() }.value().expect("user node"));
                (true, true)
            }
            InsertOutcome::Exists(existing, _node) => {
                f(false, unsafe { existing.deref() }.value().expect("user node"));
                (true, false)
            }
            InsertOutcome::NoGuards(_) => (false, false),
        }
    }

    /// Removes `key`. Returns whether a pair was removed.
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.remove_at(self.head_node(), &|k| k.borrow().cmp(key), |_| {})
    }

    /// Removes `key`, running `f` on the value after the unlink and
    /// before the node is retired.
    pub fn remove_and<Q>(&self, key: &Q, f: impl FnOnce(&V)) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.remove_at(self.head_node(), &|k| k.borrow().cmp(key), |node| {
            f(unsafe { node.deref() }.value().expect("user node"));
        })
    }

    /// Removes the first key for which `cmp` answers `Equal`, under a
    /// caller-supplied ordering consistent with the list order.
    pub fn remove_with<Q: ?Sized>(&self, key: &Q, cmp: impl Fn(&Q, &K) -> CmpOrdering) -> bool {
        self.remove_at(
            self.head_node(),
            &|k| cmp(key, k).reverse(),
            |_| {},
        )
    }

    /// Returns whether `key` is present (and not logically deleted).
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.find_at(self.head_node(), &|k| k.borrow().cmp(key), |_| ())
            .is_some()
    }

    /// Looks up `key` and applies `f` to its value under protection.
    pub fn find_and<Q, R>(&self, key: &Q, f: impl FnOnce(&V) -> R) -> Option<R>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.find_at(self.head_node(), &|k| k.borrow().cmp(key), |node| {
            f(node.value().expect("user node"))
        })
    }

    /// Looks up the first key for which `cmp` answers `Equal`.
    pub fn find_with<Q: ?Sized>(&self, key: &Q, cmp: impl Fn(&Q, &K) -> CmpOrdering) -> bool {
        self.find_at(self.head_node(), &|k| cmp(key, k).reverse(), |_| ())
            .is_some()
    }

    /// Looks up `key` and holds the value through `guard`.
    pub fn get<'g, Q>(&self, guard: &'g mut Guard<Tr::Gc>, key: &Q) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.get_at(self.head_node(), &|k| k.borrow().cmp(key), guard)
            .map(|node| unsafe { node.deref() }.value().expect("user node"))
    }

    /// Unlinks `key` and holds the (retired but protected) value through
    /// `guard` until the guard is cleared or dropped.
    pub fn extract<'g, Q>(&self, guard: &'g mut Guard<Tr::Gc>, key: &Q) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let mut taken = None;
        let removed = self.remove_at(self.head_node(), &|k| k.borrow().cmp(key), |node| {
            guard.assign(node);
            taken = Some(node);
        });
        if !removed {
            return None;
        }
        taken.map(|node| unsafe { node.deref() }.value().expect("user node"))
    }

    /// Returns `true` if the list holds no pairs. Structural; never
    /// answered via the item counter.
    pub fn is_empty(&self) -> bool {
        self.empty_at(self.head_node())
    }

    /// Number of pairs, per the item-counter policy.
    pub fn len(&self) -> usize {
        self.counter.value()
    }

    /// Removes every pair. Not atomic.
    pub fn clear(&self) {
        while self.remove_first_at(self.head_node()) {}
    }

    /// The statistics sink.
    pub fn statistics(&self) -> &Tr::Stat {
        &self.stat
    }

    /// Visits every node in chain order. Single-threaded only; test
    /// support.
    pub(crate) fn debug_for_each(&self, mut f: impl FnMut(&Node<K, V>)) {
        let mut cur = self.head_node();
        while !cur.is_null() {
            let node = unsafe { cur.deref() };
            f(node);
            cur = node.next.load(std::sync::atomic::Ordering::Relaxed).with_tag(0);
        }
    }

    /// Checks ordering and linkage invariants. Not thread-safe; intended
    /// for tests and debugging, never for program logic.
    pub fn debug_validate(&self) {
        use std::sync::atomic::Ordering::Relaxed;

        let mut cur = self.head_node();
        let mut last: Option<&K> = None;
        loop {
            let node = unsafe { cur.deref() };
            if let Some(k) = node.key() {
                if let Some(prev) = last {
                    assert!(prev < k, "list keys out of order");
                }
                last = Some(k);
            }
            let next = node.next.load(Relaxed);
            assert_eq!(next.tag(), 0, "marked node reachable in quiescence");
            if matches!(node.key, Bound::Tail) {
                assert!(next.is_null());
                return;
            }
            cur = next;
        }
    }
}

impl<K, V, Tr: CollectionTraits> Drop for LazyList<K, V, Tr> {
    fn drop(&mut self) {
        // Exclusive access: free the chain directly, sentinels included.
        let mut cur = self.head.load(std::sync::atomic::Ordering::Relaxed);
        while !cur.is_null() {
            let node = unsafe { cur.into_box() };
            cur = node.next.load(std::sync::atomic::Ordering::Relaxed).with_tag(0);
        }
    }
}

impl<K, V, Tr> Default for LazyList<K, V, Tr>
where
    K: Ord + 'static,
    V: 'static,
    Tr: CollectionTraits,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, Tr: CollectionTraits> fmt::Debug for LazyList<K, V, Tr> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("LazyList { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CountingCollectionStat;
    use tidepool_reclaim::{Hp, Ptb};
    use tidepool_utils::{AtomicCounter, ExpBackoff, RelaxedModel};

    struct CountingTraits;

    impl CollectionTraits for CountingTraits {
        type Gc = Hp;
        type Backoff = ExpBackoff;
        type ItemCounter = AtomicCounter;
        type MemoryModel = RelaxedModel;
        type Stat = CountingCollectionStat;
    }

    struct PtbTraits;

    impl CollectionTraits for PtbTraits {
        type Gc = Ptb;
        type Backoff = ExpBackoff;
        type ItemCounter = AtomicCounter;
        type MemoryModel = RelaxedModel;
        type Stat = CountingCollectionStat;
    }

    #[test]
    fn insert_find_remove() {
        let list: LazyList<i32, String, CountingTraits> = LazyList::new();
        assert!(list.insert(5, "five".into()));
        assert!(!list.insert(5, "again".into()));
        assert_eq!(list.len(), 1);
        assert!(list.contains(&5));
        assert!(!list.contains(&7));
        assert!(list.remove(&5));
        assert!(!list.remove(&5));
        assert!(!list.contains(&5));
        assert_eq!(list.len(), 0);
        assert_eq!(list.statistics().insert_duplicates(), 1);
        list.debug_validate();
    }

    #[test]
    fn keeps_order() {
        let list: LazyList<i32, i32> = LazyList::new();
        for k in [3, 1, 4, 1, 5, 9, 2, 6] {
            list.insert(k, k * 10);
        }
        // Duplicate 1 was rejected.
        let mut seen = Vec::new();
        for k in [1, 2, 3, 4, 5, 6, 9] {
            assert_eq!(list.find_and(&k, |v| *v), Some(k * 10));
            seen.push(k);
        }
        assert_eq!(seen.len(), 7);
        list.debug_validate();
    }

    #[test]
    fn set_law_random() {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        use std::collections::BTreeMap;

        let mut rng = StdRng::seed_from_u64(0x1a2b);
        let list: LazyList<u16, u16> = LazyList::new();
        let mut model: BTreeMap<u16, u16> = BTreeMap::new();

        for _ in 0..4000 {
            let k = rng.gen_range(0..64);
            if rng.gen_bool(0.5) {
                assert_eq!(list.insert(k, k), !model.contains_key(&k));
                model.entry(k).or_insert(k);
            } else {
                assert_eq!(list.remove(&k), model.remove(&k).is_some());
            }
        }
        for k in 0..64u16 {
            assert_eq!(list.contains(&k), model.contains_key(&k));
        }
        list.debug_validate();
    }

    #[test]
    fn update_is_an_upsert() {
        let list: LazyList<i32, i32> = LazyList::new();
        let (ok, inserted) = list.update(1, 10, |fresh, v| {
            assert!(fresh);
            assert_eq!(*v, 10);
        });
        assert!(ok && inserted);
        let (ok, inserted) = list.update(1, 99, |fresh, v| {
            assert!(!fresh);
            assert_eq!(*v, 10);
        });
        assert!(ok && !inserted);
    }

    #[test]
    fn insert_with_runs_initializer_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let list: LazyList<i32, i32> = LazyList::new();
        let runs = AtomicUsize::new(0);
        assert!(list.insert_with(3, 30, |_| {
            runs.fetch_add(1, Ordering::Relaxed);
        }));
        assert!(!list.insert_with(3, 31, |_| {
            runs.fetch_add(1, Ordering::Relaxed);
        }));
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn remove_and_sees_value_before_retire() {
        let list: LazyList<i32, String, PtbTraits> = LazyList::new();
        list.insert(2, "two".into());
        let mut seen = None;
        assert!(list.remove_and(&2, |v| seen = Some(v.clone())));
        assert_eq!(seen.as_deref(), Some("two"));
    }

    #[test]
    fn get_and_extract_hold_values() {
        let list: LazyList<i32, i32> = LazyList::new();
        list.insert(8, 80);

        let mut guard = Guard::<Hp>::new().unwrap();
        assert_eq!(list.get(&mut guard, &8), Some(&80));

        let mut guard2 = Guard::<Hp>::new().unwrap();
        let v = list.extract(&mut guard2, &8).copied();
        assert_eq!(v, Some(80));
        // Unlinked by the extract.
        assert!(!list.contains(&8));
        assert_eq!(list.extract(&mut guard2, &8), None);
    }

    #[test]
    fn custom_comparator_variants() {
        let list: LazyList<i32, i32> = LazyList::new();
        list.insert(10, 1);
        // Same total order, expressed as a predicate on a foreign type.
        let cmp = |q: &i64, k: &i32| (*q).cmp(&i64::from(*k));
        assert!(list.find_with(&10i64, cmp));
        assert!(list.remove_with(&10i64, cmp));
        assert!(!list.find_with(&10i64, cmp));
    }

    #[test]
    fn clear_empties() {
        let list: LazyList<i32, i32, CountingTraits> = LazyList::new();
        for k in 0..50 {
            list.insert(k, k);
        }
        assert!(!list.is_empty());
        list.clear();
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn concurrent_find_never_blocks() {
        use crossbeam_utils::thread;
        use std::sync::atomic::{AtomicBool, Ordering};

        let list: LazyList<i32, i32> = LazyList::new();
        let stop = AtomicBool::new(false);

        thread::scope(|scope| {
            scope.spawn(|_| {
                for round in 0..200 {
                    for k in 0..32 {
                        list.insert(k, round);
                    }
                    for k in 0..32 {
                        list.remove(&k);
                    }
                }
                stop.store(true, Ordering::Release);
            });
            for _ in 0..3 {
                scope.spawn(|_| {
                    while !stop.load(Ordering::Acquire) {
                        // Either answer is fine; the call must return.
                        let _ = list.contains(&16);
                    }
                });
            }
        })
        .unwrap();
    }

    #[test]
    fn concurrent_inserts_do_not_duplicate() {
        use crossbeam_utils::thread;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let list: LazyList<u32, u32, CountingTraits> = LazyList::new();
        let wins = AtomicUsize::new(0);

        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|_| {
                    for k in 0..256u32 {
                        if list.insert(k, k) {
                            wins.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        })
        .unwrap();

        assert_eq!(wins.load(Ordering::Relaxed), 256);
        assert_eq!(list.len(), 256);
        for k in 0..256u32 {
            assert!(list.contains(&k));
        }
        list.debug_validate();
    }
}
