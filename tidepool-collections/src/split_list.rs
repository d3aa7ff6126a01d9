//! The split-ordered hash table (Shalev and Shavit).

use std::borrow::Borrow;
use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

use tidepool_reclaim::{Guard, Shared};
use tidepool_utils::{CachePadded, ItemCounter};

use crate::bucket_table::BucketTable;
use crate::lazy_list::{Bound, InsertOutcome, LazyList, Node};
use crate::stat::CollectionStat;
use crate::{CollectionTraits, DefaultSplitListTraits, SplitListTraits};

/// Chain key: bit-reversed hash first, the user key as tiebreaker for
/// colliding hashes. Sentinel (bucket) nodes carry no user key and sort
/// before any user node that could share their reversed hash — their
/// reversed hash has the least significant bit clear, user keys have it
/// set.
pub(crate) struct SplitKey<K> {
    so: u64,
    key: Option<K>,
}

impl<K: Ord> PartialEq for SplitKey<K> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl<K: Ord> Eq for SplitKey<K> {}

impl<K: Ord> PartialOrd for SplitKey<K> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord> Ord for SplitKey<K> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.so
            .cmp(&other.so)
            .then_with(|| match (&self.key, &other.key) {
                (None, None) => CmpOrdering::Equal,
                (None, Some(_)) => CmpOrdering::Less,
                (Some(_), None) => CmpOrdering::Greater,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

/// Reversed-hash key of a user node.
fn regular_key(hash: u64) -> u64 {
    hash.reverse_bits() | 1
}

/// Reversed-hash key of bucket `index`'s sentinel.
fn dummy_key(index: u64) -> u64 {
    index.reverse_bits()
}

/// The bucket whose sentinel precedes `index`'s: the index with its
/// highest set bit cleared.
fn parent_bucket(index: u64) -> u64 {
    debug_assert!(index > 0);
    index & !(1u64 << (63 - index.leading_zeros()))
}

/// Adapts a [`SplitListTraits`] bundle to the chain's
/// [`CollectionTraits`].
struct ChainTraits<Tr>(PhantomData<Tr>);

impl<Tr: SplitListTraits> CollectionTraits for ChainTraits<Tr> {
    type Gc = Tr::Gc;
    type Backoff = Tr::Backoff;
    type ItemCounter = Tr::ItemCounter;
    type MemoryModel = Tr::MemoryModel;
    type Stat = Tr::Stat;
}

type Chain<K, V, Tr> = LazyList<SplitKey<K>, V, ChainTraits<Tr>>;
type ChainNode<K, V> = Node<SplitKey<K>, V>;

/// A lock-free hash map built as a single split-ordered list.
///
/// All pairs live in one [`LazyList`] sorted by bit-reversed hash. A
/// bucket is nothing but a pointer to a permanent sentinel node inside
/// that list, created lazily the first time the bucket is addressed, and
/// spliced in under its parent bucket's sentinel. Because the list order
/// is the reversed-hash order, doubling the bucket count splits every
/// bucket in two *in place*: the table grows, new sentinels are spliced
/// in, and not a single element moves.
///
/// The table doubles once the pair count exceeds
/// `LOAD_FACTOR × bucket count`, which requires a real item counter in
/// the traits bundle.
pub struct SplitListMap<K, V, Tr: SplitListTraits = DefaultSplitListTraits> {
    list: Chain<K, V, Tr>,
    table: Tr::Table,
    bucket_count: CachePadded<AtomicUsize>,
    hasher: Tr::Hasher,
}

unsafe impl<K: Send + Sync, V: Send + Sync, Tr: SplitListTraits> Send for SplitListMap<K, V, Tr> {}
unsafe impl<K: Send + Sync, V: Send + Sync, Tr: SplitListTraits> Sync for SplitListMap<K, V, Tr> {}

impl<K, V, Tr> SplitListMap<K, V, Tr>
where
    K: Ord + Hash + 'static,
    V: 'static,
    Tr: SplitListTraits,
{
    /// Creates a map sized for `expected_items`. The bucket table is
    /// capped at `expected_items / LOAD_FACTOR` (rounded up to a power of
    /// two), which bounds how often it can double.
    pub fn with_capacity(expected_items: usize) -> SplitListMap<K, V, Tr> {
        let max_buckets = (expected_items / Tr::LOAD_FACTOR.max(1))
            .next_power_of_two()
            .max(2);
        let list = Chain::<K, V, Tr>::new();
        let table = Tr::Table::with_capacity(max_buckets);
        // Bucket 0's sentinel is the list head itself.
        table.set_bucket(0, list.head_node().as_raw().cast::<()>());
        SplitListMap {
            list,
            table,
            bucket_count: CachePadded::new(AtomicUsize::new(2)),
            hasher: Tr::Hasher::default(),
        }
    }

    /// Creates a map with a default capacity of 1024 expected items.
    pub fn new() -> SplitListMap<K, V, Tr> {
        Self::with_capacity(1024)
    }

    fn hash_of<Q: Hash + ?Sized>(&self, key: &Q) -> u64 {
        let mut h = self.hasher.build_hasher();
        key.hash(&mut h);
        h.finish()
    }

    /// Returns the sentinel to start searching from for `bucket`,
    /// initializing it (and transitively its parents) on first touch.
    ///
    /// Initialization splices a new sentinel node into the chain right
    /// under the parent's; racing initializers converge on whichever
    /// splice won. If the guard budget blocks the splice, the parent's
    /// sentinel is returned instead — searching from an ancestor is
    /// always correct, only longer.
    fn ensure_bucket(&self, bucket: u64) -> Shared<ChainNode<K, V>> {
        let entry = self.table.bucket(bucket as usize);
        if !entry.is_null() {
            return Shared::from_raw(entry.cast::<ChainNode<K, V>>());
        }
        debug_assert!(bucket > 0, "bucket 0 is pre-initialized");

        let parent = self.ensure_bucket(parent_bucket(bucket));
        let node = Box::new(Node::new(
            Bound::Key(SplitKey {
                so: dummy_key(bucket),
                key: None,
            }),
            None,
        ));
        match self.list.insert_node_at(parent, node, None) {
            InsertOutcome::Inserted(sentinel) => {
                // Sentinels are not items.
                self.list.counter().decrement();
                self.table
                    .set_bucket(bucket as usize, sentinel.as_raw().cast::<()>());
                sentinel
            }
            InsertOutcome::Exists(sentinel, _node) => {
                self.table
                    .set_bucket(bucket as usize, sentinel.as_raw().cast::<()>());
                sentinel
            }
            InsertOutcome::NoGuards(_node) => parent,
        }
    }

    fn bucket_head(&self, hash: u64) -> Shared<ChainNode<K, V>> {
        let size = self.bucket_count.load(Ordering::Acquire);
        self.ensure_bucket(hash & (size as u64 - 1))
    }

    /// Doubles the bucket count if the load factor is exceeded and the
    /// table can still grow.
    fn maybe_resize(&self) {
        let size = self.bucket_count.load(Ordering::Acquire);
        if self.list.counter().value() <= Tr::LOAD_FACTOR.max(1) * size
            || size * 2 > self.table.capacity()
        {
            return;
        }
        if self
            .bucket_count
            .compare_exchange(size, size * 2, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.list.stat().on_resize();
        }
    }

    fn chain_cmp<'a, Q>(so: u64, key: &'a Q) -> impl Fn(&SplitKey<K>) -> CmpOrdering + 'a
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        move |sk: &SplitKey<K>| {
            sk.so.cmp(&so).then_with(|| match &sk.key {
                // Sentinels and user nodes never share a reversed hash
                // (the parities differ), so this arm only orders the
                // sentinel ahead of the probe.
                None => CmpOrdering::Less,
                Some(k) => k.borrow().cmp(key),
            })
        }
    }

    /// Inserts `key → value` if the key is absent. The pair is dropped
    /// when the key is already present.
    pub fn insert(&self, key: K, value: V) -> bool {
        let hash = self.hash_of(&key);
        let head = self.bucket_head(hash);
        let node = Box::new(Node::new(
            Bound::Key(SplitKey {
                so: regular_key(hash),
                key: Some(key),
            }),
            Some(value),
        ));
        match self.list.insert_node_at(head, node, None) {
            InsertOutcome::Inserted(_) => {
                self.maybe_resize();
                true
            }
            _ => false,
        }
    }

    /// Inserts and, on success, runs `init` on the value after it is
    /// linked and visible to other threads.
    pub fn insert_with(&self, key: K, value: V, init: impl FnOnce(&V)) -> bool {
        let mut guard = match Guard::new() {
            Some(g) => g,
            None => return false,
        };
        let hash = self.hash_of(&key);
        let head = self.bucket_head(hash);
        let node = Box::new(Node::new(
            Bound::Key(SplitKey {
                so: regular_key(hash),
                key: Some(key),
            }),
            Some(value),
        ));
        match self.list.insert_node_at(head, node, Some(&mut guard)) {
            InsertOutcome::Inserted(linked) => {
                init(unsafe { linked.deref() }.value().expect("user node"));
                self.maybe_resize();
                true
            }
            _ => false,
        }
    }

    /// Builds the value with `make` and inserts it if the key is absent.
    pub fn emplace(&self, key: K, make: impl FnOnce() -> V) -> bool {
        self.insert(key, make())
    }

    /// Upsert; see [`LazyList::update`].
    pub fn update(&self, key: K, value: V, f: impl FnOnce(bool, &V)) -> (bool, bool) {
        let mut guard = match Guard::new() {
            Some(g) => g,
            None => return (false, false),
        };
        let hash = self.hash_of(&key);
        let head = self.bucket_head(hash);
        let node = Box::new(Node::new(
            Bound::Key(SplitKey {
                so: regular_key(hash),
                key: Some(key),
            }),
            Some(value),
        ));
        match self.list.insert_node_at(head, node, Some(&mut guard)) {
            InsertOutcome::Inserted(linked) => {
                f(true, unsafe { linked.deref() }.value().expect("user node"));
                self.maybe_resize();
                (true, true)
            }
            InsertOutcome::Exists(existing, _node) => {
                f(false, unsafe { existing.deref() }.value().expect("user node"));
                (true, false)
            }
            InsertOutcome::NoGuards(_node) => (false, false),
        }
    }

    /// Removes `key`. Returns whether a pair was removed.
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + Hash + ?Sized,
    {
        let hash = self.hash_of(key);
        let head = self.bucket_head(hash);
        self.list
            .remove_at(head, &Self::chain_cmp(regular_key(hash), key), |_| {})
    }

    /// Removes `key`, running `f` on the value before the node is
    /// retired.
    pub fn remove_and<Q>(&self, key: &Q, f: impl FnOnce(&V)) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + Hash + ?Sized,
    {
        let hash = self.hash_of(key);
        let head = self.bucket_head(hash);
        self.list
            .remove_at(head, &Self::chain_cmp(regular_key(hash), key), |node| {
                f(unsafe { node.deref() }.value().expect("user node"));
            })
    }

    /// Returns whether `key` is present.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + Hash + ?Sized,
    {
        let hash = self.hash_of(key);
        let head = self.bucket_head(hash);
        self.list
            .find_at(head, &Self::chain_cmp(regular_key(hash), key), |_| ())
            .is_some()
    }

    /// Looks up `key` and applies `f` to its value under protection.
    pub fn find_and<Q, R>(&self, key: &Q, f: impl FnOnce(&V) -> R) -> Option<R>
    where
        K: Borrow<Q>,
        Q: Ord + Hash + ?Sized,
    {
        let hash = self.hash_of(key);
        let head = self.bucket_head(hash);
        self.list
            .find_at(head, &Self::chain_cmp(regular_key(hash), key), |node| {
                f(node.value().expect("user node"))
            })
    }

    /// Looks up `key` and holds the value through `guard`.
    pub fn get<'g, Q>(&self, guard: &'g mut Guard<Tr::Gc>, key: &Q) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: Ord + Hash + ?Sized,
    {
        let hash = self.hash_of(key);
        let head = self.bucket_head(hash);
        self.list
            .get_at(head, &Self::chain_cmp(regular_key(hash), key), guard)
            .map(|node| unsafe { node.deref() }.value().expect("user node"))
    }

    /// Unlinks `key` and holds the value through `guard`.
    pub fn extract<'g, Q>(&self, guard: &'g mut Guard<Tr::Gc>, key: &Q) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: Ord + Hash + ?Sized,
    {
        let hash = self.hash_of(key);
        let head = self.bucket_head(hash);
        let mut taken = None;
        let removed =
            self.list
                .remove_at(head, &Self::chain_cmp(regular_key(hash), key), |node| {
                    guard.assign(node);
                    taken = Some(node);
                });
        if !removed {
            return None;
        }
        taken.map(|node| unsafe { node.deref() }.value().expect("user node"))
    }

    /// Returns `true` if the map holds no pairs. Structural.
    pub fn is_empty(&self) -> bool {
        self.list.empty_at(self.list.head_node())
    }

    /// Number of pairs, per the item-counter policy.
    pub fn len(&self) -> usize {
        self.list.counter().value()
    }

    /// Current bucket count.
    pub fn bucket_count(&self) -> usize {
        self.bucket_count.load(Ordering::Relaxed)
    }

    /// Removes every pair. Not atomic. Sentinels stay.
    pub fn clear(&self) {
        while self.list.remove_first_at(self.list.head_node()) {}
    }

    /// The statistics sink.
    pub fn statistics(&self) -> &Tr::Stat {
        self.list.stat()
    }

    /// Checks the split-order invariants: chain sorted, sentinel keys
    /// even, user keys odd, every initialized bucket's sentinel carrying
    /// the bit-reversal of its index. Not thread-safe; intended for tests
    /// and debugging, never for program logic.
    pub fn debug_validate(&self) {
        self.list.debug_validate();
        self.list.debug_for_each(|node| {
            if let Some(sk) = node.key() {
                match &sk.key {
                    None => assert_eq!(sk.so & 1, 0, "sentinel key with LSB set"),
                    Some(_) => assert_eq!(sk.so & 1, 1, "user key with LSB clear"),
                }
            }
        });
        for bucket in 0..self.bucket_count() {
            let entry = self.table.bucket(bucket);
            if bucket == 0 || entry.is_null() {
                continue;
            }
            let node = unsafe { &*entry.cast::<ChainNode<K, V>>() };
            let sk = node.key().expect("sentinel node has a split key");
            assert_eq!(sk.so, dummy_key(bucket as u64));
            assert!(sk.key.is_none());
        }
    }
}

impl<K, V, Tr> Default for SplitListMap<K, V, Tr>
where
    K: Ord + Hash + 'static,
    V: 'static,
    Tr: SplitListTraits,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, Tr: SplitListTraits> fmt::Debug for SplitListMap<K, V, Tr> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("SplitListMap { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket_table::StaticBucketTable;
    use crate::stat::CountingCollectionStat;
    use tidepool_reclaim::Hp;
    use tidepool_utils::{AtomicCounter, ExpBackoff, RelaxedModel};

    struct StaticTraits;

    impl SplitListTraits for StaticTraits {
        type Gc = Hp;
        type Backoff = ExpBackoff;
        type ItemCounter = AtomicCounter;
        type MemoryModel = RelaxedModel;
        type Stat = CountingCollectionStat;
        type Hasher = std::collections::hash_map::RandomState;
        type Table = StaticBucketTable;
        const LOAD_FACTOR: usize = 2;
    }

    #[test]
    fn key_encoding_parities() {
        assert_eq!(regular_key(0) & 1, 1);
        assert_eq!(dummy_key(0) & 1, 0);
        assert_eq!(dummy_key(3), 3u64.reverse_bits());
        assert_eq!(parent_bucket(0b110), 0b010);
        assert_eq!(parent_bucket(1), 0);
    }

    #[test]
    fn insert_find_remove() {
        let map: SplitListMap<u64, u64> = SplitListMap::new();
        assert!(map.insert(5, 50));
        assert!(!map.insert(5, 51));
        assert!(map.contains(&5));
        assert_eq!(map.find_and(&5, |v| *v), Some(50));
        assert!(map.remove(&5));
        assert!(!map.remove(&5));
        assert!(!map.contains(&5));
        map.debug_validate();
    }

    #[test]
    fn grows_by_doubling_without_moving() {
        let map: SplitListMap<u64, u64, StaticTraits> = SplitListMap::with_capacity(4096);
        let start_buckets = map.bucket_count();
        for k in 0..512 {
            assert!(map.insert(k, k));
        }
        assert!(map.bucket_count() > start_buckets);
        assert!(map.bucket_count().is_power_of_two());
        assert_eq!(map.len(), 512);
        for k in 0..512 {
            assert!(map.contains(&k), "lost key {} after resizing", k);
        }
        assert!(map.statistics().resizes() > 0);
        map.debug_validate();
    }

    #[test]
    fn set_law_random() {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        use std::collections::BTreeMap;

        let mut rng = StdRng::seed_from_u64(0x5eed);
        let map: SplitListMap<u32, u32> = SplitListMap::new();
        let mut model = BTreeMap::new();

        for _ in 0..6000 {
            let k = rng.gen_range(0..512u32);
            if rng.gen_bool(0.6) {
                assert_eq!(map.insert(k, k), !model.contains_key(&k));
                model.entry(k).or_insert(k);
            } else {
                assert_eq!(map.remove(&k), model.remove(&k).is_some());
            }
        }
        for k in 0..512u32 {
            assert_eq!(map.contains(&k), model.contains_key(&k));
        }
        map.debug_validate();
    }

    #[test]
    fn guarded_get_and_extract() {
        let map: SplitListMap<String, Vec<u8>> = SplitListMap::new();
        map.insert("alpha".to_string(), vec![1, 2, 3]);

        let mut guard = Guard::<Hp>::new().unwrap();
        assert_eq!(map.get(&mut guard, "alpha"), Some(&vec![1, 2, 3]));

        let mut guard2 = Guard::<Hp>::new().unwrap();
        let v = map.extract(&mut guard2, "alpha").cloned();
        assert_eq!(v, Some(vec![1, 2, 3]));
        assert!(!map.contains("alpha"));
    }

    #[test]
    fn clear_keeps_sentinels_working() {
        let map: SplitListMap<u64, u64> = SplitListMap::new();
        for k in 0..100 {
            map.insert(k, k);
        }
        map.clear();
        assert!(map.is_empty());
        assert_eq!(map.len(), 0);
        // Buckets survive a clear and keep serving inserts.
        for k in 0..100 {
            assert!(map.insert(k, k + 1));
        }
        assert_eq!(map.find_and(&7, |v| *v), Some(8));
        map.debug_validate();
    }

    #[test]
    fn concurrent_mixed_workload() {
        use crossbeam_utils::thread;

        let map: SplitListMap<u32, u32> = SplitListMap::with_capacity(4096);

        thread::scope(|scope| {
            for t in 0..4u32 {
                let map = &map;
                scope.spawn(move |_| {
                    // Disjoint key ranges per thread, plus lookups across
                    // everyone's range.
                    let base = t * 1000;
                    for k in base..base + 1000 {
                        assert!(map.insert(k, k));
                    }
                    for k in base..base + 1000 {
                        assert!(map.contains(&k));
                    }
                    for k in (base..base + 1000).step_by(2) {
                        assert!(map.remove(&k));
                    }
                });
            }
        })
        .unwrap();

        for t in 0..4u32 {
            let base = t * 1000;
            for k in base..base + 1000 {
                assert_eq!(map.contains(&k), k % 2 == 1);
            }
        }
        map.debug_validate();
    }
}
