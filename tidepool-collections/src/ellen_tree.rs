//! The Ellen, Fatourou, Ruppert and van Breugel non-blocking external
//! binary search tree.

use std::borrow::Borrow;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::Ordering;

use tidepool_reclaim::{Atomic, Gc, Guard, Owned, Shared};
use tidepool_utils::{ItemCounter, MemoryModel};

use crate::stat::CollectionStat;
use crate::{CollectionTraits, DefaultCollectionTraits};

/// Update-field states, packed into the descriptor pointer's low bits.
const CLEAN: usize = 0;
const IFLAG: usize = 1;
const DFLAG: usize = 2;
const MARK: usize = 3;

/// Routing/leaf key. The two infinite keys sort above every user key;
/// `Inf2` anchors the root and the rightmost sentinel leaf, `Inf1` the
/// sentinel leaf that all user keys insert to the left of.
enum TreeKey<K> {
    Finite(K),
    Inf1,
    Inf2,
}

impl<K> TreeKey<K> {
    /// `true` if a search for `target` branches left at a node with this
    /// routing key.
    fn goes_left<Q>(&self, target: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        match self {
            TreeKey::Finite(k) => target < k.borrow(),
            TreeKey::Inf1 | TreeKey::Inf2 => true,
        }
    }

    fn matches<Q>(&self, target: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        match self {
            TreeKey::Finite(k) => k.borrow() == target,
            _ => false,
        }
    }

    fn is_finite(&self) -> bool {
        matches!(self, TreeKey::Finite(_))
    }
}

impl<K: Clone> TreeKey<K> {
    fn duplicate(&self) -> TreeKey<K> {
        match self {
            TreeKey::Finite(k) => TreeKey::Finite(k.clone()),
            TreeKey::Inf1 => TreeKey::Inf1,
            TreeKey::Inf2 => TreeKey::Inf2,
        }
    }
}

/// A tree node. Leaves carry the values; internal nodes route and carry
/// the `update` word that serializes structural changes below them.
struct TreeNode<K, V> {
    key: TreeKey<K>,
    value: Option<V>,
    is_leaf: bool,
    left: Atomic<TreeNode<K, V>>,
    right: Atomic<TreeNode<K, V>>,
    update: Atomic<UpdateDesc<K, V>>,
}

unsafe impl<K: Send + Sync, V: Send + Sync> Send for TreeNode<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for TreeNode<K, V> {}

impl<K, V> TreeNode<K, V> {
    fn leaf(key: TreeKey<K>, value: Option<V>) -> TreeNode<K, V> {
        TreeNode {
            key,
            value,
            is_leaf: true,
            left: Atomic::null(),
            right: Atomic::null(),
            update: Atomic::null(),
        }
    }

    fn internal(
        key: TreeKey<K>,
        left: Shared<TreeNode<K, V>>,
        right: Shared<TreeNode<K, V>>,
    ) -> TreeNode<K, V> {
        TreeNode {
            key,
            value: None,
            is_leaf: false,
            left: Atomic::from_shared(left),
            right: Atomic::from_shared(right),
            update: Atomic::null(),
        }
    }

    fn child(&self, right: bool) -> &Atomic<TreeNode<K, V>> {
        if right {
            &self.right
        } else {
            &self.left
        }
    }
}

/// The payload of a pending operation. Any thread that reads a flagged
/// update word can finish the operation from this record alone; child
/// sides are recorded so helpers never have to compare routing keys of
/// nodes they have not protected.
enum UpdateDesc<K, V> {
    Insert {
        l: Shared<TreeNode<K, V>>,
        new_internal: Shared<TreeNode<K, V>>,
        /// Side of the flagged parent that `l` occupies.
        l_right: bool,
    },
    Delete {
        p: Shared<TreeNode<K, V>>,
        l: Shared<TreeNode<K, V>>,
        /// `p`'s update word as observed by the deleter; the mark CAS
        /// requires it unchanged.
        p_update: Shared<UpdateDesc<K, V>>,
        /// Side of the flagged grandparent that `p` occupies.
        p_right: bool,
    },
}

unsafe impl<K: Send + Sync, V: Send + Sync> Send for UpdateDesc<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for UpdateDesc<K, V> {}

/// The guard set a tree operation works with: three for the search path,
/// two for the update words it snapshots, one spare for helping.
struct SearchGuards<Tr: CollectionTraits> {
    gp: Guard<Tr::Gc>,
    p: Guard<Tr::Gc>,
    l: Guard<Tr::Gc>,
    pup: Guard<Tr::Gc>,
    gpup: Guard<Tr::Gc>,
    spare: Guard<Tr::Gc>,
}

impl<Tr: CollectionTraits> SearchGuards<Tr> {
    fn new() -> Option<SearchGuards<Tr>> {
        Some(SearchGuards {
            gp: Guard::new()?,
            p: Guard::new()?,
            l: Guard::new()?,
            pup: Guard::new()?,
            gpup: Guard::new()?,
            spare: Guard::new()?,
        })
    }
}

/// What a descent found. All pointers are protected by the guards the
/// search ran with: `gp` (null when `p` is the root), `p`, the leaf `l`,
/// and the two update-word snapshots. The `*_right` fields record which
/// child slot each link went through.
struct SearchResult<K, V> {
    gp: Shared<TreeNode<K, V>>,
    p: Shared<TreeNode<K, V>>,
    l: Shared<TreeNode<K, V>>,
    p_update: Shared<UpdateDesc<K, V>>,
    gp_update: Shared<UpdateDesc<K, V>>,
    /// Side of `gp` holding `p`. Meaningless while `gp` is null.
    p_right: bool,
    /// Side of `p` holding `l`.
    l_right: bool,
}

enum Attempt {
    Done,
    Retry,
}

/// The Ellen et al. leaf-oriented lock-free binary search tree.
///
/// User pairs live only in leaves; internal nodes are routers with
/// exactly two children. A structural change first CASes a descriptor
/// into the affected internal node's `update` word (IFlag for inserts,
/// DFlag then Mark for deletes); the child swing and the unflag follow.
/// Any thread that encounters a flagged word helps the pending operation
/// to completion before retrying its own, which is what makes every
/// operation lock-free.
///
/// The tree is deliberately unbalanced: sorted insertion degenerates it
/// into a list, exactly as in the sequential external BST.
///
/// Unlinked routers, leaves and displaced descriptors are retired
/// through the traits bundle's reclamation scheme. Descents validate
/// every step against the guarded parent's update word and restart from
/// the root when it moved, so a traversal never trusts the children of a
/// node whose removal has begun.
pub struct EllenTree<K, V, Tr: CollectionTraits = DefaultCollectionTraits> {
    root: Atomic<TreeNode<K, V>>,
    counter: Tr::ItemCounter,
    stat: Tr::Stat,
    _marker: PhantomData<Tr>,
}

unsafe impl<K: Send + Sync, V: Send + Sync, Tr: CollectionTraits> Send for EllenTree<K, V, Tr> {}
unsafe impl<K: Send + Sync, V: Send + Sync, Tr: CollectionTraits> Sync for EllenTree<K, V, Tr> {}

impl<K, V, Tr> EllenTree<K, V, Tr>
where
    K: Ord + Clone + 'static,
    V: 'static,
    Tr: CollectionTraits,
{
    /// Creates an empty tree: a root router keyed `Inf2` over the two
    /// sentinel leaves.
    pub fn new() -> EllenTree<K, V, Tr> {
        let inf1 = Owned::new(TreeNode::leaf(TreeKey::Inf1, None)).into_shared();
        let inf2 = Owned::new(TreeNode::leaf(TreeKey::Inf2, None)).into_shared();
        let root = Owned::new(TreeNode::internal(TreeKey::Inf2, inf1, inf2)).into_shared();
        EllenTree {
            root: Atomic::from_shared(root),
            counter: Tr::ItemCounter::default(),
            stat: Tr::Stat::default(),
            _marker: PhantomData,
        }
    }

    fn root_node(&self) -> Shared<TreeNode<K, V>> {
        self.root.load(Ordering::Relaxed)
    }

    /// Descends from the root, branching by `go_left` at every router,
    /// until a leaf.
    ///
    /// Each step protects the child, then re-reads the guarded parent's
    /// update word: if it changed, or the parent is marked, the children
    /// cannot be trusted (the parent may already be unlinked with its
    /// fields frozen) and the descent restarts from the root. A marked
    /// parent whose grandparent snapshot still carries the matching DFlag
    /// is helped first, so a stalled deleter cannot make searchers spin
    /// forever.
    fn search(
        &self,
        go_left: &impl Fn(&TreeKey<K>) -> bool,
        g: &mut SearchGuards<Tr>,
    ) -> SearchResult<K, V> {
        'retry: loop {
            let root = self.root_node();
            let mut gp = Shared::null();
            let mut gp_update: Shared<UpdateDesc<K, V>> = Shared::null();
            let mut p = root;
            let mut p_right = false;
            g.p.assign(p);
            let root_node = unsafe { p.deref() };
            let mut p_update = g.pup.protect(&root_node.update, Tr::MemoryModel::LOAD);
            let mut l_right = !go_left(&root_node.key);
            let mut l = g.l.protect(root_node.child(l_right), Tr::MemoryModel::LOAD);
            if root_node.update.load(Tr::MemoryModel::LOAD) != p_update {
                continue 'retry;
            }

            loop {
                debug_assert!(!l.is_null());
                if unsafe { l.deref() }.is_leaf {
                    return SearchResult {
                        gp,
                        p,
                        l,
                        p_update,
                        gp_update,
                        p_right,
                        l_right,
                    };
                }

                gp = p;
                gp_update = p_update;
                p_right = l_right;
                std::mem::swap(&mut g.gp, &mut g.p);
                std::mem::swap(&mut g.p, &mut g.l);
                std::mem::swap(&mut g.gpup, &mut g.pup);
                p = l;

                let p_node = unsafe { p.deref() };
                p_update = g.pup.protect(&p_node.update, Tr::MemoryModel::LOAD);
                if p_update.tag() == MARK {
                    if gp_update.tag() == DFLAG && gp_update.as_raw() == p_update.as_raw() {
                        self.stat.on_help();
                        self.help_marked(gp_update.with_tag(DFLAG), gp);
                    }
                    continue 'retry;
                }

                l_right = !go_left(&p_node.key);
                l = g.l.protect(p_node.child(l_right), Tr::MemoryModel::LOAD);
                if p_node.update.load(Tr::MemoryModel::LOAD) != p_update {
                    continue 'retry;
                }
            }
        }
    }

    /// Finishes the operation behind a flagged update word observed in
    /// `node`'s update field. `word` must be protected and `node` guarded
    /// by the caller.
    fn help(
        &self,
        word: Shared<UpdateDesc<K, V>>,
        node: Shared<TreeNode<K, V>>,
        g: &mut SearchGuards<Tr>,
    ) {
        self.stat.on_help();
        match word.tag() {
            IFLAG => self.help_insert(word, node),
            DFLAG => self.help_delete_foreign(word, node, g),
            // A bare Mark cannot be helped without its grandparent; the
            // next descent passes the flagged grandparent and helps
            // there.
            _ => {}
        }
    }

    /// Completes an insert whose IFlag is installed in `p`'s update word.
    fn help_insert(&self, word: Shared<UpdateDesc<K, V>>, p: Shared<TreeNode<K, V>>) {
        let UpdateDesc::Insert {
            l,
            new_internal,
            l_right,
        } = (unsafe { word.deref() })
        else {
            debug_assert!(false, "IFlag word with a delete descriptor");
            return;
        };
        let p_node = unsafe { p.deref() };
        let _ = p_node.child(*l_right).compare_exchange(
            *l,
            *new_internal,
            Tr::MemoryModel::RMW_SUCCESS,
            Tr::MemoryModel::RMW_FAILURE,
        );
        let _ = p_node.update.compare_exchange(
            word.with_tag(IFLAG),
            word.with_tag(CLEAN),
            Tr::MemoryModel::RMW_SUCCESS,
            Tr::MemoryModel::RMW_FAILURE,
        );
    }

    /// Helps a delete found flagged in a foreign grandparent `gp`.
    ///
    /// The descriptor's `p` is not on the helper's guarded path, so it is
    /// protected with the spare guard and validated by re-reading the
    /// flag: while the DFlag is installed, the delete has not been
    /// unflagged and its nodes have not been retired.
    fn help_delete_foreign(
        &self,
        word: Shared<UpdateDesc<K, V>>,
        gp: Shared<TreeNode<K, V>>,
        g: &mut SearchGuards<Tr>,
    ) {
        let UpdateDesc::Delete { p, .. } = (unsafe { word.deref() }) else {
            debug_assert!(false, "DFlag word with an insert descriptor");
            return;
        };
        g.spare.assign(*p);
        if unsafe { gp.deref() }.update.load(Tr::MemoryModel::LOAD) != word.with_tag(DFLAG) {
            g.spare.clear();
            return;
        }
        let _ = self.finish_delete(word.with_tag(DFLAG), gp);
        g.spare.clear();
    }

    /// Runs the mark-then-swing half of a delete whose DFlag is installed
    /// in `gp`. The descriptor's `p` must be protected by the caller.
    /// Returns whether the delete went through (`false` means it was
    /// backtracked and the owner must retry).
    fn finish_delete(&self, word: Shared<UpdateDesc<K, V>>, gp: Shared<TreeNode<K, V>>) -> bool {
        let UpdateDesc::Delete { p, p_update, .. } = (unsafe { word.deref() }) else {
            debug_assert!(false, "DFlag word with an insert descriptor");
            return false;
        };
        let p_node = unsafe { p.deref() };
        let marked = word.with_tag(MARK);
        match p_node.update.compare_exchange(
            *p_update,
            marked,
            Tr::MemoryModel::RMW_SUCCESS,
            Tr::MemoryModel::RMW_FAILURE,
        ) {
            Ok(displaced) => {
                self.retire_displaced(displaced);
                self.help_marked(word, gp);
                true
            }
            Err(actual) if actual == marked => {
                self.help_marked(word, gp);
                true
            }
            Err(_) => {
                // Another operation slipped into p's update word first;
                // release the grandparent and let the owner retry.
                let _ = unsafe { gp.deref() }.update.compare_exchange(
                    word.with_tag(DFLAG),
                    word.with_tag(CLEAN),
                    Tr::MemoryModel::RMW_SUCCESS,
                    Tr::MemoryModel::RMW_FAILURE,
                );
                false
            }
        }
    }

    /// Swings `gp`'s child from the marked `p` to `l`'s sibling and
    /// unflags. `p` must be protected by the caller; once marked, its
    /// child pointers can no longer change, so every helper reads the
    /// same sibling.
    fn help_marked(&self, word: Shared<UpdateDesc<K, V>>, gp: Shared<TreeNode<K, V>>) {
        let UpdateDesc::Delete {
            p, l, p_right, ..
        } = (unsafe { word.deref() })
        else {
            debug_assert!(false, "DFlag word with an insert descriptor");
            return;
        };
        let p_node = unsafe { p.deref() };
        let left = p_node.left.load(Tr::MemoryModel::LOAD);
        let sibling = if left == *l {
            p_node.right.load(Tr::MemoryModel::LOAD)
        } else {
            left
        };
        let gp_node = unsafe { gp.deref() };
        let _ = gp_node.child(*p_right).compare_exchange(
            *p,
            sibling,
            Tr::MemoryModel::RMW_SUCCESS,
            Tr::MemoryModel::RMW_FAILURE,
        );
        let _ = gp_node.update.compare_exchange(
            word.with_tag(DFLAG),
            word.with_tag(CLEAN),
            Tr::MemoryModel::RMW_SUCCESS,
            Tr::MemoryModel::RMW_FAILURE,
        );
    }

    /// Retires the descriptor displaced by a successful flag or mark CAS.
    fn retire_displaced(&self, displaced: Shared<UpdateDesc<K, V>>) {
        if !displaced.is_null() {
            unsafe { Tr::Gc::retire(displaced.with_tag(0)) };
        }
    }

    /// Inserts `key → value` if the key is absent. The pair is dropped
    /// when the key is already present.
    pub fn insert(&self, key: K, value: V) -> bool {
        self.insert_impl(key, value, |_| {}).is_some()
    }

    /// Inserts and, on success, runs `init` on the value after it is
    /// linked and visible to other threads.
    pub fn insert_with(&self, key: K, value: V, init: impl FnOnce(&V)) -> bool {
        self.insert_impl(key, value, |leaf| {
            init(unsafe { leaf.deref() }.value.as_ref().expect("user leaf"));
        })
        .is_some()
    }

    /// Builds the value with `make` and inserts it if the key is absent.
    pub fn emplace(&self, key: K, make: impl FnOnce() -> V) -> bool {
        self.insert(key, make())
    }

    /// Upsert. Inserts if absent, otherwise leaves the existing value in
    /// place; `f` receives `(inserted, &value)` for the winning leaf.
    ///
    /// Returns `(ok, inserted)`: `ok` is `false` only on guard
    /// exhaustion, in which case nothing happened.
    pub fn update(&self, key: K, value: V, f: impl FnOnce(bool, &V)) -> (bool, bool) {
        let Some(mut g) = SearchGuards::<Tr>::new() else {
            return (false, false);
        };
        match self.insert_core(key, value, &mut g) {
            InsertCore::Inserted(leaf) => {
                // Still protected by g.l (insert never republishes it).
                f(true, unsafe { leaf.deref() }.value.as_ref().expect("user leaf"));
                (true, true)
            }
            InsertCore::Exists(leaf) => {
                f(false, unsafe { leaf.deref() }.value.as_ref().expect("user leaf"));
                (true, false)
            }
        }
    }

    fn insert_impl(
        &self,
        key: K,
        value: V,
        on_insert: impl FnOnce(Shared<TreeNode<K, V>>),
    ) -> Option<Shared<TreeNode<K, V>>> {
        let mut g = SearchGuards::<Tr>::new()?;
        match self.insert_core(key, value, &mut g) {
            InsertCore::Inserted(leaf) => {
                on_insert(leaf);
                Some(leaf)
            }
            InsertCore::Exists(_) => None,
        }
    }

    /// The insert loop proper. On return the affected leaf is still
    /// protected by `g.l`.
    fn insert_core(&self, key: K, value: V, g: &mut SearchGuards<Tr>) -> InsertCore<K, V> {
        let new_leaf = Owned::new(TreeNode::leaf(TreeKey::Finite(key), Some(value))).into_shared();
        // The key lives in the leaf's stable heap allocation, so the
        // closure stays valid across retries.
        let target: &K = match &unsafe { new_leaf.deref() }.key {
            TreeKey::Finite(k) => k,
            _ => unreachable!(),
        };
        let go_left = |nk: &TreeKey<K>| nk.goes_left(target);

        loop {
            let res = self.search(&go_left, g);
            let l_node = unsafe { res.l.deref() };
            if l_node.key.matches(target) {
                self.stat.on_insert_exists();
                unsafe { drop(new_leaf.into_box()) };
                return InsertCore::Exists(res.l);
            }
            if res.p_update.tag() != CLEAN {
                self.help(res.p_update, res.p, g);
                self.stat.on_insert_retry();
                continue;
            }

            let p_node = unsafe { res.p.deref() };
            // The new router replaces l with {new_leaf, l}, keyed by the
            // larger of the two keys.
            let (left, right, router_key) = if l_node.key.goes_left(target) {
                (new_leaf, res.l, l_node.key.duplicate())
            } else {
                (res.l, new_leaf, TreeKey::Finite(target.clone()))
            };
            let new_internal =
                Owned::new(TreeNode::internal(router_key, left, right)).into_shared();
            let info = Owned::new(UpdateDesc::Insert {
                l: res.l,
                new_internal,
                l_right: res.l_right,
            })
            .into_shared();

            // Publish the hazard on the fresh leaf while it is still
            // private: once the flag CAS lands, a concurrent delete could
            // otherwise retire it before the caller ever looks at it.
            g.l.assign(new_leaf);

            match p_node.update.compare_exchange(
                res.p_update,
                info.with_tag(IFLAG),
                Tr::MemoryModel::RMW_SUCCESS,
                Tr::MemoryModel::RMW_FAILURE,
            ) {
                Ok(displaced) => {
                    self.retire_displaced(displaced);
                    self.help_insert(info.with_tag(IFLAG), res.p);
                    self.counter.increment();
                    self.stat.on_insert();
                    return InsertCore::Inserted(new_leaf);
                }
                Err(_) => {
                    // Never published: plain frees, then help whoever won.
                    unsafe {
                        drop(info.into_box());
                        drop(new_internal.into_box());
                    }
                    let actual = g.pup.protect(&p_node.update, Tr::MemoryModel::LOAD);
                    self.help(actual, res.p, g);
                    self.stat.on_insert_retry();
                }
            }
        }
    }

    /// One delete attempt against a located leaf.
    ///
    /// On success, `before_retire` runs with the leaf still protected,
    /// and the unlinked router and leaf are retired afterwards even if
    /// the callback panics.
    fn try_delete(
        &self,
        res: &SearchResult<K, V>,
        g: &mut SearchGuards<Tr>,
        before_retire: impl FnOnce(Shared<TreeNode<K, V>>),
    ) -> Attempt {
        debug_assert!(!res.gp.is_null(), "finite leaves sit at depth two or more");
        if res.gp_update.tag() != CLEAN {
            self.help(res.gp_update, res.gp, g);
            return Attempt::Retry;
        }
        if res.p_update.tag() != CLEAN {
            self.help(res.p_update, res.p, g);
            return Attempt::Retry;
        }

        let gp_node = unsafe { res.gp.deref() };
        let info = Owned::new(UpdateDesc::Delete {
            p: res.p,
            l: res.l,
            p_update: res.p_update,
            p_right: res.p_right,
        })
        .into_shared();

        match gp_node.update.compare_exchange(
            res.gp_update,
            info.with_tag(DFLAG),
            Tr::MemoryModel::RMW_SUCCESS,
            Tr::MemoryModel::RMW_FAILURE,
        ) {
            Ok(displaced) => {
                self.retire_displaced(displaced);
                if self.finish_delete(info.with_tag(DFLAG), res.gp) {
                    self.counter.decrement();
                    self.stat.on_remove();
                    let retire = scopeguard::guard((res.p, res.l), |(p, l)| unsafe {
                        Tr::Gc::retire(p);
                        Tr::Gc::retire(l);
                    });
                    before_retire(retire.1);
                    Attempt::Done
                } else {
                    // The backtracked descriptor stays installed as
                    // (Clean, info); the next flag on gp retires it.
                    self.stat.on_remove_retry();
                    Attempt::Retry
                }
            }
            Err(_) => {
                unsafe { drop(info.into_box()) };
                let actual = g.gpup.protect(&gp_node.update, Tr::MemoryModel::LOAD);
                self.help(actual, res.gp, g);
                self.stat.on_remove_retry();
                Attempt::Retry
            }
        }
    }

    fn remove_impl<Q>(&self, key: &Q, before_retire: impl FnOnce(Shared<TreeNode<K, V>>)) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let Some(mut g) = SearchGuards::<Tr>::new() else {
            return false;
        };
        let go_left = |nk: &TreeKey<K>| nk.goes_left(key);
        let mut before_retire = Some(before_retire);

        loop {
            let res = self.search(&go_left, &mut g);
            if !unsafe { res.l.deref() }.key.matches(key) {
                self.stat.on_remove_miss();
                return false;
            }
            match self.try_delete(&res, &mut g, |leaf| {
                if let Some(f) = before_retire.take() {
                    f(leaf);
                }
            }) {
                Attempt::Done => return true,
                Attempt::Retry => {}
            }
        }
    }

    /// Removes `key`. Returns whether a pair was removed.
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.remove_impl(key, |_| {})
    }

    /// Removes `key`, running `f` on the value after the unlink and
    /// before the nodes are retired.
    pub fn remove_and<Q>(&self, key: &Q, f: impl FnOnce(&V)) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.remove_impl(key, |leaf| {
            f(unsafe { leaf.deref() }.value.as_ref().expect("user leaf"));
        })
    }

    /// Returns whether `key` is present.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.find_and(key, |_| ()).is_some()
    }

    /// Looks up `key` and applies `f` to its value under protection.
    pub fn find_and<Q, R>(&self, key: &Q, f: impl FnOnce(&V) -> R) -> Option<R>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let mut g = SearchGuards::<Tr>::new()?;
        let go_left = |nk: &TreeKey<K>| nk.goes_left(key);
        let res = self.search(&go_left, &mut g);
        let l_node = unsafe { res.l.deref() };
        if l_node.key.matches(key) {
            self.stat.on_find_hit();
            Some(f(l_node.value.as_ref().expect("user leaf")))
        } else {
            self.stat.on_find_miss();
            None
        }
    }

    /// Looks up `key` and holds the value through `guard`.
    pub fn get<'g, Q>(&self, guard: &'g mut Guard<Tr::Gc>, key: &Q) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let mut g = SearchGuards::<Tr>::new()?;
        let go_left = |nk: &TreeKey<K>| nk.goes_left(key);
        let res = self.search(&go_left, &mut g);
        let l_node = unsafe { res.l.deref() };
        if l_node.key.matches(key) {
            self.stat.on_find_hit();
            guard.assign(res.l);
            Some(unsafe { res.l.deref() }.value.as_ref().expect("user leaf"))
        } else {
            self.stat.on_find_miss();
            None
        }
    }

    /// Unlinks `key` and holds the value through `guard`.
    pub fn extract<'g, Q>(&self, guard: &'g mut Guard<Tr::Gc>, key: &Q) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let mut taken = None;
        let removed = self.remove_impl(key, |leaf| {
            guard.assign(leaf);
            taken = Some(leaf);
        });
        if !removed {
            return None;
        }
        taken.map(|leaf| unsafe { leaf.deref() }.value.as_ref().expect("user leaf"))
    }

    /// Unlinks the leftmost leaf and holds its value through `guard`.
    ///
    /// The value is the minimum observed at the moment the leaf was
    /// guarded; a concurrently inserted smaller key may be missed. That
    /// is inherent to using the tree as a priority queue and callers must
    /// tolerate it.
    pub fn extract_min<'g>(&self, guard: &'g mut Guard<Tr::Gc>) -> Option<&'g V> {
        self.extract_edge(guard, false)
    }

    /// Unlinks the rightmost leaf and holds its value through `guard`.
    /// The same caveat as [`extract_min`](Self::extract_min) applies.
    pub fn extract_max<'g>(&self, guard: &'g mut Guard<Tr::Gc>) -> Option<&'g V> {
        self.extract_edge(guard, true)
    }

    fn extract_edge<'g>(&self, guard: &'g mut Guard<Tr::Gc>, max: bool) -> Option<&'g V> {
        let mut g = SearchGuards::<Tr>::new()?;
        let mut taken = None;
        loop {
            let res = if max {
                self.search_rightmost_finite(&mut g)
            } else {
                // The leftmost leaf: every router branches left.
                self.search(&|_| true, &mut g)
            };
            if !unsafe { res.l.deref() }.key.is_finite() {
                return None;
            }
            match self.try_delete(&res, &mut g, |leaf| {
                guard.assign(leaf);
                taken = Some(leaf);
            }) {
                Attempt::Done => {
                    return taken.map(|leaf| {
                        unsafe { leaf.deref() }.value.as_ref().expect("user leaf")
                    });
                }
                Attempt::Retry => {}
            }
        }
    }

    /// Descends to the rightmost finite leaf.
    ///
    /// The plain rightmost path ends at the `Inf2` sentinel, and the
    /// right child of an infinite-keyed router may be the `Inf1`
    /// sentinel; in both cases the maximum finite leaf (if any) is the
    /// first leaf of the left subtree instead. Same validation discipline
    /// as [`search`](Self::search).
    fn search_rightmost_finite(&self, g: &mut SearchGuards<Tr>) -> SearchResult<K, V> {
        'retry: loop {
            let root = self.root_node();
            let mut gp = Shared::null();
            let mut gp_update: Shared<UpdateDesc<K, V>> = Shared::null();
            let mut p = root;
            let mut p_right = false;
            g.p.assign(p);
            let mut p_update =
                g.pup.protect(&unsafe { p.deref() }.update, Tr::MemoryModel::LOAD);
            if unsafe { p.deref() }.update.load(Tr::MemoryModel::LOAD) != p_update {
                continue 'retry;
            }

            loop {
                let p_node = unsafe { p.deref() };

                let mut l_right = true;
                let mut l = g.l.protect(p_node.child(true), Tr::MemoryModel::LOAD);
                if p_node.update.load(Tr::MemoryModel::LOAD) != p_update {
                    continue 'retry;
                }
                if unsafe { l.deref() }.is_leaf && !unsafe { l.deref() }.key.is_finite() {
                    // The right edge is a sentinel; the candidates live on
                    // the left.
                    l_right = false;
                    l = g.l.protect(p_node.child(false), Tr::MemoryModel::LOAD);
                    if p_node.update.load(Tr::MemoryModel::LOAD) != p_update {
                        continue 'retry;
                    }
                }

                if unsafe { l.deref() }.is_leaf {
                    return SearchResult {
                        gp,
                        p,
                        l,
                        p_update,
                        gp_update,
                        p_right,
                        l_right,
                    };
                }

                gp = p;
                gp_update = p_update;
                p_right = l_right;
                std::mem::swap(&mut g.gp, &mut g.p);
                std::mem::swap(&mut g.p, &mut g.l);
                std::mem::swap(&mut g.gpup, &mut g.pup);
                p = l;

                let p_node = unsafe { p.deref() };
                p_update = g.pup.protect(&p_node.update, Tr::MemoryModel::LOAD);
                if p_update.tag() == MARK {
                    if gp_update.tag() == DFLAG && gp_update.as_raw() == p_update.as_raw() {
                        self.stat.on_help();
                        self.help_marked(gp_update.with_tag(DFLAG), gp);
                    }
                    continue 'retry;
                }
            }
        }
    }

    /// Returns `true` if the tree holds no pairs: the root's left child
    /// is the `Inf1` sentinel leaf.
    pub fn is_empty(&self) -> bool {
        let Some(mut guard) = Guard::<Tr::Gc>::new() else {
            return true;
        };
        let root_node = unsafe { self.root_node().deref() };
        let left = guard.protect(&root_node.left, Tr::MemoryModel::LOAD);
        let left_node = unsafe { left.deref() };
        left_node.is_leaf && !left_node.key.is_finite()
    }

    /// Number of pairs, per the item-counter policy.
    pub fn len(&self) -> usize {
        self.counter.value()
    }

    /// Removes every pair. Not atomic.
    pub fn clear(&self) {
        let Some(mut g) = SearchGuards::<Tr>::new() else {
            return;
        };
        loop {
            let res = self.search(&|_| true, &mut g);
            if !unsafe { res.l.deref() }.key.is_finite() {
                return;
            }
            let _ = self.try_delete(&res, &mut g, |_| {});
        }
    }

    /// The statistics sink.
    pub fn statistics(&self) -> &Tr::Stat {
        &self.stat
    }

    /// Checks the structural invariants: every router has two children,
    /// keys appear only in leaves, in-order leaf keys are strictly
    /// increasing and end with the two sentinels. Not thread-safe;
    /// intended for tests and debugging, never for program logic.
    pub fn debug_validate(&self) {
        fn walk<K: Ord, V>(node: Shared<TreeNode<K, V>>, leaves: &mut Vec<*const TreeNode<K, V>>) {
            let n = unsafe { node.deref() };
            if n.is_leaf {
                leaves.push(node.as_raw());
                return;
            }
            let left = n.left.load(Ordering::Relaxed);
            let right = n.right.load(Ordering::Relaxed);
            assert!(!left.is_null() && !right.is_null(), "router missing a child");
            assert_eq!(
                n.update.load(Ordering::Relaxed).tag(),
                CLEAN,
                "pending operation in quiescence"
            );
            walk(left, leaves);
            walk(right, leaves);
        }

        let mut leaves = Vec::new();
        walk(self.root_node(), &mut leaves);
        let mut prev: Option<&TreeKey<K>> = None;
        for leaf in leaves {
            let node = unsafe { &*leaf };
            assert!(node.is_leaf);
            if let (Some(a), TreeKey::Finite(b)) = (&prev, &node.key) {
                if let TreeKey::Finite(a) = a {
                    assert!(a < b, "leaf keys out of order");
                }
            }
            prev = Some(&node.key);
        }
        // The in-order walk ends with the two sentinels.
        assert!(matches!(prev, Some(TreeKey::Inf2)));
    }
}

enum InsertCore<K, V> {
    Inserted(Shared<TreeNode<K, V>>),
    Exists(Shared<TreeNode<K, V>>),
}

impl<K, V, Tr> Default for EllenTree<K, V, Tr>
where
    K: Ord + Clone + 'static,
    V: 'static,
    Tr: CollectionTraits,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, Tr: CollectionTraits> Drop for EllenTree<K, V, Tr> {
    fn drop(&mut self) {
        // Exclusive access: free nodes iteratively, and with each router
        // the descriptor still parked in its update word. Retired
        // descriptors and nodes are already owned by the reclamation
        // scheme and are not reachable from here.
        let mut stack = vec![self.root.load(Ordering::Relaxed)];
        while let Some(cur) = stack.pop() {
            if cur.is_null() {
                continue;
            }
            let node = unsafe { cur.into_box() };
            if !node.is_leaf {
                stack.push(node.left.load(Ordering::Relaxed));
                stack.push(node.right.load(Ordering::Relaxed));
                let desc = node.update.load(Ordering::Relaxed);
                // A Mark word shares its descriptor with the flagging
                // grandparent; the grandparent's word owns it.
                if !desc.is_null() && desc.tag() != MARK {
                    unsafe { drop(desc.with_tag(0).into_box()) };
                }
            }
        }
    }
}

impl<K, V, Tr: CollectionTraits> fmt::Debug for EllenTree<K, V, Tr> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("EllenTree { .. }")
    }
}

/// Derives the key a value is indexed by in an [`EllenTreeSet`].
pub trait KeyExtractor<V>: 'static {
    /// The derived key type.
    type Key: Ord + Clone + 'static;

    /// Extracts the key of `value`.
    fn extract(value: &V) -> Self::Key;
}

/// A set-of-values view over [`EllenTree`]: the element type carries its
/// own key, derived by a [`KeyExtractor`].
pub struct EllenTreeSet<V, E, Tr = DefaultCollectionTraits>
where
    E: KeyExtractor<V>,
    Tr: CollectionTraits,
{
    tree: EllenTree<E::Key, V, Tr>,
}

impl<V, E, Tr> EllenTreeSet<V, E, Tr>
where
    V: 'static,
    E: KeyExtractor<V>,
    Tr: CollectionTraits,
{
    /// Creates an empty set.
    pub fn new() -> EllenTreeSet<V, E, Tr> {
        EllenTreeSet {
            tree: EllenTree::new(),
        }
    }

    /// Inserts `value` if its key is absent.
    pub fn insert(&self, value: V) -> bool {
        let key = E::extract(&value);
        self.tree.insert(key, value)
    }

    /// Removes the value keyed `key`.
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        E::Key: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.tree.remove(key)
    }

    /// Returns whether a value keyed `key` is present.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        E::Key: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.tree.contains(key)
    }

    /// Unlinks the value with the least observed key; see
    /// [`EllenTree::extract_min`].
    pub fn extract_min<'g>(&self, guard: &'g mut Guard<Tr::Gc>) -> Option<&'g V> {
        self.tree.extract_min(guard)
    }

    /// Unlinks the value with the greatest observed key; see
    /// [`EllenTree::extract_max`].
    pub fn extract_max<'g>(&self, guard: &'g mut Guard<Tr::Gc>) -> Option<&'g V> {
        self.tree.extract_max(guard)
    }

    /// The underlying tree.
    pub fn as_tree(&self) -> &EllenTree<E::Key, V, Tr> {
        &self.tree
    }
}

impl<V, E, Tr> Default for EllenTreeSet<V, E, Tr>
where
    V: 'static,
    E: KeyExtractor<V>,
    Tr: CollectionTraits,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V, E, Tr> fmt::Debug for EllenTreeSet<V, E, Tr>
where
    E: KeyExtractor<V>,
    Tr: CollectionTraits,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("EllenTreeSet { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stat::CountingCollectionStat;
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
    fn empty_tree_shape() {
        let tree: EllenTree<i32, i32> = EllenTree::new();
        assert!(tree.is_empty());
        assert!(!tree.contains(&1));
        tree.debug_validate();
    }

    #[test]
    fn insert_find_remove() {
        let tree: EllenTree<i32, String, CountingTraits> = EllenTree::new();
        assert!(tree.insert(5, "five".into()));
        assert!(!tree.insert(5, "again".into()));
        assert_eq!(tree.len(), 1);
        assert!(tree.contains(&5));
        assert_eq!(tree.find_and(&5, |v| v.clone()), Some("five".to_string()));
        assert!(tree.remove(&5));
        assert!(!tree.remove(&5));
        assert!(!tree.contains(&5));
        assert!(tree.is_empty());
        assert_eq!(tree.statistics().insert_duplicates(), 1);
        tree.debug_validate();
    }

    #[test]
    fn extract_min_drains_in_order() {
        let tree: EllenTree<i32, i32> = EllenTree::new();
        for k in [3, 1, 4, 1, 5, 9, 2, 6] {
            tree.insert(k, k);
        }
        // Duplicate 1 was rejected: 7 distinct keys.
        let mut drained = Vec::new();
        loop {
            let mut guard = Guard::<Hp>::new().unwrap();
            match tree.extract_min(&mut guard) {
                Some(v) => drained.push(*v),
                None => break,
            }
        }
        assert_eq!(drained, vec![1, 2, 3, 4, 5, 6, 9]);
        assert!(tree.is_empty());
        tree.debug_validate();
    }

    #[test]
    fn extract_max_mirrors_min() {
        let tree: EllenTree<i32, i32, PtbTraits> = EllenTree::new();
        for k in [10, 30, 20] {
            tree.insert(k, k);
        }
        let mut guard = Guard::<Ptb>::new().unwrap();
        assert_eq!(tree.extract_max(&mut guard).copied(), Some(30));
        guard.clear();
        assert_eq!(tree.extract_max(&mut guard).copied(), Some(20));
        guard.clear();
        assert_eq!(tree.extract_max(&mut guard).copied(), Some(10));
        guard.clear();
        assert_eq!(tree.extract_max(&mut guard).copied(), None);
        tree.debug_validate();
    }

    #[test]
    fn set_law_random() {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        use std::collections::BTreeMap;

        let mut rng = StdRng::seed_from_u64(0xe11e);
        let tree: EllenTree<u16, u16> = EllenTree::new();
        let mut model = BTreeMap::new();

        for _ in 0..4000 {
            let k = rng.gen_range(0..128u16);
            if rng.gen_bool(0.55) {
                assert_eq!(tree.insert(k, k), !model.contains_key(&k));
                model.entry(k).or_insert(k);
            } else {
                assert_eq!(tree.remove(&k), model.remove(&k).is_some());
            }
        }
        for k in 0..128u16 {
            assert_eq!(tree.contains(&k), model.contains_key(&k));
        }
        tree.debug_validate();
    }

    #[test]
    fn sorted_insertion_still_works() {
        // Degenerates the shape into a spine; correctness must hold.
        let tree: EllenTree<u32, u32> = EllenTree::new();
        for k in 0..200 {
            assert!(tree.insert(k, k * 2));
        }
        for k in 0..200 {
            assert_eq!(tree.find_and(&k, |v| *v), Some(k * 2));
        }
        for k in (0..200).step_by(2) {
            assert!(tree.remove(&k));
        }
        for k in 0..200 {
            assert_eq!(tree.contains(&k), k % 2 == 1);
        }
        tree.debug_validate();
    }

    #[test]
    fn guarded_get_and_extract() {
        let tree: EllenTree<i32, Vec<u8>> = EllenTree::new();
        tree.insert(1, vec![9, 9]);

        let mut guard = Guard::<Hp>::new().unwrap();
        assert_eq!(tree.get(&mut guard, &1), Some(&vec![9, 9]));

        let mut guard2 = Guard::<Hp>::new().unwrap();
        let v = tree.extract(&mut guard2, &1).cloned();
        assert_eq!(v, Some(vec![9, 9]));
        assert!(!tree.contains(&1));
    }

    #[test]
    fn update_is_an_upsert() {
        let tree: EllenTree<i32, i32> = EllenTree::new();
        let (ok, inserted) = tree.update(7, 70, |fresh, v| {
            assert!(fresh);
            assert_eq!(*v, 70);
        });
        assert!(ok && inserted);
        let (ok, inserted) = tree.update(7, 71, |fresh, v| {
            assert!(!fresh);
            assert_eq!(*v, 70);
        });
        assert!(ok && !inserted);
    }

    #[test]
    fn key_extractor_set() {
        #[derive(Clone)]
        struct Person {
            id: u64,
            name: &'static str,
        }

        struct ById;

        impl KeyExtractor<Person> for ById {
            type Key = u64;

            fn extract(p: &Person) -> u64 {
                p.id
            }
        }

        let set: EllenTreeSet<Person, ById> = EllenTreeSet::new();
        assert!(set.insert(Person { id: 2, name: "b" }));
        assert!(set.insert(Person { id: 1, name: "a" }));
        assert!(!set.insert(Person { id: 2, name: "dup" }));
        assert!(set.contains(&1));

        let mut guard = Guard::<Hp>::new().unwrap();
        assert_eq!(set.extract_min(&mut guard).map(|p| p.name), Some("a"));
    }

    #[test]
    fn clear_empties() {
        let tree: EllenTree<u32, u32, CountingTraits> = EllenTree::new();
        for k in 0..100 {
            tree.insert(k, k);
        }
        tree.clear();
        assert!(tree.is_empty());
        assert_eq!(tree.len(), 0);
        tree.debug_validate();
    }

    #[test]
    fn concurrent_disjoint_inserts_and_removes() {
        use crossbeam_utils::thread;

        let tree: EllenTree<u32, u32, CountingTraits> = EllenTree::new();

        thread::scope(|scope| {
            for t in 0..4u32 {
                let tree = &tree;
                scope.spawn(move |_| {
                    let base = t * 500;
                    for k in base..base + 500 {
                        assert!(tree.insert(k, k));
                    }
                    for k in (base..base + 500).step_by(2) {
                        assert!(tree.remove(&k));
                    }
                });
            }
        })
        .unwrap();

        for t in 0..4u32 {
            let base = t * 500;
            for k in base..base + 500 {
                assert_eq!(tree.contains(&k), k % 2 == 1, "key {}", k);
            }
        }
        assert_eq!(tree.len(), 1000);
        tree.debug_validate();
    }

    #[test]
    fn concurrent_contended_same_keys() {
        use crossbeam_utils::thread;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let tree: EllenTree<u32, u32, CountingTraits> = EllenTree::new();
        let net = AtomicUsize::new(0);

        thread::scope(|scope| {
            for _ in 0..4 {
                let tree = &tree;
                let net = &net;
                scope.spawn(move |_| {
                    for round in 0..50u32 {
                        for k in 0..32u32 {
                            if tree.insert(k, round) {
                                net.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        for k in 0..32u32 {
                            if tree.remove(&k) {
                                net.fetch_sub(1, Ordering::Relaxed);
                            }
                        }
                    }
                });
            }
        })
        .unwrap();

        // Every successful insert was matched by at most one successful
        // remove; whatever net remains must be exactly what the tree
        // still holds.
        let mut present = 0;
        for k in 0..32u32 {
            if tree.contains(&k) {
                present += 1;
            }
        }
        assert_eq!(present, net.load(Ordering::Relaxed));
        tree.debug_validate();
    }
}
