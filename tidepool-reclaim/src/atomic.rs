//! Word-sized atomic pointers with tag bits.

use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Returns a bitmask of the low bits unused by aligned pointers to `T`.
#[inline]
fn low_bits<T>() -> usize {
    (1 << mem::align_of::<T>().trailing_zeros()) - 1
}

/// Packs a tag into the unused low bits of `raw`.
#[inline]
fn compose<T>(raw: *mut T, tag: usize) -> usize {
    debug_assert_eq!(raw as usize & low_bits::<T>(), 0, "unaligned pointer");
    raw as usize | (tag & low_bits::<T>())
}

/// Splits a composed word back into pointer and tag.
#[inline]
fn decompose<T>(data: usize) -> (*mut T, usize) {
    ((data & !low_bits::<T>()) as *mut T, data & low_bits::<T>())
}

/// An atomic pointer to `T` that can carry a tag in its alignment-spare low
/// bits.
///
/// This is the linkage-field type of every tidepool container. All
/// operations take explicit [`Ordering`]s; the container's memory-model
/// policy decides what gets passed. Loads return a [`Shared`] snapshot,
/// which is only safe to dereference while a hazard guard holds the same
/// pointer — the type system does not enforce that, the containers'
/// protect-then-validate discipline does.
pub struct Atomic<T> {
    data: AtomicUsize,
    _marker: PhantomData<*mut T>,
}

unsafe impl<T: Send + Sync> Send for Atomic<T> {}
unsafe impl<T: Send + Sync> Sync for Atomic<T> {}

impl<T> Atomic<T> {
    /// Returns a new null atomic pointer.
    pub const fn null() -> Atomic<T> {
        Atomic {
            data: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    /// Allocates `value` on the heap and returns an atomic pointer to it.
    pub fn new(value: T) -> Atomic<T> {
        Atomic::from_shared(Owned::new(value).into_shared())
    }

    /// Returns an atomic pointer initialized to `shared`.
    pub fn from_shared(shared: Shared<T>) -> Atomic<T> {
        Atomic {
            data: AtomicUsize::new(shared.data),
            _marker: PhantomData,
        }
    }

    /// Loads the current value.
    #[inline]
    pub fn load(&self, ord: Ordering) -> Shared<T> {
        Shared::from_data(self.data.load(ord))
    }

    /// Stores `new`.
    #[inline]
    pub fn store(&self, new: Shared<T>, ord: Ordering) {
        self.data.store(new.data, ord);
    }

    /// Stores `new`, returning the previous value.
    #[inline]
    pub fn swap(&self, new: Shared<T>, ord: Ordering) -> Shared<T> {
        Shared::from_data(self.data.swap(new.data, ord))
    }

    /// Compares the current value with `current` (pointer and tag) and, if
    /// equal, replaces it with `new`.
    ///
    /// On success returns the previous value; on failure the actual one.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: Shared<T>,
        new: Shared<T>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Shared<T>, Shared<T>> {
        self.data
            .compare_exchange(current.data, new.data, success, failure)
            .map(Shared::from_data)
            .map_err(Shared::from_data)
    }

    /// Bitwise-ors `tag` into the current value, returning the previous
    /// value. Used to set mark bits without a CAS loop.
    #[inline]
    pub fn fetch_or(&self, tag: usize, ord: Ordering) -> Shared<T> {
        Shared::from_data(self.data.fetch_or(tag & low_bits::<T>(), ord))
    }
}

impl<T> Default for Atomic<T> {
    fn default() -> Self {
        Atomic::null()
    }
}

impl<T> fmt::Debug for Atomic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (raw, tag) = decompose::<T>(self.data.load(Ordering::Relaxed));
        f.debug_struct("Atomic")
            .field("raw", &raw)
            .field("tag", &tag)
            .finish()
    }
}

/// A tagged pointer snapshot loaded from an [`Atomic`].
///
/// `Shared` is `Copy` and carries no lifetime: it is a plain word. Whether
/// dereferencing it is sound depends on the reclamation protocol — a
/// container may only call [`deref`](Shared::deref) on a pointer that a
/// hazard guard has published and validated, or on a path with exclusive
/// access (`&mut self`, drop).
pub struct Shared<T> {
    data: usize,
    _marker: PhantomData<*const T>,
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Shared<T> {}

impl<T> PartialEq for Shared<T> {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl<T> Eq for Shared<T> {}

impl<T> Shared<T> {
    /// The null pointer with a zero tag.
    pub const fn null() -> Shared<T> {
        Shared {
            data: 0,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub(crate) fn from_data(data: usize) -> Shared<T> {
        Shared {
            data,
            _marker: PhantomData,
        }
    }

    /// Wraps a raw pointer with a zero tag.
    #[inline]
    pub fn from_raw(raw: *const T) -> Shared<T> {
        Shared::from_data(compose(raw as *mut T, 0))
    }

    /// Returns the pointer with the tag bits stripped.
    #[inline]
    pub fn as_raw(&self) -> *mut T {
        decompose::<T>(self.data).0
    }

    /// Returns the tag.
    #[inline]
    pub fn tag(&self) -> usize {
        decompose::<T>(self.data).1
    }

    /// Returns the same pointer with the tag replaced by `tag`.
    #[inline]
    pub fn with_tag(&self, tag: usize) -> Shared<T> {
        Shared::from_data(compose(self.as_raw(), tag))
    }

    /// Returns `true` if the pointer (ignoring the tag) is null.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.as_raw().is_null()
    }

    /// Dereferences the pointer.
    ///
    /// # Safety
    ///
    /// The pointer must be non-null and protected from reclamation for the
    /// chosen lifetime.
    #[inline]
    pub unsafe fn deref<'a>(&self) -> &'a T {
        &*self.as_raw()
    }

    /// Converts to a reference, or `None` if null.
    ///
    /// # Safety
    ///
    /// As for [`deref`](Shared::deref).
    #[inline]
    pub unsafe fn as_ref<'a>(&self) -> Option<&'a T> {
        self.as_raw().as_ref()
    }

    /// Takes back ownership of the pointed-to box.
    ///
    /// # Safety
    ///
    /// The pointer must be non-null, originate from [`Owned`], and be
    /// unreachable to every other thread.
    #[inline]
    pub unsafe fn into_box(self) -> Box<T> {
        debug_assert!(!self.is_null());
        Box::from_raw(self.as_raw())
    }
}

impl<T> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("raw", &self.as_raw())
            .field("tag", &self.tag())
            .finish()
    }
}

/// A uniquely-owned heap allocation, the precursor of a published node.
pub struct Owned<T> {
    inner: Box<T>,
}

impl<T> Owned<T> {
    /// Allocates `value` on the heap.
    pub fn new(value: T) -> Owned<T> {
        Owned {
            inner: Box::new(value),
        }
    }

    /// Relinquishes ownership, returning the allocation as a [`Shared`]
    /// with a zero tag. The caller becomes responsible for retiring or
    /// reclaiming it.
    pub fn into_shared(self) -> Shared<T> {
        Shared::from_raw(Box::into_raw(self.inner))
    }
}

impl<T> std::ops::Deref for Owned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> std::ops::DerefMut for Owned<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T: fmt::Debug> fmt::Debug for Owned<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Owned").field("value", &self.inner).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};

    #[test]
    fn tag_round_trip() {
        let a = Atomic::<u64>::new(5);
        let p = a.load(Relaxed);
        assert_eq!(p.tag(), 0);
        a.store(p.with_tag(1), Release);
        let q = a.load(Acquire);
        assert_eq!(q.tag(), 1);
        assert_eq!(q.as_raw(), p.as_raw());
        unsafe {
            assert_eq!(*q.deref(), 5);
            drop(q.into_box());
        }
    }

    #[test]
    fn cas_compares_tag() {
        let a = Atomic::<u64>::new(9);
        let p = a.load(Relaxed);
        a.fetch_or(1, Relaxed);
        // The untagged snapshot no longer matches.
        assert!(a.compare_exchange(p, Shared::null(), AcqRel, Relaxed).is_err());
        assert!(a
            .compare_exchange(p.with_tag(1), Shared::null(), AcqRel, Relaxed)
            .is_ok());
        unsafe { drop(p.into_box()) }
    }

    #[test]
    fn null_has_no_target() {
        let s = Shared::<u32>::null();
        assert!(s.is_null());
        assert!(unsafe { s.as_ref() }.is_none());
    }
}
