//! Bucket tables for the split-ordered hash map.
//!
//! A bucket entry is an opaque pointer to a sentinel node woven into the
//! backing list. Entries are written once (sentinels are never removed),
//! so a table only has to guarantee that a published entry stays readable
//! at a stable address — which is also why growth never moves entries:
//! the static table preallocates them all, the expandable table adds
//! segments around the existing ones.

use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Storage of bucket sentinel pointers.
///
/// Entries are untyped; the split-ordered map owns the casts. `null`
/// means the bucket has not been initialized yet.
pub trait BucketTable: Send + Sync + 'static {
    /// Creates a table able to address `capacity` buckets. `capacity` is a
    /// power of two.
    fn with_capacity(capacity: usize) -> Self;

    /// The largest bucket count this table can address.
    fn capacity(&self) -> usize;

    /// Reads the entry for `bucket`, or null if uninitialized.
    fn bucket(&self, index: usize) -> *mut ();

    /// Publishes the entry for `bucket`.
    ///
    /// Racing writers publish the same sentinel (the splice into the list
    /// decides the winner and losers re-read), so a lost store is
    /// harmless.
    fn set_bucket(&self, index: usize, entry: *mut ());
}

/// A flat, fully preallocated table.
pub struct StaticBucketTable {
    slots: Box<[AtomicPtr<()>]>,
}

impl BucketTable for StaticBucketTable {
    fn with_capacity(capacity: usize) -> StaticBucketTable {
        assert!(capacity.is_power_of_two());
        let slots = (0..capacity)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        StaticBucketTable { slots }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn bucket(&self, index: usize) -> *mut () {
        self.slots[index].load(Ordering::Acquire)
    }

    fn set_bucket(&self, index: usize, entry: *mut ()) {
        self.slots[index].store(entry, Ordering::Release);
    }
}

impl fmt::Debug for StaticBucketTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticBucketTable")
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Entries per lazily allocated segment.
const SEGMENT_BITS: usize = 9;
const SEGMENT_LEN: usize = 1 << SEGMENT_BITS;

/// A two-level table: a fixed top array of segment pointers, segments
/// allocated on first touch. Doubling the bucket count touches nothing —
/// higher indices simply start resolving to fresh segments.
pub struct ExpandableBucketTable {
    segments: Box<[AtomicPtr<AtomicPtr<()>>]>,
}

impl ExpandableBucketTable {
    fn segment(&self, seg_index: usize) -> &[AtomicPtr<()>] {
        let slot = &self.segments[seg_index];
        let mut seg = slot.load(Ordering::Acquire);
        if seg.is_null() {
            let fresh = (0..SEGMENT_LEN)
                .map(|_| AtomicPtr::new(ptr::null_mut::<()>()))
                .collect::<Vec<_>>()
                .into_boxed_slice();
            let fresh = Box::into_raw(fresh) as *mut AtomicPtr<()>;
            match slot.compare_exchange(
                ptr::null_mut(),
                fresh,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => seg = fresh,
                Err(won) => {
                    // Another thread installed a segment first.
                    unsafe {
                        drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                            fresh,
                            SEGMENT_LEN,
                        )))
                    };
                    seg = won;
                }
            }
        }
        unsafe { std::slice::from_raw_parts(seg, SEGMENT_LEN) }
    }
}

impl BucketTable for ExpandableBucketTable {
    fn with_capacity(capacity: usize) -> ExpandableBucketTable {
        assert!(capacity.is_power_of_two());
        let top = ((capacity + SEGMENT_LEN - 1) / SEGMENT_LEN).max(1);
        let segments = (0..top)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        ExpandableBucketTable { segments }
    }

    fn capacity(&self) -> usize {
        self.segments.len() * SEGMENT_LEN
    }

    fn bucket(&self, index: usize) -> *mut () {
        self.segment(index >> SEGMENT_BITS)[index & (SEGMENT_LEN - 1)].load(Ordering::Acquire)
    }

    fn set_bucket(&self, index: usize, entry: *mut ()) {
        self.segment(index >> SEGMENT_BITS)[index & (SEGMENT_LEN - 1)]
            .store(entry, Ordering::Release);
    }
}

impl Drop for ExpandableBucketTable {
    fn drop(&mut self) {
        for slot in self.segments.iter() {
            let seg = slot.load(Ordering::Relaxed);
            if !seg.is_null() {
                unsafe { drop(Box::from_raw(ptr::slice_from_raw_parts_mut(seg, SEGMENT_LEN))) };
            }
        }
    }
}

impl fmt::Debug for ExpandableBucketTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpandableBucketTable")
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercises<T: BucketTable>() {
        let table = T::with_capacity(2048);
        assert!(table.capacity() >= 2048);
        assert!(table.bucket(0).is_null());
        assert!(table.bucket(2047).is_null());

        let marker = 0x10usize as *mut ();
        table.set_bucket(7, marker);
        assert_eq!(table.bucket(7), marker);
        assert!(table.bucket(8).is_null());

        table.set_bucket(2047, marker);
        assert_eq!(table.bucket(2047), marker);
    }

    #[test]
    fn static_table() {
        exercises::<StaticBucketTable>();
    }

    #[test]
    fn expandable_table() {
        exercises::<ExpandableBucketTable>();
    }

    #[test]
    fn expandable_allocates_segments_lazily() {
        let table = ExpandableBucketTable::with_capacity(SEGMENT_LEN * 4);
        assert_eq!(table.segments.len(), 4);
        for slot in table.segments.iter() {
            assert!(slot.load(Ordering::Relaxed).is_null());
        }
        table.set_bucket(SEGMENT_LEN + 1, 0x20usize as *mut ());
        assert!(!table.segments[1].load(Ordering::Relaxed).is_null());
        assert!(table.segments[0].load(Ordering::Relaxed).is_null());
    }
}
