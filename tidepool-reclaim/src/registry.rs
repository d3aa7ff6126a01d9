//! The process-wide thread registry.
//!
//! Both reclamation schemes keep one record per attached thread. Records
//! live on a lock-free singly-linked list: a new record is pushed at the
//! head with a release CAS and scanning threads walk the list with acquire
//! loads. A record is claimed by CASing its `active` flag; detach clears
//! the flag and leaves the record in place for the next thread that
//! attaches, so records are never freed while the process lives. That
//! reuse is what lets scans run without reclamation of the registry
//! itself.

use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use tidepool_utils::CachePadded;

/// A retired allocation awaiting disposal.
///
/// The pointer is untagged; the disposer knows the concrete node type and
/// returns the memory to its allocator. Each entry is disposed exactly
/// once: ownership moves linearly from the retiring thread's buffer to
/// either the disposer or (on detach) the orphan pool.
pub(crate) struct Retired {
    pub(crate) ptr: *mut u8,
    pub(crate) dispose: unsafe fn(*mut u8),
}

unsafe impl Send for Retired {}

impl Retired {
    pub(crate) unsafe fn dispose(self) {
        (self.dispose)(self.ptr);
    }
}

/// One registered thread, carrying scheme-specific scratch `R`.
pub(crate) struct Record<R> {
    /// Next record in the registry. Immutable once published.
    next: *const Record<R>,
    /// Whether a live thread currently owns this record.
    active: AtomicBool,
    pub(crate) data: R,
}

// Records are shared so scans can read hazard slots; the owner-only parts
// of `R` are interior-mutable cells that no other thread touches.
unsafe impl<R> Send for Record<R> {}
unsafe impl<R: Sync> Sync for Record<R> {}

pub(crate) struct Registry<R> {
    head: CachePadded<AtomicPtr<Record<R>>>,
    /// High-water mark of registered records; sizes retired-list bounds.
    len: AtomicUsize,
}

impl<R> Registry<R> {
    pub(crate) const fn new() -> Registry<R> {
        Registry {
            head: CachePadded::new(AtomicPtr::new(std::ptr::null_mut())),
            len: AtomicUsize::new(0),
        }
    }
}

impl<R: Default> Registry<R> {
    /// Claims an inactive record or registers a fresh one.
    pub(crate) fn acquire(&self) -> &'static Record<R>
    where
        R: 'static,
    {
        let mut cur = self.head.load(Ordering::Acquire);
        while !cur.is_null() {
            let rec = unsafe { &*cur };
            if !rec.active.load(Ordering::Relaxed)
                && rec
                    .active
                    .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return rec;
            }
            cur = rec.next as *mut _;
        }

        let rec = Box::into_raw(Box::new(Record {
            next: std::ptr::null(),
            active: AtomicBool::new(true),
            data: R::default(),
        }));
        self.len.fetch_add(1, Ordering::Relaxed);
        loop {
            let head = self.head.load(Ordering::Acquire);
            unsafe { (*rec).next = head };
            if self
                .head
                .compare_exchange(head, rec, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return unsafe { &*rec };
            }
        }
    }

    /// Returns a claimed record to the free pool.
    pub(crate) fn release(&self, rec: &Record<R>) {
        rec.active.store(false, Ordering::Release);
    }

    /// Number of records ever registered.
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Iterates every record, active or not. Inactive records keep their
    /// protection cells null, so scans may visit them harmlessly.
    pub(crate) fn iter(&self) -> RecordIter<'_, R> {
        RecordIter {
            cur: self.head.load(Ordering::Acquire),
            _registry: self,
        }
    }
}

pub(crate) struct RecordIter<'a, R> {
    cur: *const Record<R>,
    _registry: &'a Registry<R>,
}

impl<'a, R> Iterator for RecordIter<'a, R> {
    type Item = &'a Record<R>;

    fn next(&mut self) -> Option<&'a Record<R>> {
        if self.cur.is_null() {
            return None;
        }
        let rec = unsafe { &*self.cur };
        self.cur = rec.next;
        Some(rec)
    }
}

/// Retired entries abandoned by detached threads.
///
/// A detaching thread parks whatever it could not yet prove safe here;
/// any later scan adopts the whole pool into its own retired list. The
/// pool is a Treiber stack of batches so both ends are lock-free.
pub(crate) struct OrphanPool {
    head: CachePadded<AtomicPtr<OrphanBatch>>,
}

struct OrphanBatch {
    entries: Vec<Retired>,
    next: *mut OrphanBatch,
}

impl OrphanPool {
    pub(crate) const fn new() -> OrphanPool {
        OrphanPool {
            head: CachePadded::new(AtomicPtr::new(std::ptr::null_mut())),
        }
    }

    pub(crate) fn push(&self, entries: Vec<Retired>) {
        if entries.is_empty() {
            return;
        }
        let batch = Box::into_raw(Box::new(OrphanBatch {
            entries,
            next: std::ptr::null_mut(),
        }));
        loop {
            let head = self.head.load(Ordering::Acquire);
            unsafe { (*batch).next = head };
            if self
                .head
                .compare_exchange(head, batch, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Takes every parked entry, leaving the pool empty.
    pub(crate) fn adopt(&self, into: &mut Vec<Retired>) {
        let mut batch = self.head.swap(std::ptr::null_mut(), Ordering::AcqRel);
        while !batch.is_null() {
            let owned = unsafe { Box::from_raw(batch) };
            into.extend(owned.entries);
            batch = owned.next;
        }
    }
}
