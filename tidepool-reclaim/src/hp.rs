//! Hazard-pointer reclamation (Michael's scheme).
//!
//! Every attached thread owns a small array of hazard slots and a bounded
//! list of retired allocations. Readers publish the pointer they are about
//! to dereference into a slot and re-read the source to validate it;
//! writers retire unlinked nodes locally and, once the retired list hits
//! its threshold, scan all slots and dispose every entry no slot protects.
//!
//! The threshold is `2 * K * N` (K slots per thread, N the registry's
//! record high-water mark), so the number of unreclaimed retired objects
//! per thread stays bounded while scans stay amortized-cheap.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::ptr;
use std::sync::atomic::{fence, AtomicPtr, Ordering};

use crate::registry::{OrphanPool, Record, Registry, Retired};

/// Hazard slots per thread.
pub(crate) const SLOTS_PER_THREAD: usize = 8;

/// Per-thread hazard-pointer state.
///
/// `slots` is read by every scanning thread; `in_use` and `retired` are
/// touched only by the owning thread.
pub(crate) struct HpThread {
    slots: [AtomicPtr<u8>; SLOTS_PER_THREAD],
    in_use: Cell<u8>,
    retired: UnsafeCell<Vec<Retired>>,
}

unsafe impl Sync for HpThread {}

impl Default for HpThread {
    fn default() -> HpThread {
        const NULL: AtomicPtr<u8> = AtomicPtr::new(ptr::null_mut());
        HpThread {
            slots: [NULL; SLOTS_PER_THREAD],
            in_use: Cell::new(0),
            retired: UnsafeCell::new(Vec::new()),
        }
    }
}

static REGISTRY: Registry<HpThread> = Registry::new();
static ORPHANS: OrphanPool = OrphanPool::new();

struct Handle {
    rec: &'static Record<HpThread>,
}

impl Drop for Handle {
    fn drop(&mut self) {
        detach_record(self.rec);
    }
}

thread_local! {
    static HANDLE: RefCell<Option<Handle>> = const { RefCell::new(None) };
}

/// Returns the calling thread's record, attaching on first use. `None`
/// only during thread teardown, after the thread-local was destroyed.
fn record() -> Option<&'static Record<HpThread>> {
    HANDLE
        .try_with(|h| {
            h.borrow_mut()
                .get_or_insert_with(|| Handle {
                    rec: REGISTRY.acquire(),
                })
                .rec
        })
        .ok()
}

pub(crate) fn attach() {
    let _ = record();
}

pub(crate) fn detach() {
    let _ = HANDLE.try_with(|h| h.borrow_mut().take());
}

fn detach_record(rec: &'static Record<HpThread>) {
    debug_assert_eq!(rec.data.in_use.get(), 0, "detach with live guards");
    for slot in &rec.data.slots {
        slot.store(ptr::null_mut(), Ordering::Release);
    }
    rec.data.in_use.set(0);

    // Dispose what we can prove safe; park the rest for later scans.
    let doomed = {
        let retired = unsafe { &mut *rec.data.retired.get() };
        let doomed = split_unprotected(retired);
        ORPHANS.push(std::mem::take(retired));
        doomed
    };
    REGISTRY.release(rec);
    for entry in doomed {
        unsafe { entry.dispose() };
    }
}

/// A claimed hazard slot. Handed to [`Guard`](crate::Guard); released on
/// guard drop, on the owning thread.
pub struct HpSlot {
    rec: &'static Record<HpThread>,
    index: usize,
}

pub(crate) fn try_acquire() -> Option<HpSlot> {
    let rec = record()?;
    let used = rec.data.in_use.get();
    (0..SLOTS_PER_THREAD).find(|i| used & (1 << i) == 0).map(|index| {
        rec.data.in_use.set(used | (1 << index));
        HpSlot { rec, index }
    })
}

pub(crate) fn release(slot: &mut HpSlot) {
    clear(slot);
    let rec = slot.rec;
    rec.data.in_use.set(rec.data.in_use.get() & !(1 << slot.index));
}

/// Publishes `ptr` in the slot.
///
/// The release store makes the node's initialization visible to scanning
/// threads; the full fence orders the publication before the caller's
/// validating re-read of the source, which release/acquire alone does not.
pub(crate) fn publish(slot: &HpSlot, ptr: *mut u8) {
    slot.rec.data.slots[slot.index].store(ptr, Ordering::Release);
    fence(Ordering::SeqCst);
}

pub(crate) fn clear(slot: &HpSlot) {
    slot.rec.data.slots[slot.index].store(ptr::null_mut(), Ordering::Release);
}

/// Queues `ptr` for disposal once no hazard slot references it.
pub(crate) unsafe fn retire(ptr: *mut u8, dispose: unsafe fn(*mut u8)) {
    let entry = Retired { ptr, dispose };
    let rec = match record() {
        Some(rec) => rec,
        // Thread-local teardown: no buffer to amortize into, so park the
        // entry for whichever thread scans next.
        None => {
            ORPHANS.push(vec![entry]);
            return;
        }
    };

    let doomed = {
        let retired = unsafe { &mut *rec.data.retired.get() };
        retired.push(entry);
        if retired.len() < scan_threshold() {
            return;
        }
        ORPHANS.adopt(retired);
        split_unprotected(retired)
    };
    // The borrow on the retired list is gone: disposers are free to
    // re-enter `retire`.
    for entry in doomed {
        unsafe { entry.dispose() };
    }
}

/// Forces a scan of the calling thread's retired list.
pub(crate) fn scan() {
    if let Some(rec) = record() {
        let doomed = {
            let retired = unsafe { &mut *rec.data.retired.get() };
            ORPHANS.adopt(retired);
            split_unprotected(retired)
        };
        for entry in doomed {
            unsafe { entry.dispose() };
        }
    }
}

fn scan_threshold() -> usize {
    2 * SLOTS_PER_THREAD * REGISTRY.len().max(1)
}

/// Removes and returns every entry of `retired` that no hazard slot
/// protects. The caller disposes them after dropping its borrow.
fn split_unprotected(retired: &mut Vec<Retired>) -> Vec<Retired> {
    if retired.is_empty() {
        return Vec::new();
    }

    // Order the snapshot after every preceding unlink: a reader that still
    // sees a retired pointer must have published its hazard before our
    // fence, or its validating re-read will fail.
    fence(Ordering::SeqCst);
    let mut hazards: Vec<*mut u8> = Vec::with_capacity(REGISTRY.len() * SLOTS_PER_THREAD);
    for rec in REGISTRY.iter() {
        for slot in &rec.data.slots {
            let p = slot.load(Ordering::Acquire);
            if !p.is_null() {
                hazards.push(p);
            }
        }
    }
    hazards.sort_unstable();

    let mut doomed = Vec::new();
    retired.retain(|entry| {
        if hazards.binary_search(&entry.ptr).is_ok() {
            true
        } else {
            doomed.push(Retired {
                ptr: entry.ptr,
                dispose: entry.dispose,
            });
            false
        }
    });
    doomed
}
