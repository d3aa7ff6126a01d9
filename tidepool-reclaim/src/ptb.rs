//! Pass-the-Buck reclamation (Herlihy, Luchangco and Moir).
//!
//! Shares the thread-registry shape with the hazard-pointer scheme: each
//! thread owns a small array of trap cells and a buffer of retired
//! allocations. The difference is on the retire side. Where hazard
//! pointers keep a protected entry buffered until a later scan, the
//! liberating thread here tries to get rid of every entry immediately:
//! an entry nobody traps is disposed on the spot, and an entry some cell
//! traps is handed to that cell — the buck — making the protector
//! responsible for it once it clears its trap.
//!
//! Ownership of an entry is always exactly one of: a thread's buffer, a
//! cell's hand-off slot, or the orphan pool. Every transfer is a CAS or a
//! swap, which is what makes the at-most-one-dispose guarantee hold.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::ptr;
use std::sync::atomic::{fence, AtomicPtr, Ordering};

use crate::registry::{OrphanPool, Record, Registry, Retired};

/// Trap cells per thread.
pub(crate) const TRAPS_PER_THREAD: usize = 8;

/// One trap: the guarded pointer plus the hand-off ("buck") slot other
/// threads may pass a retired entry through.
struct TrapCell {
    guarded: AtomicPtr<u8>,
    handoff: AtomicPtr<Retired>,
}

impl TrapCell {
    const fn new() -> TrapCell {
        TrapCell {
            guarded: AtomicPtr::new(ptr::null_mut()),
            handoff: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

pub(crate) struct PtbThread {
    traps: [TrapCell; TRAPS_PER_THREAD],
    in_use: Cell<u8>,
    retired: UnsafeCell<Vec<Retired>>,
}

unsafe impl Sync for PtbThread {}

impl Default for PtbThread {
    fn default() -> PtbThread {
        const EMPTY: TrapCell = TrapCell::new();
        PtbThread {
            traps: [EMPTY; TRAPS_PER_THREAD],
            in_use: Cell::new(0),
            retired: UnsafeCell::new(Vec::new()),
        }
    }
}

static REGISTRY: Registry<PtbThread> = Registry::new();
static ORPHANS: OrphanPool = OrphanPool::new();

struct Handle {
    rec: &'static Record<PtbThread>,
}

impl Drop for Handle {
    fn drop(&mut self) {
        detach_record(self.rec);
    }
}

thread_local! {
    static HANDLE: RefCell<Option<Handle>> = const { RefCell::new(None) };
}

fn record() -> Option<&'static Record<PtbThread>> {
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

fn detach_record(rec: &'static Record<PtbThread>) {
    debug_assert_eq!(rec.data.in_use.get(), 0, "detach with live guards");
    let mut collected = Vec::new();
    for cell in &rec.data.traps {
        cell.guarded.store(ptr::null_mut(), Ordering::Release);
        take_handoff(cell, &mut collected);
    }
    rec.data.in_use.set(0);

    let doomed = {
        let retired = unsafe { &mut *rec.data.retired.get() };
        retired.extend(collected);
        let doomed = liberate_buffer(retired);
        ORPHANS.push(std::mem::take(retired));
        doomed
    };
    REGISTRY.release(rec);
    for entry in doomed {
        unsafe { entry.dispose() };
    }
}

/// Pops the cell's hand-off entry, if any, into `into`.
fn take_handoff(cell: &TrapCell, into: &mut Vec<Retired>) {
    let buck = cell.handoff.swap(ptr::null_mut(), Ordering::AcqRel);
    if !buck.is_null() {
        into.push(*unsafe { Box::from_raw(buck) });
    }
}

/// A claimed trap cell.
pub struct PtbSlot {
    rec: &'static Record<PtbThread>,
    index: usize,
}

pub(crate) fn try_acquire() -> Option<PtbSlot> {
    let rec = record()?;
    let used = rec.data.in_use.get();
    (0..TRAPS_PER_THREAD).find(|i| used & (1 << i) == 0).map(|index| {
        rec.data.in_use.set(used | (1 << index));
        PtbSlot { rec, index }
    })
}

pub(crate) fn release(slot: &mut PtbSlot) {
    clear(slot);
    let rec = slot.rec;
    rec.data.in_use.set(rec.data.in_use.get() & !(1 << slot.index));
}

pub(crate) fn publish(slot: &PtbSlot, ptr: *mut u8) {
    let cell = &slot.rec.data.traps[slot.index];
    // Any buck passed for the previous trapped pointer becomes ours to
    // re-buffer before the trap moves on.
    collect_cell(slot.rec, cell);
    cell.guarded.store(ptr, Ordering::Release);
    fence(Ordering::SeqCst);
}

pub(crate) fn clear(slot: &PtbSlot) {
    let cell = &slot.rec.data.traps[slot.index];
    collect_cell(slot.rec, cell);
    cell.guarded.store(ptr::null_mut(), Ordering::Release);
}

fn collect_cell(rec: &'static Record<PtbThread>, cell: &TrapCell) {
    let mut collected = Vec::new();
    take_handoff(cell, &mut collected);
    if !collected.is_empty() {
        let retired = unsafe { &mut *rec.data.retired.get() };
        retired.extend(collected);
    }
}

pub(crate) unsafe fn retire(ptr: *mut u8, dispose: unsafe fn(*mut u8)) {
    let entry = Retired { ptr, dispose };
    let rec = match record() {
        Some(rec) => rec,
        None => {
            ORPHANS.push(vec![entry]);
            return;
        }
    };

    let doomed = {
        let retired = unsafe { &mut *rec.data.retired.get() };
        retired.push(entry);
        if retired.len() < liberate_threshold() {
            return;
        }
        ORPHANS.adopt(retired);
        liberate_buffer(retired)
    };
    for entry in doomed {
        unsafe { entry.dispose() };
    }
}

/// Forces a liberate pass over the calling thread's buffer.
pub(crate) fn liberate() {
    if let Some(rec) = record() {
        let doomed = {
            let retired = unsafe { &mut *rec.data.retired.get() };
            ORPHANS.adopt(retired);
            liberate_buffer(retired)
        };
        for entry in doomed {
            unsafe { entry.dispose() };
        }
    }
}

fn liberate_threshold() -> usize {
    2 * TRAPS_PER_THREAD * REGISTRY.len().max(1)
}

/// Tries to shed every buffered entry: disposal for the untrapped, a pass
/// of the buck for the trapped. Entries whose trapping cell already holds
/// a buck stay buffered for the next pass. Returns the entries to dispose;
/// the caller runs the disposers after releasing its buffer borrow.
fn liberate_buffer(retired: &mut Vec<Retired>) -> Vec<Retired> {
    if retired.is_empty() {
        return Vec::new();
    }

    fence(Ordering::SeqCst);
    let mut keep = Vec::new();
    let mut doomed = Vec::new();
    'entries: for entry in retired.drain(..) {
        for rec in REGISTRY.iter() {
            for cell in &rec.data.traps {
                if cell.guarded.load(Ordering::Acquire) == entry.ptr {
                    match pass_buck(cell, entry) {
                        Passed => continue 'entries,
                        Kept(returned) => {
                            keep.extend(returned);
                            continue 'entries;
                        }
                    }
                }
            }
        }
        doomed.push(entry);
    }
    *retired = keep;
    doomed
}

enum BuckOutcome {
    /// The protector now owns the entry.
    Passed,
    /// The entry (and possibly a stolen buck) came back to us.
    Kept(Vec<Retired>),
}

use BuckOutcome::{Kept, Passed};

/// Attempts to hand `entry` to the cell trapping it.
fn pass_buck(cell: &TrapCell, entry: Retired) -> BuckOutcome {
    let target = entry.ptr;
    let boxed = Box::into_raw(Box::new(entry));
    match cell.handoff.compare_exchange(
        ptr::null_mut(),
        boxed,
        Ordering::AcqRel,
        Ordering::Relaxed,
    ) {
        Ok(_) => {
            // If the trap moved on before the protector saw our buck, it
            // may never look at the hand-off slot again; take the buck
            // back unless the protector (or another liberator) already
            // did.
            if cell.guarded.load(Ordering::SeqCst) == target {
                return Passed;
            }
            let back = cell.handoff.swap(ptr::null_mut(), Ordering::AcqRel);
            if back.is_null() {
                Passed
            } else {
                Kept(vec![*unsafe { Box::from_raw(back) }])
            }
        }
        Err(_) => {
            // Hand-off occupied: the entry stays in our buffer.
            Kept(vec![*unsafe { Box::from_raw(boxed) }])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    macro_rules! counting_disposer {
        ($counter:ident, $dispose:ident) => {
            static $counter: AtomicUsize = AtomicUsize::new(0);
            unsafe fn $dispose(p: *mut u8) {
                $counter.fetch_add(1, Ordering::Relaxed);
                drop(Box::from_raw(p.cast::<u64>()));
            }
        };
    }

    #[test]
    fn untrapped_pointer_is_freed_by_liberate() {
        counting_disposer!(DISPOSED, dispose);

        attach();
        for _ in 0..3 {
            let p = Box::into_raw(Box::new(3u64)).cast::<u8>();
            unsafe { retire(p, dispose) };
        }
        liberate();
        assert_eq!(DISPOSED.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn trapped_pointer_rides_the_buck() {
        counting_disposer!(DISPOSED, dispose);

        attach();
        let p = Box::into_raw(Box::new(5u64)).cast::<u8>();
        let mut slot = try_acquire().unwrap();
        publish(&slot, p);

        unsafe { retire(p, dispose) };
        liberate();
        // The entry was handed to our own trap cell, not disposed.
        assert_eq!(DISPOSED.load(Ordering::Relaxed), 0);

        // Clearing the trap reclaims the buck into the buffer; the next
        // pass frees it.
        clear(&slot);
        liberate();
        assert_eq!(DISPOSED.load(Ordering::Relaxed), 1);

        release(&mut slot);
    }

    #[test]
    fn trap_cells_are_bounded() {
        attach();
        let mut slots = Vec::new();
        while let Some(slot) = try_acquire() {
            slots.push(slot);
        }
        assert_eq!(slots.len(), TRAPS_PER_THREAD);
        for mut slot in slots {
            release(&mut slot);
        }
    }
}
