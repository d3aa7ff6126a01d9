//! Guards: scoped holders of one protection slot.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::Ordering;

use tidepool_utils::load_order;

use crate::atomic::{Atomic, Shared};
use crate::{hp, ptb};

/// A safe-memory-reclamation scheme.
///
/// Implemented by [`Hp`] (hazard pointers) and [`Ptb`] (pass-the-buck).
/// Containers are generic over a `Gc` and never name a scheme directly;
/// both schemes expose the same protect/retire contract, so the choice is
/// a type parameter in the container's traits bundle.
///
/// # Safety
///
/// An implementation must guarantee that a pointer published in an
/// acquired slot is not disposed until the slot is cleared, and that every
/// retired pointer is disposed exactly once after the last slot
/// referencing it is cleared.
pub unsafe trait Gc: 'static + Sized {
    /// Handle to one protection slot.
    type Slot;

    /// Registers the calling thread. Idempotent; implicit on first use.
    fn attach();

    /// Unregisters the calling thread, parking what could not be freed.
    ///
    /// Live guards must be dropped first.
    fn detach();

    /// Claims a slot, or `None` when the per-thread budget is exhausted.
    fn try_acquire() -> Option<Self::Slot>;

    /// Returns a slot to its thread's pool. The slot is cleared first.
    fn release(slot: &mut Self::Slot);

    /// Publishes `ptr` in the slot, fenced so that a subsequent re-read of
    /// the source pointer validates the publication.
    fn publish(slot: &Self::Slot, ptr: *mut u8);

    /// Empties the slot.
    fn clear(slot: &Self::Slot);

    /// Queues an allocation for disposal once unprotected.
    ///
    /// # Safety
    ///
    /// `ptr` must be unlinked — unreachable to any thread that has not
    /// already published it — and retired at most once.
    unsafe fn retire_raw(ptr: *mut u8, dispose: unsafe fn(*mut u8));

    /// Forces a reclamation pass over the calling thread's retired
    /// entries, adopting anything parked by exited threads.
    fn collect();

    /// Retires a boxed `T`, disposing it with `Box::from_raw`.
    ///
    /// # Safety
    ///
    /// As for [`retire_raw`](Gc::retire_raw); additionally `ptr` must
    /// originate from `Box<T>` and its tag is ignored.
    unsafe fn retire<T>(ptr: Shared<T>) {
        unsafe fn drop_boxed<T>(p: *mut u8) {
            drop(Box::from_raw(p.cast::<T>()));
        }
        Self::retire_raw(ptr.as_raw().cast::<u8>(), drop_boxed::<T>);
    }
}

/// Hazard-pointer reclamation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Hp;

unsafe impl Gc for Hp {
    type Slot = hp::HpSlot;

    fn attach() {
        hp::attach();
    }

    fn detach() {
        hp::detach();
    }

    fn try_acquire() -> Option<hp::HpSlot> {
        hp::try_acquire()
    }

    fn release(slot: &mut hp::HpSlot) {
        hp::release(slot);
    }

    fn publish(slot: &hp::HpSlot, ptr: *mut u8) {
        hp::publish(slot, ptr);
    }

    fn clear(slot: &hp::HpSlot) {
        hp::clear(slot);
    }

    unsafe fn retire_raw(ptr: *mut u8, dispose: unsafe fn(*mut u8)) {
        hp::retire(ptr, dispose);
    }

    fn collect() {
        hp::scan();
    }
}

/// Pass-the-buck reclamation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Ptb;

unsafe impl Gc for Ptb {
    type Slot = ptb::PtbSlot;

    fn attach() {
        ptb::attach();
    }

    fn detach() {
        ptb::detach();
    }

    fn try_acquire() -> Option<ptb::PtbSlot> {
        ptb::try_acquire()
    }

    fn release(slot: &mut ptb::PtbSlot) {
        ptb::release(slot);
    }

    fn publish(slot: &ptb::PtbSlot, ptr: *mut u8) {
        ptb::publish(slot, ptr);
    }

    fn clear(slot: &ptb::PtbSlot) {
        ptb::clear(slot);
    }

    unsafe fn retire_raw(ptr: *mut u8, dispose: unsafe fn(*mut u8)) {
        ptb::retire(ptr, dispose);
    }

    fn collect() {
        ptb::liberate();
    }
}

/// A scoped holder of one protection slot.
///
/// While a pointer is published in a guard, the reclamation scheme will
/// not dispose it; dropping the guard (including on panic or early
/// return) clears and releases the slot unconditionally.
///
/// Guards are bound to the thread that created them and are therefore
/// neither `Send` nor `Sync`.
pub struct Guard<G: Gc> {
    slot: G::Slot,
    _not_send: PhantomData<*mut ()>,
}

impl<G: Gc> Guard<G> {
    /// Claims a slot from the calling thread's budget.
    ///
    /// Returns `None` when no slot is available; callers must treat the
    /// failure as "not found" and perform no partial mutation.
    pub fn new() -> Option<Guard<G>> {
        G::try_acquire().map(|slot| Guard {
            slot,
            _not_send: PhantomData,
        })
    }

    /// Publishes the pointer read from `src` and validates it by
    /// re-reading until the value is stable.
    ///
    /// On return the guarded pointer was observed in `src` after its
    /// publication, so it is safe to dereference until the guard is
    /// cleared, re-pointed or dropped. The returned snapshot carries the
    /// tag seen by the final read.
    pub fn protect<T>(&mut self, src: &Atomic<T>, ord: Ordering) -> Shared<T> {
        let mut cur = src.load(load_order(ord));
        loop {
            G::publish(&self.slot, cur.as_raw().cast::<u8>());
            let reread = src.load(ord);
            if reread.as_raw() == cur.as_raw() {
                return reread;
            }
            cur = reread;
        }
    }

    /// Publishes `ptr` without validation.
    ///
    /// Only sound for pointers that are already protected — by another
    /// guard of this thread, or by an installed descriptor the caller has
    /// validated — and need their protection extended past that source.
    pub fn assign<T>(&mut self, ptr: Shared<T>) {
        G::publish(&self.slot, ptr.as_raw().cast::<u8>());
    }

    /// Empties the guard.
    pub fn clear(&mut self) {
        G::clear(&self.slot);
    }
}

impl<G: Gc> Drop for Guard<G> {
    fn drop(&mut self) {
        G::clear(&self.slot);
        G::release(&mut self.slot);
    }
}

impl<G: Gc> fmt::Debug for Guard<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Guard { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering::Acquire;

    fn exhaustion_behaves<G: Gc>() {
        G::attach();
        let mut guards = Vec::new();
        while let Some(g) = Guard::<G>::new() {
            guards.push(g);
        }
        assert!(!guards.is_empty());
        // Releasing any one slot makes acquisition succeed again.
        guards.pop();
        let extra = Guard::<G>::new();
        assert!(extra.is_some());
    }

    #[test]
    fn hp_guard_budget() {
        exhaustion_behaves::<Hp>();
    }

    #[test]
    fn ptb_guard_budget() {
        exhaustion_behaves::<Ptb>();
    }

    #[test]
    fn protect_returns_the_published_value() {
        Hp::attach();
        let atom = Atomic::<u64>::new(42);
        let mut guard = Guard::<Hp>::new().unwrap();
        let shared = guard.protect(&atom, Acquire);
        assert_eq!(unsafe { *shared.deref() }, 42);
        drop(guard);
        unsafe { drop(atom.load(Acquire).into_box()) };
    }
}
