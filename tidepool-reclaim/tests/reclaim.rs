//! Concurrent reclamation stress: readers dereference guarded pointers
//! while writers swap nodes out and retire them.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::thread;
use tidepool_reclaim::{Atomic, Gc, Guard, Hp, Owned, Ptb};

static DROPS: AtomicUsize = AtomicUsize::new(0);

struct Payload {
    value: u64,
    check: u64,
}

impl Payload {
    fn new(value: u64) -> Payload {
        Payload {
            value,
            check: value ^ 0xdead_beef,
        }
    }
}

impl Drop for Payload {
    fn drop(&mut self) {
        // A double dispose would run this twice for one allocation; the
        // counter comparison at the end of each test catches it.
        DROPS.fetch_add(1, Ordering::Relaxed);
    }
}

fn swap_and_read<G: Gc>(writers: usize, readers: usize, swaps_per_writer: usize) {
    let allocated = AtomicUsize::new(0);
    let drops_before = DROPS.load(Ordering::Relaxed);
    let slot = Atomic::new(Payload::new(0));
    allocated.fetch_add(1, Ordering::Relaxed);

    thread::scope(|scope| {
        for w in 0..writers {
            let slot = &slot;
            let allocated = &allocated;
            scope.spawn(move |_| {
                G::attach();
                for i in 0..swaps_per_writer {
                    let value = (w * swaps_per_writer + i + 1) as u64;
                    let fresh = Owned::new(Payload::new(value)).into_shared();
                    allocated.fetch_add(1, Ordering::Relaxed);
                    let old = slot.swap(fresh, Ordering::AcqRel);
                    unsafe { G::retire(old) };
                }
            });
        }
        for _ in 0..readers {
            let slot = &slot;
            scope.spawn(move |_| {
                G::attach();
                let mut guard = Guard::<G>::new().expect("a fresh thread has free slots");
                for _ in 0..swaps_per_writer * writers {
                    let shared = guard.protect(slot, Ordering::Acquire);
                    let payload = unsafe { shared.deref() };
                    // A freed payload would fail this (and ASan would bark
                    // first).
                    assert_eq!(payload.check, payload.value ^ 0xdead_beef);
                    guard.clear();
                }
            });
        }
    })
    .unwrap();

    // Quiescent: the final node is still live, all others were retired.
    G::attach();
    unsafe { G::retire(slot.swap(tidepool_reclaim::Shared::null(), Ordering::AcqRel)) };

    // All worker threads have exited and detached; a collect pass adopts
    // whatever they parked and must free every allocation exactly once.
    G::collect();
    let dropped = DROPS.load(Ordering::Relaxed) - drops_before;
    assert_eq!(dropped, allocated.load(Ordering::Relaxed));
    G::detach();
}

// The two schemes share the drop counter, so they run in one test body
// rather than racing in parallel test threads.
#[test]
fn swap_stress_frees_everything_exactly_once() {
    swap_and_read::<Hp>(2, 3, 5_000);
    swap_and_read::<Ptb>(2, 3, 5_000);
}

#[test]
fn guard_budget_is_shared_per_thread() {
    Hp::attach();
    let mut guards: Vec<Guard<Hp>> = Vec::new();
    while let Some(g) = Guard::new() {
        guards.push(g);
    }
    // Default budget: eight hazard slots.
    assert_eq!(guards.len(), 8);
    drop(guards.pop());
    assert!(Guard::<Hp>::new().is_some());
}
