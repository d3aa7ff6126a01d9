//! Safe memory reclamation for lock-free data structures.
//!
//! The remove operation is where lock-free containers get hard. A thread
//! that unlinks a node cannot free it immediately: another thread may have
//! loaded the same pointer a moment earlier and still be reading through
//! it. This crate delays the freeing of unlinked nodes until no reader can
//! still dereference them, using one of two interchangeable schemes:
//!
//! - **Hazard pointers** ([`Hp`]): readers publish each pointer they are
//!   about to dereference in a per-thread slot; retiring threads scan the
//!   slots and free whatever no slot names.
//! - **Pass-the-buck** ([`Ptb`]): retiring threads try to shed retired
//!   pointers immediately, handing any still-protected pointer to its
//!   protector, which becomes responsible for freeing it.
//!
//! Containers use the scheme through two types: [`Atomic`], the tagged
//! atomic pointer their linkage fields are made of, and [`Guard`], a
//! scoped holder of one protection slot with a publish-and-validate
//! [`protect`](Guard::protect) loop. Retiring goes through
//! [`Gc::retire`], which defers the drop of the boxed node until every
//! guard naming it is gone.
//!
//! Per-thread protection budgets are fixed (eight slots); when they run
//! out, [`Guard::new`] returns `None` and the caller reports "not found"
//! rather than risking an unprotected read. Threads register themselves
//! on first use and unregister when they exit; retired entries a dying
//! thread cannot yet free are parked in a global pool that any later scan
//! adopts.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

mod atomic;
mod guard;
mod hp;
mod ptb;
mod registry;

pub use atomic::{Atomic, Owned, Shared};
pub use guard::{Gc, Guard, Hp, Ptb};
