use std::fmt;
use std::ops::{Deref, DerefMut};

cfg_if::cfg_if! {
    if #[cfg(any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "powerpc64",
    ))] {
        /// Pads and aligns a value to the length of a cache line.
        ///
        /// Sharing a cache line between two atomics that are written by
        /// different threads makes every write invalidate the other
        /// thread's line. Wrapping the hot fields (a queue's `head` and
        /// `tail`, the registry head) in `CachePadded` keeps them on lines
        /// of their own.
        ///
        /// These architectures prefetch cache lines in adjacent pairs, so
        /// the padding is 128 bytes rather than 64.
        #[repr(align(128))]
        #[derive(Clone, Copy, Default, Hash, PartialEq, Eq)]
        pub struct CachePadded<T> {
            value: T,
        }
    } else {
        /// Pads and aligns a value to the length of a cache line.
        ///
        /// Sharing a cache line between two atomics that are written by
        /// different threads makes every write invalidate the other
        /// thread's line. Wrapping the hot fields (a queue's `head` and
        /// `tail`, the registry head) in `CachePadded` keeps them on lines
        /// of their own.
        #[repr(align(64))]
        #[derive(Clone, Copy, Default, Hash, PartialEq, Eq)]
        pub struct CachePadded<T> {
            value: T,
        }
    }
}

impl<T> CachePadded<T> {
    /// Pads and aligns `t` to the length of a cache line.
    pub const fn new(t: T) -> CachePadded<T> {
        CachePadded { value: t }
    }

    /// Returns the inner value.
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for CachePadded<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: fmt::Debug> fmt::Debug for CachePadded<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePadded").field("value", &self.value).finish()
    }
}

impl<T> From<T> for CachePadded<T> {
    fn from(t: T) -> Self {
        CachePadded::new(t)
    }
}
