//! The module of system allocators.
//!
//! See [`SysAlloc`] for more information.

#[cfg(feature = "base-mmap")]
mod mmap;
#[cfg(feature = "base-static")]
mod static_;

use core::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering::*},
};

#[cfg(feature = "base-mmap")]
pub use self::mmap::Mmap;
#[cfg(feature = "base-static")]
pub use self::static_::Static;
use crate::sync::{SpinLock, spin_lock};

/// The maximum number of backends in a [`SystemAllocator`] chain. Further
/// backends are ignored.
pub const MAX_BACKENDS: usize = 8;

/// A block of memory handed out by a system allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Chunk {
    pub ptr: NonNull<u8>,
    /// The actual size of the block, never less than the requested size.
    pub len: usize,
}

/// The trait of system allocator backends.
///
/// Backends provide memory at a coarse granularity to the page heap and the
/// metadata allocator, and are tried in a fixed priority order by a
/// [`SystemAllocator`]. A backend may refuse any request, in which case the
/// next backend is tried; refusing is never fatal.
///
/// The default implementations in this crate are [`Mmap`], backed by
/// anonymous memory mappings, and [`Static`], backed by a static buffer.
///
/// # Safety
///
/// `try_alloc` must return a block of at least `size` bytes aligned to
/// `align` that is not used by anything else, and never hand out the same
/// memory twice.
pub unsafe trait SysAlloc: Sync {
    /// Allocates at least `size` bytes aligned to `align`, a power of two.
    fn try_alloc(&self, size: usize, align: usize) -> Option<Chunk>;

    /// Advises the backend that the pages of `[ptr, ptr + len)` are no longer
    /// used and may be reclaimed.
    ///
    /// Returns `false` if the range is not owned by this backend or the
    /// release failed. Released memory remains owned and accessible, but its
    /// content is lost.
    fn release(&self, ptr: NonNull<u8>, len: usize) -> bool {
        let _ = (ptr, len);
        false
    }

    /// Prepares previously released pages for reuse.
    ///
    /// Returns `false` if the range is not owned by this backend.
    fn commit(&self, ptr: NonNull<u8>, len: usize) -> bool {
        let _ = (ptr, len);
        true
    }

    /// The last OS error code observed by this backend.
    fn last_error(&self) -> Option<i32> {
        None
    }
}

/// An ordered chain of system allocator backends.
pub struct SystemAllocator<'a> {
    backends: &'a [&'a dyn SysAlloc],
    failed: SpinLock<[bool; MAX_BACKENDS]>,
    taken: AtomicUsize,
}

impl<'a> SystemAllocator<'a> {
    pub const fn new(backends: &'a [&'a dyn SysAlloc]) -> Self {
        SystemAllocator {
            backends,
            failed: spin_lock([false; MAX_BACKENDS]),
            taken: AtomicUsize::new(0),
        }
    }

    fn backends(&self) -> impl Iterator<Item = &'a dyn SysAlloc> + 'a {
        self.backends.iter().take(MAX_BACKENDS).copied()
    }

    /// Allocates `size` bytes aligned to `align` from the first backend that
    /// accepts the request.
    ///
    /// Backends that refuse are skipped by later requests until every
    /// backend has failed, at which point all of them are tried once more.
    pub fn alloc(&self, size: usize, align: usize) -> Option<Chunk> {
        debug_assert!(align.is_power_of_two());
        let align = align.max(align_of::<usize>());
        let size = size.checked_next_multiple_of(align)?;

        let mut failed = self.failed.lock();
        for pass in 0..2 {
            for (index, backend) in self.backends().enumerate() {
                if pass == 0 && failed[index] {
                    continue;
                }
                match backend.try_alloc(size, align) {
                    Some(chunk) => {
                        debug_assert!(chunk.len >= size);
                        debug_assert!(chunk.ptr.as_ptr().addr() % align == 0);
                        self.taken.fetch_add(chunk.len, Relaxed);
                        return Some(chunk);
                    }
                    None => failed[index] = true,
                }
            }
            // A later, smaller request may still succeed where this one didn't.
            *failed = [false; MAX_BACKENDS];
        }
        None
    }

    /// Releases the pages of `[ptr, ptr + len)` through the backend owning
    /// them. Returns whether the release took effect.
    pub fn release(&self, ptr: NonNull<u8>, len: usize) -> bool {
        self.backends().any(|backend| backend.release(ptr, len))
    }

    /// Commits the pages of `[ptr, ptr + len)` again after a release.
    pub fn commit(&self, ptr: NonNull<u8>, len: usize) {
        let _ = self.backends().any(|backend| backend.commit(ptr, len));
    }

    /// The total bytes obtained from the backends.
    pub fn taken(&self) -> usize {
        self.taken.load(Relaxed)
    }

    /// The last OS error code reported by any backend.
    pub fn last_error(&self) -> Option<i32> {
        self.backends().find_map(|backend| backend.last_error())
    }
}

impl core::fmt::Debug for SystemAllocator<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SystemAllocator")
            .field("backends", &self.backends.len())
            .field("taken", &self.taken())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::AtomicUsize;

    use super::*;

    struct Refusing(AtomicUsize);

    unsafe impl SysAlloc for Refusing {
        fn try_alloc(&self, _: usize, _: usize) -> Option<Chunk> {
            self.0.fetch_add(1, Relaxed);
            None
        }
    }

    struct Counting {
        calls: AtomicUsize,
        budget: usize,
    }

    unsafe impl SysAlloc for Counting {
        fn try_alloc(&self, size: usize, align: usize) -> Option<Chunk> {
            let calls = self.calls.fetch_add(1, Relaxed);
            if calls >= self.budget {
                return None;
            }
            let ptr = NonNull::new(align as *mut u8)?;
            Some(Chunk { ptr, len: size })
        }
    }

    #[test]
    fn falls_through() {
        let refusing = Refusing(AtomicUsize::new(0));
        let counting = Counting { calls: AtomicUsize::new(0), budget: 1 };
        let backends: [&dyn SysAlloc; 2] = [&refusing, &counting];
        let system = SystemAllocator::new(&backends);

        let chunk = system.alloc(100, 4096).unwrap();
        assert_eq!(chunk.len, 4096);
        assert_eq!(system.taken(), 4096);
        assert_eq!(refusing.0.load(Relaxed), 1);

        // The refusing backend is skipped once, then retried in the second pass.
        assert!(system.alloc(4096, 4096).is_none());
        assert_eq!(refusing.0.load(Relaxed), 2);
        assert_eq!(counting.calls.load(Relaxed), 3);
        assert_eq!(system.taken(), 4096);
    }

    #[test]
    fn overflow() {
        let counting = Counting { calls: AtomicUsize::new(0), budget: 1 };
        let backends: [&dyn SysAlloc; 1] = [&counting];
        let system = SystemAllocator::new(&backends);
        assert!(system.alloc(usize::MAX - 10, 4096).is_none());
        assert_eq!(counting.calls.load(Relaxed), 0);
    }
}
