use core::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering::*},
};

use super::{Chunk, SysAlloc};

/// A system allocator managing a constant sized block of static memory.
///
/// Memory is handed out by bumping a cursor and never reused. If `RELEASE`
/// is set, releasing pages inside the buffer is reported as successful while
/// the memory stays in place, which lets the page heap exercise its returned
/// lists without an OS.
///
/// # Examples
///
/// ```rust
/// use spanalloc::{AllocatorContext, Heap, base::{Static, SysAlloc}};
///
/// static BASE: Static<{ 8 << 20 }> = Static::new();
/// static BACKENDS: [&dyn SysAlloc; 1] = [&BASE];
/// static CX: AllocatorContext = AllocatorContext::new(&BACKENDS);
///
/// let mut heap = Heap::new(&CX);
/// let ptr = heap.allocate(100).unwrap();
/// unsafe { heap.deallocate(ptr) };
/// ```
pub struct Static<const CAP: usize, const RELEASE: bool = true> {
    memory: UnsafeCell<MaybeUninit<[u8; CAP]>>,
    top: AtomicUsize,
}

// `memory` is guarded by `top`.
unsafe impl<const CAP: usize, const RELEASE: bool> Sync for Static<CAP, RELEASE> {}

impl<const CAP: usize, const RELEASE: bool> Default for Static<CAP, RELEASE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const CAP: usize, const RELEASE: bool> core::fmt::Debug for Static<CAP, RELEASE> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Static")
            .field("capacity", &CAP)
            .field("used", &self.used())
            .finish()
    }
}

impl<const CAP: usize, const RELEASE: bool> Static<CAP, RELEASE> {
    /// Creates a new system allocator that allocates static memory only.
    pub const fn new() -> Self {
        Static {
            memory: UnsafeCell::new(MaybeUninit::uninit()),
            top: AtomicUsize::new(0),
        }
    }

    fn base(&self) -> *mut u8 {
        self.memory.get().cast()
    }

    /// The number of bytes handed out, including alignment padding.
    pub fn used(&self) -> usize {
        self.top.load(Relaxed)
    }

    fn contains(&self, ptr: NonNull<u8>, len: usize) -> bool {
        let start = self.base().addr();
        let addr = ptr.as_ptr().addr();
        addr >= start && addr.checked_add(len).is_some_and(|end| end <= start + CAP)
    }
}

unsafe impl<const CAP: usize, const RELEASE: bool> SysAlloc for Static<CAP, RELEASE> {
    fn try_alloc(&self, size: usize, align: usize) -> Option<Chunk> {
        let base = self.base();
        let mut top = self.top.load(Relaxed);
        loop {
            let aligned = (base.addr().checked_add(top)?).checked_next_multiple_of(align)?;
            let offset = aligned - base.addr();
            let end = offset.checked_add(size).filter(|&end| end <= CAP)?;
            match self.top.compare_exchange_weak(top, end, AcqRel, Relaxed) {
                Ok(_) => {
                    // SAFETY: `offset + size` is within the range of `memory`.
                    let ptr = unsafe { base.add(offset) };
                    // SAFETY: `base` is derived from a non-null static.
                    let ptr = unsafe { NonNull::new_unchecked(ptr) };
                    break Some(Chunk { ptr, len: size });
                }
                Err(t) => top = t,
            }
        }
    }

    fn release(&self, ptr: NonNull<u8>, len: usize) -> bool {
        RELEASE && self.contains(ptr, len)
    }

    fn commit(&self, ptr: NonNull<u8>, len: usize) -> bool {
        self.contains(ptr, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump() {
        static BASE: Static<{ 1 << 16 }> = Static::new();
        let a = BASE.try_alloc(100, 64).unwrap();
        let b = BASE.try_alloc(100, 4096).unwrap();
        assert_eq!(a.ptr.as_ptr().addr() % 64, 0);
        assert_eq!(b.ptr.as_ptr().addr() % 4096, 0);
        assert!(b.ptr.as_ptr().addr() >= a.ptr.as_ptr().addr() + 100);
        assert!(BASE.try_alloc(1 << 16, 8).is_none());
        assert!(BASE.release(a.ptr, a.len));
        assert!(!BASE.release(NonNull::dangling(), 1));
    }

    #[test]
    fn no_release() {
        static BASE: Static<4096, false> = Static::new();
        let a = BASE.try_alloc(64, 8).unwrap();
        assert!(!BASE.release(a.ptr, a.len));
        assert!(BASE.commit(a.ptr, a.len));
    }
}
