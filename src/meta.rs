//! The metadata allocator.
//!
//! Span records, page map nodes and stack traces are carved from chunks
//! obtained from the system allocator and are never returned to it.

use core::{
    alloc::Layout,
    marker::PhantomData,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering::*},
};

use crate::{
    base::SystemAllocator,
    config::{MIB, PAGE_SIZE},
    sync::{SpinLock, spin_lock},
};

const CHUNK_SIZE: usize = MIB;
/// Requests of at least this size bypass the bump chunk.
const DIRECT_THRESHOLD: usize = CHUNK_SIZE / 8;

struct Cursor {
    next: usize,
    avail: usize,
}

/// A bump allocator for metadata.
pub struct MetaAlloc {
    cursor: SpinLock<Cursor>,
    system_bytes: AtomicUsize,
    used_bytes: AtomicUsize,
}

impl MetaAlloc {
    pub const fn new() -> Self {
        MetaAlloc {
            cursor: spin_lock(Cursor { next: 0, avail: 0 }),
            system_bytes: AtomicUsize::new(0),
            used_bytes: AtomicUsize::new(0),
        }
    }

    /// Allocates zeroed memory of `layout` from `system`.
    pub fn alloc(&self, system: &SystemAllocator<'_>, layout: Layout) -> Option<NonNull<u8>> {
        let ptr = if layout.size() >= DIRECT_THRESHOLD {
            let chunk = system.alloc(layout.size(), layout.align().max(PAGE_SIZE))?;
            self.system_bytes.fetch_add(chunk.len, Relaxed);
            self.used_bytes.fetch_add(chunk.len, Relaxed);
            chunk.ptr
        } else {
            let mut cursor = self.cursor.lock();
            let mut aligned = cursor.next.next_multiple_of(layout.align());
            if cursor.next == 0 || aligned - cursor.next + layout.size() > cursor.avail {
                let chunk = system.alloc(CHUNK_SIZE, PAGE_SIZE)?;
                self.system_bytes.fetch_add(chunk.len, Relaxed);
                cursor.next = chunk.ptr.as_ptr().addr();
                cursor.avail = chunk.len;
                aligned = cursor.next;
            }
            let consumed = aligned - cursor.next + layout.size();
            cursor.next += consumed;
            cursor.avail -= consumed;
            self.used_bytes.fetch_add(consumed, Relaxed);
            // SAFETY: `aligned` points into a chunk handed out by `system`.
            unsafe { NonNull::new_unchecked(aligned as *mut u8) }
        };
        // SAFETY: The memory is freshly allocated and owned.
        unsafe { ptr.write_bytes(0, layout.size()) };
        Some(ptr)
    }

    /// The bytes obtained from the system allocator for metadata.
    pub fn system_bytes(&self) -> usize {
        self.system_bytes.load(Relaxed)
    }

    /// The bytes handed out as metadata.
    pub fn used_bytes(&self) -> usize {
        self.used_bytes.load(Relaxed)
    }
}

impl Default for MetaAlloc {
    fn default() -> Self {
        Self::new()
    }
}

/// A metadata allocator paired with the system allocator it draws from.
#[derive(Clone, Copy)]
pub struct Meta<'h, 'a> {
    pub alloc: &'h MetaAlloc,
    pub system: &'h SystemAllocator<'a>,
}

impl Meta<'_, '_> {
    /// Allocates a zeroed `T`, which must be valid when zeroed.
    pub fn zeroed<T>(&self) -> Option<NonNull<T>> {
        self.alloc.alloc(self.system, Layout::new::<T>()).map(NonNull::cast)
    }

    /// Allocates a zeroed array of `len` elements of `T`.
    pub fn zeroed_array<T>(&self, len: usize) -> Option<NonNull<T>> {
        let layout = Layout::array::<T>(len).ok()?;
        self.alloc.alloc(self.system, layout).map(NonNull::cast)
    }
}

/// A recycler of fixed-type slots carved from a [`MetaAlloc`].
pub struct ObjectPool<T> {
    free: Option<NonNull<Slot>>,
    _marker: PhantomData<T>,
}

#[repr(C)]
struct Slot {
    next: Option<NonNull<Slot>>,
}

// SAFETY: The pool owns its free slots exclusively.
unsafe impl<T: Send> Send for ObjectPool<T> {}

impl<T> ObjectPool<T> {
    const LAYOUT: Layout = {
        let size = if size_of::<T>() > size_of::<Slot>() {
            size_of::<T>()
        } else {
            size_of::<Slot>()
        };
        let align = if align_of::<T>() > align_of::<Slot>() {
            align_of::<T>()
        } else {
            align_of::<Slot>()
        };
        match Layout::from_size_align(size.next_multiple_of(align), align) {
            Ok(layout) => layout,
            Err(_) => panic!("invalid slot layout"),
        }
    };

    pub const fn new() -> Self {
        ObjectPool { free: None, _marker: PhantomData }
    }

    /// Takes a zeroed slot from the pool.
    pub fn alloc(&mut self, meta: Meta<'_, '_>) -> Option<NonNull<T>> {
        let slot = match self.free {
            Some(slot) => {
                // SAFETY: Free slots are owned by the pool and hold a link.
                self.free = unsafe { slot.as_ref().next };
                let ptr = slot.cast::<u8>();
                // SAFETY: The slot spans `LAYOUT`.
                unsafe { ptr.write_bytes(0, Self::LAYOUT.size()) };
                ptr
            }
            None => meta.alloc.alloc(meta.system, Self::LAYOUT)?,
        };
        Some(slot.cast())
    }

    /// Returns a slot to the pool.
    ///
    /// # Safety
    ///
    /// `ptr` must be allocated from this pool and no longer used.
    pub unsafe fn free(&mut self, ptr: NonNull<T>) {
        let slot = ptr.cast::<Slot>();
        // SAFETY: The slot is at least as large as `Slot`.
        unsafe { slot.write(Slot { next: self.free }) };
        self.free = Some(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{Static, SysAlloc};

    static BASE: Static<{ 4 << 20 }> = Static::new();
    static BACKENDS: [&dyn SysAlloc; 1] = [&BASE];

    #[test]
    fn bump_and_direct() {
        let system = SystemAllocator::new(&BACKENDS);
        let meta = MetaAlloc::new();
        let a = meta.alloc(&system, Layout::new::<[u64; 4]>()).unwrap();
        let b = meta.alloc(&system, Layout::new::<u8>()).unwrap();
        let c = meta.alloc(&system, Layout::new::<u64>()).unwrap();
        assert_eq!(a.as_ptr().addr() % 8, 0);
        assert_eq!(b.as_ptr().addr(), a.as_ptr().addr() + 32);
        assert_eq!(c.as_ptr().addr(), a.as_ptr().addr() + 40);
        assert_eq!(meta.system_bytes(), CHUNK_SIZE);

        let big = meta.alloc(&system, Layout::from_size_align(DIRECT_THRESHOLD, 8).unwrap());
        assert!(big.is_some());
        assert_eq!(meta.system_bytes(), CHUNK_SIZE + DIRECT_THRESHOLD.next_multiple_of(PAGE_SIZE));
        assert_eq!(meta.system_bytes(), system.taken());
    }

    #[test]
    fn pool_recycles() {
        let system = SystemAllocator::new(&BACKENDS);
        let alloc = MetaAlloc::new();
        let meta = Meta { alloc: &alloc, system: &system };
        let mut pool = ObjectPool::<[usize; 8]>::new();

        let a = pool.alloc(meta).unwrap();
        unsafe { a.as_ptr().write([7; 8]) };
        unsafe { pool.free(a) };
        let b = pool.alloc(meta).unwrap();
        assert_eq!(a, b);
        assert_eq!(unsafe { b.as_ptr().read() }, [0; 8]);
        // The free list is drained, so the next slot is fresh.
        let c = pool.alloc(meta).unwrap();
        assert_ne!(c, b);
    }
}
