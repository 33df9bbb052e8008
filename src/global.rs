//! The process-wide allocator.
//!
//! [`Spanalloc`] forwards every call to a thread-local [`Heap`] over one
//! static [`AllocatorContext`] backed by [`Mmap`]. The context reads its
//! [`Options`] from the environment on first use.

use core::{
    alloc::{GlobalAlloc, Layout},
    mem,
    ptr::{self, NonNull},
    sync::atomic::{AtomicU8, Ordering::*},
};
use std::cell::RefCell;

use crate::{
    base::{Mmap, SysAlloc},
    config::{ALIGNMENT, Options},
    error::Error,
    heap::{AllocatorContext, Heap},
    stat::Stat,
};

static BASE: Mmap = Mmap::new();
static BACKENDS: [&dyn SysAlloc; 1] = [&BASE];
static CONTEXT: AllocatorContext<'static> = AllocatorContext::new(&BACKENDS);

const UNINIT: u8 = 0;
const APPLYING: u8 = 1;
const READY: u8 = 2;
static STATE: AtomicU8 = AtomicU8::new(UNINIT);

fn context() -> &'static AllocatorContext<'static> {
    // Allocations racing with the first one, or made from inside it, are
    // served with whatever options are applied so far.
    if STATE.load(Acquire) != READY
        && STATE.compare_exchange(UNINIT, APPLYING, Acquire, Relaxed).is_ok()
    {
        CONTEXT.apply(&Options::from_env());
        STATE.store(READY, Release);
    }
    &CONTEXT
}

thread_local! {
    static HEAP: RefCell<Option<Heap<'static, 'static>>> = const { RefCell::new(None) };
}

/// Runs `f` with the heap of the current thread.
///
/// If that heap is busy, which happens when the allocator is reentered, or
/// already destroyed, `f` runs with a temporary heap that is flushed right
/// after.
fn with<T>(mut f: impl FnMut(&mut Heap<'static, 'static>) -> T) -> T {
    let cached = HEAP.try_with(|slot| {
        let mut slot = slot.try_borrow_mut().ok()?;
        Some(f(slot.get_or_insert_with(|| Heap::new(context()))))
    });
    match cached {
        Ok(Some(ret)) => ret,
        _ => f(&mut Heap::new(context())),
    }
}

/// Aborts the process if dropped during unwinding.
struct AbortOnUnwind;

impl Drop for AbortOnUnwind {
    fn drop(&mut self) {
        std::process::abort()
    }
}

/// Runs `f`, turning a corruption panic into an abort.
fn no_unwind<T>(f: impl FnOnce() -> T) -> T {
    let guard = AbortOnUnwind;
    let ret = f();
    mem::forget(guard);
    ret
}

/// The global allocator.
///
/// ```rust,no_run
/// use spanalloc::Spanalloc;
///
/// #[global_allocator]
/// static ALLOC: Spanalloc = Spanalloc;
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Spanalloc;

impl Spanalloc {
    /// The context shared by every thread.
    pub fn context(&self) -> &'static AllocatorContext<'static> {
        context()
    }

    /// Takes a snapshot of the statistics of the allocator.
    ///
    /// This function forwards the call to [`AllocatorContext::stat`].
    pub fn stat(&self) -> Stat {
        context().stat()
    }

    /// Returns the objects cached by the current thread to the central free
    /// lists.
    ///
    /// This function forwards the call to [`Heap::flush`].
    pub fn flush(&self) -> usize {
        with(|heap| heap.flush())
    }

    /// Returns every free page to the system.
    ///
    /// This function forwards the call to
    /// [`AllocatorContext::release_free_memory`].
    pub fn release_free_memory(&self) -> usize {
        context().release_free_memory()
    }

    /// Allocates at least `size` bytes from the current heap.
    ///
    /// This function forwards the call to [`Heap::try_allocate`].
    ///
    /// # Errors
    ///
    /// Errors are returned when the size overflows or the heap can't grow.
    pub fn try_allocate(&self, size: usize) -> Result<NonNull<u8>, Error> {
        with(|heap| heap.try_allocate(size))
    }

    /// This function forwards the call to [`Heap::allocate`].
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        with(|heap| heap.allocate(size))
    }

    /// This function forwards the call to [`Heap::allocate_zeroed`].
    pub fn allocate_zeroed(&self, size: usize) -> Option<NonNull<u8>> {
        with(|heap| heap.allocate_zeroed(size))
    }

    /// This function forwards the call to [`Heap::try_allocate_aligned`].
    pub fn try_allocate_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>, Error> {
        with(|heap| heap.try_allocate_aligned(size, align))
    }

    /// This function forwards the call to [`Heap::allocate_aligned`].
    pub fn allocate_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        with(|heap| heap.allocate_aligned(size, align))
    }

    /// Returns the number of bytes usable at `ptr`.
    ///
    /// This function forwards the call to [`AllocatorContext::allocated_size`].
    pub fn allocated_size(&self, ptr: NonNull<u8>) -> usize {
        context().allocated_size(ptr)
    }

    /// Deallocates an allocation of this allocator.
    ///
    /// This function forwards the call to [`Heap::deallocate`].
    ///
    /// # Safety
    ///
    /// `ptr` must have been allocated by this allocator and must not be used
    /// afterwards.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        with(|heap| unsafe { heap.deallocate(ptr) })
    }

    /// Resizes an allocation of this allocator.
    ///
    /// This function forwards the call to [`Heap::reallocate`].
    ///
    /// # Safety
    ///
    /// See [`deallocate`](Self::deallocate).
    pub unsafe fn reallocate(&self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        with(|heap| unsafe { heap.reallocate(ptr, new_size) })
    }
}

unsafe impl GlobalAlloc for Spanalloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.allocate_aligned(layout.size(), layout.align())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= ALIGNMENT {
            return self
                .allocate_zeroed(layout.size())
                .map_or(ptr::null_mut(), NonNull::as_ptr);
        }
        match self.allocate_aligned(layout.size(), layout.align()) {
            Some(ptr) => {
                // SAFETY: The allocation holds at least `layout.size()` bytes.
                unsafe { ptr.write_bytes(0, layout.size()) };
                ptr.as_ptr()
            }
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            // SAFETY: The caller guarantees `ptr` came from this allocator.
            no_unwind(|| unsafe { self.deallocate(ptr) })
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(ptr) = NonNull::new(ptr) else {
            return ptr::null_mut();
        };
        if layout.align() <= ALIGNMENT {
            // SAFETY: The caller guarantees `ptr` came from this allocator.
            let new = no_unwind(|| unsafe { self.reallocate(ptr, new_size) });
            return new.map_or(ptr::null_mut(), NonNull::as_ptr);
        }

        // Objects of other sizes may be less aligned, so move the allocation.
        let Some(new) = self.allocate_aligned(new_size, layout.align()) else {
            return ptr::null_mut();
        };
        let len = layout.size().min(new_size);
        // SAFETY: Both allocations are live and hold at least `len` bytes.
        unsafe { ptr::copy_nonoverlapping(ptr.as_ptr(), new.as_ptr(), len) };
        no_unwind(|| unsafe { self.deallocate(ptr) });
        new.as_ptr()
    }
}
