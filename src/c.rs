//! The C interface of the global allocator.
//!
//! Failed allocations return null and set `errno` to `ENOMEM`, or to
//! `EINVAL` for invalid alignments.

use core::{
    ffi::{c_int, c_void},
    mem,
    ptr::{self, NonNull},
};

use crate::{Spanalloc, error::Error};

fn set_errno(err: c_int) {
    errno::set_errno(errno::Errno(err));
}

fn into_raw(result: Result<NonNull<u8>, Error>) -> *mut c_void {
    match result {
        Ok(ptr) => ptr.as_ptr().cast(),
        Err(Error::InvalidAlignment(_)) => {
            set_errno(libc::EINVAL);
            ptr::null_mut()
        }
        Err(err) => {
            log::warn!("allocation failed: {err}");
            set_errno(libc::ENOMEM);
            ptr::null_mut()
        }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn sa_malloc(size: usize) -> *mut c_void {
    into_raw(Spanalloc.try_allocate(size))
}

/// # Safety
///
/// `ptr` must be null or an allocation of this allocator not freed yet.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sa_free(ptr: *mut c_void) {
    if let Some(ptr) = NonNull::new(ptr) {
        unsafe { Spanalloc.deallocate(ptr.cast()) }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn sa_calloc(nmemb: usize, size: usize) -> *mut c_void {
    let Some(size) = nmemb.checked_mul(size) else {
        set_errno(libc::ENOMEM);
        return ptr::null_mut();
    };
    match Spanalloc.allocate_zeroed(size) {
        Some(ptr) => ptr.as_ptr().cast(),
        None => {
            set_errno(libc::ENOMEM);
            ptr::null_mut()
        }
    }
}

/// # Safety
///
/// `ptr` must be null or an allocation of this allocator not freed yet.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sa_realloc(ptr: *mut c_void, new_size: usize) -> *mut c_void {
    let Some(ptr) = NonNull::new(ptr) else {
        return sa_malloc(new_size);
    };
    if new_size == 0 {
        unsafe { sa_free(ptr.as_ptr()) };
        return ptr::null_mut();
    }
    match unsafe { Spanalloc.reallocate(ptr.cast(), new_size) } {
        Some(new) => new.as_ptr().cast(),
        None => {
            set_errno(libc::ENOMEM);
            ptr::null_mut()
        }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn sa_memalign(align: usize, size: usize) -> *mut c_void {
    into_raw(Spanalloc.try_allocate_aligned(size, align))
}

#[unsafe(no_mangle)]
pub extern "C" fn sa_aligned_alloc(align: usize, size: usize) -> *mut c_void {
    sa_memalign(align, size)
}

/// # Safety
///
/// `slot` must be valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sa_posix_memalign(
    slot: *mut *mut c_void,
    align: usize,
    size: usize,
) -> c_int {
    if slot.is_null() || !align.is_power_of_two() || align % mem::size_of::<*mut c_void>() != 0 {
        return libc::EINVAL;
    }
    match Spanalloc.try_allocate_aligned(size, align) {
        Ok(ptr) => {
            unsafe { slot.write(ptr.as_ptr().cast()) };
            0
        }
        Err(err) => {
            log::warn!("allocation failed: {err}");
            libc::ENOMEM
        }
    }
}

/// # Safety
///
/// `ptr` must be null or an allocation of this allocator not freed yet.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sa_malloc_usable_size(ptr: *mut c_void) -> usize {
    NonNull::new(ptr).map_or(0, |ptr| Spanalloc.allocated_size(ptr.cast()))
}

/// Returns every free page to the system, returning the bytes released.
#[unsafe(no_mangle)]
pub extern "C" fn sa_release_free_memory() -> usize {
    Spanalloc.release_free_memory()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malloc_family() {
        unsafe {
            let p = sa_malloc(10).cast::<u8>();
            assert!(!p.is_null());
            assert!(sa_malloc_usable_size(p.cast()) >= 10);
            p.write_bytes(3, 10);

            let q = sa_realloc(p.cast(), 5000).cast::<u8>();
            assert!(!q.is_null());
            assert_eq!(*q.add(9), 3);
            assert!(sa_realloc(q.cast(), 0).is_null());

            let z = sa_calloc(100, 8).cast::<u64>();
            assert!((0..100).all(|i| *z.add(i) == 0));
            sa_free(z.cast());
            assert!(sa_calloc(usize::MAX, 2).is_null());

            let a = sa_memalign(4096, 100);
            assert_eq!(a.addr() % 4096, 0);
            sa_free(a);
            assert!(sa_aligned_alloc(3, 100).is_null());

            let mut slot = ptr::null_mut();
            assert_eq!(sa_posix_memalign(&mut slot, 64, 200), 0);
            assert_eq!(slot.addr() % 64, 0);
            sa_free(slot);
            assert_eq!(sa_posix_memalign(&mut slot, 4, 200), libc::EINVAL);

            sa_free(ptr::null_mut());
            assert_eq!(sa_malloc_usable_size(ptr::null_mut()), 0);
        }
    }
}
