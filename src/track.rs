//! Memory state annotations for Valgrind, enabled by the `track-valgrind`
//! feature and compiled to nothing otherwise.

#[cfg(feature = "track-valgrind")]
mod imp {
    use core::ptr::NonNull;

    use crabgrind::memcheck::*;

    /// An object was handed out to the user.
    pub fn allocated(ptr: NonNull<u8>, size: usize, is_zeroed: bool) {
        alloc::malloc(ptr.as_ptr().cast(), size, 0, is_zeroed)
    }

    /// An object was returned by the user.
    pub fn freed(ptr: NonNull<u8>) {
        alloc::free(ptr.as_ptr().cast(), 0)
    }

    pub fn undefined(ptr: NonNull<u8>, size: usize) {
        let _ = mark_mem(ptr.as_ptr().cast(), size, MemState::Undefined);
    }

    pub fn defined(ptr: NonNull<u8>, size: usize) {
        let _ = mark_mem(ptr.as_ptr().cast(), size, MemState::Defined);
    }

    pub fn no_access(ptr: NonNull<u8>, size: usize) {
        let _ = mark_mem(ptr.as_ptr().cast(), size, MemState::NoAccess);
    }
}
#[cfg(not(feature = "track-valgrind"))]
mod imp {
    use core::ptr::NonNull;

    #[inline(always)]
    pub fn allocated(ptr: NonNull<u8>, size: usize, is_zeroed: bool) {
        let _ = (ptr, size, is_zeroed);
    }

    #[inline(always)]
    pub fn freed(ptr: NonNull<u8>) {
        let _ = ptr;
    }

    #[inline(always)]
    pub fn undefined(ptr: NonNull<u8>, size: usize) {
        let _ = (ptr, size);
    }

    #[inline(always)]
    pub fn defined(ptr: NonNull<u8>, size: usize) {
        let _ = (ptr, size);
    }

    #[inline(always)]
    pub fn no_access(ptr: NonNull<u8>, size: usize) {
        let _ = (ptr, size);
    }
}
pub use self::imp::*;
