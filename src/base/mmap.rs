use core::{
    mem,
    ptr::NonNull,
    sync::atomic::{AtomicI32, Ordering::*},
};

use memmap2::MmapOptions;

use super::{Chunk, SysAlloc};

/// A system allocator backed by anonymous memory mappings.
///
/// Mappings are never unmapped once handed out. Released pages are advised
/// away with `MADV_DONTNEED` and refault as zero pages on the next access.
#[derive(Debug, Default)]
pub struct Mmap {
    last_error: AtomicI32,
}

impl Mmap {
    pub const fn new() -> Self {
        Mmap { last_error: AtomicI32::new(0) }
    }

    fn os_page_size() -> usize {
        // SAFETY: `sysconf` has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(size).unwrap_or(4096)
    }

    fn record_error(&self, errno: i32) {
        self.last_error.store(errno, Relaxed);
    }

    /// # Safety
    ///
    /// `[addr, addr + len)` must be an owned part of a mapping.
    unsafe fn unmap(&self, addr: usize, len: usize) {
        if len == 0 {
            return;
        }
        // SAFETY: The range is owned and page-aligned.
        if unsafe { libc::munmap(addr as *mut libc::c_void, len) } != 0 {
            self.record_error(errno::errno().0);
        }
    }
}

unsafe impl SysAlloc for Mmap {
    fn try_alloc(&self, size: usize, align: usize) -> Option<Chunk> {
        let os_page = Self::os_page_size();
        let size = size.checked_next_multiple_of(os_page)?;
        let extra = align.saturating_sub(os_page);
        let len = size.checked_add(extra)?;

        let mut map = match MmapOptions::new().len(len).map_anon() {
            Ok(map) => map,
            Err(err) => {
                self.record_error(err.raw_os_error().unwrap_or(libc::ENOMEM));
                return None;
            }
        };
        let base = map.as_mut_ptr();
        // The pages are trimmed and released manually.
        mem::forget(map);

        let start = base.addr();
        let aligned = start.next_multiple_of(align);
        // SAFETY: The head and the tail are owned parts of the mapping above.
        unsafe {
            self.unmap(start, aligned - start);
            self.unmap(aligned + size, start + len - (aligned + size));
        }
        let ptr = NonNull::new(base.with_addr(aligned))?;
        Some(Chunk { ptr, len: size })
    }

    fn release(&self, ptr: NonNull<u8>, len: usize) -> bool {
        // SAFETY: The range was handed out by a mapping and is no longer used.
        let ret = unsafe { libc::madvise(ptr.as_ptr().cast(), len, libc::MADV_DONTNEED) };
        if ret != 0 {
            self.record_error(errno::errno().0);
        }
        ret == 0
    }

    fn last_error(&self) -> Option<i32> {
        match self.last_error.load(Relaxed) {
            0 => None,
            errno => Some(errno),
        }
    }
}
