//! Compile-time geometry and runtime tunables.
//!
//! The geometry constants are generated by the build script and can be
//! overridden with `SPANALLOC_PAGE_SHIFT` and `SPANALLOC_MAX_SIZE_SHIFT` at
//! build time. The runtime [`Options`] are read from the environment once,
//! see [`Options::from_env`].

use core::ffi::CStr;

include!(concat!(env!("OUT_DIR"), "/config.rs"));

/// The size of a page, the allocation granularity of the page heap.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// The largest size served by size classes. Larger requests go directly to
/// the page heap.
pub const MAX_SIZE: usize = 1 << MAX_SIZE_SHIFT;

/// The number of pages in 1 MiB. Free spans shorter than this are kept in
/// per-length buckets, longer ones in the large lists.
pub const MAX_PAGES: usize = 1 << (20 - PAGE_SHIFT);
/// The minimum number of pages requested from the system at a time.
pub const MIN_SYSTEM_ALLOC: usize = MAX_PAGES;

/// The upper bound on the number of size classes, including the reserved
/// class 0.
pub const MAX_CLASSES: usize = 128;
/// The minimum alignment of every allocation.
pub const ALIGNMENT: usize = 8;
/// The alignment of every allocation of at least this many bytes.
pub const MIN_ALIGN: usize = 16;

/// The number of significant bits in a user-space address.
pub const ADDRESS_BITS: usize = 48;

pub(crate) const MIB: usize = 1 << 20;

/// Runtime tunables of an [`AllocatorContext`](crate::AllocatorContext).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Options {
    /// How eagerly free pages are returned to the system. `0` disables
    /// incremental scavenging.
    pub release_rate: f64,
    /// The cap on committed pages, `0` for unlimited.
    pub heap_limit_pages: usize,
    /// The upper bound of objects moved per batch between thread caches and
    /// central free lists.
    pub transfer_num_objects: usize,
    /// The mean number of bytes between sampled allocations, `0` disables
    /// sampling.
    pub sample_parameter: usize,
    /// Release every freed span immediately.
    pub aggressive_decommit: bool,
    /// The byte budget of each thread cache.
    pub max_thread_cache_bytes: usize,
    /// Allocations of at least this many bytes are reported.
    pub large_alloc_report_threshold: usize,
    /// Heap growth between forced release passes, in bytes.
    pub force_coalesce_interval: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl Options {
    pub const DEFAULT: Options = Options {
        release_rate: 1.0,
        heap_limit_pages: 0,
        transfer_num_objects: 32,
        sample_parameter: 0,
        aggressive_decommit: false,
        max_thread_cache_bytes: 4 * MIB,
        large_alloc_report_threshold: 1 << 30,
        force_coalesce_interval: 128 * MIB,
    };

    pub(crate) const MIN_TRANSFER: usize = 2;
    pub(crate) const MAX_TRANSFER: usize = 1024;

    /// Reads the options from `SPANALLOC_*` environment variables, falling
    /// back to the defaults for unset or malformed values.
    ///
    /// This function doesn't allocate, so it can run from inside the first
    /// allocation of a global allocator.
    pub fn from_env() -> Self {
        let mut options = Options::DEFAULT;
        if let Some(rate) = env_f64(c"SPANALLOC_RELEASE_RATE") {
            options.release_rate = rate.max(0.0);
        }
        if let Some(mb) = env_usize(c"SPANALLOC_HEAP_LIMIT_MB") {
            options.heap_limit_pages = mb.saturating_mul(MIB) >> PAGE_SHIFT;
        }
        if let Some(num) = env_usize(c"SPANALLOC_TRANSFER_NUM_OBJ") {
            options.transfer_num_objects = num;
        }
        if let Some(bytes) = env_usize(c"SPANALLOC_SAMPLE_PARAMETER") {
            options.sample_parameter = bytes;
        }
        if let Some(flag) = env_usize(c"SPANALLOC_AGGRESSIVE_DECOMMIT") {
            options.aggressive_decommit = flag != 0;
        }
        if let Some(bytes) = env_usize(c"SPANALLOC_MAX_THREAD_CACHE_BYTES") {
            options.max_thread_cache_bytes = bytes;
        }
        if let Some(bytes) = env_usize(c"SPANALLOC_LARGE_ALLOC_REPORT_THRESHOLD") {
            options.large_alloc_report_threshold = bytes;
        }
        options
    }

    /// The transfer batch bound actually used by the size map.
    pub fn clamped_transfer_num_objects(&self) -> usize {
        self.transfer_num_objects.clamp(Self::MIN_TRANSFER, Self::MAX_TRANSFER)
    }
}

fn env_str(name: &CStr) -> Option<&'static str> {
    // SAFETY: `name` is nul-terminated, and the returned string lives in the
    // environment block, which we never modify.
    let value = unsafe { libc::getenv(name.as_ptr()) };
    if value.is_null() {
        return None;
    }
    // SAFETY: `getenv` returns a nul-terminated string.
    let value = unsafe { CStr::from_ptr(value) };
    value.to_str().ok().map(str::trim)
}

fn env_usize(name: &CStr) -> Option<usize> {
    env_str(name)?.parse().ok()
}

fn env_f64(name: &CStr) -> Option<f64> {
    env_str(name)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry() {
        assert!(PAGE_SIZE.is_power_of_two());
        assert!(MAX_SIZE > PAGE_SIZE);
        assert_eq!(MAX_PAGES * PAGE_SIZE, MIB);
        assert!(MIN_SYSTEM_ALLOC <= MAX_PAGES);
    }

    #[test]
    fn transfer_clamp() {
        let mut options = Options::default();
        options.transfer_num_objects = 0;
        assert_eq!(options.clamped_transfer_num_objects(), 2);
        options.transfer_num_objects = 1 << 20;
        assert_eq!(options.clamped_transfer_num_objects(), 1024);
        options.transfer_num_objects = 64;
        assert_eq!(options.clamped_transfer_num_objects(), 64);
    }

    #[test]
    fn missing_env() {
        assert_eq!(env_usize(c"SPANALLOC_SURELY_NOT_SET_ANYWHERE"), None);
    }
}
