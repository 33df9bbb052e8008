use core::fmt;

use crate::config::PAGE_SHIFT;

/// The errors of a fallible allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    /// The requested size overflows the address space arithmetic.
    SizeOverflow,
    /// The system allocator refused to grow the heap.
    OutOfMemory {
        /// The number of pages requested.
        pages: usize,
        /// The last OS error reported by a backend, if any.
        os_error: Option<i32>,
    },
    /// Growing the heap would exceed the configured heap limit.
    HeapLimit {
        /// The number of pages requested.
        pages: usize,
    },
    /// The alignment is not a power of two.
    InvalidAlignment(usize),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::SizeOverflow => write!(f, "requested size overflows the address space"),
            Error::OutOfMemory { pages, os_error } => {
                write!(f, "out of memory growing the heap by {} bytes", pages << PAGE_SHIFT)?;
                #[cfg(feature = "base-mmap")]
                if let Some(errno) = os_error {
                    write!(f, ": {}", errno::Errno(*errno))?;
                }
                #[cfg(not(feature = "base-mmap"))]
                if let Some(errno) = os_error {
                    write!(f, ": os error {errno}")?;
                }
                Ok(())
            }
            Error::HeapLimit { pages } => {
                write!(f, "heap limit reached allocating {} bytes", pages << PAGE_SHIFT)
            }
            Error::InvalidAlignment(align) => {
                write!(f, "alignment {align:#x} is not a power of two")
            }
        }
    }
}

impl std::error::Error for Error {}

/// The kind of a heap corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorruptionKind {
    /// The pointer doesn't belong to any span of this allocator.
    UnownedPointer,
    /// The pointer points into the middle of an allocated object.
    InteriorPointer,
    /// The object or span is already free.
    DoubleFree,
    /// A span disagrees with the free lists or the page map.
    SpanMismatch,
}

/// A detected heap corruption.
///
/// Corruptions are never returned to callers of the allocation API. They are
/// raised as a panic carrying this value as the payload (see [`fatal`]),
/// which aborts the process in builds with `panic = "abort"` and can be
/// caught and downcast with [`std::panic::catch_unwind`] otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Corruption {
    pub kind: CorruptionKind,
    /// The offending address, or the first page of the offending span.
    pub address: usize,
    pub detail: &'static str,
}

impl Corruption {
    pub const fn new(kind: CorruptionKind, address: usize, detail: &'static str) -> Self {
        Corruption { kind, address, detail }
    }
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            CorruptionKind::UnownedPointer => "pointer not owned by the allocator",
            CorruptionKind::InteriorPointer => "pointer into the middle of an object",
            CorruptionKind::DoubleFree => "double free",
            CorruptionKind::SpanMismatch => "span bookkeeping mismatch",
        };
        write!(f, "heap corruption: {kind} at {:#x} ({})", self.address, self.detail)
    }
}

impl std::error::Error for Corruption {}

/// Reports a heap corruption and unwinds with it as the payload.
///
/// Must not be called while holding any lock of the allocator.
#[cold]
#[track_caller]
pub fn fatal(corruption: Corruption) -> ! {
    log::error!("{corruption}");
    std::panic::panic_any(corruption)
}
