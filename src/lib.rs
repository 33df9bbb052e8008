//! A multi-tier memory allocator built on spans.
//!
//! Memory flows through three tiers:
//!
//! - The [page heap](page_heap::PageHeap) hands out runs of pages, called
//!   spans, with best-fit search, coalescing and scavenging of idle pages
//!   back to the [system allocator](base::SysAlloc).
//! - [Central free lists](central::CentralFreeList), one per size class,
//!   carve spans into objects and move them in batches.
//! - [Thread caches](thread_cache::ThreadCache) serve most requests
//!   without taking any lock.
//!
//! An [`AllocatorContext`] ties the shared tiers together, and a [`Heap`]
//! adds a thread cache on top of it. With the `global` feature, the
//! [`Spanalloc`] type serves as the global allocator:
//!
//! ```rust,no_run
//! #[global_allocator]
//! static ALLOC: spanalloc::Spanalloc = spanalloc::Spanalloc;
//! ```
//!
//! Heap corruptions detected on the deallocation path, such as freeing a
//! pointer into the middle of an object, are never silently ignored. They
//! panic with a [`Corruption`] payload, which aborts the process when the
//! global allocator is in use.

pub mod base;
#[cfg(feature = "c")]
mod c;
pub mod central;
pub mod config;
pub mod error;
#[cfg(feature = "global")]
mod global;
pub mod heap;
mod meta;
mod object;
pub mod page_heap;
pub mod pagemap;
pub mod sampler;
pub mod size_class;
pub mod span;
pub mod stat;
mod sync;
pub mod thread_cache;
mod track;

#[cfg(feature = "global")]
pub use self::global::Spanalloc;
pub use self::{
    config::Options,
    error::{Corruption, CorruptionKind, Error},
    heap::{AllocatorContext, Heap},
    stat::Stat,
};
