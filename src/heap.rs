//! The allocation front door.
//!
//! An [`AllocatorContext`] holds everything shared by the threads of a
//! process: the page heap, the size map and the central free lists. A
//! [`Heap`] is the private part of one execution context, a thread cache and
//! a sampler, and serves every request through its context.

use core::{
    fmt,
    ptr::{self, NonNull},
    sync::atomic::{AtomicUsize, Ordering::*},
};
use std::sync::OnceLock;

use crate::{
    base::SysAlloc,
    central::CentralFreeList,
    config::{ALIGNMENT, MAX_CLASSES, Options, PAGE_SHIFT, PAGE_SIZE},
    error::{Corruption, CorruptionKind, Error, fatal},
    page_heap::{self, PageHeap},
    sampler::{Sample, Sampler, StackCollector, StackTrace},
    size_class::SizeMap,
    span::{Location, SpanId},
    stat::{Ranges, Stat},
    sync::{SpinLock, spin_lock},
    thread_cache::{ThreadCache, Tiers},
    track,
};

/// The report threshold of large allocations never grows past this.
const MAX_REPORT_THRESHOLD: usize = 8 << 30;

/// What a pointer handed to the allocator resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    /// An object of a size class.
    Object(usize),
    /// A whole span of this many pages.
    Pages(usize),
}

/// The state shared by every [`Heap`] of an allocator.
///
/// A context must be constructed before any allocation it serves, and must
/// outlive every pointer allocated from it. It is usually a `static`:
///
/// ```rust
/// use spanalloc::{AllocatorContext, Heap, base::{Mmap, SysAlloc}};
///
/// static BASE: Mmap = Mmap::new();
/// static BACKENDS: [&dyn SysAlloc; 1] = [&BASE];
/// static CX: AllocatorContext = AllocatorContext::new(&BACKENDS);
///
/// let mut heap = Heap::new(&CX);
/// let ptr = heap.allocate_zeroed(4096).unwrap();
/// assert!(heap.allocated_size(ptr) >= 4096);
/// unsafe { heap.deallocate(ptr) };
/// ```
pub struct AllocatorContext<'a> {
    page_heap: PageHeap<'a>,
    size_map: OnceLock<SizeMap>,
    central: [CentralFreeList; MAX_CLASSES],
    transfer_num_objects: AtomicUsize,
    sample_parameter: AtomicUsize,
    max_thread_cache_bytes: AtomicUsize,
    large_alloc_report_threshold: AtomicUsize,
    stack_collector: SpinLock<Option<StackCollector>>,
}

impl<'a> AllocatorContext<'a> {
    /// Creates a context drawing memory from `backends` in order, with the
    /// default [`Options`].
    pub const fn new(backends: &'a [&'a dyn SysAlloc]) -> Self {
        AllocatorContext {
            page_heap: PageHeap::new(backends),
            size_map: OnceLock::new(),
            central: [const { CentralFreeList::new() }; MAX_CLASSES],
            transfer_num_objects: AtomicUsize::new(Options::DEFAULT.transfer_num_objects),
            sample_parameter: AtomicUsize::new(Options::DEFAULT.sample_parameter),
            max_thread_cache_bytes: AtomicUsize::new(Options::DEFAULT.max_thread_cache_bytes),
            large_alloc_report_threshold: AtomicUsize::new(
                Options::DEFAULT.large_alloc_report_threshold,
            ),
            stack_collector: spin_lock(None),
        }
    }

    /// Applies `options` to this context.
    ///
    /// The transfer batch bound only takes effect before the first
    /// allocation, when the size map is built. Thread cache budgets apply to
    /// heaps created afterwards.
    pub fn apply(&self, options: &Options) {
        self.page_heap.apply(options);

        let transfer = options.clamped_transfer_num_objects();
        if transfer != options.transfer_num_objects {
            log::warn!(
                "transfer batch of {} objects clamped to {transfer}",
                options.transfer_num_objects
            );
        }
        let old = self.transfer_num_objects.swap(transfer, Relaxed);
        if old != transfer && self.size_map.get().is_some() {
            log::warn!("size map already built, transfer batch of {transfer} objects ignored");
        }

        self.set_sample_parameter(options.sample_parameter);
        self.set_max_thread_cache_bytes(options.max_thread_cache_bytes);
        self.set_large_alloc_report_threshold(options.large_alloc_report_threshold);
    }

    /// The options currently in effect.
    pub fn options(&self) -> Options {
        Options {
            release_rate: self.page_heap.release_rate(),
            heap_limit_pages: self.page_heap.heap_limit_pages(),
            transfer_num_objects: self.transfer_num_objects.load(Relaxed),
            sample_parameter: self.sample_parameter(),
            aggressive_decommit: self.page_heap.aggressive_decommit(),
            max_thread_cache_bytes: self.max_thread_cache_bytes(),
            large_alloc_report_threshold: self.large_alloc_report_threshold.load(Relaxed),
            ..Options::DEFAULT
        }
    }

    pub fn set_release_rate(&self, rate: f64) {
        self.page_heap.set_release_rate(rate)
    }

    pub fn set_heap_limit_pages(&self, pages: usize) {
        self.page_heap.set_heap_limit_pages(pages)
    }

    pub fn set_aggressive_decommit(&self, enabled: bool) {
        self.page_heap.set_aggressive_decommit(enabled)
    }

    pub fn sample_parameter(&self) -> usize {
        self.sample_parameter.load(Relaxed)
    }

    /// Sets the mean number of bytes between sampled allocations, `0` to
    /// disable sampling.
    pub fn set_sample_parameter(&self, bytes: usize) {
        self.sample_parameter.store(bytes, Relaxed)
    }

    pub fn max_thread_cache_bytes(&self) -> usize {
        self.max_thread_cache_bytes.load(Relaxed)
    }

    pub fn set_max_thread_cache_bytes(&self, bytes: usize) {
        self.max_thread_cache_bytes.store(bytes, Relaxed)
    }

    pub fn set_large_alloc_report_threshold(&self, bytes: usize) {
        self.large_alloc_report_threshold.store(bytes, Relaxed)
    }

    /// Sets the hook recording the call stacks of sampled allocations.
    pub fn set_stack_collector(&self, collector: Option<StackCollector>) {
        *self.stack_collector.lock() = collector;
    }

    pub fn page_heap(&self) -> &PageHeap<'a> {
        &self.page_heap
    }

    /// The size map, built on first use.
    pub fn size_map(&self) -> &SizeMap {
        self.size_map
            .get_or_init(|| SizeMap::new(self.transfer_num_objects.load(Relaxed)))
    }

    /// The central free list of `class`.
    pub fn central(&self, class: usize) -> &CentralFreeList {
        &self.central[class]
    }

    pub fn tiers(&self) -> Tiers<'_, 'a> {
        Tiers {
            page_heap: &self.page_heap,
            central: &self.central,
            size_map: self.size_map(),
        }
    }

    /// Takes a snapshot of the statistics of this context.
    pub fn stat(&self) -> Stat {
        Stat::collect(self)
    }

    /// Iterates over the address ranges of the page heap.
    pub fn ranges(&self) -> Ranges<'_, 'a> {
        Ranges::new(self)
    }

    /// Copies the live sampled allocations into `out`, returning their total
    /// number.
    pub fn sampled(&self, out: &mut [Sample]) -> usize {
        self.page_heap.sampled(out)
    }

    /// Returns every free page to the system. Returns the bytes released.
    pub fn release_free_memory(&self) -> usize {
        self.release_pages(usize::MAX)
    }

    /// Returns at least `bytes` of free memory to the system if there is
    /// that much. Returns the bytes released.
    pub fn release_to_system(&self, bytes: usize) -> usize {
        self.release_pages(bytes.div_ceil(PAGE_SIZE))
    }

    fn release_pages(&self, pages: usize) -> usize {
        let released = self.page_heap.release_at_least(pages);
        if released > 0 {
            log::debug!("released {released} pages on request");
        }
        released << PAGE_SHIFT
    }

    /// Walks every internal structure of the page heap.
    pub fn check(&self) -> Result<(), Corruption> {
        self.page_heap.check_expensive()
    }

    /// Returns the number of bytes usable at `ptr`.
    ///
    /// Reports a [`Corruption`] if `ptr` is not an allocation of this
    /// context.
    pub fn allocated_size(&self, ptr: NonNull<u8>) -> usize {
        match self.resolve(ptr) {
            Ok(Owner::Object(class)) => self.size_map().class_size(class),
            Ok(Owner::Pages(pages)) => pages << PAGE_SHIFT,
            Err(corruption) => fatal(corruption),
        }
    }

    fn resolve(&self, ptr: NonNull<u8>) -> Result<Owner, Corruption> {
        use CorruptionKind::*;

        let address = ptr.as_ptr().addr();
        let page = address >> PAGE_SHIFT;
        let entry = self.page_heap.entry(page).ok_or(Corruption::new(
            UnownedPointer,
            address,
            "no span covers the pointer",
        ))?;
        let span = self.page_heap.span(entry.span);
        if !span.contains(page) || span.location() != Location::InUse {
            return Err(Corruption::new(DoubleFree, address, "the pointer is in free memory"));
        }

        let class = usize::from(entry.class);
        if class == 0 {
            if span.address() != address {
                return Err(Corruption::new(
                    InteriorPointer,
                    address,
                    "the pointer is not the start of its span",
                ));
            }
            return Ok(Owner::Pages(span.length()));
        }
        let size_map = self.size_map();
        let offset = address - span.address();
        if offset % size_map.class_size(class) != 0 {
            return Err(Corruption::new(
                InteriorPointer,
                address,
                "the pointer is not the start of an object",
            ));
        }
        if offset / size_map.class_size(class) >= size_map.objects_per_span(class) {
            return Err(Corruption::new(
                UnownedPointer,
                address,
                "the pointer is past the last object of its span",
            ));
        }
        Ok(Owner::Object(class))
    }

    fn span_ptr(&self, id: SpanId) -> NonNull<u8> {
        // SAFETY: Backends never hand out the null page.
        unsafe { NonNull::new_unchecked(self.page_heap.span(id).as_ptr()) }
    }

    fn report_large(&self, size: usize) {
        let threshold = self.large_alloc_report_threshold.load(Relaxed);
        if size < threshold {
            return;
        }
        // Each report raises the bar by an eighth, so a growing buffer isn't
        // reported on every step.
        let raised = (threshold + threshold / 8).min(MAX_REPORT_THRESHOLD);
        if self
            .large_alloc_report_threshold
            .compare_exchange(threshold, raised, Relaxed, Relaxed)
            .is_ok()
        {
            log::warn!("large allocation of {size} bytes");
        }
    }

    fn allocate_pages(&self, size: usize) -> Result<NonNull<u8>, Error> {
        let pages = page_heap::pages(size).ok_or(Error::SizeOverflow)?;
        self.report_large(size);
        let id = self.page_heap.new_span(pages)?;
        Ok(self.span_ptr(id))
    }

    fn allocate_aligned_pages(&self, size: usize, align: usize) -> Result<NonNull<u8>, Error> {
        self.report_large(size);
        let id = self.page_heap.new_aligned(size, align)?;
        Ok(self.span_ptr(id))
    }

    fn allocate_sampled(&self, size: usize) -> Result<NonNull<u8>, Error> {
        let pages = page_heap::pages(size).ok_or(Error::SizeOverflow)?;
        let collector = *self.stack_collector.lock();
        let trace = StackTrace::capture(size, collector);
        self.report_large(size);
        let id = self.page_heap.new_sampled(pages, &trace)?;
        Ok(self.span_ptr(id))
    }
}

impl fmt::Debug for AllocatorContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatorContext")
            .field("page_heap", &self.page_heap)
            .field("size_map", &self.size_map.get().map(SizeMap::num_classes))
            .field("options", &self.options())
            .finish_non_exhaustive()
    }
}

fn report<T>(result: Result<T, Error>) -> Option<T> {
    result.inspect_err(|err| log::warn!("allocation failed: {err}")).ok()
}

/// The allocator of one execution context, usually a thread.
///
/// Small requests are served by the thread cache without locking. Large
/// requests, and sampled ones, go to the page heap of the context.
pub struct Heap<'c, 'a> {
    cx: &'c AllocatorContext<'a>,
    cache: ThreadCache,
    sampler: Sampler,
}

impl<'c, 'a> Heap<'c, 'a> {
    /// Creates a heap serving requests from `cx`.
    pub fn new(cx: &'c AllocatorContext<'a>) -> Self {
        Heap {
            cx,
            cache: ThreadCache::new(cx.max_thread_cache_bytes()),
            sampler: Sampler::new(),
        }
    }

    pub fn context(&self) -> &'c AllocatorContext<'a> {
        self.cx
    }

    pub fn cache(&self) -> &ThreadCache {
        &self.cache
    }

    fn allocate_inner(&mut self, size: usize) -> Result<NonNull<u8>, Error> {
        let cx = self.cx;
        if self.sampler.record_allocation(size, cx.sample_parameter()) {
            return cx.allocate_sampled(size.max(1));
        }
        match cx.size_map().try_class_of(size) {
            Some(class) => self.cache.allocate(cx.tiers(), class),
            None => cx.allocate_pages(size),
        }
    }

    /// Allocates at least `size` bytes.
    ///
    /// # Errors
    ///
    /// Errors are returned when the size overflows or the heap can't grow.
    pub fn try_allocate(&mut self, size: usize) -> Result<NonNull<u8>, Error> {
        let ptr = self.allocate_inner(size)?;
        track::allocated(ptr, size, false);
        Ok(ptr)
    }

    /// Allocates at least `size` bytes, returning `None` on failure.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        report(self.try_allocate(size))
    }

    pub fn try_allocate_zeroed(&mut self, size: usize) -> Result<NonNull<u8>, Error> {
        let ptr = self.allocate_inner(size)?;
        // SAFETY: The allocation holds at least `size` bytes.
        unsafe { ptr.write_bytes(0, size) };
        track::allocated(ptr, size, true);
        Ok(ptr)
    }

    /// Allocates at least `size` zeroed bytes, returning `None` on failure.
    pub fn allocate_zeroed(&mut self, size: usize) -> Option<NonNull<u8>> {
        report(self.try_allocate_zeroed(size))
    }

    fn allocate_aligned_inner(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, Error> {
        if align <= ALIGNMENT {
            return self.allocate_inner(size);
        }
        let cx = self.cx;
        let size_map = cx.size_map();
        let size = size.max(1);

        // Objects are aligned to the largest power of two dividing their
        // class size, so the first such class at least as large will do.
        if align < PAGE_SIZE
            && let Some(class) = size_map.try_class_of(size)
            && let Some(class) = (class..size_map.num_classes())
                .find(|&class| size_map.class_size(class) & (align - 1) == 0)
        {
            return self.cache.allocate(cx.tiers(), class);
        }
        if align <= PAGE_SIZE {
            return cx.allocate_pages(size);
        }
        cx.allocate_aligned_pages(size, align)
    }

    /// Allocates at least `size` bytes aligned to `align`.
    ///
    /// # Errors
    ///
    /// Besides the errors of [`try_allocate`](Self::try_allocate),
    /// [`Error::InvalidAlignment`] is returned if `align` is not a power of
    /// two.
    pub fn try_allocate_aligned(
        &mut self,
        size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, Error> {
        if !align.is_power_of_two() {
            return Err(Error::InvalidAlignment(align));
        }
        let ptr = self.allocate_aligned_inner(size, align)?;
        track::allocated(ptr, size, false);
        Ok(ptr)
    }

    /// Allocates at least `size` bytes aligned to `align`, returning `None`
    /// on failure.
    pub fn allocate_aligned(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        report(self.try_allocate_aligned(size, align))
    }

    /// Returns the number of bytes usable at `ptr`, which is at least the
    /// size requested for it.
    ///
    /// Reports a [`Corruption`] if `ptr` is not an allocation of this heap's
    /// context.
    pub fn allocated_size(&self, ptr: NonNull<u8>) -> usize {
        self.cx.allocated_size(ptr)
    }

    /// Deallocates `ptr`.
    ///
    /// Pointers that are not the start of a live allocation of this heap's
    /// context are reported as a [`Corruption`], when they can be told
    /// apart.
    ///
    /// # Safety
    ///
    /// `ptr` must have been allocated by a heap of the same context and must
    /// not be used afterwards.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        let cx = self.cx;
        match cx.resolve(ptr) {
            Ok(Owner::Object(class)) => {
                track::freed(ptr);
                // SAFETY: The object belongs to `class` and is no longer used.
                unsafe { self.cache.deallocate(cx.tiers(), class, ptr) }
            }
            Ok(Owner::Pages(_)) => {
                track::freed(ptr);
                if let Err(corruption) = cx.page_heap.delete_at(ptr.as_ptr().addr()) {
                    fatal(corruption)
                }
            }
            Err(corruption) => fatal(corruption),
        }
    }

    /// Resizes the allocation at `ptr` to `new_size` bytes.
    ///
    /// The allocation stays in place if `new_size` is between half of its
    /// usable size and its usable size. Growing reserves at least a quarter
    /// more than the old size. On failure, the old allocation is left
    /// untouched.
    ///
    /// # Safety
    ///
    /// See [`deallocate`](Self::deallocate).
    pub unsafe fn try_reallocate(
        &mut self,
        ptr: NonNull<u8>,
        new_size: usize,
    ) -> Result<NonNull<u8>, Error> {
        let old_size = self.allocated_size(ptr);
        if new_size <= old_size && new_size >= old_size / 2 {
            return Ok(ptr);
        }

        let grow_to = old_size.saturating_add(old_size / 4);
        let new = if new_size > old_size && new_size < grow_to {
            self.try_allocate(grow_to)
                .or_else(|_| self.try_allocate(new_size))?
        } else {
            self.try_allocate(new_size)?
        };
        // SAFETY: Both allocations are live and hold at least the copied
        // length.
        unsafe {
            ptr::copy_nonoverlapping(ptr.as_ptr(), new.as_ptr(), old_size.min(new_size));
            self.deallocate(ptr);
        }
        Ok(new)
    }

    /// Resizes the allocation at `ptr`, returning `None` on failure.
    ///
    /// # Safety
    ///
    /// See [`deallocate`](Self::deallocate).
    pub unsafe fn reallocate(&mut self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        report(unsafe { self.try_reallocate(ptr, new_size) })
    }

    /// Returns every object cached by this heap to the central free lists.
    pub fn flush(&mut self) -> usize {
        let released = self.cache.flush(self.cx.tiers());
        if released > 0 {
            log::debug!("flushed {released} cached objects");
        }
        released
    }
}

impl Drop for Heap<'_, '_> {
    fn drop(&mut self) {
        self.cache.flush(self.cx.tiers());
    }
}

impl fmt::Debug for Heap<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("cached_bytes", &self.cache.size())
            .field("max_cached_bytes", &self.cache.max_size())
            .finish_non_exhaustive()
    }
}
