//! The page heap: a best-fit allocator of page runs over memory obtained
//! from the system allocator.
//!
//! Free spans are kept on per-length lists for lengths below
//! [`MAX_PAGES`], and on one large list pair above. Each length has a normal
//! list of committed spans and a returned list of spans released to the
//! system. Adjacent free spans are coalesced only when they share their
//! location, so normal and returned memory never mix.
//!
//! All state lives behind one spin lock. Locked sections only collect what
//! is worth logging, and the log is written after the lock is dropped.

use core::{
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering::*},
};

use crate::{
    base::{SysAlloc, SystemAllocator},
    config::{MAX_PAGES, MIN_SYSTEM_ALLOC, Options, PAGE_SHIFT, PAGE_SIZE},
    error::{Corruption, CorruptionKind, Error},
    meta::{Meta, MetaAlloc, ObjectPool},
    pagemap::{PAGE_LIMIT, PageEntry, PageMap, RadixPageMap},
    sampler::{Sample, StackTrace},
    span::{Location, PageId, Span, SpanArena, SpanCursor, SpanId, SpanList},
    stat::{LargeSpanStats, PageHeapStats, Range, RangeKind, SmallSpanStats},
    sync::{SpinLock, SpinLockGuard, spin_lock},
};

/// The scavenging delay, in pages, when nothing could be released.
const DEFAULT_RELEASE_DELAY: i64 = 1 << 18;
/// The upper bound of the scavenging delay, in pages.
const MAX_RELEASE_DELAY: f64 = (1 << 20) as f64;

/// The number of pages covering `bytes`, or `None` on overflow.
pub const fn pages(bytes: usize) -> Option<usize> {
    match bytes.checked_add(PAGE_SIZE - 1) {
        Some(bytes) => Some(bytes >> PAGE_SHIFT),
        None => None,
    }
}

#[derive(Debug, Default)]
struct FreeLists {
    normal: SpanList,
    returned: SpanList,
}

impl FreeLists {
    const fn new() -> Self {
        FreeLists {
            normal: SpanList::new(),
            returned: SpanList::new(),
        }
    }

    fn get(&mut self, location: Location) -> &mut SpanList {
        match location {
            Location::OnReturnedFreelist => &mut self.returned,
            _ => &mut self.normal,
        }
    }
}

struct State {
    /// Lists of free spans of length `i`. Index 0 is never used.
    free: [FreeLists; MAX_PAGES],
    large: FreeLists,
    sampled: SpanList,
    cursor: SpanCursor,
    traces: ObjectPool<StackTrace>,
    stats: PageHeapStats,
    scavenge_counter: i64,
    release_index: usize,
}

impl State {
    const fn new() -> Self {
        State {
            free: [const { FreeLists::new() }; MAX_PAGES],
            large: FreeLists::new(),
            sampled: SpanList::new(),
            cursor: SpanCursor::new(),
            traces: ObjectPool::new(),
            stats: PageHeapStats::EMPTY,
            scavenge_counter: 0,
            release_index: 0,
        }
    }

    fn lists(&mut self, len: usize) -> &mut FreeLists {
        if len < MAX_PAGES {
            &mut self.free[len]
        } else {
            &mut self.large
        }
    }
}

/// Things worth logging that happened while the page heap was locked.
#[derive(Debug, Default)]
struct Events {
    grown: usize,
    forced: usize,
    scavenged: usize,
}

impl Events {
    fn log(self) {
        if self.grown > 0 {
            log::debug!("page heap grew by {} pages", self.grown);
        }
        if self.forced > 0 {
            log::debug!("forced coalescing released {} pages", self.forced);
        }
        if self.scavenged > 0 {
            log::debug!("scavenged {} pages", self.scavenged);
        }
    }
}

/// The page heap.
///
/// The page heap owns the system allocator chain, the metadata allocator,
/// the span records and the page map. Lookups through the page map are
/// lock-free; everything else takes the page heap lock.
pub struct PageHeap<'a, M: PageMap = RadixPageMap> {
    system: SystemAllocator<'a>,
    meta: MetaAlloc,
    spans: SpanArena,
    pagemap: M,
    state: SpinLock<State>,
    release_rate: AtomicU64,
    heap_limit_pages: AtomicUsize,
    aggressive_decommit: AtomicBool,
    force_coalesce_interval: AtomicUsize,
}

impl<'a> PageHeap<'a> {
    /// Creates a page heap drawing memory from `backends` in order.
    pub const fn new(backends: &'a [&'a dyn SysAlloc]) -> Self {
        Self::with_page_map(backends, RadixPageMap::new())
    }
}

impl<'a, M: PageMap> PageHeap<'a, M> {
    pub const fn with_page_map(backends: &'a [&'a dyn SysAlloc], pagemap: M) -> Self {
        PageHeap {
            system: SystemAllocator::new(backends),
            meta: MetaAlloc::new(),
            spans: SpanArena::new(),
            pagemap,
            state: spin_lock(State::new()),
            release_rate: AtomicU64::new(Options::DEFAULT.release_rate.to_bits()),
            heap_limit_pages: AtomicUsize::new(Options::DEFAULT.heap_limit_pages),
            aggressive_decommit: AtomicBool::new(Options::DEFAULT.aggressive_decommit),
            force_coalesce_interval: AtomicUsize::new(Options::DEFAULT.force_coalesce_interval),
        }
    }

    /// Applies the page heap tunables of `options`.
    pub fn apply(&self, options: &Options) {
        self.set_release_rate(options.release_rate);
        self.set_heap_limit_pages(options.heap_limit_pages);
        self.set_aggressive_decommit(options.aggressive_decommit);
        self.force_coalesce_interval
            .store(options.force_coalesce_interval.max(PAGE_SIZE), Relaxed);
    }

    pub fn release_rate(&self) -> f64 {
        f64::from_bits(self.release_rate.load(Relaxed))
    }

    pub fn set_release_rate(&self, rate: f64) {
        self.release_rate.store(rate.max(0.0).to_bits(), Relaxed)
    }

    pub fn heap_limit_pages(&self) -> usize {
        self.heap_limit_pages.load(Relaxed)
    }

    pub fn set_heap_limit_pages(&self, pages: usize) {
        self.heap_limit_pages.store(pages, Relaxed)
    }

    pub fn aggressive_decommit(&self) -> bool {
        self.aggressive_decommit.load(Relaxed)
    }

    pub fn set_aggressive_decommit(&self, enabled: bool) {
        self.aggressive_decommit.store(enabled, Relaxed)
    }

    pub fn system(&self) -> &SystemAllocator<'a> {
        &self.system
    }

    pub fn meta(&self) -> Meta<'_, 'a> {
        Meta {
            alloc: &self.meta,
            system: &self.system,
        }
    }

    /// Looks up the page map entry of `page` without locking.
    #[inline]
    pub fn entry(&self, page: PageId) -> Option<PageEntry> {
        self.pagemap.get(page)
    }

    #[inline]
    pub fn span(&self, id: SpanId) -> &Span {
        self.spans.get(id)
    }

    pub(crate) fn spans(&self) -> &SpanArena {
        &self.spans
    }

    fn with<R>(&self, f: impl FnOnce(&mut Locked<'_, 'a, M>) -> R) -> R {
        let mut locked = Locked {
            heap: self,
            state: self.state.lock(),
            events: Events::default(),
        };
        let ret = f(&mut locked);
        let Locked { state, events, .. } = locked;
        drop(state);
        events.log();
        ret
    }

    /// Allocates a run of `n` pages.
    pub fn new_span(&self, n: usize) -> Result<SpanId, Error> {
        self.with(|locked| locked.new_span(n.max(1)))
    }

    /// Allocates a run of `n` pages and registers it for objects of `class`.
    pub fn new_with_size_class(&self, n: usize, class: usize) -> Result<SpanId, Error> {
        self.with(|locked| {
            let id = locked.new_span(n.max(1))?;
            locked.register_size_class(id, class);
            Ok(id)
        })
    }

    /// Allocates a run of pages covering `bytes` whose address is aligned to
    /// `align`, a power of two larger than a page.
    pub fn new_aligned(&self, bytes: usize, align: usize) -> Result<SpanId, Error> {
        debug_assert!(align.is_power_of_two() && align > PAGE_SIZE);
        let needed = pages(bytes).ok_or(Error::SizeOverflow)?.max(1);
        let total = bytes
            .checked_add(align)
            .and_then(pages)
            .ok_or(Error::SizeOverflow)?;
        self.with(|locked| {
            let heap = locked.heap;
            let mut id = locked.new_span(total)?;

            let address = heap.spans.get(id).address();
            let skip = (address.next_multiple_of(align) - address) >> PAGE_SHIFT;
            if skip > 0 {
                let Some(rest) = locked.split(id, skip) else {
                    locked.delete(id);
                    return Err(Error::OutOfMemory { pages: total, os_error: None });
                };
                locked.delete(id);
                id = rest;
            }
            if heap.spans.get(id).length() > needed
                && let Some(trailer) = locked.split(id, needed)
            {
                locked.delete(trailer);
            }
            Ok(id)
        })
    }

    /// Allocates a run of `n` pages recorded as a sampled allocation.
    pub fn new_sampled(&self, n: usize, trace: &StackTrace) -> Result<SpanId, Error> {
        self.with(|locked| {
            let id = locked.new_span(n.max(1))?;
            let record = locked.state.traces.alloc(locked.heap.meta());
            if let Some(record) = record {
                // SAFETY: The record is freshly allocated and owned.
                unsafe { record.write(*trace) };
            }
            locked.heap.spans.get(id).set_sampled(record);
            let heap = locked.heap;
            locked.state.sampled.push_front(&heap.spans, id);
            Ok(id)
        })
    }

    /// Returns an in-use span to the free lists.
    pub fn delete(&self, id: SpanId) {
        self.with(|locked| locked.delete(id))
    }

    /// Frees the in-use span starting at `address`, as a large allocation.
    ///
    /// Returns the number of pages freed, or the corruption found while
    /// validating the pointer. The caller must report it.
    pub fn delete_at(&self, address: usize) -> Result<usize, Corruption> {
        use CorruptionKind::*;

        let page = address >> PAGE_SHIFT;
        self.with(|locked| {
            let heap = locked.heap;
            let entry = heap.pagemap.get(page).ok_or(Corruption::new(
                UnownedPointer,
                address,
                "no span covers the pointer",
            ))?;
            let span = heap.spans.get(entry.span);
            if !span.contains(page) || span.location() != Location::InUse {
                return Err(Corruption::new(DoubleFree, address, "the pointer is in free memory"));
            }
            if span.size_class() != 0 {
                return Err(Corruption::new(
                    SpanMismatch,
                    address,
                    "the span was carved into objects",
                ));
            }
            if span.address() != address {
                return Err(Corruption::new(
                    InteriorPointer,
                    address,
                    "the pointer is not the start of its span",
                ));
            }
            let len = span.length();
            locked.delete(entry.span);
            Ok(len)
        })
    }

    /// Splits the in-use span `id` into a prefix of `n` pages and returns
    /// the suffix as a new in-use span.
    pub fn split(&self, id: SpanId, n: usize) -> Option<SpanId> {
        self.with(|locked| locked.split(id, n))
    }

    /// Records that every page of `id` holds objects of `class`.
    pub fn register_size_class(&self, id: SpanId, class: usize) {
        self.with(|locked| locked.register_size_class(id, class))
    }

    /// Releases free spans to the system until at least `n` pages are
    /// released or nothing is left to release. Returns the pages released.
    pub fn release_at_least(&self, n: usize) -> usize {
        self.with(|locked| locked.release_at_least(n))
    }

    pub fn stats(&self) -> PageHeapStats {
        self.state.lock().stats
    }

    /// Counts the free spans of each length below [`MAX_PAGES`].
    pub fn small_span_stats(&self) -> SmallSpanStats {
        let state = self.state.lock();
        let mut stats = SmallSpanStats::EMPTY;
        for (len, lists) in state.free.iter().enumerate() {
            stats.normal_length[len] = lists.normal.len();
            stats.returned_length[len] = lists.returned.len();
        }
        stats
    }

    pub fn large_span_stats(&self) -> LargeSpanStats {
        let state = self.state.lock();
        let mut stats = LargeSpanStats::default();
        for (_, span) in state.large.normal.iter(&self.spans) {
            stats.spans += 1;
            stats.normal_pages += span.length();
        }
        for (_, span) in state.large.returned.iter(&self.spans) {
            stats.spans += 1;
            stats.returned_pages += span.length();
        }
        stats
    }

    /// The number of live span records.
    pub fn live_spans(&self) -> usize {
        self.state.lock().cursor.live()
    }

    /// Copies the live sampled allocations into `out`, returning the total
    /// number of them, which may exceed `out.len()`.
    pub fn sampled(&self, out: &mut [Sample]) -> usize {
        let state = self.state.lock();
        let mut count = 0;
        for (_, span) in state.sampled.iter(&self.spans) {
            if let Some(slot) = out.get_mut(count) {
                // SAFETY: Trace records live as long as their span is sampled.
                let trace = span.trace().map_or(StackTrace::EMPTY, |t| unsafe { *t.as_ptr() });
                *slot = Sample {
                    address: span.address(),
                    allocated: span.length() << PAGE_SHIFT,
                    trace,
                };
            }
            count += 1;
        }
        count
    }

    /// Describes the first span at or after `page`. `class_size` resolves
    /// size classes to object sizes for occupancy estimates.
    pub fn next_range(&self, page: PageId, class_size: impl Fn(usize) -> usize) -> Option<Range> {
        let _state = self.state.lock();
        let (found, entry) = self.pagemap.next(page)?;
        let span = self.spans.get(entry.span);
        if !span.contains(found) {
            return Some(Range {
                address: found << PAGE_SHIFT,
                length: PAGE_SIZE,
                kind: RangeKind::Unknown,
                fraction: 0.0,
            });
        }
        let length = span.length() << PAGE_SHIFT;
        let (kind, fraction) = match span.location() {
            Location::InUse if span.size_class() != 0 => {
                let used = class_size(span.size_class()) * span.refcount();
                (RangeKind::InUse, used as f64 / length as f64)
            }
            Location::InUse => (RangeKind::InUse, 1.0),
            Location::OnNormalFreelist => (RangeKind::Free, 0.0),
            Location::OnReturnedFreelist => (RangeKind::Unmapped, 0.0),
        };
        Some(Range {
            address: span.address(),
            length,
            kind,
            fraction,
        })
    }

    /// Checks the byte accounting of the page heap.
    pub fn check(&self) -> Result<(), Corruption> {
        let stats = self.stats();
        let mismatch = |detail| Err(Corruption::new(CorruptionKind::SpanMismatch, 0, detail));
        if stats.free_bytes + stats.unmapped_bytes + stats.in_use_bytes != stats.system_bytes {
            return mismatch("free, unmapped and in-use bytes don't add up");
        }
        if stats.committed_bytes + stats.unmapped_bytes != stats.system_bytes {
            return mismatch("committed and unmapped bytes don't add up");
        }
        Ok(())
    }

    /// Walks every free list, checking list membership, lengths, page map
    /// boundaries and coalescing.
    pub fn check_expensive(&self) -> Result<(), Corruption> {
        self.check()?;
        let state = self.state.lock();
        let lists = state.free.iter().enumerate().skip(1).map(|(len, lists)| (len, len, lists));
        let lists = lists.chain([(MAX_PAGES, usize::MAX, &state.large)]);
        for (min, max, lists) in lists {
            for (list, location) in [
                (&lists.normal, Location::OnNormalFreelist),
                (&lists.returned, Location::OnReturnedFreelist),
            ] {
                let mut count = 0;
                for (id, span) in list.iter(&self.spans) {
                    self.check_free_span(id, span, location, min..=max)?;
                    count += 1;
                }
                if count != list.len() {
                    let detail = "list length disagrees with its links";
                    return Err(Corruption::new(CorruptionKind::SpanMismatch, 0, detail));
                }
            }
        }
        Ok(())
    }

    fn check_free_span(
        &self,
        id: SpanId,
        span: &Span,
        location: Location,
        lengths: core::ops::RangeInclusive<usize>,
    ) -> Result<(), Corruption> {
        let mismatch = |detail| {
            Err(Corruption::new(
                CorruptionKind::SpanMismatch,
                span.address(),
                detail,
            ))
        };
        if span.location() != location {
            return mismatch("location disagrees with the free list");
        }
        if !lengths.contains(&span.length()) {
            return mismatch("length disagrees with the free list");
        }
        let resolves = |page| self.pagemap.get(page).map(|entry| entry.span) == Some(id);
        if !resolves(span.start()) || !resolves(span.end() - 1) {
            return mismatch("boundary pages don't resolve to the span");
        }
        for page in [span.start().wrapping_sub(1), span.end()] {
            if let Some(entry) = self.pagemap.get(page) {
                let other = self.spans.get(entry.span);
                if entry.span != id && other.contains(page) && other.location() == location {
                    return mismatch("adjacent free spans were not coalesced");
                }
            }
        }
        Ok(())
    }
}

impl<M: PageMap> fmt::Debug for PageHeap<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageHeap")
            .field("system", &self.system)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// The page heap with its lock held.
struct Locked<'h, 'a, M: PageMap> {
    heap: &'h PageHeap<'a, M>,
    state: SpinLockGuard<'h, State>,
    events: Events,
}

impl<M: PageMap> Locked<'_, '_, M> {
    fn record_span(&self, id: SpanId) {
        let heap = self.heap;
        let span = heap.spans.get(id);
        let entry = Some(PageEntry::new(id, 0));
        heap.pagemap.set(span.start(), entry);
        if span.length() > 1 {
            heap.pagemap.set(span.end() - 1, entry);
        }
    }

    fn new_record(&mut self, start: PageId, len: usize) -> Option<SpanId> {
        let heap = self.heap;
        heap.spans.alloc(&mut self.state.cursor, heap.meta(), start, len)
    }

    fn retire(&mut self, id: SpanId) {
        let heap = self.heap;
        heap.spans.free(&mut self.state.cursor, id)
    }

    fn new_span(&mut self, n: usize) -> Result<SpanId, Error> {
        if let Some(id) = self.search_free_and_large_lists(n) {
            return Ok(id);
        }

        let stats = self.state.stats;
        let interval = self.heap.force_coalesce_interval.load(Relaxed).max(PAGE_SIZE);
        let grown = stats.system_bytes.saturating_add(n << PAGE_SHIFT);
        if stats.free_bytes != 0
            && stats.unmapped_bytes != 0
            && stats.free_bytes + stats.unmapped_bytes >= stats.system_bytes / 4
            && stats.system_bytes / interval != grown / interval
        {
            // Free and returned spans never coalesce, so release everything
            // and look again before growing.
            let released = self.release_at_least(usize::MAX);
            self.events.forced += released;
            if let Some(id) = self.search_free_and_large_lists(n) {
                return Ok(id);
            }
        }

        self.grow_heap(n)?;
        self.search_free_and_large_lists(n).ok_or(Error::OutOfMemory {
            pages: n,
            os_error: None,
        })
    }

    fn search_free_and_large_lists(&mut self, n: usize) -> Option<SpanId> {
        for len in n..MAX_PAGES {
            if let Some(id) = self.state.free[len].normal.first() {
                return Some(self.carve(id, n));
            }
            if !self.state.free[len].returned.is_empty() && self.ensure_limit(n, true) {
                // The list may have been drained by coalescing.
                if let Some(id) = self.state.free[len].returned.first() {
                    return Some(self.carve(id, n));
                }
            }
        }
        self.alloc_large(n)
    }

    /// Address-ordered best fit over the large lists.
    fn alloc_large(&mut self, n: usize) -> Option<SpanId> {
        let heap = self.heap;
        let best_fit = |list: &SpanList| {
            list.iter(&heap.spans)
                .filter(|(_, span)| span.length() >= n)
                .min_by_key(|(_, span)| (span.length(), span.start()))
        };
        let normal = best_fit(&self.state.large.normal);
        let returned = best_fit(&self.state.large.returned);

        let best = match (normal, returned) {
            (None, None) => return None,
            (Some((id, _)), None) => return Some(self.carve(id, n)),
            (Some((id, span)), Some((_, other))) if span.length() <= other.length() => {
                return Some(self.carve(id, n));
            }
            (_, Some((id, _))) => id,
        };

        if self.ensure_limit(n, false) {
            return Some(self.carve(best, n));
        }
        if self.ensure_limit(n, true) {
            // Releasing may have coalesced the candidates, search again.
            return self.alloc_large(n);
        }
        None
    }

    /// Takes `n` pages from the front of the free span `id`, returning the
    /// rest to the list it was on.
    fn carve(&mut self, id: SpanId, n: usize) -> SpanId {
        let heap = self.heap;
        let span = heap.spans.get(id);
        debug_assert_ne!(span.location(), Location::InUse);
        let old_location = span.location();
        self.remove_from_free_list(id);
        span.set_location(Location::InUse);

        let extra = span.length() - n;
        if extra > 0
            && let Some(leftover) = self.new_record(span.start() + n, extra)
        {
            heap.spans.get(leftover).set_location(old_location);
            self.record_span(leftover);
            // The neighbors of the leftover were not mergeable with the
            // original span, so skip coalescing.
            self.prepend_to_free_list(leftover);
            span.set_length(n);
            heap.pagemap.set(span.end() - 1, Some(PageEntry::new(id, 0)));
        }

        let bytes = span.length() << PAGE_SHIFT;
        self.state.stats.in_use_bytes += bytes;
        if old_location == Location::OnReturnedFreelist {
            self.commit(span);
        }
        id
    }

    fn commit(&mut self, span: &Span) {
        let bytes = span.length() << PAGE_SHIFT;
        if let Some(ptr) = NonNull::new(span.as_ptr()) {
            self.heap.system.commit(ptr, bytes);
        }
        let stats = &mut self.state.stats;
        stats.commit_count += 1;
        stats.committed_bytes += bytes;
        stats.total_commit_bytes += bytes;
    }

    fn decommit(&mut self, span: &Span) -> bool {
        let bytes = span.length() << PAGE_SHIFT;
        let stats = &mut self.state.stats;
        stats.decommit_count += 1;
        let released = NonNull::new(span.as_ptr())
            .is_some_and(|ptr| self.heap.system.release(ptr, bytes));
        if released {
            stats.committed_bytes -= bytes;
            stats.total_decommit_bytes += bytes;
        }
        released
    }

    fn split(&mut self, id: SpanId, n: usize) -> Option<SpanId> {
        let heap = self.heap;
        let span = heap.spans.get(id);
        debug_assert!(0 < n && n < span.length());
        debug_assert_eq!(span.location(), Location::InUse);
        debug_assert_eq!(span.size_class(), 0);

        let leftover = self.new_record(span.start() + n, span.length() - n)?;
        self.record_span(leftover);
        span.set_length(n);
        heap.pagemap.set(span.end() - 1, Some(PageEntry::new(id, 0)));
        Some(leftover)
    }

    fn register_size_class(&mut self, id: SpanId, class: usize) {
        let heap = self.heap;
        let span = heap.spans.get(id);
        span.set_size_class(class);
        let entry = Some(PageEntry::new(id, class as u8));
        for page in span.start()..span.end() {
            heap.pagemap.set(page, entry);
        }
    }

    fn delete(&mut self, id: SpanId) {
        let heap = self.heap;
        let span = heap.spans.get(id);
        debug_assert_eq!(span.location(), Location::InUse);
        debug_assert!(span.length() > 0);
        let n = span.length();

        if span.size_class() != 0 {
            for page in span.start() + 1..span.end() - 1 {
                heap.pagemap.set(page, None);
            }
            self.record_span(id);
            span.set_size_class(0);
            span.set_objects(None);
            span.set_refcount(0);
        }
        if span.is_sampled() {
            self.state.sampled.remove(&heap.spans, id);
            if let Some(trace) = span.take_trace() {
                // SAFETY: The record came from this pool and is no longer
                // referenced by the span.
                unsafe { self.state.traces.free(trace) };
            }
        }

        self.state.stats.in_use_bytes -= n << PAGE_SHIFT;
        span.set_location(Location::OnNormalFreelist);
        self.merge_into_free_list(id);
        self.incremental_scavenge(n);
    }

    fn merge_into_free_list(&mut self, id: SpanId) {
        let heap = self.heap;
        let span = heap.spans.get(id);
        debug_assert_ne!(span.location(), Location::InUse);
        let (start, len) = (span.start(), span.length());

        if heap.aggressive_decommit()
            && span.location() == Location::OnNormalFreelist
            && self.decommit(span)
        {
            span.set_location(Location::OnReturnedFreelist);
        }

        let entry = Some(PageEntry::new(id, 0));
        if let Some(prev) = self.mergeable(span, start.wrapping_sub(1)) {
            let prev_len = heap.spans.get(prev).length();
            self.retire(prev);
            span.set_start(start - prev_len);
            span.set_length(span.length() + prev_len);
            heap.pagemap.set(span.start(), entry);
            heap.pagemap.set(start - 1, entry);
            heap.pagemap.set(start, entry);
        }
        if let Some(next) = self.mergeable(span, start + len) {
            let next_len = heap.spans.get(next).length();
            self.retire(next);
            span.set_length(span.length() + next_len);
            heap.pagemap.set(span.end() - 1, entry);
            heap.pagemap.set(start + len - 1, entry);
            heap.pagemap.set(start + len, entry);
        }

        self.prepend_to_free_list(id);
    }

    /// Unlinks the free neighbor of `span` covering `page` if the two can be
    /// coalesced.
    fn mergeable(&mut self, span: &Span, page: PageId) -> Option<SpanId> {
        let heap = self.heap;
        let other_id = heap.pagemap.get(page)?.span;
        let other = heap.spans.get(other_id);
        if !other.contains(page) || other.location() == Location::InUse {
            return None;
        }
        if heap.aggressive_decommit()
            && other.location() == Location::OnNormalFreelist
            && span.location() == Location::OnReturnedFreelist
        {
            if !self.decommit(other) {
                return None;
            }
        } else if other.location() != span.location() {
            return None;
        }
        self.remove_from_free_list(other_id);
        Some(other_id)
    }

    fn prepend_to_free_list(&mut self, id: SpanId) {
        let heap = self.heap;
        let span = heap.spans.get(id);
        let bytes = span.length() << PAGE_SHIFT;
        match span.location() {
            Location::OnNormalFreelist => self.state.stats.free_bytes += bytes,
            _ => self.state.stats.unmapped_bytes += bytes,
        }
        self.state
            .lists(span.length())
            .get(span.location())
            .push_front(&heap.spans, id);
    }

    fn remove_from_free_list(&mut self, id: SpanId) {
        let heap = self.heap;
        let span = heap.spans.get(id);
        let bytes = span.length() << PAGE_SHIFT;
        match span.location() {
            Location::OnNormalFreelist => self.state.stats.free_bytes -= bytes,
            _ => self.state.stats.unmapped_bytes -= bytes,
        }
        self.state
            .lists(span.length())
            .get(span.location())
            .remove(&heap.spans, id);
    }

    fn release_at_least(&mut self, n: usize) -> usize {
        let heap = self.heap;
        let mut released = 0;
        while released < n && self.state.stats.free_bytes > 0 {
            let before = released;
            for _ in 0..=MAX_PAGES {
                if released >= n {
                    break;
                }
                let index = self.state.release_index;
                self.state.release_index = (index + 1) % (MAX_PAGES + 1);

                let lists = match index {
                    MAX_PAGES => &self.state.large,
                    index => &self.state.free[index],
                };
                let Some(id) = lists.normal.last() else {
                    continue;
                };
                let len = heap.spans.get(id).length();
                if !self.release_span(id) {
                    // The system doesn't support releasing this memory.
                    return released;
                }
                released += len;
            }
            if released == before {
                break;
            }
        }
        released
    }

    fn release_span(&mut self, id: SpanId) -> bool {
        let span = self.heap.spans.get(id);
        debug_assert_eq!(span.location(), Location::OnNormalFreelist);
        if !self.decommit(span) {
            return false;
        }
        self.remove_from_free_list(id);
        span.set_location(Location::OnReturnedFreelist);
        self.merge_into_free_list(id);
        true
    }

    fn incremental_scavenge(&mut self, n: usize) {
        let state = &mut *self.state;
        state.scavenge_counter -= n as i64;
        if state.scavenge_counter >= 0 {
            return;
        }

        let rate = self.heap.release_rate();
        if rate <= 1e-6 {
            state.scavenge_counter = DEFAULT_RELEASE_DELAY;
            return;
        }

        state.stats.scavenge_count += 1;
        let released = self.release_at_least(1);
        self.events.scavenged += released;
        self.state.scavenge_counter = if released == 0 {
            DEFAULT_RELEASE_DELAY
        } else {
            // A rate of 1 waits for 1000 freed pages per released page.
            (1000.0 / rate * released as f64).min(MAX_RELEASE_DELAY) as i64
        };
    }

    /// Checks that committing `n` more pages stays within the heap limit,
    /// optionally releasing free pages to make room.
    fn ensure_limit(&mut self, n: usize, with_release: bool) -> bool {
        let limit = self.heap.heap_limit_pages();
        if limit == 0 {
            return true;
        }
        // Metadata counts against the limit as well.
        let taken = self.heap.system.taken() >> PAGE_SHIFT;
        let mut taken = taken.saturating_sub(self.state.stats.unmapped_bytes >> PAGE_SHIFT);
        if taken + n > limit && with_release {
            let released = self.release_at_least(taken + n - limit);
            taken = taken.saturating_sub(released);
        }
        taken + n <= limit
    }

    fn grow_heap(&mut self, n: usize) -> Result<(), Error> {
        let heap = self.heap;
        if n >= PAGE_LIMIT {
            return Err(Error::SizeOverflow);
        }

        let mut ask = n.max(MIN_SYSTEM_ALLOC);
        let mut limited = false;
        let mut chunk = None;
        if self.ensure_limit(ask, true) {
            chunk = heap.system.alloc(ask << PAGE_SHIFT, PAGE_SIZE);
        } else {
            limited = true;
        }
        if chunk.is_none() && n < ask {
            ask = n;
            if self.ensure_limit(ask, true) {
                limited = false;
                chunk = heap.system.alloc(ask << PAGE_SHIFT, PAGE_SIZE);
            } else {
                limited = true;
            }
        }
        let Some(chunk) = chunk else {
            return Err(match limited {
                true => Error::HeapLimit { pages: n },
                false => Error::OutOfMemory {
                    pages: n,
                    os_error: heap.system.last_error(),
                },
            });
        };

        let ask = chunk.len >> PAGE_SHIFT;
        let bytes = ask << PAGE_SHIFT;
        let start = chunk.ptr.as_ptr().expose_provenance() >> PAGE_SHIFT;
        // One page of slack on both sides lets coalescing skip bounds checks.
        if !heap.pagemap.ensure(start.saturating_sub(1), ask + 2, heap.meta()) {
            return Err(Error::OutOfMemory { pages: n, os_error: None });
        }
        let Some(id) = self.new_record(start, ask) else {
            return Err(Error::OutOfMemory { pages: n, os_error: None });
        };

        let stats = &mut self.state.stats;
        stats.reserve_count += 1;
        stats.commit_count += 1;
        stats.system_bytes += bytes;
        stats.committed_bytes += bytes;
        stats.in_use_bytes += bytes;
        stats.total_commit_bytes += bytes;
        stats.total_reserve_bytes += bytes;
        self.events.grown += ask;

        self.record_span(id);
        self.delete(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::boxed::Box;

    use super::*;
    use crate::base::Static;

    fn heap(backends: &'static [&'static dyn SysAlloc]) -> Box<PageHeap<'static>> {
        let heap = Box::new(PageHeap::new(backends));
        heap.set_release_rate(0.0);
        heap
    }

    fn location(heap: &PageHeap<'_>, id: SpanId) -> Location {
        heap.span(id).location()
    }

    #[test]
    fn carve_and_coalesce() {
        static BASE: Static<{ 16 << 20 }> = Static::new();
        static BACKENDS: [&dyn SysAlloc; 1] = [&BASE];
        let heap = heap(&BACKENDS);

        let a = heap.new_span(3).unwrap();
        let b = heap.new_span(5).unwrap();
        let start = heap.span(a).start();
        assert_eq!(heap.span(a).end(), heap.span(b).start());
        assert_eq!(heap.stats().system_bytes, MIN_SYSTEM_ALLOC << PAGE_SHIFT);
        assert_eq!(heap.stats().in_use_bytes, 8 << PAGE_SHIFT);
        heap.check_expensive().unwrap();

        heap.delete(a);
        assert_eq!(heap.small_span_stats().normal_length[3], 1);
        heap.delete(b);
        // Everything coalesced back into the original chunk.
        let large = heap.large_span_stats();
        assert_eq!((large.spans, large.normal_pages), (1, MIN_SYSTEM_ALLOC));
        assert_eq!(heap.small_span_stats().normal_length[3], 0);
        assert_eq!(heap.live_spans(), 1);
        heap.check_expensive().unwrap();

        let c = heap.new_span(MIN_SYSTEM_ALLOC).unwrap();
        assert_eq!(heap.span(c).start(), start);
        assert_eq!(heap.stats().system_bytes, MIN_SYSTEM_ALLOC << PAGE_SHIFT);
    }

    #[test]
    fn release_and_recommit() {
        static BASE: Static<{ 16 << 20 }> = Static::new();
        static BACKENDS: [&dyn SysAlloc; 1] = [&BASE];
        let heap = heap(&BACKENDS);

        let a = heap.new_span(MAX_PAGES).unwrap();
        heap.delete(a);
        assert_eq!(heap.release_at_least(usize::MAX), MIN_SYSTEM_ALLOC);
        let stats = heap.stats();
        assert_eq!(stats.unmapped_bytes, MIN_SYSTEM_ALLOC << PAGE_SHIFT);
        assert_eq!(stats.committed_bytes, 0);
        // Nothing is left to release.
        assert_eq!(heap.release_at_least(10), 0);
        assert_eq!(heap.stats(), stats);

        let b = heap.new_span(2).unwrap();
        assert_eq!(location(&heap, b), Location::InUse);
        let stats = heap.stats();
        assert_eq!(stats.committed_bytes, 2 << PAGE_SHIFT);
        assert_eq!(stats.commit_count, 2);
        heap.check_expensive().unwrap();
    }

    #[test]
    fn aggressive_decommit() {
        static BASE: Static<{ 16 << 20 }> = Static::new();
        static BACKENDS: [&dyn SysAlloc; 1] = [&BASE];
        let heap = heap(&BACKENDS);

        let a = heap.new_span(3).unwrap();
        let b = heap.new_span(5).unwrap();
        let start = heap.span(a).start();
        heap.delete(a);
        assert_eq!(location(&heap, a), Location::OnNormalFreelist);

        // Both normal neighbors are released to coalesce with the freed span.
        heap.set_aggressive_decommit(true);
        heap.delete(b);
        let stats = heap.stats();
        assert_eq!(stats.free_bytes, 0);
        assert_eq!(stats.unmapped_bytes, MIN_SYSTEM_ALLOC << PAGE_SHIFT);
        assert_eq!(stats.committed_bytes, 0);
        let large = heap.large_span_stats();
        assert_eq!((large.spans, large.returned_pages), (1, MIN_SYSTEM_ALLOC));
        assert_eq!(heap.live_spans(), 1);
        let id = heap.entry(start).unwrap().span;
        assert_eq!(location(&heap, id), Location::OnReturnedFreelist);
        heap.check_expensive().unwrap();

        let c = heap.new_span(4).unwrap();
        assert_eq!(heap.span(c).start(), start);
        assert_eq!(location(&heap, c), Location::InUse);
        let stats = heap.stats();
        assert_eq!(stats.committed_bytes, 4 << PAGE_SHIFT);
        assert_eq!(stats.unmapped_bytes, (MIN_SYSTEM_ALLOC - 4) << PAGE_SHIFT);

        // Freed spans go straight back to the system.
        heap.delete(c);
        let stats = heap.stats();
        assert_eq!((stats.free_bytes, stats.committed_bytes), (0, 0));
        assert_eq!(heap.live_spans(), 1);
        heap.check_expensive().unwrap();
    }

    #[test]
    fn normal_wins_ties() {
        static BASE: Static<{ 16 << 20 }> = Static::new();
        static BACKENDS: [&dyn SysAlloc; 1] = [&BASE];
        let heap = heap(&BACKENDS);

        // Two large spans of equal length, one of them released.
        let a = heap.new_span(MAX_PAGES).unwrap();
        let b = heap.new_span(MAX_PAGES).unwrap();
        heap.delete(a);
        heap.release_at_least(MAX_PAGES);
        assert_eq!(heap.large_span_stats().returned_pages, MAX_PAGES);
        heap.delete(b);
        let large = heap.large_span_stats();
        assert_eq!(large.normal_pages, MAX_PAGES);

        let c = heap.new_span(MAX_PAGES).unwrap();
        assert_eq!(heap.span(c).start(), heap.span(b).start());
        assert_eq!(heap.stats().unmapped_bytes, MAX_PAGES << PAGE_SHIFT);
        heap.delete(c);
        heap.check_expensive().unwrap();
    }

    #[test]
    fn force_coalesce() {
        static BASE: Static<{ 16 << 20 }> = Static::new();
        static BACKENDS: [&dyn SysAlloc; 1] = [&BASE];
        let heap = heap(&BACKENDS);
        heap.force_coalesce_interval.store(PAGE_SIZE, Relaxed);

        let half = MIN_SYSTEM_ALLOC / 2;
        let a = heap.new_span(half).unwrap();
        let b = heap.new_span(half).unwrap();
        heap.delete(a);
        assert_eq!(heap.release_at_least(half), half);
        heap.delete(b);
        let stats = heap.stats();
        assert_eq!(stats.free_bytes, stats.unmapped_bytes);

        // Only coalescing the normal and returned halves can satisfy this.
        let c = heap.new_span(MIN_SYSTEM_ALLOC).unwrap();
        assert_eq!(heap.stats().system_bytes, stats.system_bytes);
        assert_eq!(heap.span(c).length(), MIN_SYSTEM_ALLOC);
        heap.check().unwrap();
    }

    #[test]
    fn heap_limit() {
        static BASE: Static<{ 16 << 20 }> = Static::new();
        static BACKENDS: [&dyn SysAlloc; 1] = [&BASE];
        let heap = heap(&BACKENDS);

        // Grow once so that the metadata is already accounted for.
        let a = heap.new_span(1).unwrap();
        let taken = heap.system().taken() >> PAGE_SHIFT;
        heap.set_heap_limit_pages(taken + 1);
        let err = heap.new_span(MIN_SYSTEM_ALLOC * 2).unwrap_err();
        assert_eq!(err, Error::HeapLimit { pages: MIN_SYSTEM_ALLOC * 2 });
        heap.delete(a);
        heap.check_expensive().unwrap();
    }

    #[test]
    fn aligned_split() {
        static BASE: Static<{ 16 << 20 }> = Static::new();
        static BACKENDS: [&dyn SysAlloc; 1] = [&BASE];
        let heap = heap(&BACKENDS);

        let _pad = heap.new_span(1).unwrap();
        let align = PAGE_SIZE * 8;
        let id = heap.new_aligned(PAGE_SIZE * 3, align).unwrap();
        let span = heap.span(id);
        assert_eq!(span.address() % align, 0);
        assert_eq!(span.length(), 3);
        assert_eq!(heap.stats().in_use_bytes, 4 << PAGE_SHIFT);
        heap.check_expensive().unwrap();
    }

    #[test]
    fn size_class_registration() {
        static BASE: Static<{ 16 << 20 }> = Static::new();
        static BACKENDS: [&dyn SysAlloc; 1] = [&BASE];
        let heap = heap(&BACKENDS);

        let id = heap.new_with_size_class(4, 7).unwrap();
        let start = heap.span(id).start();
        for page in start..start + 4 {
            assert_eq!(heap.entry(page), Some(PageEntry::new(id, 7)));
        }
        heap.delete(id);
        assert_eq!(heap.entry(start + 1), None);
        assert_eq!(heap.entry(start).map(|e| e.class), Some(0));
    }

    #[test]
    fn invalid_frees() {
        static BASE: Static<{ 16 << 20 }> = Static::new();
        static BACKENDS: [&dyn SysAlloc; 1] = [&BASE];
        let heap = heap(&BACKENDS);

        let id = heap.new_span(2).unwrap();
        let _guard = heap.new_span(1).unwrap();
        let address = heap.span(id).address();
        let kind = |result: Result<usize, Corruption>| result.unwrap_err().kind;

        assert_eq!(kind(heap.delete_at(PAGE_SIZE)), CorruptionKind::UnownedPointer);
        assert_eq!(kind(heap.delete_at(address + 8)), CorruptionKind::InteriorPointer);
        assert_eq!(heap.delete_at(address), Ok(2));
        assert_eq!(kind(heap.delete_at(address)), CorruptionKind::DoubleFree);
        heap.check_expensive().unwrap();
    }

    #[test]
    fn ranges() {
        static BASE: Static<{ 16 << 20 }> = Static::new();
        static BACKENDS: [&dyn SysAlloc; 1] = [&BASE];
        let heap = heap(&BACKENDS);

        let a = heap.new_span(2).unwrap();
        let start = heap.span(a).start();
        let range = heap.next_range(0, |_| 0).unwrap();
        assert_eq!(range.address, start << PAGE_SHIFT);
        assert_eq!(range.kind, RangeKind::InUse);
        assert_eq!(range.fraction, 1.0);

        let rest = heap.next_range(start + 2, |_| 0).unwrap();
        assert_eq!(rest.kind, RangeKind::Free);
        assert_eq!(rest.length, (MIN_SYSTEM_ALLOC - 2) << PAGE_SHIFT);
        assert!(heap.next_range(start + MIN_SYSTEM_ALLOC, |_| 0).is_none());
    }

    #[test]
    fn sampled_spans() {
        static BASE: Static<{ 16 << 20 }> = Static::new();
        static BACKENDS: [&dyn SysAlloc; 1] = [&BASE];
        let heap = heap(&BACKENDS);

        let trace = StackTrace { size: 100, depth: 1, ..StackTrace::EMPTY };
        let id = heap.new_sampled(1, &trace).unwrap();
        let mut out = [Sample { address: 0, allocated: 0, trace: StackTrace::EMPTY }; 2];
        assert_eq!(heap.sampled(&mut out), 1);
        assert_eq!(out[0].address, heap.span(id).address());
        assert_eq!(out[0].trace.size, 100);
        heap.delete(id);
        assert_eq!(heap.sampled(&mut out), 0);
    }
}
