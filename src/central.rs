//! Central free lists: the per-class pools shared by all thread caches.
//!
//! A central free list keeps the free objects of partially used spans, plus
//! a transfer cache of whole batches that moves between thread caches
//! without touching any span.

use core::{
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicU64, Ordering::*},
};

use crate::{
    config::{MIB, PAGE_SHIFT},
    error::Error,
    object::{self, Chain, ObjectList},
    page_heap::PageHeap,
    size_class::ClassInfo,
    span::SpanList,
    sync::{SpinLock, SpinLockGuard, spin_lock},
};

/// The maximum number of batches in a transfer cache.
const MAX_SLOTS: usize = 64;
/// The number of batches a transfer cache starts with room for.
const INITIAL_SLOTS: usize = 16;

struct State {
    /// Spans with at least one free object.
    nonempty: SpanList,
    slots: [Option<Chain>; MAX_SLOTS],
    used_slots: usize,
    cache_size: usize,
    /// The free objects held by spans.
    free_objects: usize,
    spans: usize,
}

/// The central free list of one size class.
pub struct CentralFreeList {
    state: SpinLock<State>,
    acquisitions: AtomicU64,
}

impl CentralFreeList {
    pub const fn new() -> Self {
        CentralFreeList {
            state: spin_lock(State {
                nonempty: SpanList::new(),
                slots: [const { None }; MAX_SLOTS],
                used_slots: 0,
                cache_size: INITIAL_SLOTS,
                free_objects: 0,
                spans: 0,
            }),
            acquisitions: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> SpinLockGuard<'_, State> {
        self.acquisitions.fetch_add(1, Relaxed);
        self.state.lock()
    }

    /// The bound of batches the transfer cache of `info` may grow to.
    fn max_cache(info: &ClassInfo) -> usize {
        let batch_bytes = (info.size * info.batch).max(1);
        (MIB / batch_bytes).clamp(1, MAX_SLOTS)
    }

    /// Inserts a chain of objects of this class.
    ///
    /// Full batches are kept in the transfer cache when it has room. Other
    /// objects go back to their spans, and spans left without any object in
    /// use are returned to the page heap.
    ///
    /// # Safety
    ///
    /// The chain must consist of free objects of this class, allocated from
    /// `page_heap`.
    pub(crate) unsafe fn insert_range(
        &self,
        page_heap: &PageHeap<'_>,
        info: &ClassInfo,
        chain: Chain,
    ) {
        let mut state = self.lock();
        if chain.len == info.batch {
            let max = Self::max_cache(info);
            let has_room = state.used_slots < state.cache_size.min(max) || {
                let grown = state.cache_size < max;
                if grown {
                    state.cache_size += 1;
                }
                grown
            };
            if has_room {
                let index = state.used_slots;
                state.slots[index] = Some(chain);
                state.used_slots += 1;
                return;
            }
        }
        // SAFETY: The chain is owned and its objects belong to this class.
        unsafe { self.release_to_spans(&mut state, page_heap, info, chain) };
    }

    unsafe fn release_to_spans(
        &self,
        state: &mut SpinLockGuard<'_, State>,
        page_heap: &PageHeap<'_>,
        info: &ClassInfo,
        chain: Chain,
    ) {
        let spans = page_heap.spans();
        // SAFETY: The chain is well-formed and owned.
        for obj in unsafe { chain.iter() } {
            let page = obj.as_ptr().addr() >> PAGE_SHIFT;
            let Some(entry) = page_heap.entry(page) else {
                debug_assert!(false, "object {obj:p} has no span");
                continue;
            };
            let id = entry.span;
            let span = spans.get(id);

            if span.objects().is_none() {
                state.nonempty.push_front(spans, id);
            }
            // SAFETY: `obj` is free and its link is no longer needed by the
            // iterator, which read it before yielding.
            unsafe { object::set_next(obj, span.objects()) };
            span.set_objects(Some(obj));
            state.free_objects += 1;

            let refcount = span.refcount() - 1;
            span.set_refcount(refcount);
            if refcount == 0 {
                state.nonempty.remove(spans, id);
                state.free_objects -= info.objects_per_span;
                state.spans -= 1;
                SpinLockGuard::unlocked(state, || page_heap.delete(id));
            }
        }
    }

    /// Removes up to `n` objects, refilling from the page heap if no object
    /// is left. The returned chain is never empty.
    pub(crate) fn remove_range(
        &self,
        page_heap: &PageHeap<'_>,
        info: &ClassInfo,
        n: usize,
    ) -> Result<Chain, Error> {
        let mut state = self.lock();
        if n == info.batch && state.used_slots > 0 {
            state.used_slots -= 1;
            let index = state.used_slots;
            if let Some(chain) = state.slots[index].take() {
                return Ok(chain);
            }
        }

        let mut list = ObjectList::new();
        if self.fetch_from_one_span(&mut state, page_heap, n, &mut list) == 0 {
            Self::populate(&mut state, page_heap, info)?;
            self.fetch_from_one_span(&mut state, page_heap, n, &mut list);
        }
        while list.len() < n {
            if self.fetch_from_one_span(&mut state, page_heap, n - list.len(), &mut list) == 0 {
                break;
            }
        }
        drop(state);

        let len = list.len();
        list.pop_chain(len).ok_or(Error::OutOfMemory { pages: info.pages, os_error: None })
    }

    fn fetch_from_one_span(
        &self,
        state: &mut State,
        page_heap: &PageHeap<'_>,
        n: usize,
        out: &mut ObjectList,
    ) -> usize {
        let spans = page_heap.spans();
        let Some(id) = state.nonempty.first() else {
            return 0;
        };
        let span = spans.get(id);

        let mut taken = 0;
        while taken < n
            && let Some(obj) = span.objects()
        {
            // SAFETY: Objects on a span's list are free and linked.
            span.set_objects(unsafe { object::next(obj) });
            // SAFETY: The object is now owned by `out`.
            unsafe { out.push(obj) };
            taken += 1;
        }
        if span.objects().is_none() {
            state.nonempty.remove(spans, id);
        }
        span.set_refcount(span.refcount() + taken);
        state.free_objects -= taken;
        taken
    }

    /// Allocates a span from the page heap and carves it into objects.
    ///
    /// The central lock is released while the page heap is busy.
    fn populate(
        state: &mut SpinLockGuard<'_, State>,
        page_heap: &PageHeap<'_>,
        info: &ClassInfo,
    ) -> Result<(), Error> {
        let id = SpinLockGuard::unlocked(state, || {
            let id = page_heap.new_with_size_class(info.pages, info.class)?;
            let span = page_heap.span(id);
            let base = span.as_ptr();

            let mut head = None;
            for index in (0..info.objects_per_span).rev() {
                // SAFETY: The span is exclusively ours and holds
                // `objects_per_span` objects.
                let obj = unsafe { NonNull::new_unchecked(base.add(index * info.size)) };
                // SAFETY: Ditto.
                unsafe { object::set_next(obj, head) };
                head = Some(obj);
            }
            span.set_objects(head);
            span.set_refcount(0);
            Ok::<_, Error>(id)
        })?;

        state.nonempty.push_front(page_heap.spans(), id);
        state.free_objects += info.objects_per_span;
        state.spans += 1;
        Ok(())
    }

    /// The number of times the lock of this list was taken.
    pub fn lock_acquisitions(&self) -> u64 {
        self.acquisitions.load(Relaxed)
    }

    /// The number of free objects held by spans.
    pub fn free_objects(&self) -> usize {
        self.state.lock().free_objects
    }

    /// The number of free objects held by the transfer cache.
    pub fn transfer_objects(&self, info: &ClassInfo) -> usize {
        self.state.lock().used_slots * info.batch
    }

    /// The number of spans carved for this class.
    pub fn spans(&self) -> usize {
        self.state.lock().spans
    }
}

impl Default for CentralFreeList {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CentralFreeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CentralFreeList")
            .field("spans", &state.spans)
            .field("free_objects", &state.free_objects)
            .field("used_slots", &state.used_slots)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{boxed::Box, vec::Vec};

    use super::*;
    use crate::{
        base::{Static, SysAlloc},
        size_class::SizeMap,
    };

    static BASE: Static<{ 32 << 20 }> = Static::new();
    static BACKENDS: [&dyn SysAlloc; 1] = [&BASE];

    fn collect(chain: Chain) -> Vec<NonNull<u8>> {
        unsafe { chain.iter() }.collect()
    }

    #[test]
    fn populate_and_return() {
        let heap = Box::new(PageHeap::new(&BACKENDS));
        heap.set_release_rate(0.0);
        let map = SizeMap::new(32);
        let info = map.info(map.class_of(100));
        let central = CentralFreeList::new();

        let chain = central.remove_range(&heap, &info, 5).unwrap();
        assert_eq!(chain.len, 5);
        assert_eq!(central.spans(), 1);
        assert_eq!(central.free_objects(), info.objects_per_span - 5);
        let objs = collect(chain);
        for pair in objs.windows(2) {
            assert_eq!(pair[0].as_ptr().addr().abs_diff(pair[1].as_ptr().addr()), info.size);
        }
        let in_use = heap.stats().in_use_bytes;
        assert_eq!(in_use, info.pages << PAGE_SHIFT);

        // Returning every object gives the span back to the page heap.
        unsafe { central.insert_range(&heap, &info, chain) };
        assert_eq!(central.spans(), 0);
        assert_eq!(central.free_objects(), 0);
        assert_eq!(heap.stats().in_use_bytes, 0);
        heap.check_expensive().unwrap();
    }

    #[test]
    fn transfer_cache() {
        let heap = Box::new(PageHeap::new(&BACKENDS));
        heap.set_release_rate(0.0);
        let map = SizeMap::new(32);
        let info = map.info(map.class_of(16));
        let central = CentralFreeList::new();

        let batch = central.remove_range(&heap, &info, info.batch).unwrap();
        assert_eq!(batch.len, info.batch);
        let free = central.free_objects();

        unsafe { central.insert_range(&heap, &info, batch) };
        assert_eq!(central.transfer_objects(&info), info.batch);
        assert_eq!(central.free_objects(), free);

        let again = central.remove_range(&heap, &info, info.batch).unwrap();
        assert_eq!(again, batch);
        assert_eq!(central.transfer_objects(&info), 0);
        assert!(central.lock_acquisitions() >= 3);
    }

    #[test]
    fn transfer_cache_bound() {
        let heap = Box::new(PageHeap::new(&BACKENDS));
        heap.set_release_rate(0.0);
        let map = SizeMap::new(32);
        let info = map.info(map.class_of(128 << 10));
        let max = CentralFreeList::max_cache(&info);
        assert!(max < INITIAL_SLOTS);
        let central = CentralFreeList::new();

        let batches = (0..=max)
            .map(|_| {
                let mut list = ObjectList::new();
                while list.len() < info.batch {
                    let chain = central.remove_range(&heap, &info, 1).unwrap();
                    unsafe { list.push_chain(chain) };
                }
                list.pop_chain(info.batch).unwrap()
            })
            .collect::<Vec<_>>();
        for batch in batches {
            unsafe { central.insert_range(&heap, &info, batch) };
        }
        assert_eq!(central.transfer_objects(&info), max * info.batch);
    }

    #[test]
    fn spans_across_refills() {
        let heap = Box::new(PageHeap::new(&BACKENDS));
        heap.set_release_rate(0.0);
        let map = SizeMap::new(32);
        let info = map.info(map.class_of(16));
        assert_ne!(info.objects_per_span, info.batch);
        let central = CentralFreeList::new();

        let mut chains = Vec::new();
        let mut total = 0;
        while total < info.objects_per_span * 2 + 1 {
            let chain = central.remove_range(&heap, &info, info.objects_per_span).unwrap();
            total += chain.len;
            chains.push(chain);
        }
        assert_eq!(central.spans(), 3);
        for chain in chains {
            unsafe { central.insert_range(&heap, &info, chain) };
        }
        assert_eq!(central.spans(), 0);
        assert_eq!(heap.stats().in_use_bytes, 0);
    }
}
