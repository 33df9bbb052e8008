//! Thread caches: per-thread free lists of every size class.
//!
//! A thread cache is owned by one execution context and takes no lock on
//! hits. Misses fetch a batch from the central free list; lists growing past
//! their dynamic bound, or a cache growing past its byte budget, give
//! objects back.

use core::ptr::NonNull;

use array_macro::array;

use crate::{
    central::CentralFreeList,
    config::MAX_CLASSES,
    error::Error,
    object::ObjectList,
    page_heap::PageHeap,
    size_class::{ClassInfo, SizeMap},
};

/// The upper bound of the dynamic length of a free list.
const MAX_DYNAMIC_FREE_LIST_LENGTH: usize = 8192;
/// The number of times a list may overflow before its bound shrinks.
const MAX_OVERAGES: usize = 3;

/// The shared tiers behind a thread cache.
#[derive(Clone, Copy)]
pub struct Tiers<'c, 'a> {
    pub page_heap: &'c PageHeap<'a>,
    pub central: &'c [CentralFreeList; MAX_CLASSES],
    pub size_map: &'c SizeMap,
}

#[derive(Debug)]
struct FreeList {
    objects: ObjectList,
    lowater: usize,
    max_length: usize,
    length_overages: usize,
}

impl FreeList {
    const fn new() -> Self {
        FreeList {
            objects: ObjectList::new(),
            lowater: 0,
            max_length: 1,
            length_overages: 0,
        }
    }
}

/// A per-thread cache of free objects.
#[derive(Debug)]
pub struct ThreadCache {
    lists: [FreeList; MAX_CLASSES],
    size: usize,
    max_size: usize,
}

impl ThreadCache {
    /// Creates an empty cache holding at most about `max_size` bytes.
    pub fn new(max_size: usize) -> Self {
        ThreadCache {
            lists: array![_ => FreeList::new(); MAX_CLASSES],
            size: 0,
            max_size,
        }
    }

    /// The bytes of free objects held by this cache.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// The number of free objects of `class` held by this cache.
    pub fn len(&self, class: usize) -> usize {
        self.lists[class].objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// The current dynamic bound of the list of `class`.
    pub fn max_length(&self, class: usize) -> usize {
        self.lists[class].max_length
    }

    /// Allocates an object of `class`.
    #[inline]
    pub fn allocate(&mut self, tiers: Tiers<'_, '_>, class: usize) -> Result<NonNull<u8>, Error> {
        let list = &mut self.lists[class];
        match list.objects.pop() {
            Some(obj) => {
                list.lowater = list.lowater.min(list.objects.len());
                self.size -= tiers.size_map.class_size(class);
                Ok(obj)
            }
            None => self.fetch_from_central(tiers, &tiers.size_map.info(class)),
        }
    }

    #[cold]
    fn fetch_from_central(
        &mut self,
        tiers: Tiers<'_, '_>,
        info: &ClassInfo,
    ) -> Result<NonNull<u8>, Error> {
        let list = &mut self.lists[info.class];
        let num = list.max_length.min(info.batch);
        let chain = tiers.central[info.class].remove_range(tiers.page_heap, info, num)?;

        // SAFETY: The chain is owned and well-formed.
        unsafe { list.objects.push_chain(chain) };
        let obj = list.objects.pop().ok_or(Error::OutOfMemory {
            pages: info.pages,
            os_error: None,
        })?;
        self.size += (chain.len - 1) * info.size;

        // Grow slowly up to the batch size, then in whole batches.
        if list.max_length < info.batch {
            list.max_length += 1;
        } else {
            let len = (list.max_length + info.batch).min(MAX_DYNAMIC_FREE_LIST_LENGTH);
            list.max_length = len - len % info.batch;
        }
        Ok(obj)
    }

    /// Returns an object of `class` to the cache.
    ///
    /// # Safety
    ///
    /// `obj` must be a free object of `class` allocated from `tiers`.
    #[inline]
    pub unsafe fn deallocate(&mut self, tiers: Tiers<'_, '_>, class: usize, obj: NonNull<u8>) {
        let list = &mut self.lists[class];
        // SAFETY: The object is owned by the caller.
        unsafe { list.objects.push(obj) };
        self.size += tiers.size_map.class_size(class);

        if list.objects.len() > list.max_length {
            self.list_too_long(tiers, &tiers.size_map.info(class));
        }
        if self.size >= self.max_size {
            self.scavenge(tiers);
        }
    }

    #[cold]
    fn list_too_long(&mut self, tiers: Tiers<'_, '_>, info: &ClassInfo) {
        self.release_to_central(tiers, info, info.batch);

        let list = &mut self.lists[info.class];
        if list.max_length < info.batch {
            list.max_length += 1;
        } else if list.max_length > info.batch {
            list.length_overages += 1;
            if list.length_overages > MAX_OVERAGES {
                list.max_length -= info.batch;
                list.length_overages = 0;
            }
        }
    }

    fn release_to_central(&mut self, tiers: Tiers<'_, '_>, info: &ClassInfo, n: usize) -> usize {
        let list = &mut self.lists[info.class];
        let mut released = 0;
        // Whole batches first, so the transfer cache can take them.
        while released < n {
            let Some(chain) = list.objects.pop_chain(info.batch.min(n - released)) else {
                break;
            };
            released += chain.len;
            // SAFETY: The objects came from this class and are free.
            unsafe { tiers.central[info.class].insert_range(tiers.page_heap, info, chain) };
        }
        list.lowater = list.lowater.min(list.objects.len());
        self.size -= released * info.size;
        released
    }

    /// Gives back half of the objects that stayed unused since the last
    /// scavenge in each list.
    pub fn scavenge(&mut self, tiers: Tiers<'_, '_>) {
        for class in 1..tiers.size_map.num_classes() {
            let lowater = self.lists[class].lowater;
            if lowater > 0 {
                let info = tiers.size_map.info(class);
                let drop = (lowater / 2).max(1);
                self.release_to_central(tiers, &info, drop);

                // Only shrink down to the batch size to avoid another slow
                // start.
                let list = &mut self.lists[class];
                if list.max_length > info.batch {
                    list.max_length = (list.max_length - info.batch).max(info.batch);
                }
            }
            let list = &mut self.lists[class];
            list.lowater = list.objects.len();
        }
    }

    /// Returns every cached object to the central free lists. Returns the
    /// number of objects released.
    pub fn flush(&mut self, tiers: Tiers<'_, '_>) -> usize {
        let mut released = 0;
        for class in 1..tiers.size_map.num_classes() {
            let len = self.lists[class].objects.len();
            if len > 0 {
                released += self.release_to_central(tiers, &tiers.size_map.info(class), len);
            }
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use std::{boxed::Box, vec::Vec};

    use super::*;
    use crate::base::{Static, SysAlloc};

    static BASE: Static<{ 32 << 20 }> = Static::new();
    static BACKENDS: [&dyn SysAlloc; 1] = [&BASE];

    struct Fixture {
        page_heap: Box<PageHeap<'static>>,
        central: Box<[CentralFreeList; MAX_CLASSES]>,
        size_map: SizeMap,
    }

    impl Fixture {
        fn new() -> Self {
            let page_heap = Box::new(PageHeap::new(&BACKENDS));
            page_heap.set_release_rate(0.0);
            Fixture {
                page_heap,
                central: Box::new([const { CentralFreeList::new() }; MAX_CLASSES]),
                size_map: SizeMap::new(32),
            }
        }

        fn tiers(&self) -> Tiers<'_, 'static> {
            Tiers {
                page_heap: &self.page_heap,
                central: &self.central,
                size_map: &self.size_map,
            }
        }
    }

    #[test]
    fn slow_start() {
        let fixture = Fixture::new();
        let tiers = fixture.tiers();
        let class = fixture.size_map.class_of(10);
        let batch = fixture.size_map.num_objects_to_move(class);
        let mut cache = ThreadCache::new(1 << 20);

        let mut objs = Vec::new();
        for _ in 0..3 {
            objs.push(cache.allocate(tiers, class).unwrap());
        }
        // Two misses fetching one and two objects, then a hit.
        assert_eq!(cache.max_length(class), 3);
        assert_eq!(cache.len(class), 0);

        while cache.max_length(class) <= batch {
            objs.push(cache.allocate(tiers, class).unwrap());
        }
        assert_eq!(cache.max_length(class), batch * 2);

        for obj in objs {
            unsafe { cache.deallocate(tiers, class, obj) };
        }
        assert!(cache.len(class) <= cache.max_length(class));
        assert!(cache.flush(tiers) > 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn hits_take_no_lock() {
        let fixture = Fixture::new();
        let tiers = fixture.tiers();
        let class = fixture.size_map.class_of(10);
        let mut cache = ThreadCache::new(1 << 20);

        for _ in 0..10 {
            let obj = cache.allocate(tiers, class).unwrap();
            unsafe { cache.deallocate(tiers, class, obj) };
        }
        let before = fixture.central[class].lock_acquisitions();
        for _ in 0..10_000 {
            let obj = cache.allocate(tiers, class).unwrap();
            unsafe { cache.deallocate(tiers, class, obj) };
        }
        assert_eq!(fixture.central[class].lock_acquisitions(), before);
        cache.flush(tiers);
    }

    #[test]
    fn byte_budget() {
        let fixture = Fixture::new();
        let tiers = fixture.tiers();
        let class = fixture.size_map.class_of(1024);
        let size = fixture.size_map.class_size(class);
        let mut cache = ThreadCache::new(size * 16);

        let objs = (0..256)
            .map(|_| cache.allocate(tiers, class).unwrap())
            .collect::<Vec<_>>();
        for obj in objs {
            unsafe { cache.deallocate(tiers, class, obj) };
        }
        assert!(cache.size() <= size * 16);
        cache.flush(tiers);
        assert!(cache.is_empty());
    }
}
