//! The page-to-span index.
//!
//! Boundary pages of every span resolve to it. Interior pages resolve to it
//! only after its size class is registered.

use core::{
    ptr,
    sync::atomic::{AtomicPtr, AtomicU64, Ordering::*},
};

use crate::{
    config::{ADDRESS_BITS, PAGE_SHIFT},
    meta::Meta,
    span::{PageId, SpanId},
};

/// An entry of the page map: the owning span and its size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageEntry {
    pub span: SpanId,
    pub class: u8,
}

impl PageEntry {
    pub const fn new(span: SpanId, class: u8) -> Self {
        PageEntry { span, class }
    }

    const fn encode(entry: Option<PageEntry>) -> u64 {
        match entry {
            Some(entry) => entry.span.raw() as u64 | (entry.class as u64) << 32,
            None => 0,
        }
    }

    const fn decode(raw: u64) -> Option<PageEntry> {
        match SpanId::from_raw(raw as u32) {
            Some(span) => Some(PageEntry { span, class: (raw >> 32) as u8 }),
            None => None,
        }
    }
}

/// The trait of page-to-span indices.
///
/// Writers are serialized by the page heap lock; readers may run
/// concurrently without locking.
pub trait PageMap: Sync {
    /// Looks up the entry of `page`.
    fn get(&self, page: PageId) -> Option<PageEntry>;

    /// Sets the entry of `page`, whose storage must have been ensured.
    fn set(&self, page: PageId, entry: Option<PageEntry>);

    /// Makes room for the entries of `[start, start + n)`.
    ///
    /// Returns `false` if the range is not addressable or the storage
    /// couldn't be allocated.
    fn ensure(&self, start: PageId, n: usize, meta: Meta<'_, '_>) -> bool;

    /// Finds the first page at or after `page` that has an entry.
    fn next(&self, page: PageId) -> Option<(PageId, PageEntry)>;
}

/// The number of bits of a page number.
pub const PAGE_BITS: usize = ADDRESS_BITS - PAGE_SHIFT;
/// The number of addressable pages.
pub const PAGE_LIMIT: usize = 1 << PAGE_BITS;

const ROOT_BITS: usize = PAGE_BITS.div_ceil(3);
const INTERIOR_BITS: usize = (PAGE_BITS - ROOT_BITS).div_ceil(2);
const LEAF_BITS: usize = PAGE_BITS - ROOT_BITS - INTERIOR_BITS;

const ROOT_LEN: usize = 1 << ROOT_BITS;
const INTERIOR_LEN: usize = 1 << INTERIOR_BITS;
const LEAF_LEN: usize = 1 << LEAF_BITS;

type Leaf = [AtomicU64; LEAF_LEN];
type Interior = [AtomicPtr<Leaf>; INTERIOR_LEN];

const fn split(page: PageId) -> (usize, usize, usize) {
    (
        page >> (INTERIOR_BITS + LEAF_BITS),
        (page >> LEAF_BITS) & (INTERIOR_LEN - 1),
        page & (LEAF_LEN - 1),
    )
}

/// A three-level radix tree over page numbers.
///
/// The root is stored inline; interior and leaf nodes are zeroed metadata
/// published with release ordering and never freed.
pub struct RadixPageMap {
    root: [AtomicPtr<Interior>; ROOT_LEN],
}

impl RadixPageMap {
    pub const fn new() -> Self {
        RadixPageMap {
            root: [const { AtomicPtr::new(ptr::null_mut()) }; ROOT_LEN],
        }
    }

    fn leaf(&self, page: PageId) -> Option<&Leaf> {
        if page >= PAGE_LIMIT {
            return None;
        }
        let (i1, i2, _) = split(page);
        // SAFETY: Published nodes are never freed.
        let interior = unsafe { self.root[i1].load(Acquire).as_ref() }?;
        // SAFETY: Ditto.
        unsafe { interior[i2].load(Acquire).as_ref() }
    }
}

impl Default for RadixPageMap {
    fn default() -> Self {
        Self::new()
    }
}

impl PageMap for RadixPageMap {
    #[inline]
    fn get(&self, page: PageId) -> Option<PageEntry> {
        let leaf = self.leaf(page)?;
        PageEntry::decode(leaf[split(page).2].load(Acquire))
    }

    fn set(&self, page: PageId, entry: Option<PageEntry>) {
        match self.leaf(page) {
            Some(leaf) => leaf[split(page).2].store(PageEntry::encode(entry), Release),
            None => debug_assert!(entry.is_none(), "page {page:#x} is not ensured"),
        }
    }

    fn ensure(&self, start: PageId, n: usize, meta: Meta<'_, '_>) -> bool {
        let Some(end) = start.checked_add(n).filter(|&end| end <= PAGE_LIMIT) else {
            return false;
        };
        let mut key = start;
        while key < end {
            let (i1, i2, _) = split(key);
            let mut interior = self.root[i1].load(Acquire);
            if interior.is_null() {
                let Some(node) = meta.zeroed::<Interior>() else {
                    return false;
                };
                interior = node.as_ptr();
                self.root[i1].store(interior, Release);
            }
            // SAFETY: Published nodes are never freed.
            let slot = unsafe { &(*interior)[i2] };
            if slot.load(Acquire).is_null() {
                let Some(node) = meta.zeroed::<Leaf>() else {
                    return false;
                };
                slot.store(node.as_ptr(), Release);
            }
            key = ((key >> LEAF_BITS) + 1) << LEAF_BITS;
        }
        true
    }

    fn next(&self, mut page: PageId) -> Option<(PageId, PageEntry)> {
        while page < PAGE_LIMIT {
            let (i1, i2, i3) = split(page);
            // SAFETY: Published nodes are never freed.
            let Some(interior) = (unsafe { self.root[i1].load(Acquire).as_ref() }) else {
                page = (i1 + 1) << (INTERIOR_BITS + LEAF_BITS);
                continue;
            };
            // SAFETY: Ditto.
            let Some(leaf) = (unsafe { interior[i2].load(Acquire).as_ref() }) else {
                page = ((page >> LEAF_BITS) + 1) << LEAF_BITS;
                continue;
            };
            let base = page - i3;
            if let Some((offset, entry)) = leaf[i3..]
                .iter()
                .enumerate()
                .find_map(|(offset, raw)| Some((offset, PageEntry::decode(raw.load(Acquire))?)))
            {
                return Some((base + i3 + offset, entry));
            }
            page = base + LEAF_LEN;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        base::{Static, SysAlloc, SystemAllocator},
        meta::MetaAlloc,
    };

    static BASE: Static<{ 4 << 20 }> = Static::new();
    static BACKENDS: [&dyn SysAlloc; 1] = [&BASE];

    fn entry(id: u32, class: u8) -> Option<PageEntry> {
        Some(PageEntry::new(SpanId::from_raw(id).unwrap(), class))
    }

    #[test]
    fn geometry() {
        assert_eq!(ROOT_BITS + INTERIOR_BITS + LEAF_BITS, PAGE_BITS);
        assert!(LEAF_BITS > 0);
        assert_eq!(PageEntry::decode(PageEntry::encode(entry(7, 200))), entry(7, 200));
    }

    #[test]
    fn set_get_next() {
        let system = SystemAllocator::new(&BACKENDS);
        let alloc = MetaAlloc::new();
        let meta = Meta { alloc: &alloc, system: &system };
        let map = RadixPageMap::new();

        let base = 5 << LEAF_BITS;
        assert_eq!(map.get(base), None);
        assert!(map.ensure(base - 1, LEAF_LEN + 2, meta));
        assert!(!map.ensure(PAGE_LIMIT - 1, 2, meta));

        map.set(base, entry(1, 0));
        map.set(base + LEAF_LEN, entry(2, 3));
        assert_eq!(map.get(base), entry(1, 0));
        assert_eq!(map.get(base + 1), None);

        assert_eq!(map.next(0), Some((base, entry(1, 0).unwrap())));
        assert_eq!(map.next(base + 1), Some((base + LEAF_LEN, entry(2, 3).unwrap())));
        assert_eq!(map.next(base + LEAF_LEN + 1), None);

        map.set(base, None);
        assert_eq!(map.get(base), None);
    }
}
