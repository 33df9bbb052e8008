//! Spans: contiguous runs of pages, the unit of ownership of the page heap.
//!
//! Span records live in a [`SpanArena`] and are addressed by [`SpanId`]
//! handles. Free lists are index-based doubly-linked [`SpanList`]s threaded
//! through the records.
//!
//! Every field of a record is an atomic accessed with relaxed ordering. The
//! page heap writes start, length and location under its lock; a central
//! free list writes the object list and reference count under its own lock.
//! Lock-free readers on the deallocation path only read fields of in-use
//! spans, which don't change until the span is freed.

use core::{
    fmt,
    iter::FusedIterator,
    num::NonZeroU32,
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicU32, AtomicUsize, Ordering::*},
};

use crate::{config::PAGE_SHIFT, meta::Meta, sampler::StackTrace};

/// A page number: a page-aligned address shifted right by
/// [`PAGE_SHIFT`](crate::config::PAGE_SHIFT).
pub type PageId = usize;

/// The handle of a span record.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpanId(NonZeroU32);

impl SpanId {
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match NonZeroU32::new(raw) {
            Some(raw) => Some(SpanId(raw)),
            None => None,
        }
    }

    pub const fn raw(self) -> u32 {
        self.0.get()
    }

    fn index(self) -> usize {
        (self.0.get() - 1) as usize
    }

    fn encode(id: Option<SpanId>) -> u32 {
        id.map_or(0, SpanId::raw)
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpanId({})", self.0)
    }
}

/// The state of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Location {
    /// Lent out, either as a large allocation or carved into objects.
    InUse = 0,
    /// Free and backed by committed memory.
    OnNormalFreelist = 1,
    /// Free and released to the system.
    OnReturnedFreelist = 2,
}

impl Location {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Location::OnNormalFreelist,
            2 => Location::OnReturnedFreelist,
            _ => Location::InUse,
        }
    }
}

/// A span record.
#[derive(Default)]
pub struct Span {
    start: AtomicUsize,
    length: AtomicUsize,
    location: AtomicU8,
    size_class: AtomicU8,
    sampled: AtomicBool,
    prev: AtomicU32,
    next: AtomicU32,
    objects: AtomicPtr<u8>,
    refcount: AtomicUsize,
    trace: AtomicPtr<StackTrace>,
}

impl Span {
    const fn new() -> Self {
        Span {
            start: AtomicUsize::new(0),
            length: AtomicUsize::new(0),
            location: AtomicU8::new(Location::InUse as u8),
            size_class: AtomicU8::new(0),
            sampled: AtomicBool::new(false),
            prev: AtomicU32::new(0),
            next: AtomicU32::new(0),
            objects: AtomicPtr::new(ptr::null_mut()),
            refcount: AtomicUsize::new(0),
            trace: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn reset(&self, start: PageId, length: usize) {
        self.start.store(start, Relaxed);
        self.length.store(length, Relaxed);
        self.location.store(Location::InUse as u8, Relaxed);
        self.size_class.store(0, Relaxed);
        self.sampled.store(false, Relaxed);
        self.prev.store(0, Relaxed);
        self.next.store(0, Relaxed);
        self.objects.store(ptr::null_mut(), Relaxed);
        self.refcount.store(0, Relaxed);
        self.trace.store(ptr::null_mut(), Relaxed);
    }

    /// The first page of the span.
    pub fn start(&self) -> PageId {
        self.start.load(Relaxed)
    }

    pub(crate) fn set_start(&self, start: PageId) {
        self.start.store(start, Relaxed)
    }

    /// The number of pages of the span. Retired records have length 0.
    pub fn length(&self) -> usize {
        self.length.load(Relaxed)
    }

    pub(crate) fn set_length(&self, length: usize) {
        self.length.store(length, Relaxed)
    }

    /// The page right after the span.
    pub fn end(&self) -> PageId {
        self.start() + self.length()
    }

    /// The address of the first byte of the span.
    pub fn address(&self) -> usize {
        self.start() << PAGE_SHIFT
    }

    /// A pointer to the first byte of the span.
    ///
    /// Span memory comes from chunks whose provenance was exposed when the
    /// page heap took them over.
    pub fn as_ptr(&self) -> *mut u8 {
        ptr::with_exposed_provenance_mut(self.address())
    }

    pub(crate) fn contains(&self, page: PageId) -> bool {
        (self.start()..self.end()).contains(&page)
    }

    pub fn location(&self) -> Location {
        Location::from_raw(self.location.load(Relaxed))
    }

    pub(crate) fn set_location(&self, location: Location) {
        self.location.store(location as u8, Relaxed)
    }

    /// The size class of the objects carved from the span, or 0.
    pub fn size_class(&self) -> usize {
        self.size_class.load(Relaxed) as usize
    }

    pub(crate) fn set_size_class(&self, class: usize) {
        debug_assert!(class <= u8::MAX as usize);
        self.size_class.store(class as u8, Relaxed)
    }

    pub fn is_sampled(&self) -> bool {
        self.sampled.load(Relaxed)
    }

    pub(crate) fn set_sampled(&self, trace: Option<NonNull<StackTrace>>) {
        self.sampled.store(true, Relaxed);
        self.trace
            .store(trace.map_or(ptr::null_mut(), NonNull::as_ptr), Relaxed);
    }

    pub(crate) fn take_trace(&self) -> Option<NonNull<StackTrace>> {
        self.sampled.store(false, Relaxed);
        NonNull::new(self.trace.swap(ptr::null_mut(), Relaxed))
    }

    pub(crate) fn trace(&self) -> Option<NonNull<StackTrace>> {
        NonNull::new(self.trace.load(Relaxed))
    }

    pub(crate) fn objects(&self) -> Option<NonNull<u8>> {
        NonNull::new(self.objects.load(Relaxed))
    }

    pub(crate) fn set_objects(&self, objects: Option<NonNull<u8>>) {
        self.objects
            .store(objects.map_or(ptr::null_mut(), NonNull::as_ptr), Relaxed)
    }

    /// The number of objects of the span in use outside the central free
    /// list.
    pub fn refcount(&self) -> usize {
        self.refcount.load(Relaxed)
    }

    pub(crate) fn set_refcount(&self, refcount: usize) {
        self.refcount.store(refcount, Relaxed)
    }

    fn prev(&self) -> Option<SpanId> {
        SpanId::from_raw(self.prev.load(Relaxed))
    }

    fn next(&self) -> Option<SpanId> {
        SpanId::from_raw(self.next.load(Relaxed))
    }

    fn set_prev(&self, prev: Option<SpanId>) {
        self.prev.store(SpanId::encode(prev), Relaxed)
    }

    fn set_next(&self, next: Option<SpanId>) {
        self.next.store(SpanId::encode(next), Relaxed)
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Span")
            .field("start", &format_args!("{:#x}", self.address()))
            .field("length", &self.length())
            .field("location", &self.location())
            .field("size_class", &self.size_class())
            .finish()
    }
}

const BLOCK_LEN: usize = 1024;
const MAX_BLOCKS: usize = 16384;

/// Returned for handles whose block was never allocated.
static DETACHED: Span = Span::new();

/// The allocation state of a [`SpanArena`], owned by the page heap.
#[derive(Debug, Default)]
pub(crate) struct SpanCursor {
    free: Option<SpanId>,
    len: usize,
    live: usize,
}

impl SpanCursor {
    pub const fn new() -> Self {
        SpanCursor { free: None, len: 0, live: 0 }
    }

    /// The number of live span records.
    pub fn live(&self) -> usize {
        self.live
    }
}

/// The table of span records.
///
/// Records are allocated in blocks from the metadata allocator and looked up
/// without locking. Handles of retired records are recycled.
pub struct SpanArena {
    blocks: [AtomicPtr<Span>; MAX_BLOCKS],
}

impl SpanArena {
    pub const fn new() -> Self {
        SpanArena {
            blocks: [const { AtomicPtr::new(ptr::null_mut()) }; MAX_BLOCKS],
        }
    }

    /// Looks up the record of `id`.
    #[inline]
    pub fn get(&self, id: SpanId) -> &Span {
        let index = id.index();
        let block = self.blocks[index / BLOCK_LEN].load(Acquire);
        if block.is_null() {
            debug_assert!(false, "span {id:?} was never allocated");
            return &DETACHED;
        }
        // SAFETY: Blocks are never deallocated, and hold `BLOCK_LEN` records.
        unsafe { &*block.add(index % BLOCK_LEN) }
    }

    /// Creates a record for `[start, start + length)`, in use and without a
    /// size class.
    pub(crate) fn alloc(
        &self,
        cursor: &mut SpanCursor,
        meta: Meta<'_, '_>,
        start: PageId,
        length: usize,
    ) -> Option<SpanId> {
        let id = match cursor.free {
            Some(id) => {
                cursor.free = self.get(id).next();
                id
            }
            None => {
                let index = cursor.len;
                let block = index / BLOCK_LEN;
                if block >= MAX_BLOCKS {
                    return None;
                }
                if index % BLOCK_LEN == 0 && self.blocks[block].load(Relaxed).is_null() {
                    let ptr = meta.zeroed_array::<Span>(BLOCK_LEN)?;
                    self.blocks[block].store(ptr.as_ptr(), Release);
                }
                cursor.len += 1;
                SpanId::from_raw(u32::try_from(cursor.len).ok()?)?
            }
        };
        cursor.live += 1;
        self.get(id).reset(start, length);
        Some(id)
    }

    /// Retires the record of `id`, recycling its handle.
    pub(crate) fn free(&self, cursor: &mut SpanCursor, id: SpanId) {
        let span = self.get(id);
        span.reset(0, 0);
        span.set_next(cursor.free);
        cursor.free = Some(id);
        cursor.live -= 1;
    }
}

impl Default for SpanArena {
    fn default() -> Self {
        Self::new()
    }
}

/// An intrusive doubly-linked list of spans.
#[derive(Debug, Default)]
pub struct SpanList {
    head: Option<SpanId>,
    tail: Option<SpanId>,
    len: usize,
}

impl SpanList {
    pub const fn new() -> Self {
        SpanList { head: None, tail: None, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn first(&self) -> Option<SpanId> {
        self.head
    }

    pub fn last(&self) -> Option<SpanId> {
        self.tail
    }

    /// Prepends `id`, which must not be linked into any list.
    pub fn push_front(&mut self, spans: &SpanArena, id: SpanId) {
        let span = spans.get(id);
        span.set_prev(None);
        span.set_next(self.head);
        match self.head {
            Some(head) => spans.get(head).set_prev(Some(id)),
            None => self.tail = Some(id),
        }
        self.head = Some(id);
        self.len += 1;
    }

    /// Unlinks `id`, which must be linked into this list.
    pub fn remove(&mut self, spans: &SpanArena, id: SpanId) {
        let span = spans.get(id);
        let (prev, next) = (span.prev(), span.next());
        match prev {
            Some(prev) => spans.get(prev).set_next(next),
            None => self.head = next,
        }
        match next {
            Some(next) => spans.get(next).set_prev(prev),
            None => self.tail = prev,
        }
        span.set_prev(None);
        span.set_next(None);
        self.len -= 1;
    }

    pub fn iter<'s>(&self, spans: &'s SpanArena) -> Iter<'s> {
        Iter { spans, cur: self.head }
    }
}

#[derive(Clone)]
pub struct Iter<'s> {
    spans: &'s SpanArena,
    cur: Option<SpanId>,
}

impl<'s> Iterator for Iter<'s> {
    type Item = (SpanId, &'s Span);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cur?;
        let span = self.spans.get(id);
        self.cur = span.next();
        Some((id, span))
    }
}

impl FusedIterator for Iter<'_> {}
