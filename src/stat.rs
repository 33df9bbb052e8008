//! Statistics and introspection.
//!
//! A [`Stat`] is a point-in-time snapshot of an
//! [`AllocatorContext`](crate::AllocatorContext). Its parts are taken one
//! lock at a time, so a snapshot of a busy allocator is not atomic as a
//! whole, but every part is consistent in itself.

use core::{fmt, iter::FusedIterator};

use crate::{
    config::{MAX_CLASSES, MAX_PAGES, PAGE_SHIFT},
    heap::AllocatorContext,
    span::PageId,
};

/// The byte accounting of a page heap.
///
/// At every quiescent point, `free_bytes + unmapped_bytes + in_use_bytes`
/// and `committed_bytes + unmapped_bytes` both equal `system_bytes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageHeapStats {
    /// Bytes obtained from the system for pages.
    pub system_bytes: usize,
    /// Committed bytes on the normal free lists.
    pub free_bytes: usize,
    /// Bytes on the returned free lists.
    pub unmapped_bytes: usize,
    pub committed_bytes: usize,
    /// Bytes of spans handed out, including spans carved into objects.
    pub in_use_bytes: usize,
    pub scavenge_count: usize,
    pub commit_count: usize,
    pub total_commit_bytes: usize,
    pub decommit_count: usize,
    pub total_decommit_bytes: usize,
    pub reserve_count: usize,
    pub total_reserve_bytes: usize,
}

impl PageHeapStats {
    pub const EMPTY: PageHeapStats = PageHeapStats {
        system_bytes: 0,
        free_bytes: 0,
        unmapped_bytes: 0,
        committed_bytes: 0,
        in_use_bytes: 0,
        scavenge_count: 0,
        commit_count: 0,
        total_commit_bytes: 0,
        decommit_count: 0,
        total_decommit_bytes: 0,
        reserve_count: 0,
        total_reserve_bytes: 0,
    };
}

impl Default for PageHeapStats {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// The number of free spans of each length below [`MAX_PAGES`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SmallSpanStats {
    pub normal_length: [usize; MAX_PAGES],
    pub returned_length: [usize; MAX_PAGES],
}

impl SmallSpanStats {
    pub const EMPTY: SmallSpanStats = SmallSpanStats {
        normal_length: [0; MAX_PAGES],
        returned_length: [0; MAX_PAGES],
    };

    /// The free bytes held by small spans, committed and returned.
    pub fn bytes(&self) -> (usize, usize) {
        let sum = |lengths: &[usize]| {
            let pages = lengths.iter().enumerate().map(|(len, count)| len * count);
            pages.sum::<usize>() << PAGE_SHIFT
        };
        (sum(&self.normal_length), sum(&self.returned_length))
    }
}

impl Default for SmallSpanStats {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// The free spans of at least [`MAX_PAGES`] pages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LargeSpanStats {
    pub spans: usize,
    pub normal_pages: usize,
    pub returned_pages: usize,
}

/// The statistics of one size class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ClassStat {
    pub class: usize,
    /// The object size.
    pub size: usize,
    /// The pages of each span of this class.
    pub pages: usize,
    /// The number of objects moved per batch.
    pub batch: usize,
    /// The spans carved for this class.
    pub spans: usize,
    /// Free objects held by spans of the central free list.
    pub central_objects: usize,
    /// Free objects held by the transfer cache.
    pub transfer_objects: usize,
}

impl ClassStat {
    /// The free bytes of this class outside thread caches.
    pub fn free_bytes(&self) -> usize {
        (self.central_objects + self.transfer_objects) * self.size
    }
}

/// A snapshot of the state of an allocator context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stat {
    pub page_heap: PageHeapStats,
    /// Bytes obtained from the system for metadata.
    pub meta_system_bytes: usize,
    /// Metadata bytes actually handed out.
    pub meta_used_bytes: usize,
    /// Bytes obtained from every system allocator backend.
    pub taken_bytes: usize,
    pub live_spans: usize,
    pub num_classes: usize,
    pub classes: [ClassStat; MAX_CLASSES],
    pub small: SmallSpanStats,
    pub large: LargeSpanStats,
}

impl Stat {
    pub(crate) fn collect(cx: &AllocatorContext<'_>) -> Self {
        let page_heap = cx.page_heap();
        let size_map = cx.size_map();
        let mut classes = [ClassStat::default(); MAX_CLASSES];
        for (class, stat) in classes.iter_mut().enumerate().take(size_map.num_classes()).skip(1) {
            let info = size_map.info(class);
            let central = cx.central(class);
            *stat = ClassStat {
                class,
                size: info.size,
                pages: info.pages,
                batch: info.batch,
                spans: central.spans(),
                central_objects: central.free_objects(),
                transfer_objects: central.transfer_objects(&info),
            };
        }
        let meta = page_heap.meta();
        Stat {
            page_heap: page_heap.stats(),
            meta_system_bytes: meta.alloc.system_bytes(),
            meta_used_bytes: meta.alloc.used_bytes(),
            taken_bytes: page_heap.system().taken(),
            live_spans: page_heap.live_spans(),
            num_classes: size_map.num_classes(),
            classes,
            small: page_heap.small_span_stats(),
            large: page_heap.large_span_stats(),
        }
    }

    /// The statistics of every size class in use.
    pub fn classes(&self) -> &[ClassStat] {
        &self.classes[1..self.num_classes.max(1)]
    }

    /// The free bytes held by central free lists and transfer caches.
    pub fn central_free_bytes(&self) -> usize {
        self.classes().iter().map(ClassStat::free_bytes).sum()
    }

    /// Whether the bytes taken from the system are all accounted for by the
    /// page heap and the metadata allocator.
    pub fn is_balanced(&self) -> bool {
        let heap = &self.page_heap;
        heap.free_bytes + heap.unmapped_bytes + heap.in_use_bytes == heap.system_bytes
            && heap.committed_bytes + heap.unmapped_bytes == heap.system_bytes
            && heap.system_bytes + self.meta_system_bytes == self.taken_bytes
    }
}

impl fmt::Display for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn row(f: &mut fmt::Formatter<'_>, op: &str, bytes: usize, what: &str) -> fmt::Result {
            const MIB: f64 = (1 << 20) as f64;
            writeln!(f, "MALLOC: {op} {bytes:>10} ({:>8.1} MiB) {what}", bytes as f64 / MIB)
        }

        let heap = &self.page_heap;

        writeln!(f, "------------------------------------------------")?;
        row(f, " ", heap.in_use_bytes, "bytes in use by spans")?;
        row(f, "+", heap.free_bytes, "bytes in page heap freelist")?;
        row(f, "+", heap.unmapped_bytes, "bytes released to the system")?;
        row(f, "+", self.meta_system_bytes, "bytes of metadata")?;
        writeln!(f, "MALLOC:   ------------")?;
        row(f, "=", self.taken_bytes, "bytes taken from the system")?;
        writeln!(f, "MALLOC: {:>12}               spans in use", self.live_spans)?;
        let central = self.central_free_bytes();
        writeln!(f, "MALLOC: {central:>12}               bytes in central free lists")?;
        writeln!(f, "------------------------------------------------")?;

        writeln!(f, "Size classes (class, size, spans, free objects, transfer objects):")?;
        for class in self.classes().iter().filter(|class| class.spans > 0) {
            writeln!(
                f,
                "class {:3} [ {:8} bytes ] {:6} spans {:8} free {:8} transfer",
                class.class, class.size, class.spans, class.central_objects, class.transfer_objects,
            )?;
        }

        writeln!(f, "Free spans (pages, normal, returned):")?;
        for len in 1..MAX_PAGES {
            let normal = self.small.normal_length[len];
            let returned = self.small.returned_length[len];
            if normal + returned > 0 {
                writeln!(f, "{len:6} pages: {normal:6} normal {returned:6} returned")?;
            }
        }
        writeln!(
            f,
            ">{:5} large: {:6} spans {:8} normal pages {:8} returned pages",
            MAX_PAGES - 1,
            self.large.spans,
            self.large.normal_pages,
            self.large.returned_pages,
        )
    }
}

/// The kind of an address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RangeKind {
    /// Allocated, as a whole or carved into objects.
    InUse,
    /// Free and committed.
    Free,
    /// Free and released to the system.
    Unmapped,
    /// The page is indexed but its span could not be resolved.
    Unknown,
}

/// An address range of the page heap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Range {
    pub address: usize,
    /// The length in bytes.
    pub length: usize,
    pub kind: RangeKind,
    /// The estimated fraction of the range in use by objects.
    pub fraction: f64,
}

/// An iterator over the address ranges of an allocator context, in address
/// order.
///
/// Ranges are looked up one at a time, so spans changing while iterating may
/// be seen in either state.
#[derive(Debug)]
pub struct Ranges<'c, 'a> {
    cx: &'c AllocatorContext<'a>,
    next: Option<PageId>,
}

impl<'c, 'a> Ranges<'c, 'a> {
    pub(crate) fn new(cx: &'c AllocatorContext<'a>) -> Self {
        Ranges { cx, next: Some(0) }
    }
}

impl Iterator for Ranges<'_, '_> {
    type Item = Range;

    fn next(&mut self) -> Option<Range> {
        let size_map = self.cx.size_map();
        let page = self.next?;
        let range = self
            .cx
            .page_heap()
            .next_range(page, |class| size_map.class_size(class));
        self.next = range.map(|range| (range.address + range.length) >> PAGE_SHIFT);
        range
    }
}

impl FusedIterator for Ranges<'_, '_> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_span_bytes() {
        let mut stats = SmallSpanStats::EMPTY;
        stats.normal_length[2] = 3;
        stats.returned_length[1] = 1;
        assert_eq!(stats.bytes(), (6 << PAGE_SHIFT, 1 << PAGE_SHIFT));
    }

    #[test]
    fn class_free_bytes() {
        let stat = ClassStat {
            size: 64,
            central_objects: 3,
            transfer_objects: 32,
            ..Default::default()
        };
        assert_eq!(stat.free_bytes(), 35 * 64);
    }
}
