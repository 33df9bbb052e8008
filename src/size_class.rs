//! Size classes: the mapping from requested sizes to fixed object sizes.

use crate::config::{ALIGNMENT, MAX_CLASSES, MAX_SIZE, MIN_ALIGN, PAGE_SHIFT, PAGE_SIZE};

/// Sizes up to this bound are indexed at 8-byte granularity, larger sizes at
/// 128-byte granularity.
const MAX_SMALL_SIZE: usize = 1024;
const CLASS_ARRAY_SIZE: usize = large_index(MAX_SIZE) + 1;

/// The number of bytes a transfer batch aims to carry.
const TARGET_TRANSFER_BYTES: usize = 64 * 1024;

const fn small_index(size: usize) -> usize {
    (size + 7) >> 3
}

const fn large_index(size: usize) -> usize {
    (size + 127 + (120 << 7)) >> 7
}

const fn class_index(size: usize) -> usize {
    if size <= MAX_SMALL_SIZE {
        small_index(size)
    } else {
        large_index(size)
    }
}

/// Returns the alignment guaranteed for an allocation of `size` bytes.
///
/// Mid-range sizes are aligned to an eighth of their power-of-two floor, which
/// bounds the waste of rounding up to the alignment to 12.5%.
pub const fn alignment_for_size(size: usize) -> usize {
    let alignment = if size > MAX_SIZE {
        PAGE_SIZE
    } else if size >= 128 {
        (1 << size.ilog2()) / 8
    } else if size >= MIN_ALIGN {
        MIN_ALIGN
    } else {
        ALIGNMENT
    };
    if alignment > PAGE_SIZE {
        PAGE_SIZE
    } else {
        alignment
    }
}

/// Returns the number of objects of `size` bytes moved per batch between a
/// thread cache and a central free list, bounded by `max`.
pub const fn num_move_size(size: usize, max: usize) -> usize {
    if size == 0 {
        return 0;
    }
    let num = TARGET_TRANSFER_BYTES / size;
    let num = if num < 2 { 2 } else { num };
    if num > max { max } else { num }
}

/// The geometry of one size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassInfo {
    pub class: usize,
    /// The object size.
    pub size: usize,
    /// The pages of each span carved into objects.
    pub pages: usize,
    /// The number of objects moved per batch.
    pub batch: usize,
    pub objects_per_span: usize,
}

/// The table of size classes.
///
/// Class 0 is reserved for spans that are not carved into objects. Classes
/// `1..num_classes()` have strictly increasing object sizes.
#[derive(Debug, Clone)]
pub struct SizeMap {
    class_array: [u8; CLASS_ARRAY_SIZE],
    class_to_size: [usize; MAX_CLASSES],
    class_to_pages: [usize; MAX_CLASSES],
    num_objects_to_move: [usize; MAX_CLASSES],
    num_classes: usize,
}

impl SizeMap {
    /// Builds the size class table, bounding transfer batches by
    /// `transfer_max` objects.
    ///
    /// # Panics
    ///
    /// Panics if the table fails its self-check, which indicates a geometry
    /// bug rather than a runtime condition.
    pub fn new(transfer_max: usize) -> Self {
        let mut map = SizeMap {
            class_array: [0; CLASS_ARRAY_SIZE],
            class_to_size: [0; MAX_CLASSES],
            class_to_pages: [0; MAX_CLASSES],
            num_objects_to_move: [0; MAX_CLASSES],
            num_classes: 0,
        };
        assert_eq!(class_index(0), 0, "invalid class index for size 0");

        let mut class = 1;
        let mut size = ALIGNMENT;
        while size <= MAX_SIZE {
            let alignment = alignment_for_size(size);
            assert_eq!(size % alignment, 0, "size {size} is not aligned to {alignment}");

            let blocks_to_move = num_move_size(size, transfer_max) / 4;
            let mut span_bytes = 0;
            loop {
                span_bytes += PAGE_SIZE;
                // Leftover of at most 1/8 of the span.
                while span_bytes % size > span_bytes >> 3 {
                    span_bytes += PAGE_SIZE;
                }
                if span_bytes / size >= blocks_to_move {
                    break;
                }
            }
            let pages = span_bytes >> PAGE_SHIFT;

            if class > 1 && pages == map.class_to_pages[class - 1] {
                let objects = span_bytes / size;
                let prev_objects = (pages << PAGE_SHIFT) / map.class_to_size[class - 1];
                if objects == prev_objects {
                    map.class_to_size[class - 1] = size;
                    size += alignment;
                    continue;
                }
            }

            assert!(class < MAX_CLASSES, "too many size classes: more than {MAX_CLASSES}");
            map.class_to_pages[class] = pages;
            map.class_to_size[class] = size;
            class += 1;
            size += alignment;
        }
        map.num_classes = class;

        let mut next_size = 0;
        for class in 1..map.num_classes {
            let max_size = map.class_to_size[class];
            let mut size = next_size;
            while size <= max_size {
                map.class_array[class_index(size)] = class as u8;
                size += ALIGNMENT;
            }
            next_size = max_size + ALIGNMENT;
        }

        map.validate();

        for class in 1..map.num_classes {
            map.num_objects_to_move[class] = num_move_size(map.class_to_size[class], transfer_max);
        }
        map
    }

    fn validate(&self) {
        let mut size = 0;
        while size <= MAX_SIZE {
            let class = self.class_of(size);
            assert!(
                class > 0 && class < self.num_classes,
                "bad size class {class} for size {size}"
            );
            assert!(
                class == 1 || size > self.class_to_size[class - 1],
                "unnecessarily large class {class} for size {size}"
            );
            let class_size = self.class_to_size[class];
            assert!(
                class_size != 0 && size <= class_size,
                "class {class} of size {class_size} cannot serve {size}"
            );
            size += if size < MAX_SMALL_SIZE { 8 } else { 128 };
        }
    }

    /// The number of size classes, including the reserved class 0.
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Returns the size class serving `size` bytes.
    ///
    /// `size` must not exceed [`MAX_SIZE`].
    #[inline]
    pub fn class_of(&self, size: usize) -> usize {
        debug_assert!(size <= MAX_SIZE);
        self.class_array[class_index(size)] as usize
    }

    /// Returns the size class serving `size` bytes, or `None` if it is served
    /// directly by the page heap.
    #[inline]
    pub fn try_class_of(&self, size: usize) -> Option<usize> {
        (size <= MAX_SIZE).then(|| self.class_of(size))
    }

    /// The object size of `class`.
    #[inline]
    pub fn class_size(&self, class: usize) -> usize {
        self.class_to_size[class]
    }

    /// The pages of each span carved into objects of `class`.
    #[inline]
    pub fn class_pages(&self, class: usize) -> usize {
        self.class_to_pages[class]
    }

    /// The number of objects moved per batch for `class`.
    #[inline]
    pub fn num_objects_to_move(&self, class: usize) -> usize {
        self.num_objects_to_move[class]
    }

    /// The number of objects a span of `class` is carved into.
    pub fn objects_per_span(&self, class: usize) -> usize {
        (self.class_to_pages[class] << PAGE_SHIFT) / self.class_to_size[class]
    }

    pub fn info(&self, class: usize) -> ClassInfo {
        ClassInfo {
            class,
            size: self.class_size(class),
            pages: self.class_pages(class),
            batch: self.num_objects_to_move(class),
            objects_per_span: self.objects_per_span(class),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> SizeMap {
        SizeMap::new(32)
    }

    #[test]
    fn monotonic_and_sufficient() {
        let map = map();
        let mut last = 0;
        for size in 0..=MAX_SIZE {
            let class = map.class_of(size);
            assert!(class >= last, "class of {size} decreased");
            assert!(map.class_size(class) >= size);
            last = class;
        }
    }

    #[test]
    fn strictly_increasing() {
        let map = map();
        assert!(map.num_classes() > 2);
        for class in 2..map.num_classes() {
            assert!(map.class_size(class - 1) < map.class_size(class));
        }
        assert_eq!(map.class_size(map.num_classes() - 1), MAX_SIZE);
    }

    #[test]
    fn waste_bound() {
        let map = map();
        for class in 1..map.num_classes() {
            let span = map.class_pages(class) << PAGE_SHIFT;
            assert!(span % map.class_size(class) <= span / 8, "class {class} wastes too much");
            assert!(map.objects_per_span(class) >= 1);
        }
    }

    #[test]
    fn alignment() {
        assert_eq!(alignment_for_size(1), ALIGNMENT);
        assert_eq!(alignment_for_size(16), MIN_ALIGN);
        assert_eq!(alignment_for_size(100), MIN_ALIGN);
        assert_eq!(alignment_for_size(1000), 64);
        assert_eq!(alignment_for_size(MAX_SIZE), PAGE_SIZE);
        assert_eq!(alignment_for_size(MAX_SIZE + 1), PAGE_SIZE);

        let map = map();
        for class in 1..map.num_classes() {
            let size = map.class_size(class);
            assert_eq!(size % alignment_for_size(size).min(size), 0);
        }
    }

    #[test]
    fn batches() {
        assert_eq!(num_move_size(0, 32), 0);
        assert_eq!(num_move_size(8, 32), 32);
        assert_eq!(num_move_size(8, 4096), 4096);
        assert_eq!(num_move_size(MAX_SIZE, 32), 2);

        let small = SizeMap::new(2);
        for class in 1..small.num_classes() {
            assert_eq!(small.num_objects_to_move(class), 2);
        }
    }

    #[test]
    fn routing() {
        let map = map();
        assert_eq!(map.try_class_of(MAX_SIZE + 1), None);
        assert_eq!(map.try_class_of(0), Some(1));
        assert_eq!(map.class_size(map.class_of(10)), 16);
    }
}
