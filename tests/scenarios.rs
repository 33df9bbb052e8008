use std::{
    collections::BTreeMap,
    panic::{self, AssertUnwindSafe},
    ptr::NonNull,
};

use spanalloc::{
    AllocatorContext, Corruption, CorruptionKind, Heap, Options,
    base::{Static, SysAlloc},
    config::{MAX_PAGES, MAX_SIZE, PAGE_SHIFT, PAGE_SIZE},
    span::Location,
};

const MIB: usize = 1 << 20;

fn context(backends: &'static [&'static dyn SysAlloc]) -> Box<AllocatorContext<'static>> {
    Box::new(AllocatorContext::new(backends))
}

fn location(cx: &AllocatorContext<'_>, ptr: NonNull<u8>) -> Location {
    let entry = cx.page_heap().entry(ptr.as_ptr().addr() >> PAGE_SHIFT).unwrap();
    cx.page_heap().span(entry.span).location()
}

#[test]
fn size_classes() {
    static BASE: Static<{ 4 << 20 }> = Static::new();
    static BACKENDS: [&dyn SysAlloc; 1] = [&BASE];
    let cx = context(&BACKENDS);
    let map = cx.size_map();

    let mut last = 0;
    for size in 0..=MAX_SIZE {
        let class = map.class_of(size);
        assert!(class >= last);
        assert!(map.class_size(class) >= size);
        last = class;
    }
    for class in 2..map.num_classes() {
        assert!(map.class_size(class - 1) < map.class_size(class));
    }
}

#[test]
fn random_round_trip() {
    static BASE: Static<{ 256 << 20 }> = Static::new();
    static BACKENDS: [&dyn SysAlloc; 1] = [&BASE];
    let cx = context(&BACKENDS);
    let mut heap = Heap::new(&cx);
    let mut rng = fastrand::Rng::with_seed(7);

    let mut live = BTreeMap::<usize, (NonNull<u8>, usize, u8)>::new();
    for step in 0..10_000 {
        if live.is_empty() || rng.u8(..) < 150 {
            let size = match rng.u8(..) {
                0..200 => rng.usize(..=1024),
                200..250 => rng.usize(1024..=64 << 10),
                _ => rng.usize(64 << 10..=2 * MIB),
            };
            let ptr = heap.allocate(size).unwrap();
            let start = ptr.as_ptr().addr();
            let end = start + heap.allocated_size(ptr);
            assert!(end - start >= size);

            // Live ranges never overlap.
            if let Some((_, &(prev, prev_size, _))) = live.range(..start).next_back() {
                assert!(prev.as_ptr().addr() + prev_size.max(1) <= start);
            }
            if let Some((&next, _)) = live.range(start..).next() {
                assert!(end <= next);
            }

            let tag = rng.u8(..);
            unsafe { ptr.write_bytes(tag, size) };
            live.insert(start, (ptr, size, tag));
        } else {
            let key = *live.keys().nth(rng.usize(..live.len())).unwrap();
            let (ptr, size, tag) = live.remove(&key).unwrap();
            let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
            assert!(bytes.iter().all(|&b| b == tag));
            unsafe { heap.deallocate(ptr) };
        }

        if step % 1000 == 0 {
            assert!(cx.stat().is_balanced(), "{}", cx.stat());
        }
    }

    for (_, (ptr, _, _)) in live {
        unsafe { heap.deallocate(ptr) };
    }
    heap.flush();
    let stat = cx.stat();
    assert!(stat.is_balanced(), "{stat}");
    cx.check().unwrap();
}

#[test]
fn release_is_idempotent() {
    static BASE: Static<{ 16 << 20 }> = Static::new();
    static BACKENDS: [&dyn SysAlloc; 1] = [&BASE];
    let cx = context(&BACKENDS);
    cx.set_release_rate(0.0);
    let mut heap = Heap::new(&cx);

    let ptr = heap.allocate(3 * MIB).unwrap();
    unsafe { heap.deallocate(ptr) };
    assert!(cx.release_free_memory() >= 3 * MIB);

    let before = cx.stat();
    assert_eq!(cx.release_free_memory(), 0);
    assert_eq!(cx.release_to_system(MIB), 0);
    assert_eq!(cx.stat(), before);
    cx.check().unwrap();
}

#[test]
fn coalescing_avoids_growth() {
    static BASE: Static<{ 16 << 20 }> = Static::new();
    static BACKENDS: [&dyn SysAlloc; 1] = [&BASE];
    let cx = context(&BACKENDS);
    cx.apply(&Options {
        release_rate: 0.0,
        force_coalesce_interval: 0,
        ..Options::DEFAULT
    });
    let page_heap = cx.page_heap();

    let half = MAX_PAGES / 2;
    let a = page_heap.new_span(half).unwrap();
    let b = page_heap.new_span(half).unwrap();
    page_heap.delete(a);
    assert_eq!(page_heap.release_at_least(half), half);
    page_heap.delete(b);

    // The free pages are split into a normal and a returned half.
    let system = page_heap.stats().system_bytes;
    let c = page_heap.new_span(MAX_PAGES).unwrap();
    assert_eq!(page_heap.stats().system_bytes, system);
    assert_eq!(page_heap.span(c).length(), MAX_PAGES);
    page_heap.delete(c);
    cx.check().unwrap();
}

#[test]
fn cache_hits_take_no_lock() {
    static BASE: Static<{ 16 << 20 }> = Static::new();
    static BACKENDS: [&dyn SysAlloc; 1] = [&BASE];
    let cx = context(&BACKENDS);
    cx.set_sample_parameter(0);
    let mut heap = Heap::new(&cx);
    let central = cx.central(cx.size_map().class_of(10));

    for _ in 0..4 {
        let ptr = heap.allocate(10).unwrap();
        unsafe { heap.deallocate(ptr) };
    }
    let before = central.lock_acquisitions();
    for _ in 0..10_000 {
        let ptr = heap.allocate(10).unwrap();
        unsafe { heap.deallocate(ptr) };
    }
    assert_eq!(central.lock_acquisitions(), before);

    // Holding all of them at once still moves objects in batches.
    let ptrs = (0..10_000).map(|_| heap.allocate(10).unwrap()).collect::<Vec<_>>();
    for ptr in ptrs {
        unsafe { heap.deallocate(ptr) };
    }
    assert!(central.lock_acquisitions() - before < 1250);
}

#[test]
fn released_pages_and_ties() {
    static BASE: Static<{ 32 << 20 }> = Static::new();
    static BACKENDS: [&dyn SysAlloc; 1] = [&BASE];
    let cx = context(&BACKENDS);
    cx.set_release_rate(0.0);
    let mut heap = Heap::new(&cx);

    let a = heap.allocate(MIB).unwrap();
    let b = heap.allocate(MIB).unwrap();
    unsafe { heap.deallocate(a) };
    assert_eq!(location(&cx, a), Location::OnNormalFreelist);
    cx.release_free_memory();
    assert_eq!(location(&cx, a), Location::OnReturnedFreelist);

    // Equally good fits: the committed span wins.
    unsafe { heap.deallocate(b) };
    assert_eq!(location(&cx, b), Location::OnNormalFreelist);
    let c = heap.allocate(MIB).unwrap();
    assert_eq!(c, b);
    assert_eq!(location(&cx, a), Location::OnReturnedFreelist);
    unsafe { heap.deallocate(c) };
}

#[test]
fn best_fit_beats_commit_state() {
    static BASE: Static<{ 32 << 20 }> = Static::new();
    static BACKENDS: [&dyn SysAlloc; 1] = [&BASE];
    let cx = context(&BACKENDS);
    cx.set_release_rate(0.0);
    let mut heap = Heap::new(&cx);

    let a = heap.allocate(MIB).unwrap();
    let b = heap.allocate(MIB + 2 * PAGE_SIZE).unwrap();
    unsafe { heap.deallocate(a) };
    cx.release_free_memory();
    unsafe { heap.deallocate(b) };
    assert_eq!(location(&cx, b), Location::OnNormalFreelist);

    let c = heap.allocate(MIB).unwrap();
    assert_eq!(c, a);
    assert_eq!(location(&cx, c), Location::InUse);
    assert_eq!(cx.stat().page_heap.unmapped_bytes, 0);
    unsafe { heap.deallocate(c) };
}

#[test]
fn interior_free_is_fatal() {
    static BASE: Static<{ 16 << 20 }> = Static::new();
    static BACKENDS: [&dyn SysAlloc; 1] = [&BASE];
    let cx = context(&BACKENDS);
    cx.set_sample_parameter(0);
    let mut heap = Heap::new(&cx);

    let obj = heap.allocate(64).unwrap();
    let interior = unsafe { obj.add(8) };
    let payload = panic::catch_unwind(AssertUnwindSafe(|| unsafe { heap.deallocate(interior) }))
        .unwrap_err();
    let corruption = payload.downcast_ref::<Corruption>().unwrap();
    assert_eq!(corruption.kind, CorruptionKind::InteriorPointer);
    assert_eq!(corruption.address, interior.as_ptr().addr());

    // The heap is untouched and keeps working.
    unsafe { heap.deallocate(obj) };
    assert_eq!(heap.allocate(64), Some(obj));
}
