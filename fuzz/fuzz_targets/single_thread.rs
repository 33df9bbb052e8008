#![no_main]

use std::ptr::NonNull;

use libfuzzer_sys::{arbitrary::Arbitrary, fuzz_target};
use spanalloc::{
    AllocatorContext, Heap,
    base::{Mmap, SysAlloc},
};

#[derive(Debug, Arbitrary)]
enum Action {
    Allocate { size: u32, align_shift: u8 },
    Deallocate { index: u8 },
    Reallocate { index: u8, size: u32 },
    Flush,
    Release,
}

static BASE: Mmap = Mmap::new();
static BACKENDS: [&dyn SysAlloc; 1] = [&BASE];
static CX: AllocatorContext<'static> = AllocatorContext::new(&BACKENDS);

fuzz_target!(|actions: Vec<Action>| {
    let cx = &CX;
    let mut heap = Heap::new(cx);
    let mut allocations = Vec::<(NonNull<u8>, usize, u8)>::new();

    for action in actions {
        match action {
            Action::Allocate { size, align_shift } => {
                let size = (size % 4194304) as usize;
                let align_shift = align_shift % 16;
                if let Some(ptr) = heap.allocate_aligned(size, 1 << align_shift) {
                    assert_eq!(ptr.as_ptr().addr() % (1 << align_shift), 0);
                    unsafe { ptr.write_bytes(align_shift, size) };
                    allocations.push((ptr, size, align_shift));
                }
            }
            Action::Deallocate { index } => {
                if let Some(index) = (index as usize).checked_rem(allocations.len()) {
                    let (ptr, size, tag) = allocations.swap_remove(index);
                    check(ptr, size, tag);
                    unsafe { heap.deallocate(ptr) };
                }
            }
            Action::Reallocate { index, size } => {
                if let Some(index) = (index as usize).checked_rem(allocations.len()) {
                    let (ptr, old, tag) = allocations[index];
                    // Reallocation only keeps the default alignment.
                    if tag > 3 {
                        continue;
                    }
                    let size = (size % 4194304) as usize;
                    if let Some(new) = unsafe { heap.reallocate(ptr, size) } {
                        check(new, old.min(size), tag);
                        unsafe { new.write_bytes(tag, size) };
                        allocations[index] = (new, size, tag);
                    }
                }
            }
            Action::Flush => {
                heap.flush();
            }
            Action::Release => {
                cx.release_free_memory();
            }
        }
        assert!(cx.stat().is_balanced());
    }

    for (ptr, size, tag) in allocations {
        check(ptr, size, tag);
        unsafe { heap.deallocate(ptr) };
    }
    heap.flush();
    cx.check().unwrap();
});

fn check(ptr: NonNull<u8>, size: usize, tag: u8) {
    let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
    assert!(bytes.iter().all(|&b| b == tag));
}
