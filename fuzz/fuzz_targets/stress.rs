#![no_main]

use std::{iter, ptr::NonNull, sync::Mutex, thread};

use libfuzzer_sys::{arbitrary::Arbitrary, fuzz_target};
use spanalloc::Spanalloc;

const THREADS: usize = 12;
const TRANSFER_COUNT: usize = 1000;

#[derive(Debug, Arbitrary)]
enum Action {
    Allocate { size: u32, align_shift: u8 },
    Deallocate { index: u8 },
    SizeOf { index: u8 },
    Flush,
    Release,
    Transfer { from: u8, to: u8 },
}

#[global_allocator]
static SPANALLOC: Spanalloc = Spanalloc;

fuzz_target!(|action_sets: [Vec<Action>; THREADS]| {
    let transfers: Vec<_> = iter::repeat_with(|| Mutex::new(None))
        .take(TRANSFER_COUNT)
        .collect();

    thread::scope(|s| {
        for actions in action_sets {
            s.spawn(|| fuzz_one(actions, &transfers));
        }
    });
});

fn fuzz_one(actions: Vec<Action>, transfers: &[Mutex<Option<Allocation>>]) {
    let mut allocations = Vec::new();

    actions.into_iter().for_each(|action| match action {
        Action::Allocate { size, align_shift } => {
            let align_shift = align_shift % 20;
            let size = size % 16777216 + 1;
            if let Some(a) = Allocation::new(size as usize, align_shift) {
                allocations.push(a);
            }
        }
        Action::Deallocate { index } => {
            if let Some(index) = (index as usize).checked_rem(allocations.len()) {
                drop(allocations.swap_remove(index));
            }
        }
        Action::SizeOf { index } => {
            if let Some(index) = (index as usize).checked_rem(allocations.len()) {
                allocations[index].check_size();
            }
        }
        Action::Flush => {
            Spanalloc.flush();
        }
        Action::Release => {
            Spanalloc.release_free_memory();
        }
        Action::Transfer { from, to } => {
            if let Some(from) = (from as usize).checked_rem(allocations.len())
                && let Some(to) = (to as usize).checked_rem(transfers.len())
            {
                let a = allocations.swap_remove(from);
                let o = transfers[to].lock().unwrap().replace(a);
                if let Some(a) = o {
                    allocations.push(a);
                }
            }
        }
    });
}

struct Allocation {
    ptr: NonNull<u8>,
    size: usize,
    align_shift: u8,
}

unsafe impl Send for Allocation {}

impl Allocation {
    fn new(size: usize, align_shift: u8) -> Option<Self> {
        let ptr = Spanalloc.allocate_aligned(size, 1 << align_shift)?;
        assert_eq!(ptr.as_ptr().addr() % (1 << align_shift), 0);
        unsafe { ptr.add(size / 2).write(align_shift) };
        Some(Allocation { ptr, size, align_shift })
    }

    fn check_size(&self) {
        let usable = Spanalloc.allocated_size(self.ptr);
        assert!(
            usable >= self.size,
            "ptr = {:p}, usable = {usable:#x}, size = {:#x}",
            self.ptr,
            self.size
        );
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        assert_eq!(unsafe { self.ptr.add(self.size / 2).read() }, self.align_shift);
        unsafe { Spanalloc.deallocate(self.ptr) };
    }
}
