use std::{collections::HashMap, sync::mpsc, thread};

use spanalloc::Spanalloc;

#[global_allocator]
static ALLOC: Spanalloc = Spanalloc;

#[ctor::ctor]
fn init() {
    // A small budget makes the thread caches scavenge often.
    Spanalloc.context().set_max_thread_cache_bytes(64 << 10);
}

#[test]
fn threads() {
    let (tx, rx) = mpsc::channel::<Vec<Box<[u8]>>>();

    let workers = (0..8u8)
        .map(|id| {
            let tx = tx.clone();
            thread::spawn(move || {
                let mut rng = fastrand::Rng::with_seed(id.into());
                let mut map = HashMap::new();
                for i in 0..20_000u32 {
                    map.insert(i, vec![id; rng.usize(..512)]);
                    if i % 3 == 0 {
                        map.remove(&(i / 2));
                    }
                }
                assert!(map.values().all(|v| v.iter().all(|&b| b == id)));

                // Freed on another thread.
                let boxes = (0..1000)
                    .map(|n| vec![id; n % 300 + 1].into_boxed_slice())
                    .collect();
                tx.send(boxes).unwrap();

                let big = vec![id; 3 << 20];
                assert_eq!(big[big.len() - 1], id);
                Spanalloc.flush()
            })
        })
        .collect::<Vec<_>>();
    drop(tx);

    let mut received = 0;
    for boxes in rx {
        assert!(boxes.iter().all(|b| b.iter().all(|&x| x == b[0])));
        received += boxes.len();
    }
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(received, 8000);

    let mut v = Vec::<u64>::with_capacity(1);
    for i in 0..100_000 {
        v.push(i);
    }
    assert_eq!(v.iter().sum::<u64>(), 99_999 * 100_000 / 2);
    drop(v);

    let aligned = Box::new(Aligned([7; 4096]));
    assert_eq!(std::ptr::from_ref(&*aligned).addr() % 4096, 0);
    drop(aligned);

    Spanalloc.flush();
    Spanalloc.release_free_memory();
    let stat = Spanalloc.stat();
    assert!(stat.is_balanced(), "{stat}");
    Spanalloc.context().check().unwrap();
}

#[repr(align(4096))]
struct Aligned([u8; 4096]);
