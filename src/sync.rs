//! The spin lock guarding every shared structure of the allocator.

use core::{
    hint,
    sync::atomic::{AtomicBool, Ordering::*},
};
use std::thread;

use parking_lot::lock_api::{self, GuardSend, RawMutex};

/// A test-and-test-and-set lock for very short critical sections.
///
/// Contended acquisitions spin for a bounded number of rounds and then yield
/// to the OS scheduler between attempts. The lock is not reentrant: locking
/// it twice from the same thread deadlocks.
///
/// There is no poisoning. A panicking holder releases the lock while its
/// guard unwinds, and the protected data is left as the holder left it.
pub struct RawSpinLock {
    locked: AtomicBool,
}

impl RawSpinLock {
    const SPIN_LIMIT: u32 = 64;

    #[cold]
    fn lock_slow(&self) {
        let mut spins = 0;
        loop {
            while self.locked.load(Relaxed) {
                if spins < Self::SPIN_LIMIT {
                    spins += 1;
                    hint::spin_loop();
                } else {
                    thread::yield_now();
                }
            }
            if self.try_lock() {
                return;
            }
        }
    }
}

unsafe impl RawMutex for RawSpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = RawSpinLock {
        locked: AtomicBool::new(false),
    };

    type GuardMarker = GuardSend;

    fn lock(&self) {
        if !self.try_lock() {
            self.lock_slow()
        }
    }

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange_weak(false, true, Acquire, Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.locked.store(false, Release)
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Relaxed)
    }
}

pub type SpinLock<T> = lock_api::Mutex<RawSpinLock, T>;
pub type SpinLockGuard<'a, T> = lock_api::MutexGuard<'a, RawSpinLock, T>;

/// Creates a spin lock in a constant context.
pub const fn spin_lock<T>(value: T) -> SpinLock<T> {
    SpinLock::const_new(RawSpinLock::INIT, value)
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, vec::Vec};

    use super::*;

    #[test]
    fn exclusive() {
        let lock = Arc::new(spin_lock(0usize));
        let threads = (0..8)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    for _ in 0..10000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect::<Vec<_>>();
        threads.into_iter().for_each(|t| t.join().unwrap());
        assert_eq!(*lock.lock(), 80000);
    }

    #[test]
    fn unlocked_section() {
        let lock = spin_lock(1);
        let mut guard = lock.lock();
        SpinLockGuard::unlocked(&mut guard, || assert!(lock.try_lock().is_some()));
        *guard += 1;
        drop(guard);
        assert_eq!(*lock.lock(), 2);
    }

    #[test]
    fn released_on_panic() {
        let lock = spin_lock(());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = lock.lock();
            panic!("holder failed");
        }));
        assert!(result.is_err());
        assert!(!lock.is_locked());
    }
}
