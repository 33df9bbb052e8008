//! Allocation sampling.
//!
//! The distance between two sampled allocations, in bytes, follows an
//! exponential distribution whose mean is the configured sample parameter.
//! Sampled allocations are served from their own page-granular span, which
//! carries a [`StackTrace`] collected through an optional
//! [`StackCollector`].

use core::sync::atomic::{AtomicU64, Ordering::*};

/// The maximum number of frames recorded per sampled allocation.
pub const MAX_STACK_DEPTH: usize = 31;

/// A function filling the buffer with return addresses of the current call
/// stack, innermost first, and returning the number of frames written.
///
/// The collector runs inside the allocator and must not allocate.
pub type StackCollector = fn(&mut [usize]) -> usize;

/// The record of a sampled allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct StackTrace {
    /// The requested size of the allocation.
    pub size: usize,
    pub depth: usize,
    pub stack: [usize; MAX_STACK_DEPTH],
}

impl StackTrace {
    pub const EMPTY: StackTrace = StackTrace {
        size: 0,
        depth: 0,
        stack: [0; MAX_STACK_DEPTH],
    };

    /// Records a trace for an allocation of `size` bytes.
    pub fn capture(size: usize, collector: Option<StackCollector>) -> Self {
        let mut trace = StackTrace { size, ..Self::EMPTY };
        if let Some(collector) = collector {
            trace.depth = collector(&mut trace.stack).min(MAX_STACK_DEPTH);
        }
        trace
    }

    /// The recorded frames.
    pub fn frames(&self) -> &[usize] {
        &self.stack[..self.depth]
    }
}

impl Default for StackTrace {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// A sampled live allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub address: usize,
    /// The bytes reserved for the allocation.
    pub allocated: usize,
    pub trace: StackTrace,
}

/// The per-heap sampling state.
#[derive(Debug)]
pub struct Sampler {
    bytes_until_sample: usize,
    armed: bool,
    rng: fastrand::Rng,
}

impl Sampler {
    pub fn new() -> Self {
        static SEED: AtomicU64 = AtomicU64::new(0x5bd1_e995);
        let seed = SEED.fetch_add(0x9e37_79b9_7f4a_7c15, Relaxed);
        Sampler {
            bytes_until_sample: 0,
            armed: false,
            rng: fastrand::Rng::with_seed(seed),
        }
    }

    /// Accounts an allocation of `size` bytes and returns whether it should
    /// be sampled, given a mean sampling distance of `mean` bytes.
    #[inline]
    pub fn record_allocation(&mut self, size: usize, mean: usize) -> bool {
        if mean == 0 {
            return false;
        }
        if !self.armed {
            self.armed = true;
            self.bytes_until_sample = self.next_distance(mean);
        }
        if size < self.bytes_until_sample {
            self.bytes_until_sample -= size;
            return false;
        }
        self.bytes_until_sample = self.next_distance(mean);
        true
    }

    fn next_distance(&mut self, mean: usize) -> usize {
        // `1 - [0, 1)` keeps the logarithm finite.
        let q = 1.0 - self.rng.f64();
        let distance = -q.ln() * mean as f64 + 1.0;
        if distance >= (usize::MAX / 2) as f64 {
            usize::MAX / 2
        } else {
            distance as usize
        }
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}
