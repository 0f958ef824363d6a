//! Per-thread time accounting for parallel regions.
//!
//! The host runtime's tool layer reports three events: a parallel region
//! begins (master thread), a parallel region ends (master thread), and a
//! thread enters a synchronization region. From those the probe attributes
//! wall time to individual threads since the last reset:
//!
//! - the master's time for the region is `end - begin`, recorded in slot 0;
//! - a worker waiting at a region-closing barrier (the runtime reports its
//!   state as overhead) has been busy from region begin until it hit the
//!   barrier, so `now - begin` accumulates into its slot. Slot 0 is skipped
//!   there; the master is already accounted for.
//!
//! Each slot has a single writer (its own thread), so plain atomic
//! load/store pairs on the `f64` bit patterns are enough; the engine only
//! reads the slots between regions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use derive_more::Display;

/// Kind of synchronization region a thread entered.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum SyncRegionKind {
    /// An explicit barrier.
    Barrier,
    /// The implicit barrier closing a parallel region.
    BarrierImplicit,
    /// Any other synchronization construct; not accounted.
    Other,
}

impl SyncRegionKind {
    fn is_barrier(self) -> bool {
        matches!(self, Self::Barrier | Self::BarrierImplicit)
    }
}

/// What the runtime says a thread is doing at the event.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Waiting inside the runtime, not doing useful work.
    Overhead,
    /// Anything else.
    Working,
}

/// Accumulated per-thread region times since the last reset.
#[derive(Debug)]
pub struct RegionProbe {
    origin: Instant,
    start: AtomicU64,
    num_regions: AtomicU64,
    elapsed: Vec<AtomicU64>,
}

fn load_f64(cell: &AtomicU64) -> f64 {
    f64::from_bits(cell.load(Ordering::Relaxed))
}

fn store_f64(cell: &AtomicU64, value: f64) {
    cell.store(value.to_bits(), Ordering::Relaxed);
}

impl RegionProbe {
    /// A probe with one time slot per possible team thread.
    #[must_use]
    pub fn new(num_slots: usize) -> Self {
        Self {
            origin: Instant::now(),
            start: AtomicU64::new(0),
            num_regions: AtomicU64::new(0),
            elapsed: (0..num_slots).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Monotonic seconds since the probe was created.
    #[must_use]
    pub fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    /// Number of parallel regions observed since creation.
    #[must_use]
    pub fn num_regions(&self) -> u64 {
        self.num_regions.load(Ordering::Relaxed)
    }

    /// Parallel region begins; master thread only.
    pub fn parallel_begin(&self) {
        store_f64(&self.start, self.now());
        self.num_regions.fetch_add(1, Ordering::Relaxed);
    }

    /// Parallel region ends; master thread only. Records the master's time
    /// for the region in slot 0.
    pub fn parallel_end(&self) {
        let elapsed = self.now() - load_f64(&self.start);

        if let Some(slot) = self.elapsed.first() {
            store_f64(slot, elapsed);
        }
    }

    /// A thread entered a synchronization region.
    ///
    /// Only region-closing barriers reached in the overhead state contribute,
    /// and only for workers: slot 0 is charged through [`Self::parallel_end`].
    pub fn sync_region(&self, kind: SyncRegionKind, state: ThreadState, thread_index: usize) {
        if !kind.is_barrier() || state != ThreadState::Overhead {
            return;
        }

        if thread_index == 0 {
            return;
        }

        let Some(slot) = self.elapsed.get(thread_index) else {
            return;
        };

        let busy = self.now() - load_f64(&self.start);
        store_f64(slot, load_f64(slot) + busy);
    }

    /// Sum of all thread slots since the last reset.
    #[must_use]
    pub fn total(&self) -> f64 {
        self.elapsed.iter().map(load_f64).sum()
    }

    /// Clears every thread slot.
    pub fn reset(&self) {
        for slot in &self.elapsed {
            store_f64(slot, 0.0);
        }
    }
}
