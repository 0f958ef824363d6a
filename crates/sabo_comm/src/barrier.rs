//! Two-phase generation-counter barrier over shared memory.
//!
//! The shared state is two counters. `gen_id` is the generation the group has
//! collectively reached; `nwriters` counts arrivals within the current
//! generation. Each participant keeps a private `expected_gen` mirror.
//!
//! A checkpoint is `arrive` followed (by callers that need the release) by
//! `wait`: the last arriver of a generation resets `nwriters` and advances
//! `gen_id`, and every participant advances its private mirror. `wait` spins
//! until the shared generation catches up with the mirror. Spinning uses the
//! CPU relax hint and never yields; the exchange is on the application's
//! critical path and a round is expected to take microseconds.
//!
//! Payload visibility rides on the generation counter alone: writers publish
//! with the release `fetch_add`s and readers observe through the acquire load
//! in `wait`. The reset of `nwriters` needs no ordering of its own because no
//! rank touches it again before observing the new generation.

use std::hint;
use std::sync::atomic::{AtomicU32, Ordering};

/// The two shared counters, mapped into every participant.
#[derive(Debug)]
#[repr(C)]
pub struct BarrierCells {
    /// Generation the group has reached.
    pub(crate) gen_id: AtomicU32,
    /// Arrivals within the current generation.
    pub(crate) nwriters: AtomicU32,
}

impl BarrierCells {
    /// Fresh cells at generation zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            gen_id: AtomicU32::new(0),
            nwriters: AtomicU32::new(0),
        }
    }
}

impl Default for BarrierCells {
    fn default() -> Self {
        Self::new()
    }
}

/// One participant's view of the barrier.
#[derive(Debug, Default)]
pub struct GenerationBarrier {
    expected_gen: u32,
}

impl GenerationBarrier {
    /// A participant expecting generation zero next.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spins until the shared generation reaches this participant's mirror.
    pub fn wait(&self, cells: &BarrierCells) {
        while cells.gen_id.load(Ordering::Acquire) != self.expected_gen {
            hint::spin_loop();
        }
    }

    /// Registers this participant's arrival at the current checkpoint.
    ///
    /// The arrival that completes the group resets the arrival counter and
    /// advances the shared generation. Every caller advances its mirror.
    pub fn arrive(&mut self, cells: &BarrierCells, group_size: u32) {
        let arrival = cells.nwriters.fetch_add(1, Ordering::AcqRel);

        if arrival == group_size - 1 {
            cells.nwriters.store(0, Ordering::Relaxed);
            cells.gen_id.fetch_add(1, Ordering::Release);
        }

        self.expected_gen = self.expected_gen.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;

    fn run_rounds(group_size: u32, rounds: u32) {
        let cells = Arc::new(BarrierCells::new());

        let handles: Vec<_> = (0..group_size)
            .map(|_| {
                let cells = Arc::clone(&cells);

                thread::spawn(move || {
                    let mut barrier = GenerationBarrier::new();

                    for _ in 0..rounds {
                        barrier.arrive(&cells, group_size);
                        barrier.wait(&cells);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cells.gen_id.load(Ordering::Acquire), rounds);
        assert_eq!(cells.nwriters.load(Ordering::Acquire), 0);
    }

    #[test]
    fn single_participant_never_blocks() {
        run_rounds(1, 100_000);
    }

    #[test]
    fn two_participants_in_lockstep() {
        run_rounds(2, 100_000);
    }

    #[test]
    fn four_participants() {
        run_rounds(4, 10_000);
    }

    // Larger groups oversubscribe small CI machines; spinning under
    // preemption stretches each round, so the counts shrink.
    #[test]
    fn eight_participants() {
        run_rounds(8, 2_000);
    }

    #[test]
    fn sixteen_participants() {
        run_rounds(16, 500);
    }

    #[test]
    fn generation_advances_once_per_round() {
        let cells = BarrierCells::new();
        let mut barrier = GenerationBarrier::new();

        for round in 1..=3u32 {
            barrier.arrive(&cells, 1);
            barrier.wait(&cells);
            assert_eq!(cells.gen_id.load(Ordering::Acquire), round);
        }
    }
}
