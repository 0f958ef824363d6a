//! Two-phase thread-count allocation.
//!
//! Phase one works per retained step: each rank's share of the node's cores
//! is proportional to its share of the step's total region time, floored,
//! with two clamps (at least one thread; at most one socket's worth). The
//! cores the floors left over go one at a time to the rank with the largest
//! remainder, smaller current allocation breaking ties; a clamped rank
//! carries a remainder of −1 and never receives leftovers.
//!
//! Phase two averages each rank's per-step counts over the window and runs
//! the same leftover dispatch once more on the averages. The final per-rank
//! count sits in window position 0.
//!
//! The speed-up gate runs before any of this: when the calling rank's
//! per-thread time is within 10% of the node average there is nothing to be
//! gained, and the rebalance is skipped.

use crate::state::RankState;

/// Relative distance from the node-average per-thread time below which a
/// rebalance is not worth its cost.
const REBALANCE_THRESHOLD: f64 = 0.1;

fn step_sum(ranks: &[RankState], step: usize) -> f64 {
    ranks.iter().map(|r| r.counters.elapsed[step]).sum()
}

/// The rank that should receive the next leftover core: largest remainder,
/// then fewest threads, then highest node rank.
fn search_max_delta(ranks: &[RankState], step: usize) -> usize {
    let mut best = 0;

    for candidate in 1..ranks.len() {
        let best_delta = ranks[best].counters.delta[step];
        let best_threads = ranks[best].counters.num_threads[step];

        let delta = ranks[candidate].counters.delta[step];

        if delta < best_delta {
            continue;
        }

        if delta > best_delta {
            best = candidate;
            continue;
        }

        if ranks[candidate].counters.num_threads[step] > best_threads {
            continue;
        }

        best = candidate;
    }

    best
}

/// Phase-one proportional pass for one step. Returns the cores allocated.
pub(crate) fn compute_step_counters(
    ranks: &mut [RankState],
    step: usize,
    num_cores: i32,
    cores_per_socket: i32,
) -> i32 {
    let sum = step_sum(ranks, step);
    let mut allocated = 0;

    for rank in ranks.iter_mut() {
        let want = if sum > 0.0 {
            (rank.counters.elapsed[step] / sum) * f64::from(num_cores)
        } else {
            0.0
        };

        let mut num_threads = want.floor() as i32;
        let mut delta = want - f64::from(num_threads);

        if num_threads == 0 {
            num_threads = 1;
            delta = 0.0;
        }

        if num_threads > cores_per_socket {
            num_threads = cores_per_socket;
            delta = -1.0;
        }

        rank.counters.num_threads[step] = num_threads;
        rank.counters.delta[step] = delta;

        allocated += num_threads;
    }

    allocated
}

/// Hands `remaining` extra cores to the ranks with the largest remainders.
pub(crate) fn dispatch_leftover(
    ranks: &mut [RankState],
    step: usize,
    remaining: i32,
    cores_per_socket: i32,
) {
    for _ in 0..remaining.max(0) {
        let idx = search_max_delta(ranks, step);

        let num_threads = ranks[idx].counters.num_threads[step] + 1;
        debug_assert!(num_threads <= cores_per_socket);

        ranks[idx].counters.delta[step] = if num_threads >= cores_per_socket {
            -1.0
        } else {
            0.0
        };
        ranks[idx].counters.num_threads[step] = num_threads;
    }
}

/// Runs phase one over every step of the window.
pub(crate) fn compute_window_counters(
    ranks: &mut [RankState],
    window: usize,
    num_cores: i32,
    cores_per_socket: i32,
) {
    for step in 0..window {
        let allocated = compute_step_counters(ranks, step, num_cores, cores_per_socket);
        dispatch_leftover(ranks, step, num_cores - allocated, cores_per_socket);
    }
}

/// Phase two: averages the window into position 0 and dispatches the
/// remainder there. The final per-rank count is `num_threads[0]`.
pub(crate) fn average_window_counters(
    ranks: &mut [RankState],
    window: usize,
    num_cores: i32,
    cores_per_socket: i32,
) {
    let mut allocated = 0;

    for rank in ranks.iter_mut() {
        let avg = rank.counters.num_threads[..window]
            .iter()
            .map(|&n| f64::from(n))
            .sum::<f64>()
            / window as f64;

        let num_threads = avg.floor() as i32;
        let mut delta = avg - f64::from(num_threads);

        if num_threads == cores_per_socket {
            delta = -1.0;
        }

        assert!(
            num_threads >= 1 && num_threads <= cores_per_socket,
            "windowed thread count {num_threads} for rank {} outside [1, {cores_per_socket}]",
            rank.node_rank
        );

        rank.counters.num_threads[0] = num_threads;
        rank.counters.delta[0] = delta;

        allocated += num_threads;
    }

    dispatch_leftover(ranks, 0, num_cores - allocated, cores_per_socket);
}

/// Whether the calling rank's per-thread time is already close enough to the
/// node average that rebalancing is not worthwhile.
pub(crate) fn speedup_within_threshold(
    ranks: &[RankState],
    own_index: usize,
    window: usize,
) -> bool {
    let mut total_threads = 0;
    let mut total_time = 0.0;

    for rank in ranks {
        total_threads += rank.num_threads;
        total_time += rank.counters.elapsed[..window].iter().sum::<f64>();
    }

    let own = &ranks[own_index];
    let own_threads = own.num_threads;
    let own_time: f64 = own.counters.elapsed[..window].iter().sum();

    let gain_total = total_time / f64::from(total_threads);
    let gain_own = own_time / f64::from(own_threads);

    (gain_total - gain_own).abs() < gain_total * REBALANCE_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranks_with_elapsed(window: usize, num_threads: i32, elapsed: &[f64]) -> Vec<RankState> {
        elapsed
            .iter()
            .enumerate()
            .map(|(i, &t)| {
                let mut rank = RankState::new(window, i as i32, i as i32, num_threads);
                rank.counters.elapsed[0] = t;
                rank
            })
            .collect()
    }

    fn final_counts(ranks: &[RankState]) -> Vec<i32> {
        ranks.iter().map(|r| r.counters.num_threads[0]).collect()
    }

    #[test]
    fn exact_proportional_split() {
        // 8 cores over times 3:3:1:1 divides without remainder.
        let mut ranks = ranks_with_elapsed(1, 2, &[3.0, 3.0, 1.0, 1.0]);

        compute_window_counters(&mut ranks, 1, 8, 4);
        average_window_counters(&mut ranks, 1, 8, 4);

        assert_eq!(final_counts(&ranks), vec![3, 3, 1, 1]);
    }

    #[test]
    fn dominant_rank_is_capped_at_one_socket() {
        // 3:1 would give the first rank 6 of 8 cores, more than a socket
        // holds; the cap pushes the surplus to the other rank.
        let mut ranks = ranks_with_elapsed(1, 4, &[3.0, 1.0]);

        compute_window_counters(&mut ranks, 1, 8, 4);
        average_window_counters(&mut ranks, 1, 8, 4);

        assert_eq!(final_counts(&ranks), vec![4, 4]);
    }

    #[test]
    fn starved_ranks_get_at_least_one_thread() {
        let mut ranks = ranks_with_elapsed(1, 2, &[100.0, 0.01, 0.01, 0.01]);

        compute_window_counters(&mut ranks, 1, 8, 4);
        average_window_counters(&mut ranks, 1, 8, 4);

        let counts = final_counts(&ranks);
        assert!(counts.iter().all(|&n| n >= 1));
        assert_eq!(counts[0], 4);
        assert_eq!(counts.iter().sum::<i32>(), 8);
    }

    #[test]
    fn leftovers_go_to_the_largest_remainder() {
        // 16 cores, times 5:3 want 10 and 6; the cap cuts the first rank to
        // 8 and the leftover dispatch fills the second up to its own cap.
        let mut ranks = ranks_with_elapsed(1, 8, &[5.0, 3.0]);

        compute_window_counters(&mut ranks, 1, 16, 8);
        average_window_counters(&mut ranks, 1, 16, 8);

        assert_eq!(final_counts(&ranks), vec![8, 8]);
    }

    #[test]
    fn equal_remainders_favor_the_smaller_allocation() {
        // 9 cores over 2:2:1: wants are 3.6, 3.6, 1.8 -> floors 3, 3, 1
        // leave two cores. Remainders are 0.6, 0.6, 0.8: the third rank is
        // first, then the tie between equal remainders 0.6/0.6 resolves to
        // the later rank (equal thread counts).
        let mut ranks = ranks_with_elapsed(1, 3, &[2.0, 2.0, 1.0]);

        compute_window_counters(&mut ranks, 1, 9, 9);

        let counts: Vec<i32> = ranks.iter().map(|r| r.counters.num_threads[0]).collect();
        assert_eq!(counts.iter().sum::<i32>(), 9);
        assert_eq!(counts[2], 2);
    }

    #[test]
    fn window_average_floors_and_redistributes() {
        let mut ranks = vec![
            RankState::new(2, 0, 0, 4),
            RankState::new(2, 1, 1, 4),
        ];

        // Step counts straight from two earlier phase-one passes.
        ranks[0].counters.num_threads.copy_from_slice(&[5, 4]);
        ranks[1].counters.num_threads.copy_from_slice(&[3, 4]);

        average_window_counters(&mut ranks, 2, 8, 8);

        // Averages 4.5 and 3.5 floor to 4 and 3; the leftover core goes to
        // the larger remainder... both are 0.5, so to the smaller count.
        assert_eq!(final_counts(&ranks), vec![4, 4]);
    }

    #[test]
    fn zero_total_time_degrades_to_one_thread_each() {
        let mut ranks = ranks_with_elapsed(1, 2, &[0.0, 0.0]);

        let allocated = compute_step_counters(&mut ranks, 0, 8, 4);
        assert_eq!(allocated, 2);
        assert!(ranks.iter().all(|r| r.counters.num_threads[0] == 1));
    }

    #[test]
    fn gate_skips_when_the_caller_matches_the_average() {
        // Both ranks: 2.0 over 4 threads -> 0.5 per thread everywhere.
        let mut ranks = ranks_with_elapsed(1, 4, &[2.0, 2.0]);
        ranks[1].counters.elapsed[0] = 2.0;

        assert!(speedup_within_threshold(&ranks, 0, 1));
    }

    #[test]
    fn gate_fires_on_imbalance() {
        let ranks = ranks_with_elapsed(1, 4, &[3.0, 1.0]);

        assert!(!speedup_within_threshold(&ranks, 0, 1));
    }
}
