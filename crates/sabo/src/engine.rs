//! The rebalance engine.
//!
//! One [`Balancer`] lives in each rank of the job. At every step boundary the
//! application (or the tool probe, in implicit mode) calls
//! [`Balancer::balanced`]; the engine folds the probe's per-thread times into
//! its step window and, when the gate opens, runs the full pipeline:
//! exchange the window with the node peers, recompute every rank's thread
//! count, solve the socket placement, and rebind its own team.
//!
//! Everything runs on the team's master thread. Peer coordination happens
//! only inside the transport's collective exchange, which every rank must
//! reach at the same logical step.
//!
//! The entry point never reports errors: fatal conditions abort the process
//! after logging a diagnostic, recoverable ones are logged and skipped.

use std::process;
use std::sync::Arc;

use sabo_comm::Transport;
use sabo_topology::{BindSlot, TeamRebind, Topology};

use crate::allocator;
use crate::config::{Config, DebugMask};
use crate::placement::{PlacementRequest, PlacementSolver};
use crate::probe::RegionProbe;
use crate::state::{RankState, SocketBucket, StepWindow};

/// Rebalance calls cheaper than this are not worth a perf log line.
const PRINT_THRESHOLD: f64 = 1e-5;

/// Whether step `step` (0-indexed) is one the engine computes on.
///
/// The window must be full (`step + 1 > window`) and the step must match the
/// configured period: every `period` steps when periodic, exactly at step
/// `period` otherwise.
pub(crate) fn rebalance_due(step: i32, period: i32, periodic: bool, window: usize) -> bool {
    let trigger = if periodic {
        (step + 1) % period == 0
    } else {
        step == period
    };

    trigger && step + 1 > window as i32
}

/// Node-wide balance state, built lazily on the first gated step with an
/// initialized transport.
struct NodeState {
    node_rank: usize,
    node_size: usize,
    ranks: Vec<RankState>,
    sockets: Vec<SocketBucket>,
    /// Per-thread binding plan for this rank's own team.
    bindings: Vec<BindSlot>,
    /// First-core index applied by the previous rebalance, for the
    /// short-circuit.
    prev_first_core: i32,
    solver: PlacementSolver,
    send_buf: Vec<f64>,
    recv_buf: Vec<f64>,
}

/// The per-process rebalance engine.
pub struct Balancer {
    config: Config,
    topology: Topology,
    probe: Arc<RegionProbe>,
    transport: Option<Box<dyn Transport + Send>>,
    binder: Box<dyn TeamRebind + Send>,

    step: i32,
    window: usize,
    /// Own observations accumulated before the transport comes up.
    pending: StepWindow,
    node: Option<NodeState>,

    cumulate_elapsed: f64,
    exchange_elapsed: f64,
}

fn fatal(message: std::fmt::Arguments<'_>) -> ! {
    log::error!(target: "sabo::core", "{message}");
    process::abort();
}

impl Balancer {
    /// Creates an engine for this process.
    ///
    /// `binder` is the runtime primitive that moves the team's threads; it is
    /// invoked only when a rebalance actually changes this rank's binding.
    pub fn new(config: Config, topology: Topology, binder: Box<dyn TeamRebind + Send>) -> Self {
        let window = config.num_steps_exchanged;
        let probe = Arc::new(RegionProbe::new(topology.num_cores() as usize));

        Self {
            config,
            topology,
            probe,
            transport: None,
            binder,
            step: 0,
            window,
            pending: StepWindow::new(window),
            node: None,
            cumulate_elapsed: 0.0,
            exchange_elapsed: 0.0,
        }
    }

    /// The probe this engine reads its per-thread times from.
    #[must_use]
    pub fn probe(&self) -> Arc<RegionProbe> {
        Arc::clone(&self.probe)
    }

    /// The configuration the engine was built with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Steps observed so far.
    #[must_use]
    pub fn step(&self) -> i32 {
        self.step
    }

    /// Attaches the node transport. Until one is attached (and reports
    /// itself initialized), steps are observed but never exchanged.
    pub fn install_transport(&mut self, transport: Box<dyn Transport + Send>) {
        self.transport = Some(transport);
    }

    /// The rebalance point: called once per step from the team's master
    /// thread.
    pub fn balanced(&mut self) {
        let start = self.probe.now();

        self.gather_probe_counters();

        let transport_ready = self
            .transport
            .as_ref()
            .is_some_and(|t| t.is_initialized());

        if transport_ready
            && rebalance_due(
                self.step,
                self.config.step_balancing,
                self.config.periodic,
                self.window,
            )
        {
            self.ensure_node_state();
            self.exchange_step_data();

            // Every rank has participated in the collective by now; skipping
            // from here on is safe even if peers decide differently.
            if self.own_speedup_within_threshold() {
                if self.config.debug(DebugMask::CORE) {
                    log::debug!(
                        target: "sabo::core",
                        "step {}: per-thread cost close to node average, keeping placement",
                        self.step
                    );
                }
            } else {
                self.recompute_thread_distribution();
                self.compute_placement();
                self.dispatch_to_sockets();
                self.adjust_socket_capacity();
                self.apply_own_placement();
            }
        }

        self.step += 1;
        self.probe.reset();

        let elapsed = self.probe.now() - start;
        self.cumulate_elapsed += elapsed;

        if elapsed > PRINT_THRESHOLD && self.config.debug(DebugMask::PERF) {
            log::debug!(
                target: "sabo::perf",
                "rebalance point took {:.3} usec ({:.6} s cumulative)",
                elapsed * 1e6,
                self.cumulate_elapsed
            );
        }
    }

    /// Tears down node state and the transport; the shared segment owner
    /// cleans up on drop.
    pub fn finalize(&mut self) {
        if self.config.debug(DebugMask::PERF) {
            log::debug!(
                target: "sabo::perf",
                "rebalancing spent {:.6} s total (exchange {:.6} s, compute {:.6} s) over {} region(s)",
                self.cumulate_elapsed,
                self.exchange_elapsed,
                self.cumulate_elapsed - self.exchange_elapsed,
                self.probe.num_regions()
            );
        }

        self.node = None;
        self.transport = None;
    }

    /// Folds the probe's accumulated thread times into the current window
    /// slot, together with the thread count they were measured under.
    fn gather_probe_counters(&mut self) {
        let slot = (self.step as usize) % self.window;
        let total = self.probe.total();

        match &mut self.node {
            Some(node) => {
                let me = node.node_rank;
                let current = node.ranks[me].num_threads;
                node.ranks[me].counters.elapsed[slot] = total;
                node.ranks[me].counters.num_threads[slot] = current;
            }
            None => {
                self.pending.elapsed[slot] = total;
                self.pending.num_threads[slot] = self.config.omp_num_threads;
            }
        }
    }

    fn ensure_node_state(&mut self) {
        if self.node.is_some() {
            return;
        }

        let transport = self
            .transport
            .as_mut()
            .expect("caller gates on an attached transport");

        let node_rank = transport.node_rank() as usize;
        let node_size = transport.node_size() as usize;
        let window = self.window;

        let mut ranks = Vec::with_capacity(node_size);

        for i in 0..node_size {
            let world_rank = transport.world_rank_from_node_rank(i as i32);
            ranks.push(RankState::new(
                window,
                i as i32,
                world_rank,
                self.config.omp_num_threads,
            ));
        }

        // Carry over what this rank observed before the transport was up.
        let own = &mut ranks[node_rank];
        own.counters.elapsed.copy_from_slice(&self.pending.elapsed);
        own.counters
            .num_threads
            .copy_from_slice(&self.pending.num_threads);

        let num_sockets = self.topology.num_sockets() as usize;

        if self.config.debug(DebugMask::CORE) {
            log::debug!(
                target: "sabo::core",
                "node state up at step {}: rank {node_rank}/{node_size}, {num_sockets} socket(s)",
                self.step
            );
        }

        self.node = Some(NodeState {
            node_rank,
            node_size,
            ranks,
            sockets: vec![SocketBucket::default(); num_sockets],
            bindings: vec![BindSlot::unbound(); self.topology.num_cores() as usize],
            prev_first_core: -1,
            solver: PlacementSolver::new(
                num_sockets,
                self.topology.num_cores_per_socket(),
                node_size,
            ),
            send_buf: vec![0.0; window],
            recv_buf: vec![0.0; window * node_size],
        });
    }

    /// Exchanges the elapsed and thread-count windows with the node peers
    /// and scatters the mirrors into the per-rank states.
    fn exchange_step_data(&mut self) {
        let start = self.probe.now();
        let window = self.window;

        let (Some(node), Some(transport)) = (&mut self.node, &mut self.transport) else {
            return;
        };

        let me = node.node_rank;

        node.send_buf
            .copy_from_slice(&node.ranks[me].counters.elapsed);
        transport.allgather(&node.send_buf, &mut node.recv_buf);

        for (i, rank) in node.ranks.iter_mut().enumerate() {
            rank.counters
                .elapsed
                .copy_from_slice(&node.recv_buf[i * window..(i + 1) * window]);
        }

        // Thread counts travel as doubles; widen on send, narrow on receive.
        for (slot, &count) in node
            .send_buf
            .iter_mut()
            .zip(&node.ranks[me].counters.num_threads)
        {
            *slot = f64::from(count);
        }
        transport.allgather(&node.send_buf, &mut node.recv_buf);

        for (i, rank) in node.ranks.iter_mut().enumerate() {
            for (slot, &value) in rank
                .counters
                .num_threads
                .iter_mut()
                .zip(&node.recv_buf[i * window..(i + 1) * window])
            {
                *slot = value as i32;
            }
        }

        self.exchange_elapsed += self.probe.now() - start;
    }

    fn own_speedup_within_threshold(&self) -> bool {
        let node = self.node.as_ref().expect("node state ensured");

        allocator::speedup_within_threshold(&node.ranks, node.node_rank, self.window)
    }

    /// Runs both allocator phases, then promotes the result to each rank's
    /// requested thread count (keeping the previous values for migration
    /// minimization and the short-circuit).
    fn recompute_thread_distribution(&mut self) {
        let num_cores = self.topology.num_cores();
        let cores_per_socket = self.topology.num_cores_per_socket();
        let window = self.window;

        let node = self.node.as_mut().expect("node state ensured");

        allocator::compute_window_counters(&mut node.ranks, window, num_cores, cores_per_socket);
        allocator::average_window_counters(&mut node.ranks, window, num_cores, cores_per_socket);

        for rank in &mut node.ranks {
            rank.prev_num_threads = rank.num_threads;
            rank.num_threads = rank.counters.num_threads[0];
            rank.prev_socket_id = rank.socket_id;
        }
    }

    fn compute_placement(&mut self) {
        let node = self.node.as_mut().expect("node state ensured");

        let requests: Vec<PlacementRequest> = node
            .ranks
            .iter()
            .map(|rank| PlacementRequest {
                node_rank: rank.node_rank,
                num_threads: rank.num_threads,
                prev_socket_id: rank.prev_socket_id,
            })
            .collect();

        match node.solver.solve(&requests) {
            Ok(placement) => {
                for (rank, &socket) in node.ranks.iter_mut().zip(&placement.socket_of_rank) {
                    rank.socket_id = socket;
                }

                if self.config.debug(DebugMask::PLACEMENT) {
                    log::debug!(
                        target: "sabo::placement",
                        "step {}: placement norm {} with {} socket change(s)",
                        self.step,
                        placement.norm,
                        placement.num_socket_changes
                    );
                }
            }
            Err(err) => {
                log::error!(
                    target: "sabo::placement",
                    "{err}: {} socket(s) x {} core(s) for {} rank(s)",
                    self.topology.num_sockets(),
                    self.topology.num_cores_per_socket(),
                    node.node_size
                );

                for rank in &node.ranks {
                    log::error!(
                        target: "sabo::placement",
                        "rank #{} wants {} thread(s)",
                        rank.node_rank,
                        rank.num_threads
                    );
                }

                fatal(format_args!("failed to compute a socket assignment"));
            }
        }
    }

    /// Rebuilds the per-socket buckets from the fresh assignment, lightest
    /// ranks first.
    fn dispatch_to_sockets(&mut self) {
        let cores_per_socket = self.topology.num_cores_per_socket();
        let node = self.node.as_mut().expect("node state ensured");

        for bucket in &mut node.sockets {
            bucket.num_free_cores = cores_per_socket;
            bucket.ranks.clear();
        }

        for (i, rank) in node.ranks.iter().enumerate() {
            debug_assert!(rank.socket_id >= 0 && (rank.socket_id as usize) < node.sockets.len());

            let bucket = &mut node.sockets[rank.socket_id as usize];
            bucket.num_free_cores -= rank.num_threads;
            bucket.ranks.push(i);
        }

        for bucket in &mut node.sockets {
            bucket
                .ranks
                .sort_by_key(|&i| (node.ranks[i].num_threads, node.ranks[i].node_rank));
        }
    }

    /// Restores the per-socket sum invariant if earlier steps drifted: shed
    /// threads round-robin while a socket is over capacity (never below
    /// one), hand out spares while under.
    fn adjust_socket_capacity(&mut self) {
        let node = self.node.as_mut().expect("node state ensured");

        for bucket in &mut node.sockets {
            if bucket.ranks.is_empty() {
                continue;
            }

            while bucket.num_free_cores < 0 {
                let mut progressed = false;

                for &i in &bucket.ranks {
                    if bucket.num_free_cores >= 0 {
                        break;
                    }

                    if node.ranks[i].num_threads == 1 {
                        continue;
                    }

                    node.ranks[i].num_threads -= 1;
                    bucket.num_free_cores += 1;
                    progressed = true;
                }

                if !progressed {
                    break;
                }
            }

            while bucket.num_free_cores > 0 {
                for &i in &bucket.ranks {
                    if bucket.num_free_cores == 0 {
                        break;
                    }

                    node.ranks[i].num_threads += 1;
                    bucket.num_free_cores -= 1;
                }
            }
        }
    }

    /// Applies the new placement to this rank's own team: deterministic
    /// per-socket ordering, first-core prefix sum, short-circuit when
    /// nothing moved, then the rebind call.
    fn apply_own_placement(&mut self) {
        let node = self.node.as_mut().expect("node state ensured");
        let me = node.node_rank;
        let socket_id = node.ranks[me].socket_id;

        let bucket = &mut node.sockets[socket_id as usize];
        bucket.ranks.sort_by_key(|&i| node.ranks[i].node_rank);

        let mut first_core = 0;

        for &i in &bucket.ranks {
            if i == me {
                break;
            }
            first_core += node.ranks[i].num_threads;
        }

        let own = &node.ranks[me];

        if self.config.debug(DebugMask::CORE) {
            log::debug!(
                target: "sabo::core",
                "rank {}/{} (world #{}) on socket #{socket_id}: {} thread(s) from local core {first_core} (had {})",
                own.node_rank,
                node.node_size,
                own.world_rank,
                own.num_threads,
                own.prev_num_threads
            );
        }

        if own.num_threads == own.prev_num_threads
            && socket_id == own.prev_socket_id
            && node.prev_first_core == first_core
        {
            if self.config.debug(DebugMask::CORE) {
                log::debug!(target: "sabo::core", "placement unchanged, nothing to do");
            }
            return;
        }

        let team_size = own.num_threads as usize;

        for i in 0..team_size {
            match self.topology.socket_core_id(socket_id, first_core + i as i32) {
                Ok(core) => node.bindings[i].new_core_id = core,
                Err(err) => fatal(format_args!("placement outside the topology: {err}")),
            }
        }

        node.prev_first_core = first_core;

        if !self.config.no_rebalance {
            self.binder.rebind(&mut node.bindings[..team_size]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullRebind;

    impl TeamRebind for NullRebind {
        fn rebind(&self, _slots: &mut [BindSlot]) {}
    }

    fn config(pairs: &[(&str, &str)]) -> Config {
        let owned: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        Config::from_lookup(move |key| {
            owned
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        })
        .unwrap()
    }

    #[test]
    fn one_shot_gate_fires_exactly_at_the_period() {
        for step in 0..10 {
            assert_eq!(rebalance_due(step, 4, false, 1), step == 4);
        }
    }

    #[test]
    fn periodic_gate_fires_every_period() {
        let due: Vec<i32> = (0..13).filter(|&k| rebalance_due(k, 4, true, 1)).collect();

        assert_eq!(due, vec![3, 7, 11]);
    }

    #[test]
    fn gate_waits_for_a_full_window() {
        // Period 1, periodic: every step triggers, but the window holds
        // three steps, so nothing runs before step 3.
        let due: Vec<i32> = (0..6).filter(|&k| rebalance_due(k, 1, true, 3)).collect();

        assert_eq!(due, vec![3, 4, 5]);
    }

    #[test]
    fn steps_advance_without_a_transport() {
        let topology = Topology::from_socket_cores(vec![vec![0, 1], vec![2, 3]]).unwrap();
        let mut balancer = config_balancer(&topology);

        for expected in 0..5 {
            assert_eq!(balancer.step(), expected);
            balancer.balanced();
        }

        assert_eq!(balancer.step(), 5);
    }

    #[test]
    fn probe_window_is_reset_each_step() {
        let topology = Topology::from_socket_cores(vec![vec![0, 1], vec![2, 3]]).unwrap();
        let mut balancer = config_balancer(&topology);
        let probe = balancer.probe();

        probe.parallel_begin();
        probe.parallel_end();
        balancer.balanced();

        assert_eq!(probe.total(), 0.0);
    }

    fn config_balancer(topology: &Topology) -> Balancer {
        Balancer::new(
            config(&[("OMP_NUM_THREADS", "2")]),
            topology.clone(),
            Box::new(NullRebind),
        )
    }
}
