//! Per-rank and per-socket balance state.

/// The windowed counters one rank carries: one entry per retained step.
#[derive(Debug, Clone)]
pub(crate) struct StepWindow {
    /// Summed per-thread region time of the step.
    pub elapsed: Vec<f64>,
    /// Thread count of the step (observation, then allocator scratch).
    pub num_threads: Vec<i32>,
    /// Allocation remainder of the step (allocator scratch).
    pub delta: Vec<f64>,
}

impl StepWindow {
    pub fn new(window: usize) -> Self {
        Self {
            elapsed: vec![0.0; window],
            num_threads: vec![0; window],
            delta: vec![0.0; window],
        }
    }
}

/// One rank of the node group, as mirrored on every peer.
#[derive(Debug, Clone)]
pub(crate) struct RankState {
    pub node_rank: i32,
    pub world_rank: i32,

    /// Placement being computed (or currently applied).
    pub socket_id: i32,
    pub num_threads: i32,

    /// Placement before the last rebalance, for migration minimization and
    /// the apply short-circuit.
    pub prev_socket_id: i32,
    pub prev_num_threads: i32,

    pub counters: StepWindow,
}

impl RankState {
    pub fn new(window: usize, node_rank: i32, world_rank: i32, num_threads: i32) -> Self {
        Self {
            node_rank,
            world_rank,
            socket_id: -1,
            num_threads,
            prev_socket_id: -1,
            prev_num_threads: -1,
            counters: StepWindow::new(window),
        }
    }
}

/// The ranks assigned to one socket and its remaining capacity.
#[derive(Debug, Default, Clone)]
pub(crate) struct SocketBucket {
    pub num_free_cores: i32,
    /// Indices into the rank array.
    pub ranks: Vec<usize>,
}
