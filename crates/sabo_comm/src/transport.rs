/// Node-scoped rank transport.
///
/// One instance represents this process's membership in its node group. Rank
/// identities are dense: node ranks run over `[0, node_size)` and map to
/// world ranks through [`Transport::world_rank_from_node_rank`].
///
/// `allgather` is collective: every rank of the node group must call it the
/// same number of times with the same `send` length, or the group deadlocks.
pub trait Transport {
    /// Whether the backend has completed its group setup.
    fn is_initialized(&self) -> bool;

    /// This process's rank in the whole job.
    fn world_rank(&self) -> i32;

    /// Number of ranks in the whole job.
    fn world_size(&self) -> i32;

    /// This process's rank within the node group.
    fn node_rank(&self) -> i32;

    /// Number of ranks on this node.
    fn node_size(&self) -> i32;

    /// Translates a node rank to its world rank.
    fn world_rank_from_node_rank(&self, node_rank: i32) -> i32;

    /// Exchanges `send` with every node peer.
    ///
    /// On return, `recv` holds the concatenation of all ranks' `send` buffers
    /// in node-rank order; `recv.len()` must equal
    /// `send.len() * node_size`.
    fn allgather(&mut self, send: &[f64], recv: &mut [f64]);
}
