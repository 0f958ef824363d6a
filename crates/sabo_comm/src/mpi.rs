//! MPI transport backend (cargo feature `mpi`).
//!
//! The world communicator supplies world identities; the node communicator is
//! split off it with a shared-memory split, and the node-to-world rank table
//! comes from a group rank translation, computed once. The exchange is the
//! library's allgather collective on the node communicator.
//!
//! The transport owns MPI initialization and requests full thread support
//! (the rebalancer is driven from inside a threaded runtime); a library that
//! grants less is rejected at init.

use ::mpi::collective::CommunicatorCollectives;
use ::mpi::environment::Universe;
use ::mpi::topology::{Communicator, Group, SimpleCommunicator};
use ::mpi::Threading;

use crate::error::CommError;
use crate::transport::Transport;

/// The MPI [`Transport`] backend.
pub struct MpiTransport {
    node: SimpleCommunicator,
    world_rank: i32,
    world_size: i32,
    translate: Vec<i32>,
    // Dropped last: finalizes MPI after the communicators are freed.
    _universe: Universe,
}

impl MpiTransport {
    /// Initializes MPI with full thread support and builds the node group.
    ///
    /// Collective over the whole job.
    pub fn initialize() -> Result<Self, CommError> {
        let (universe, provided) = ::mpi::initialize_with_threading(Threading::Multiple)
            .ok_or(CommError::MpiAlreadyInitialized)?;

        if provided != Threading::Multiple {
            return Err(CommError::MpiThreading {
                provided: format!("{provided:?}"),
            });
        }

        let world = universe.world();
        let world_rank = world.rank();
        let world_size = world.size();

        let node = world.split_shared(world_rank);

        let world_group = world.group();
        let node_group = node.group();

        let translate = (0..node.size())
            .map(|node_rank| {
                node_group
                    .translate_rank(node_rank, &world_group)
                    .ok_or(CommError::MpiTranslation { node_rank })
            })
            .collect::<Result<Vec<i32>, _>>()?;

        log::debug!(
            target: "sabo::comm",
            "mpi transport up: node rank {}/{} world rank {}/{}",
            node.rank(),
            node.size(),
            world_rank,
            world_size
        );

        Ok(Self {
            node,
            world_rank,
            world_size,
            translate,
            _universe: universe,
        })
    }
}

impl Transport for MpiTransport {
    fn is_initialized(&self) -> bool {
        true
    }

    fn world_rank(&self) -> i32 {
        self.world_rank
    }

    fn world_size(&self) -> i32 {
        self.world_size
    }

    fn node_rank(&self) -> i32 {
        self.node.rank()
    }

    fn node_size(&self) -> i32 {
        self.node.size()
    }

    fn world_rank_from_node_rank(&self, node_rank: i32) -> i32 {
        self.translate[node_rank as usize]
    }

    fn allgather(&mut self, send: &[f64], recv: &mut [f64]) {
        assert_eq!(
            recv.len(),
            send.len() * self.node.size() as usize,
            "recv buffer must span the node"
        );

        self.node.all_gather_into(send, recv);
    }
}
