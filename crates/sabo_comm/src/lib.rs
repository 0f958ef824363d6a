//! Node-local rank transport for the sabo rebalancer.
//!
//! Every rank of a job that shares a compute node periodically exchanges a
//! small, fixed-size window of `f64` observations with its node peers. This
//! crate provides that exchange behind the [`Transport`] capability trait:
//! rank identities (world and node), node-rank to world-rank translation, and
//! a node-scoped `allgather`.
//!
//! Two backends implement the trait:
//!
//! - [`ShmTransport`]: a POSIX shared-memory segment plus a sync file through
//!   which the node master publishes the segment's name and size. Peers
//!   synchronize with a hand-rolled two-phase generation-counter barrier that
//!   busy-spins for microsecond-scale latency. Rank identities come from the
//!   embedder (typically the launcher's environment).
//! - `MpiTransport` (cargo feature `mpi`): the node communicator is split off
//!   the world communicator with a shared-memory split and the exchange is the
//!   library's allgather collective. Requires a system MPI implementation.
//!
//! All coordination is node-local. A stalled peer stalls the node: the
//! barrier deliberately has no timeout.

mod barrier;
mod error;
mod shm;
mod transport;

#[cfg(feature = "mpi")]
mod mpi;

pub use error::*;
pub use shm::*;
pub use transport::*;

#[cfg(feature = "mpi")]
pub use crate::mpi::*;
