//! Step-wise, socket-aware rebalancing of rank thread teams on a shared
//! compute node.
//!
//! Parallel scientific codes often place several ranks of a distributed job
//! on one node, each rank driving its own shared-memory thread team over a
//! fixed pool of cores split across NUMA sockets. As the per-step work
//! imbalance between ranks drifts, any static threads-per-rank split turns
//! stale. This library watches each rank's parallel-region wall time through
//! a runtime tool probe, exchanges a window of recent step timings across
//! the node's ranks, recomputes how many threads every rank deserves, solves
//! which socket each rank should occupy, and rebinds the caller's team, all
//! behind a single rebalance point called at the end of each step.
//!
//! # Anatomy of a step
//!
//! 1. The [probe](RegionProbe) attributes region wall time to individual
//!    threads as the runtime reports begin/end and barrier events.
//! 2. At the rebalance point, the engine folds those times into its step
//!    window. A gate (step period, window fill, transport readiness) decides
//!    whether this step computes anything.
//! 3. On a computing step, the window travels through the node-local
//!    [`Transport`] (shared-memory segment or MPI); every rank sees the same
//!    mirrors.
//! 4. The allocator converts measured times into per-rank thread counts that
//!    sum exactly to the node's core count; a branch-and-bound solver packs
//!    the ranks onto sockets, moving as few ranks as possible.
//! 5. The applier derives this rank's first core from a deterministic
//!    per-socket order and hands a per-thread plan to the [`TeamRebind`]
//!    primitive, unless nothing changed.
//!
//! The rebalance point never returns errors: it succeeds, logs, or aborts
//! (configuration and invariant failures are not recoverable mid-run).
//!
//! # Embedding
//!
//! A runtime adapter wires its tool events to [`tool::parallel_begin`],
//! [`tool::parallel_end`] and [`tool::sync_region`], and its step boundary
//! (or region end, in implicit mode) to [`tool::balanced`]. Everything is
//! configured through `SABO_`-prefixed environment variables read once by
//! [`tool::init_from_env`]; see [`Config`] for the knobs. Embedders that
//! want explicit control construct a [`Balancer`] directly.

mod allocator;
mod config;
mod engine;
mod placement;
mod probe;
mod state;

pub mod tool;

pub use config::*;
pub use engine::Balancer;
pub use probe::*;

pub use sabo_comm::{CommError, ShmSettings, ShmTransport, Transport};
pub use sabo_topology::{
    pin_current_thread, BindSlot, MasterOnlyRebind, TeamRebind, Topology, TopologyError,
    UNBOUND_CORE,
};

#[cfg(feature = "mpi")]
pub use sabo_comm::MpiTransport;
