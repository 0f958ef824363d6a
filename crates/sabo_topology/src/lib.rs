//! Socket-level hardware topology for the sabo rebalancer.
//!
//! The rebalancer's placement engine only needs three facts about the node it
//! runs on: how many sockets (NUMA packages) there are, how many physical
//! cores each socket exposes, and which OS core id sits behind a
//! `(socket, local core index)` pair. This crate discovers those facts from
//! Linux sysfs, or loads them from an explicit layout file, and validates
//! them: every socket must expose the same core count, and a socket with
//! fewer than two cores cannot host a rebalanced team.
//!
//! It also owns the thread-binding seam: [`BindSlot`] records the current and
//! requested OS core of one team thread, [`pin_current_thread`] performs the
//! actual affinity call, and [`TeamRebind`] is the interface through which the
//! rebalancer hands a binding plan to whatever runtime drives the thread team.

pub mod cpulist;

mod binding;
mod sysfs;
mod topology;

pub use binding::*;
pub use topology::*;
