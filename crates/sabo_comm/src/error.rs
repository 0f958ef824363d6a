use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// A failure to establish or operate the node transport.
#[derive(Debug, Error)]
pub enum CommError {
    /// The sync file could not be created, locked or written.
    #[error("sync file {path}: {op} failed")]
    SyncFile {
        /// The sync file path.
        path: PathBuf,
        /// The operation that failed.
        op: &'static str,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A shared-memory call failed.
    #[error("shared memory object {name}: {op} failed")]
    SharedMemory {
        /// The POSIX shm object name.
        name: String,
        /// The operation that failed.
        op: &'static str,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// More ranks on the node than the shared header can describe.
    #[error("{node_size} ranks on the node, shared header holds at most {max}")]
    NodeTooLarge {
        /// Configured node size.
        node_size: i32,
        /// Capacity of the shared header.
        max: usize,
    },

    /// Rank identities or window are out of range.
    #[error("invalid transport settings: {reason}")]
    InvalidSettings {
        /// What is wrong with them.
        reason: String,
    },

    /// MPI was already initialized by someone else.
    #[cfg(feature = "mpi")]
    #[error("MPI is already initialized; the transport must own initialization")]
    MpiAlreadyInitialized,

    /// The MPI library granted less thread support than the rebalancer needs.
    #[cfg(feature = "mpi")]
    #[error("MPI provided thread support {provided:?}, need Multiple; initialize with MPI_Init_thread semantics")]
    MpiThreading {
        /// The threading level the library granted.
        provided: String,
    },

    /// A node rank had no translation in the world group.
    #[cfg(feature = "mpi")]
    #[error("node rank {node_rank} has no world-group translation")]
    MpiTranslation {
        /// The untranslatable node rank.
        node_rank: i32,
    },
}
