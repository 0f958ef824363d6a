use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::cpulist;
use crate::sysfs;

/// Default sysfs root for cpu discovery.
const SYSFS_CPU_ROOT: &str = "/sys/devices/system/cpu";

/// A failure to discover or validate the node's socket layout.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// A sysfs or layout file could not be read.
    #[error("failed to read {path}")]
    Io {
        /// The file that failed.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A cpulist string in sysfs or a layout file was malformed.
    #[error(transparent)]
    Cpulist(#[from] cpulist::ParseError),

    /// A sysfs attribute held something other than the expected integer.
    #[error("unexpected value {value:?} in {path}")]
    InvalidSysfsValue {
        /// The attribute file.
        path: PathBuf,
        /// Its contents.
        value: String,
    },

    /// Discovery produced no sockets at all.
    #[error("no cpu sockets discovered")]
    NoSockets,

    /// A socket exposes fewer than two cores; there is nothing to balance.
    #[error("socket #{socket} has {count} core(s), need at least two per socket")]
    TooFewCores {
        /// The offending socket index.
        socket: usize,
        /// Its core count.
        count: usize,
    },

    /// Sockets disagree on their core count.
    #[error("socket #{socket} has {found} core(s), others have {expected}")]
    HeterogeneousSockets {
        /// The offending socket index.
        socket: usize,
        /// Core count of socket 0.
        expected: usize,
        /// Core count of the offending socket.
        found: usize,
    },

    /// A rank asked for a socket or core index outside the topology.
    #[error("core index ({socket}, {local_core}) outside a {sockets}x{cores_per_socket} topology")]
    CoreOutOfRange {
        /// Requested socket.
        socket: i32,
        /// Requested socket-local core index.
        local_core: i32,
        /// Number of sockets in the topology.
        sockets: usize,
        /// Cores per socket in the topology.
        cores_per_socket: usize,
    },
}

/// The socket layout of one compute node.
///
/// Holds, per socket, the OS core ids of that socket's physical cores in
/// ascending order. Construction validates the layout; every accessor after
/// that is infallible except [`Topology::socket_core_id`], which bounds-checks
/// its indices.
#[derive(Debug, Clone)]
pub struct Topology {
    sockets: Vec<Vec<i32>>,
    cores_per_socket: usize,
}

impl Topology {
    /// Discovers the topology from the running system's sysfs tree.
    pub fn from_sysfs() -> Result<Self, TopologyError> {
        Self::from_sysfs_root(Path::new(SYSFS_CPU_ROOT))
    }

    /// Discovers the topology from an alternative sysfs cpu root.
    pub fn from_sysfs_root(root: &Path) -> Result<Self, TopologyError> {
        Self::from_socket_cores(sysfs::discover(root)?)
    }

    /// Loads the topology from a layout file: one cpulist line per socket,
    /// blank lines and `#` comments ignored.
    pub fn from_layout_file(path: &Path) -> Result<Self, TopologyError> {
        let contents = fs::read_to_string(path).map_err(|source| TopologyError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut sockets = Vec::new();

        for line in contents.lines() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let cores = cpulist::parse(line)?;
            sockets.push(cores.into_iter().map(|id| id as i32).collect());
        }

        Self::from_socket_cores(sockets)
    }

    /// Builds a topology from an explicit per-socket core list.
    ///
    /// Core ids within each socket are sorted; the socket order is preserved.
    pub fn from_socket_cores(mut sockets: Vec<Vec<i32>>) -> Result<Self, TopologyError> {
        if sockets.is_empty() {
            return Err(TopologyError::NoSockets);
        }

        for cores in &mut sockets {
            cores.sort_unstable();
        }

        let cores_per_socket = sockets[0].len();

        for (socket, cores) in sockets.iter().enumerate() {
            if cores.len() != cores_per_socket {
                return Err(TopologyError::HeterogeneousSockets {
                    socket,
                    expected: cores_per_socket,
                    found: cores.len(),
                });
            }
        }

        if let Some((socket, cores)) = sockets
            .iter()
            .enumerate()
            .find(|(_, cores)| cores.len() < 2)
        {
            return Err(TopologyError::TooFewCores {
                socket,
                count: cores.len(),
            });
        }

        log::debug!(
            target: "sabo::topology",
            "detected {} socket(s) with {} core(s) each",
            sockets.len(),
            cores_per_socket
        );

        Ok(Self {
            sockets,
            cores_per_socket,
        })
    }

    /// Number of sockets (NUMA packages) on the node.
    #[must_use]
    pub fn num_sockets(&self) -> i32 {
        self.sockets.len() as i32
    }

    /// Number of physical cores each socket exposes.
    #[must_use]
    pub fn num_cores_per_socket(&self) -> i32 {
        self.cores_per_socket as i32
    }

    /// Total physical cores on the node.
    #[must_use]
    pub fn num_cores(&self) -> i32 {
        (self.sockets.len() * self.cores_per_socket) as i32
    }

    /// The OS core id behind a socket-local core index.
    pub fn socket_core_id(&self, socket: i32, local_core: i32) -> Result<i32, TopologyError> {
        let out_of_range = TopologyError::CoreOutOfRange {
            socket,
            local_core,
            sockets: self.sockets.len(),
            cores_per_socket: self.cores_per_socket,
        };

        if socket < 0 || local_core < 0 {
            return Err(out_of_range);
        }

        self.sockets
            .get(socket as usize)
            .and_then(|cores| cores.get(local_core as usize))
            .copied()
            .ok_or(out_of_range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_report_the_layout() {
        let topo =
            Topology::from_socket_cores(vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7]]).unwrap();

        assert_eq!(topo.num_sockets(), 2);
        assert_eq!(topo.num_cores_per_socket(), 4);
        assert_eq!(topo.num_cores(), 8);
        assert_eq!(topo.socket_core_id(0, 0).unwrap(), 0);
        assert_eq!(topo.socket_core_id(1, 3).unwrap(), 7);
    }

    #[test]
    fn core_ids_are_sorted_within_a_socket() {
        let topo = Topology::from_socket_cores(vec![vec![3, 1, 0, 2]]).unwrap();

        assert_eq!(topo.socket_core_id(0, 0).unwrap(), 0);
        assert_eq!(topo.socket_core_id(0, 3).unwrap(), 3);
    }

    #[test]
    fn rejects_empty_layout() {
        assert!(matches!(
            Topology::from_socket_cores(vec![]),
            Err(TopologyError::NoSockets)
        ));
    }

    #[test]
    fn rejects_heterogeneous_sockets() {
        assert!(matches!(
            Topology::from_socket_cores(vec![vec![0, 1, 2], vec![3, 4]]),
            Err(TopologyError::HeterogeneousSockets {
                socket: 1,
                expected: 3,
                found: 2
            })
        ));
    }

    #[test]
    fn rejects_single_core_sockets() {
        assert!(matches!(
            Topology::from_socket_cores(vec![vec![0], vec![1]]),
            Err(TopologyError::TooFewCores { socket: 0, count: 1 })
        ));
    }

    #[test]
    fn out_of_range_lookups_fail() {
        let topo = Topology::from_socket_cores(vec![vec![0, 1]]).unwrap();

        assert!(topo.socket_core_id(1, 0).is_err());
        assert!(topo.socket_core_id(0, 2).is_err());
        assert!(topo.socket_core_id(-1, 0).is_err());
    }

    #[test]
    fn layout_file_with_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layout");
        std::fs::write(&path, "# two sockets\n0-3\n\n4-7\n").unwrap();

        let topo = Topology::from_layout_file(&path).unwrap();
        assert_eq!(topo.num_sockets(), 2);
        assert_eq!(topo.num_cores_per_socket(), 4);
        assert_eq!(topo.socket_core_id(1, 0).unwrap(), 4);
    }
}
