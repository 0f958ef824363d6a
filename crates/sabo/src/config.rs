//! One-shot process configuration.
//!
//! All tuning arrives through `SABO_`-prefixed environment variables (plus
//! `OMP_NUM_THREADS` for the initial team size). The whole environment is
//! read once into a [`Config`] record at init and never consulted again.

use std::env;
use std::path::PathBuf;

use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    /// Per-subsystem debug-log toggles (`SABO_LOG_DEBUG`, hexadecimal).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DebugMask: u64 {
        /// Rebalance engine decisions.
        const CORE = 1 << 0;
        /// Configuration loading.
        const CONFIG = 1 << 1;
        /// Topology discovery.
        const TOPOLOGY = 1 << 2;
        /// Placement solver.
        const PLACEMENT = 1 << 3;
        /// Tool probe events.
        const PROBE = 1 << 4;
        /// Node transport.
        const COMM = 1 << 5;
        /// Thread binding.
        const BINDING = 1 << 6;
        /// Timing instrumentation.
        const PERF = 1 << 7;
    }
}

/// A malformed or missing configuration variable.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is not set.
    #[error("required environment variable {key} is not set")]
    Missing {
        /// The variable name.
        key: &'static str,
    },

    /// A variable holds something other than an integer.
    #[error("environment variable {key}={value:?} is not an integer")]
    InvalidInteger {
        /// The variable name.
        key: &'static str,
        /// Its value.
        value: String,
    },

    /// A variable parsed but its value makes no sense.
    #[error("environment variable {key}={value} out of range: {reason}")]
    OutOfRange {
        /// The variable name.
        key: &'static str,
        /// Its value.
        value: i64,
        /// Why it is rejected.
        reason: &'static str,
    },
}

/// Process-wide tuning knobs, read once and then immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Initial threads per rank (`OMP_NUM_THREADS`, required, > 0).
    pub omp_num_threads: i32,
    /// Step period `P` (`SABO_STEP_BALANCING`, default 1, > 0).
    pub step_balancing: i32,
    /// Rebalance every `P` steps rather than once at step `P`
    /// (`SABO_PERIODIC`, default false).
    pub periodic: bool,
    /// Window size `W` (`SABO_NUM_STEPS_EXCHANGED`, default 1, >= 1).
    pub num_steps_exchanged: usize,
    /// Run the solver but skip the rebind call (`SABO_NO_REBALANCE`).
    pub no_rebalance: bool,
    /// Invoke the rebalance point from the parallel-region-end callback
    /// (`SABO_IMPLICIT_BALANCING`).
    pub implicit_balancing: bool,
    /// Override topology discovery with a layout file
    /// (`SABO_TOPOLOGY_FILE`).
    pub topology_file: Option<PathBuf>,
    /// Sync file of the shared-memory transport (`SABO_SHARED_FILENAME`).
    pub shared_filename: Option<PathBuf>,
    /// World rank for the shared-memory transport (`SABO_WORLD_TASK_ID`).
    pub world_task_id: Option<i32>,
    /// World size for the shared-memory transport (`SABO_WORLD_NUM_TASKS`).
    pub world_num_tasks: Option<i32>,
    /// Node rank for the shared-memory transport (`SABO_NODE_TASK_ID`).
    pub node_task_id: Option<i32>,
    /// Node size for the shared-memory transport (`SABO_NODE_NUM_TASKS`).
    pub node_num_tasks: Option<i32>,
    /// Per-subsystem debug toggles (`SABO_LOG_DEBUG`, hexadecimal mask).
    pub log_debug: DebugMask,
}

fn integer(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<i64>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidInteger { key, value }),
    }
}

/// Booleans follow the launcher convention: any non-zero integer is true.
fn boolean(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<bool, ConfigError> {
    Ok(integer(lookup, key)?.is_some_and(|v| v != 0))
}

fn hex_mask(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<DebugMask, ConfigError> {
    match lookup(key) {
        None => Ok(DebugMask::empty()),
        Some(value) => {
            let digits = value.trim().trim_start_matches("0x");

            u64::from_str_radix(digits, 16)
                .map(DebugMask::from_bits_truncate)
                .map_err(|_| ConfigError::InvalidInteger { key, value })
        }
    }
}

impl Config {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads the configuration through an arbitrary lookup function.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let omp_num_threads = integer(&lookup, "OMP_NUM_THREADS")?
            .ok_or(ConfigError::Missing {
                key: "OMP_NUM_THREADS",
            })?;

        if omp_num_threads <= 0 {
            return Err(ConfigError::OutOfRange {
                key: "OMP_NUM_THREADS",
                value: omp_num_threads,
                reason: "need at least one thread",
            });
        }

        let step_balancing = integer(&lookup, "SABO_STEP_BALANCING")?.unwrap_or(1);

        if step_balancing <= 0 {
            return Err(ConfigError::OutOfRange {
                key: "SABO_STEP_BALANCING",
                value: step_balancing,
                reason: "the step period must be positive",
            });
        }

        let num_steps_exchanged = integer(&lookup, "SABO_NUM_STEPS_EXCHANGED")?.unwrap_or(1);

        if num_steps_exchanged < 1 {
            return Err(ConfigError::OutOfRange {
                key: "SABO_NUM_STEPS_EXCHANGED",
                value: num_steps_exchanged,
                reason: "the window needs at least one step",
            });
        }

        let config = Self {
            omp_num_threads: omp_num_threads as i32,
            step_balancing: step_balancing as i32,
            periodic: boolean(&lookup, "SABO_PERIODIC")?,
            num_steps_exchanged: num_steps_exchanged as usize,
            no_rebalance: boolean(&lookup, "SABO_NO_REBALANCE")?,
            implicit_balancing: boolean(&lookup, "SABO_IMPLICIT_BALANCING")?,
            topology_file: lookup("SABO_TOPOLOGY_FILE").map(PathBuf::from),
            shared_filename: lookup("SABO_SHARED_FILENAME").map(PathBuf::from),
            world_task_id: integer(&lookup, "SABO_WORLD_TASK_ID")?.map(|v| v as i32),
            world_num_tasks: integer(&lookup, "SABO_WORLD_NUM_TASKS")?.map(|v| v as i32),
            node_task_id: integer(&lookup, "SABO_NODE_TASK_ID")?.map(|v| v as i32),
            node_num_tasks: integer(&lookup, "SABO_NODE_NUM_TASKS")?.map(|v| v as i32),
            log_debug: hex_mask(&lookup, "SABO_LOG_DEBUG")?,
        };

        if config.debug(DebugMask::CONFIG) {
            log::debug!(target: "sabo::config", "loaded {config:?}");
        }

        Ok(config)
    }

    /// Whether debug statements of a subsystem are enabled.
    #[must_use]
    pub fn debug(&self, mask: DebugMask) -> bool {
        self.log_debug.intersects(mask)
    }
}
