//! Process-wide tool state and the guarded rebalance entry point.
//!
//! The host runtime's tool layer is wired to three callbacks
//! ([`parallel_begin`], [`parallel_end`], [`sync_region`]) plus the
//! rebalance point [`balanced`]. All of them are no-ops until an engine is
//! [installed](install), so call sites never need to know whether the
//! library is active; this is the nullable-entry-point contract.
//!
//! A thread-local flag makes every callback re-entrancy safe: a callback
//! that (indirectly) triggers another runtime event returns immediately from
//! the nested invocation. The flag stays set across the implicit rebalance
//! so events raised from inside the engine are swallowed too.

use std::cell::Cell;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use thiserror::Error;

use sabo_comm::{CommError, ShmSettings, ShmTransport};
use sabo_topology::{TeamRebind, Topology, TopologyError};

use crate::config::{Config, ConfigError};
use crate::engine::Balancer;
use crate::probe::{RegionProbe, SyncRegionKind, ThreadState};

struct Tool {
    probe: Arc<RegionProbe>,
    implicit_balancing: bool,
    core: Mutex<Balancer>,
}

static TOOL: OnceLock<Tool> = OnceLock::new();

thread_local! {
    static IN_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

/// Cleared on drop; `None` when the thread is already inside a callback.
struct CallbackGuard;

impl CallbackGuard {
    fn enter() -> Option<Self> {
        IN_CALLBACK.with(|flag| {
            if flag.get() {
                None
            } else {
                flag.set(true);
                Some(Self)
            }
        })
    }
}

impl Drop for CallbackGuard {
    fn drop(&mut self) {
        IN_CALLBACK.with(|flag| flag.set(false));
    }
}

/// A failure to assemble the tool from the process environment.
#[derive(Debug, Error)]
pub enum InitError {
    /// The environment configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Topology discovery failed.
    #[error(transparent)]
    Topology(#[from] TopologyError),

    /// The node transport could not be established.
    #[error(transparent)]
    Comm(#[from] CommError),

    /// The shared-memory transport needs all four rank identities and the
    /// sync file path; only some were given.
    #[error("incomplete shared-memory identities: need SABO_SHARED_FILENAME and all four SABO_*_TASK/TASKS variables")]
    IncompleteShmIdentities,

    /// An engine is already installed in this process.
    #[error("a rebalance engine is already installed")]
    AlreadyInstalled,
}

/// Installs `balancer` as this process's engine.
///
/// Returns the engine back if one is already installed.
pub fn install(balancer: Balancer) -> Result<(), Balancer> {
    let tool = Tool {
        probe: balancer.probe(),
        implicit_balancing: balancer.config().implicit_balancing,
        core: Mutex::new(balancer),
    };

    TOOL.set(tool).map_err(|rejected| {
        rejected
            .core
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    })
}

/// Whether an engine is installed.
#[must_use]
pub fn is_installed() -> bool {
    TOOL.get().is_some()
}

/// Builds the engine from the environment and installs it.
///
/// Topology comes from the configured layout file or from sysfs. When the
/// configuration carries the shared-memory identities, the shared-memory
/// transport is established (collectively, blocking until the whole node
/// group is up) and attached; without them the engine observes steps but
/// never rebalances.
pub fn init_from_env(binder: Box<dyn TeamRebind + Send>) -> Result<(), InitError> {
    if is_installed() {
        return Err(InitError::AlreadyInstalled);
    }

    let config = Config::from_env()?;

    let topology = match &config.topology_file {
        Some(path) => Topology::from_layout_file(path)?,
        None => Topology::from_sysfs()?,
    };

    let shm_settings = shm_settings_from(&config)?;

    let mut balancer = Balancer::new(config, topology, binder);

    if let Some(settings) = shm_settings {
        balancer.install_transport(Box::new(ShmTransport::establish(settings)?));
    }

    install(balancer).map_err(|_| InitError::AlreadyInstalled)
}

fn shm_settings_from(config: &Config) -> Result<Option<ShmSettings>, InitError> {
    let identities = (
        config.shared_filename.as_ref(),
        config.world_task_id,
        config.world_num_tasks,
        config.node_task_id,
        config.node_num_tasks,
    );

    match identities {
        (Some(sync_path), Some(world_rank), Some(world_size), Some(node_rank), Some(node_size)) => {
            Ok(Some(ShmSettings {
                sync_path: sync_path.clone(),
                world_rank,
                world_size,
                node_rank,
                node_size,
                window: config.num_steps_exchanged,
            }))
        }
        (None, None, None, None, None) => Ok(None),
        _ => Err(InitError::IncompleteShmIdentities),
    }
}

/// The rebalance point. A no-op when no engine is installed.
pub fn balanced() {
    let Some(tool) = TOOL.get() else {
        return;
    };

    let mut core = tool.core.lock().unwrap_or_else(PoisonError::into_inner);
    core.balanced();
}

/// Parallel-region begin, reported by the team's master thread.
pub fn parallel_begin() {
    let Some(_guard) = CallbackGuard::enter() else {
        return;
    };

    let Some(tool) = TOOL.get() else {
        return;
    };

    tool.probe.parallel_begin();
}

/// Parallel-region end, reported by the team's master thread. Invokes the
/// rebalance point when implicit balancing is configured.
pub fn parallel_end() {
    let Some(_guard) = CallbackGuard::enter() else {
        return;
    };

    let Some(tool) = TOOL.get() else {
        return;
    };

    tool.probe.parallel_end();

    if tool.implicit_balancing {
        let mut core = tool.core.lock().unwrap_or_else(PoisonError::into_inner);
        core.balanced();
    }
}

/// Synchronization-region entry, reported by any team thread.
pub fn sync_region(kind: SyncRegionKind, state: ThreadState, thread_index: usize) {
    let Some(_guard) = CallbackGuard::enter() else {
        return;
    };

    let Some(tool) = TOOL.get() else {
        return;
    };

    tool.probe.sync_region(kind, state, thread_index);
}

/// Finalizes the installed engine (logs instrumentation, tears down the
/// transport). A no-op when none is installed.
pub fn finalize() {
    let Some(tool) = TOOL.get() else {
        return;
    };

    let mut core = tool.core.lock().unwrap_or_else(PoisonError::into_inner);
    core.finalize();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callbacks_without_an_engine_are_no_ops() {
        // Runs before any install in this process: nothing to observe,
        // nothing must panic.
        parallel_begin();
        parallel_end();
        sync_region(SyncRegionKind::Barrier, ThreadState::Overhead, 1);
        balanced();
        finalize();
    }

    #[test]
    fn reentrancy_guard_blocks_nested_entry() {
        let outer = CallbackGuard::enter();
        assert!(outer.is_some());

        assert!(CallbackGuard::enter().is_none());

        drop(outer);
        assert!(CallbackGuard::enter().is_some());
    }

    #[test]
    fn partial_shm_identities_are_rejected() {
        let config = Config::from_lookup(|key| match key {
            "OMP_NUM_THREADS" => Some("2".to_string()),
            "SABO_NODE_TASK_ID" => Some("0".to_string()),
            _ => None,
        })
        .unwrap();

        assert!(matches!(
            shm_settings_from(&config),
            Err(InitError::IncompleteShmIdentities)
        ));
    }

    #[test]
    fn absent_shm_identities_mean_no_transport() {
        let config = Config::from_lookup(|key| match key {
            "OMP_NUM_THREADS" => Some("2".to_string()),
            _ => None,
        })
        .unwrap();

        assert!(matches!(shm_settings_from(&config), Ok(None)));
    }
}
