//! Walks a single-rank node group through a few rebalanced steps.
//!
//! One rank on one socket exercises the whole path: probe accounting, the
//! step gate, the shared-memory exchange (gathering from itself), and the
//! allocator. With a single rank the caller always sits exactly at the node
//! average, so the speed-up gate cancels every rebalance after the exchange;
//! run several ranks with matching `SABO_*_TASK` identities to see actual
//! migrations.

use std::thread;
use std::time::Duration;

use sabo::{Balancer, Config, MasterOnlyRebind, ShmSettings, ShmTransport, Topology};

fn main() {
    let dir = tempfile::tempdir().expect("temp dir for the sync file");

    let config = Config::from_lookup(|key| {
        match key {
            "OMP_NUM_THREADS" => Some("2"),
            "SABO_PERIODIC" => Some("1"),
            "SABO_STEP_BALANCING" => Some("1"),
            _ => None,
        }
        .map(str::to_string)
    })
    .expect("demo configuration");

    // One socket, two cores; core ids 0 and 1 exist everywhere.
    let topology = Topology::from_socket_cores(vec![vec![0, 1]]).expect("demo topology");

    let mut balancer = Balancer::new(config, topology, Box::new(MasterOnlyRebind));

    let transport = ShmTransport::establish(ShmSettings {
        sync_path: dir.path().join("sync"),
        world_rank: 0,
        world_size: 1,
        node_rank: 0,
        node_size: 1,
        window: 1,
    })
    .expect("single-rank shm group");

    balancer.install_transport(Box::new(transport));

    let probe = balancer.probe();

    for step in 0..6 {
        // Stand-in for one application step with a parallel region.
        probe.parallel_begin();
        thread::sleep(Duration::from_millis(2));
        probe.parallel_end();

        balancer.balanced();

        println!("step {step} balanced (region #{})", probe.num_regions());
    }

    balancer.finalize();
    println!("done after {} steps", balancer.step());
}
