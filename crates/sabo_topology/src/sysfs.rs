//! Topology discovery from the Linux sysfs cpu tree.
//!
//! Reads `present`, then per-cpu `topology/physical_package_id` and the
//! core-sibling list. SMT siblings collapse onto one representative OS cpu per
//! physical core (the smallest sibling id), so the rest of the crate only ever
//! sees one schedulable id per core. The sysfs root is a parameter so tests
//! can point discovery at a synthetic tree.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::cpulist;
use crate::topology::TopologyError;

fn read_trimmed(path: &Path) -> Result<String, TopologyError> {
    let contents = fs::read_to_string(path).map_err(|source| TopologyError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(contents.trim().to_string())
}

fn read_package_id(path: &Path) -> Result<i64, TopologyError> {
    let value = read_trimmed(path)?;

    value.parse().map_err(|_| TopologyError::InvalidSysfsValue {
        path: path.to_path_buf(),
        value,
    })
}

/// The core siblings of one cpu, newer kernels first.
fn read_core_siblings(cpu_dir: &Path, cpu: u32) -> Result<Vec<u32>, TopologyError> {
    for name in ["core_cpus_list", "thread_siblings_list"] {
        let path = cpu_dir.join("topology").join(name);

        if path.exists() {
            return Ok(cpulist::parse(&read_trimmed(&path)?)?);
        }
    }

    // No sibling file at all: the cpu stands alone.
    Ok(vec![cpu])
}

/// Discovers the socket layout under `root`: one sorted list of
/// representative OS core ids per package, packages in ascending package-id
/// order.
pub(crate) fn discover(root: &Path) -> Result<Vec<Vec<i32>>, TopologyError> {
    let present_path = root.join("present");
    let present = cpulist::parse(&read_trimmed(&present_path)?)?;

    let mut packages: BTreeMap<i64, BTreeSet<u32>> = BTreeMap::new();

    for &cpu in &present {
        let cpu_dir: PathBuf = root.join(format!("cpu{cpu}"));

        let siblings = read_core_siblings(&cpu_dir, cpu)?;
        let representative = siblings.iter().copied().min().unwrap_or(cpu);

        // Only the representative sibling carries its physical core forward.
        if cpu != representative {
            continue;
        }

        let package_path = cpu_dir.join("topology").join("physical_package_id");
        let package_id = read_package_id(&package_path)?;

        packages.entry(package_id).or_default().insert(cpu);
    }

    Ok(packages
        .into_values()
        .map(|cores| cores.into_iter().map(|id| id as i32).collect())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    fn write_cpu(root: &Path, cpu: u32, package: i64, siblings: &str) {
        let topo = root.join(format!("cpu{cpu}")).join("topology");
        fs::create_dir_all(&topo).unwrap();
        fs::write(topo.join("physical_package_id"), format!("{package}\n")).unwrap();
        fs::write(topo.join("core_cpus_list"), format!("{siblings}\n")).unwrap();
    }

    #[test]
    fn discovers_two_sockets_without_smt() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        fs::write(root.join("present"), "0-3\n").unwrap();
        for cpu in 0..2u32 {
            write_cpu(root, cpu, 0, &cpu.to_string());
        }
        for cpu in 2..4u32 {
            write_cpu(root, cpu, 1, &cpu.to_string());
        }

        let sockets = discover(root).unwrap();
        assert_eq!(sockets, vec![vec![0, 1], vec![2, 3]]);
    }

    #[test]
    fn smt_siblings_collapse_to_smallest_id() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        // Two physical cores, hyperthreads paired as (0,2) and (1,3).
        fs::write(root.join("present"), "0-3\n").unwrap();
        write_cpu(root, 0, 0, "0,2");
        write_cpu(root, 2, 0, "0,2");
        write_cpu(root, 1, 0, "1,3");
        write_cpu(root, 3, 0, "1,3");

        let sockets = discover(root).unwrap();
        assert_eq!(sockets, vec![vec![0, 1]]);
    }

    #[test]
    fn missing_sibling_file_falls_back_to_the_cpu_itself() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        fs::write(root.join("present"), "0-1\n").unwrap();
        for cpu in 0..2u32 {
            let topo = root.join(format!("cpu{cpu}")).join("topology");
            fs::create_dir_all(&topo).unwrap();
            fs::write(topo.join("physical_package_id"), "0\n").unwrap();
        }

        let sockets = discover(root).unwrap();
        assert_eq!(sockets, vec![vec![0, 1]]);
    }

    #[test]
    fn garbage_package_id_is_reported_with_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        fs::write(root.join("present"), "0\n").unwrap();
        write_cpu(root, 0, 0, "0");
        let package = root.join("cpu0").join("topology").join("physical_package_id");
        fs::write(&package, "not-a-number\n").unwrap();

        match discover(root) {
            Err(TopologyError::InvalidSysfsValue { path, .. }) => assert_eq!(path, package),
            other => panic!("expected InvalidSysfsValue, got {other:?}"),
        }
    }
}
