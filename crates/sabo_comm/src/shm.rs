//! Shared-memory transport backend.
//!
//! Rendezvous happens through two files. The *sync file* lives at an
//! agreed-upon path: the node master writes a fixed-layout record into it
//! (under an exclusive `flock`) naming the POSIX shared-memory object and its
//! size; clients spin-open the file and read the record under the same lock,
//! retrying with a short sleep until the master has written it. The *shared
//! object* holds a header (world-rank table and the barrier counters)
//! followed by the `f64` exchange payload, sized up to whole pages.
//!
//! Sync-file record layout, little-endian, no implicit padding:
//!
//! | field | size |
//! |---|---|
//! | sync file path, NUL padded | 4096 |
//! | shm object name, NUL padded | 4096 |
//! | object size | 8 |
//! | value | 4 |
//! | pad | 4 |
//!
//! The master unlinks both files when it is dropped; established mappings
//! survive the unlink until every rank has unmapped.

use std::collections::hash_map::DefaultHasher;
use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{self, Read, Write};
use std::mem;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;
use std::time::Duration;

use crate::barrier::{BarrierCells, GenerationBarrier};
use crate::error::CommError;
use crate::transport::Transport;

/// Capacity of the shared world-rank table.
pub const MAX_NODE_RANKS: usize = 256;

/// Width of each name field in the sync-file record.
const PATH_FIELD: usize = 4096;

/// Total record size: two name fields, the size, a value and its pad.
const RECORD_LEN: usize = 2 * PATH_FIELD + 8 + 4 + 4;

/// Delay between sync-file read attempts while the master has not written.
const SYNC_RETRY: Duration = Duration::from_millis(1);

/// Head of the shared object: rank table plus barrier counters.
#[repr(C)]
struct SharedHeader {
    world_ranks: [AtomicI32; MAX_NODE_RANKS],
    barrier: BarrierCells,
}

/// Rank identities and sizing for the shared-memory backend.
///
/// Identities come from the embedder; a launcher typically provides them in
/// the environment since there is no communication library to ask.
#[derive(Debug, Clone)]
pub struct ShmSettings {
    /// World-visible path of the sync file.
    pub sync_path: PathBuf,
    /// This process's rank in the whole job.
    pub world_rank: i32,
    /// Number of ranks in the whole job.
    pub world_size: i32,
    /// This process's rank on its node.
    pub node_rank: i32,
    /// Number of ranks on this node.
    pub node_size: i32,
    /// Number of `f64` values each rank contributes per exchange.
    pub window: usize,
}

impl ShmSettings {
    fn validate(&self) -> Result<(), CommError> {
        let invalid = |reason: String| CommError::InvalidSettings { reason };

        if self.node_size < 1 {
            return Err(invalid(format!("node size {} < 1", self.node_size)));
        }

        if self.node_size as usize > MAX_NODE_RANKS {
            return Err(CommError::NodeTooLarge {
                node_size: self.node_size,
                max: MAX_NODE_RANKS,
            });
        }

        if self.node_rank < 0 || self.node_rank >= self.node_size {
            return Err(invalid(format!(
                "node rank {} outside [0, {})",
                self.node_rank, self.node_size
            )));
        }

        if self.world_size < self.node_size {
            return Err(invalid(format!(
                "world size {} < node size {}",
                self.world_size, self.node_size
            )));
        }

        if self.world_rank < 0 || self.world_rank >= self.world_size {
            return Err(invalid(format!(
                "world rank {} outside [0, {})",
                self.world_rank, self.world_size
            )));
        }

        if self.window == 0 {
            return Err(invalid("window of 0 values".to_string()));
        }

        Ok(())
    }
}

/// The record the master publishes through the sync file.
#[derive(Debug, PartialEq, Eq)]
struct SyncRecord {
    sync_path: Vec<u8>,
    shm_name: String,
    size: u64,
    value: i32,
}

impl SyncRecord {
    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; RECORD_LEN];

        let path_len = self.sync_path.len().min(PATH_FIELD - 1);
        buf[..path_len].copy_from_slice(&self.sync_path[..path_len]);

        let name = self.shm_name.as_bytes();
        let name_len = name.len().min(PATH_FIELD - 1);
        buf[PATH_FIELD..PATH_FIELD + name_len].copy_from_slice(&name[..name_len]);

        let size_at = 2 * PATH_FIELD;
        buf[size_at..size_at + 8].copy_from_slice(&self.size.to_le_bytes());
        buf[size_at + 8..size_at + 12].copy_from_slice(&self.value.to_le_bytes());
        // Final 4 bytes are the pad, already zero.

        buf
    }

    fn decode(buf: &[u8; RECORD_LEN]) -> Self {
        let c_field = |field: &[u8]| {
            let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
            field[..end].to_vec()
        };

        let size_at = 2 * PATH_FIELD;

        Self {
            sync_path: c_field(&buf[..PATH_FIELD]),
            shm_name: String::from_utf8_lossy(&c_field(&buf[PATH_FIELD..2 * PATH_FIELD]))
                .into_owned(),
            size: u64::from_le_bytes(buf[size_at..size_at + 8].try_into().expect("8 bytes")),
            value: i32::from_le_bytes(
                buf[size_at + 8..size_at + 12].try_into().expect("4 bytes"),
            ),
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    usize::try_from(page).unwrap_or(4096)
}

fn mapping_size(window: usize, node_size: usize) -> usize {
    let raw = mem::size_of::<SharedHeader>() + window * node_size * mem::size_of::<f64>();
    let page = page_size();

    raw.div_ceil(page) * page
}

/// POSIX shm object names live in one flat namespace; derive a name unique to
/// this node group from the sync path.
fn shm_object_name(sync_path: &Path) -> String {
    let mut hasher = DefaultHasher::new();
    sync_path.hash(&mut hasher);

    format!("/sabo-{:016x}", hasher.finish())
}

struct FileLock<'a> {
    file: &'a File,
}

impl<'a> FileLock<'a> {
    fn exclusive(file: &'a File) -> io::Result<Self> {
        // SAFETY: locking a valid owned descriptor.
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self { file })
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        // SAFETY: unlocking the descriptor locked above.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

fn publish_sync_record(sync_path: &Path, record: &SyncRecord) -> Result<(), CommError> {
    let fail = |op: &'static str, source: io::Error| CommError::SyncFile {
        path: sync_path.to_path_buf(),
        op,
        source,
    };

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o600)
        .custom_flags(libc::O_SYNC)
        .open(sync_path)
        .map_err(|e| fail("open", e))?;

    let _lock = FileLock::exclusive(&file).map_err(|e| fail("flock", e))?;

    file.set_len(page_size() as u64).map_err(|e| fail("ftruncate", e))?;

    (&file)
        .write_all(&record.encode())
        .map_err(|e| fail("write", e))?;

    Ok(())
}

/// Spins until the master has published a complete record.
fn read_sync_record(sync_path: &Path) -> Result<SyncRecord, CommError> {
    let fail = |op: &'static str, source: io::Error| CommError::SyncFile {
        path: sync_path.to_path_buf(),
        op,
        source,
    };

    loop {
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(sync_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                thread::sleep(SYNC_RETRY);
                continue;
            }
            Err(e) => return Err(fail("open", e)),
        };

        let mut buf = [0u8; RECORD_LEN];

        let complete = {
            let _lock = FileLock::exclusive(&file).map_err(|e| fail("flock", e))?;

            let mut filled = 0;
            loop {
                match (&file).read(&mut buf[filled..]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) => return Err(fail("read", e)),
                }
            }

            filled == RECORD_LEN
        };

        if complete {
            return Ok(SyncRecord::decode(&buf));
        }

        // Master has created but not yet filled the file.
        thread::sleep(SYNC_RETRY);
    }
}

/// Owned mapping of the shared object. The master variant unlinks the object
/// and the sync file on drop.
struct ShmMapping {
    ptr: *mut u8,
    len: usize,
    name: CString,
    cleanup: Option<PathBuf>,
}

// SAFETY: the mapping is plain shared memory; all cross-rank access goes
// through atomics or raw-pointer copies.
unsafe impl Send for ShmMapping {}

impl ShmMapping {
    fn fail(name: &CString, op: &'static str) -> CommError {
        CommError::SharedMemory {
            name: name.to_string_lossy().into_owned(),
            op,
            source: io::Error::last_os_error(),
        }
    }

    fn create(name: CString, len: usize, sync_path: PathBuf) -> Result<Self, CommError> {
        // SAFETY: name is a valid NUL-terminated string.
        let fd = unsafe {
            libc::shm_open(
                name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                (libc::S_IRUSR | libc::S_IWUSR) as libc::c_uint,
            )
        };

        if fd < 0 {
            return Err(Self::fail(&name, "shm_open"));
        }

        // SAFETY: fd is the descriptor opened above. ftruncate zero-fills,
        // which is exactly the initial state the header wants.
        if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
            let err = Self::fail(&name, "ftruncate");
            // SAFETY: closing our own descriptor.
            unsafe { libc::close(fd) };
            return Err(err);
        }

        Self::map(name, len, fd, Some(sync_path))
    }

    fn open(name: CString, len: usize) -> Result<Self, CommError> {
        // SAFETY: name is a valid NUL-terminated string.
        let fd = unsafe {
            libc::shm_open(
                name.as_ptr(),
                libc::O_RDWR,
                (libc::S_IRUSR | libc::S_IWUSR) as libc::c_uint,
            )
        };

        if fd < 0 {
            return Err(Self::fail(&name, "shm_open"));
        }

        Self::map(name, len, fd, None)
    }

    fn map(
        name: CString,
        len: usize,
        fd: libc::c_int,
        cleanup: Option<PathBuf>,
    ) -> Result<Self, CommError> {
        // SAFETY: mapping the whole object we just opened; fd stays valid for
        // the duration of the call and the mapping outlives its closing.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };

        // SAFETY: closing our own descriptor; the mapping keeps the object.
        unsafe { libc::close(fd) };

        if ptr == libc::MAP_FAILED {
            return Err(Self::fail(&name, "mmap"));
        }

        Ok(Self {
            ptr: ptr.cast(),
            len,
            name,
            cleanup,
        })
    }
}

impl Drop for ShmMapping {
    fn drop(&mut self) {
        // SAFETY: unmapping the exact region mapped in `map`.
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }

        if let Some(sync_path) = self.cleanup.take() {
            // SAFETY: unlinking the object this master created. Best effort:
            // peers keep their established mappings.
            unsafe {
                libc::shm_unlink(self.name.as_ptr());
            }

            let _ = fs::remove_file(sync_path);
        }
    }
}

/// The shared-memory [`Transport`] backend.
pub struct ShmTransport {
    settings: ShmSettings,
    map: ShmMapping,
    barrier: GenerationBarrier,
    translate: Vec<i32>,
}

impl ShmTransport {
    /// Joins (or, for node rank 0, creates) the node group described by
    /// `settings`.
    ///
    /// Collective: blocks until every rank of the node has joined.
    pub fn establish(settings: ShmSettings) -> Result<Self, CommError> {
        settings.validate()?;

        let window = settings.window;
        let node_size = settings.node_size as usize;
        let len = mapping_size(window, node_size);

        let map = if settings.node_rank == 0 {
            let name = shm_object_name(&settings.sync_path);
            let c_name = CString::new(name.clone()).expect("name has no interior NUL");

            let map = ShmMapping::create(c_name, len, settings.sync_path.clone())?;

            publish_sync_record(
                &settings.sync_path,
                &SyncRecord {
                    sync_path: settings.sync_path.as_os_str().as_encoded_bytes().to_vec(),
                    shm_name: name,
                    size: len as u64,
                    value: 0,
                },
            )?;

            map
        } else {
            let record = read_sync_record(&settings.sync_path)?;
            let c_name = CString::new(record.shm_name).expect("name has no interior NUL");

            ShmMapping::open(c_name, record.size as usize)?
        };

        let mut transport = Self {
            settings,
            map,
            barrier: GenerationBarrier::new(),
            translate: Vec::new(),
        };

        transport
            .shared()
            .world_ranks[transport.settings.node_rank as usize]
            .store(transport.settings.world_rank, Ordering::Release);

        // Everyone's rank slot is visible once the first generation turns.
        let cells = transport.cells();
        transport.barrier.arrive(cells, node_size as u32);
        transport.barrier.wait(cells);

        transport.translate = (0..node_size)
            .map(|i| transport.shared().world_ranks[i].load(Ordering::Acquire))
            .collect();

        log::debug!(
            target: "sabo::comm",
            "shm transport up: node rank {}/{} world rank {}",
            transport.settings.node_rank,
            transport.settings.node_size,
            transport.settings.world_rank
        );

        Ok(transport)
    }

    fn shared(&self) -> &SharedHeader {
        // SAFETY: the mapping is at least a page, zero-initialized by
        // ftruncate, and SharedHeader is all atomics (valid for any bits).
        unsafe { &*self.map.ptr.cast::<SharedHeader>() }
    }

    /// Barrier cells with a lifetime detached from `self`, so the local
    /// barrier mirror can be updated while they are borrowed.
    fn cells(&self) -> &'static BarrierCells {
        let header: *const SharedHeader = self.map.ptr.cast();

        // SAFETY: the mapping lives as long as this transport and the
        // reference never escapes it (private method).
        unsafe { &(*header).barrier }
    }

    fn payload(&self) -> *mut f64 {
        // SAFETY: the mapping extends past the header by window * node_size
        // doubles (mapping_size).
        unsafe { self.map.ptr.add(mem::size_of::<SharedHeader>()).cast::<f64>() }
    }
}

impl Transport for ShmTransport {
    fn is_initialized(&self) -> bool {
        true
    }

    fn world_rank(&self) -> i32 {
        self.settings.world_rank
    }

    fn world_size(&self) -> i32 {
        self.settings.world_size
    }

    fn node_rank(&self) -> i32 {
        self.settings.node_rank
    }

    fn node_size(&self) -> i32 {
        self.settings.node_size
    }

    fn world_rank_from_node_rank(&self, node_rank: i32) -> i32 {
        self.translate[node_rank as usize]
    }

    fn allgather(&mut self, send: &[f64], recv: &mut [f64]) {
        let window = self.settings.window;
        let node_size = self.settings.node_size as usize;
        let node_rank = self.settings.node_rank as usize;

        assert_eq!(send.len(), window, "send buffer must span the window");
        assert_eq!(
            recv.len(),
            window * node_size,
            "recv buffer must span the node"
        );

        let cells = self.cells();
        let payload = self.payload();

        // Wait for our turn: the previous round's readers must be done.
        self.barrier.wait(cells);

        // SAFETY: each rank writes only its own disjoint window slice.
        unsafe {
            ptr::copy_nonoverlapping(send.as_ptr(), payload.add(node_rank * window), window);
        }

        // All contributions in place, then snapshot.
        self.barrier.arrive(cells, node_size as u32);
        self.barrier.wait(cells);

        // SAFETY: between the two checkpoints no rank writes the payload;
        // recv is exclusively ours.
        unsafe {
            ptr::copy_nonoverlapping(payload, recv.as_mut_ptr(), window * node_size);
        }

        // Release writers into the next round.
        self.barrier.arrive(cells, node_size as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    fn settings(dir: &Path, node_rank: i32, node_size: i32, window: usize) -> ShmSettings {
        ShmSettings {
            sync_path: dir.join("sync"),
            world_rank: node_rank,
            world_size: node_size,
            node_rank,
            node_size,
            window,
        }
    }

    #[test]
    fn record_round_trip() {
        let record = SyncRecord {
            sync_path: b"/tmp/sync".to_vec(),
            shm_name: "/sabo-cafe".to_string(),
            size: 8192,
            value: 0,
        };

        let encoded = record.encode();
        assert_eq!(encoded.len(), RECORD_LEN);

        let decoded = SyncRecord::decode(encoded.as_slice().try_into().unwrap());
        assert_eq!(decoded, record);
    }

    #[test]
    fn mapping_size_rounds_to_pages() {
        let page = page_size();
        assert_eq!(mapping_size(1, 1) % page, 0);
        assert!(mapping_size(1, 1) >= mem::size_of::<SharedHeader>() + 8);
    }

    #[test]
    fn settings_validation_rejects_nonsense() {
        let dir = tempfile::tempdir().unwrap();

        let mut bad = settings(dir.path(), 0, 0, 1);
        assert!(ShmTransport::establish(bad.clone()).is_err());

        bad = settings(dir.path(), 2, 2, 1);
        assert!(ShmTransport::establish(bad.clone()).is_err());

        bad = settings(dir.path(), 0, 1, 0);
        assert!(ShmTransport::establish(bad).is_err());

        bad = settings(dir.path(), 0, 300, 1);
        assert!(matches!(
            ShmTransport::establish(bad),
            Err(CommError::NodeTooLarge { .. })
        ));
    }

    #[test]
    fn single_rank_group_gathers_its_own_data() {
        let dir = tempfile::tempdir().unwrap();

        let mut transport = ShmTransport::establish(settings(dir.path(), 0, 1, 2)).unwrap();

        assert_eq!(transport.node_size(), 1);
        assert_eq!(transport.world_rank_from_node_rank(0), 0);

        let mut recv = [0.0; 2];
        transport.allgather(&[1.5, 2.5], &mut recv);
        assert_eq!(recv, [1.5, 2.5]);
    }

    #[test]
    fn two_ranks_exchange_identical_mirrors() {
        let dir = tempfile::tempdir().unwrap();
        let window = 3;

        let client_settings = settings(dir.path(), 1, 2, window);

        let client = thread::spawn(move || {
            let mut transport = ShmTransport::establish(client_settings).unwrap();

            let mut mirrors = Vec::new();
            for round in 0..4 {
                let send = [round as f64, 10.0 + round as f64, 100.0];
                let mut recv = vec![0.0; window * 2];
                transport.allgather(&send, &mut recv);
                mirrors.push(recv);
            }

            (transport.world_rank_from_node_rank(0), mirrors)
        });

        let mut transport =
            ShmTransport::establish(settings(dir.path(), 0, 2, window)).unwrap();

        let mut master_mirrors = Vec::new();
        for round in 0..4 {
            let send = [-(round as f64), -1.0, -2.0];
            let mut recv = vec![0.0; window * 2];
            transport.allgather(&send, &mut recv);
            master_mirrors.push(recv);
        }

        let (translated_master, client_mirrors) = client.join().unwrap();

        // Node rank 0 translates to its world rank on both sides.
        assert_eq!(translated_master, 0);
        assert_eq!(transport.world_rank_from_node_rank(1), 1);

        // Property: the exchanged windows observed by any two peers are
        // identical element-wise.
        assert_eq!(master_mirrors, client_mirrors);

        for (round, mirror) in master_mirrors.iter().enumerate() {
            assert_eq!(mirror[..window], [-(round as f64), -1.0, -2.0]);
            assert_eq!(
                mirror[window..],
                [round as f64, 10.0 + round as f64, 100.0]
            );
        }
    }

    #[test]
    fn master_cleans_up_the_sync_file() {
        let dir = tempfile::tempdir().unwrap();
        let sync_path = dir.path().join("sync");

        {
            let _transport = ShmTransport::establish(settings(dir.path(), 0, 1, 1)).unwrap();
            assert!(sync_path.exists());
        }

        assert!(!sync_path.exists());
    }
}
