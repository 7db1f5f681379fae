//! The simulated filesystem.
//!
//! Files are ordinary host-OS files wrapped to inject disk latency,
//! atomic-rename fidelity, and crash semantics. Every machine keeps an
//! open-file table keyed by actual filename; handing the same logical file
//! to two consumers returns the same entry, so both observe crashes
//! identically. Opens hop onto the hidden machine-process, so files outlive
//! the processes that opened them.

pub mod file;

pub use file::{DiskParameters, OpenFlags, SimFile};

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::net::Ipv4Addr;

use tracing::{debug, error, info, warn};

use crate::error::{SimError, SimResult};
use crate::registry::ProcessId;
use crate::rng::{sim_random01, sim_random_range};
use crate::sim::queue::TaskPriority;
use crate::sim::world::{SimInner, SimWorld, WeakSimWorld};
use crate::types::UID;

/// Soft open-file limit: crossing it disables connection failures and
/// engages speed-up so runaway tests can finish.
const SOFT_OPEN_LIMIT: u64 = 2000;
/// Hard open-file limit: crossing it is fatal.
const HARD_OPEN_LIMIT: u64 = 3000;

#[derive(Debug)]
pub(crate) struct FileState {
    /// Logical path the file was opened as.
    pub(crate) filename: String,
    /// Real path on the host (`<filename>.part` until an atomic sync).
    pub(crate) actual_filename: String,
    pub(crate) handle: std::fs::File,
    pub(crate) flags: OpenFlags,
    /// Zone of the hosting machine.
    pub(crate) zone: String,
    pub(crate) disk: DiskParameters,
    /// High-water mark of written offsets, for disk-space accounting.
    pub(crate) approximate_size: u64,
    pub(crate) dbgid: UID,
}

#[derive(Debug, Clone, Copy, Default)]
struct DiskSpace {
    total: i64,
    /// Original free space plus drift from simulated external writers.
    base_free: i64,
    last_update: f64,
}

/// Free/total bytes reported for a machine's disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskBytes {
    /// Bytes free.
    pub free: i64,
    /// Bytes total.
    pub total: i64,
}

#[derive(Debug, Default)]
pub(crate) struct FsState {
    pub(crate) files: HashMap<u64, FileState>,
    pub(crate) next_file_id: u64,
    pub(crate) open_count: u64,
    disk_space: HashMap<Ipv4Addr, DiskSpace>,
}

/// Drop a killed process's still-un-synced atomic writes: their table
/// entries and backing `.part` files die with the process.
pub(crate) fn drop_unsynced_atomic_files(inner: &mut SimInner, id: ProcessId) {
    let Some(zone) = inner.registry.process(id).machine.clone() else {
        return;
    };
    let inner = &mut *inner;
    let Some(machine) = inner.registry.machines.get_mut(&zone) else {
        return;
    };
    let files = &mut inner.fs.files;
    machine.open_files.retain(|name, fid| {
        let unsynced = files
            .get(fid)
            .map(|f| f.flags.contains(OpenFlags::ATOMIC_WRITE_AND_CREATE))
            .unwrap_or(false);
        if unsynced {
            if let Some(state) = files.remove(fid) {
                debug!(file = %name, "dropping un-synced atomic file with killed process");
                let _ = std::fs::remove_file(&state.actual_filename);
            }
        }
        !unsynced
    });
}

/// The filesystem surface handed to workloads.
#[derive(Debug, Clone)]
pub struct SimFileSystem {
    sim: WeakSimWorld,
}

impl SimFileSystem {
    pub(crate) fn new(sim: WeakSimWorld) -> Self {
        Self { sim }
    }

    /// Open a file for simulated asynchronous I/O.
    ///
    /// The open charges the global file counter, hops onto the hosting
    /// machine's context, pays the simulated open cost, and consults the
    /// machine's open-file table before touching the host OS.
    pub async fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> SimResult<SimFile> {
        let sim = self.sim.upgrade()?;
        {
            let mut inner = sim.inner.borrow_mut();
            inner.fs.open_count += 1;
            assert!(
                inner.fs.open_count < HARD_OPEN_LIMIT,
                "too many open files in simulation"
            );
            if inner.fs.open_count == SOFT_OPEN_LIMIT {
                warn!("open-file soft limit reached; disabling connection failures");
                inner.speed_up_simulation = true;
                inner.enable_connection_failures = false;
            }
        }

        let caller = sim.current_process();
        sim.on_machine(caller, TaskPriority::DEFAULT_DELAY).await?;
        let (min_open, max_open) = {
            let inner = sim.inner.borrow();
            (inner.config.disk.min_open_time, inner.config.disk.max_open_time)
        };
        sim.sleep(sim_random_range(min_open..max_open)).await?;

        let opened = open_on_machine(&sim, caller, path, flags, mode);

        sim.on_process(caller, TaskPriority::DEFAULT_DELAY).await?;
        opened.map(|id| SimFile::new(self.sim.clone(), id))
    }

    /// Delete a file. With `must_be_durable` the host unlink always runs
    /// (after a short delay); otherwise half the time the delete stays
    /// non-durable — visible in the open-file table but lost if the process
    /// crashes before a later sync.
    pub async fn delete_file(&self, path: &str, must_be_durable: bool) -> SimResult<()> {
        let sim = self.sim.upgrade()?;
        let caller = sim.current_process();
        {
            let mut inner = sim.inner.borrow_mut();
            if let Some(zone) = inner.registry.process(caller).machine.clone() {
                if let Some(machine) = inner.registry.machines.get_mut(&zone) {
                    machine.open_files.remove(path);
                }
            }
        }
        if must_be_durable || sim_random01() < 0.5 {
            sim.sleep(0.05 * sim_random01()).await?;
            if !sim.process_rebooting(caller) {
                match std::fs::remove_file(path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        error!(path, %e, "durable delete failed");
                        return Err(SimError::IoError);
                    }
                }
                sim.sleep(0.05 * sim_random01()).await?;
                debug!(path, "durable delete");
            }
        } else {
            debug!(path, "non-durable delete");
        }
        Ok(())
    }

    /// Free and total disk bytes for the current process's machine.
    ///
    /// Space is lazily initialized per ip and drifts slowly between queries
    /// to model external writers sharing the disk.
    pub fn disk_bytes(&self) -> SimResult<DiskBytes> {
        let sim = self.sim.upgrade()?;
        let mut guard = sim.inner.borrow_mut();
        let inner = &mut *guard;
        let caller = inner.current_process;
        let process = inner.registry.process(caller);
        let ip = process.address.ip;
        let now = inner.time;

        let mut total_file_size: i64 = 0;
        if let Some(zone) = process.machine.as_ref() {
            if let Some(machine) = inner.registry.machines.get(zone) {
                for fid in machine.open_files.values() {
                    if let Some(file) = inner.fs.files.get(fid) {
                        total_file_size += file.approximate_size as i64;
                    }
                }
            }
        }

        let space = inner.fs.disk_space.entry(ip).or_default();
        if space.total == 0 {
            space.total = (5e9 + sim_random01() * 100e9) as i64;
            let floor = (5e9_f64).max((sim_random01() * (1.0 - 0.075) + 0.075) * space.total as f64);
            space.base_free = space.total.min(floor as i64 + total_file_size);
            info!(%ip, total = space.total, base_free = space.base_free, "disk space initialized");
        } else {
            let per_second = if crate::buggify!() { 10e6 } else { 1e6 };
            let max_delta = (now - space.last_update).min(5.0) * per_second;
            let delta = (-max_delta + sim_random01() * max_delta * 2.0) as i64;
            space.base_free = space
                .total
                .min((space.base_free + delta).max(total_file_size));
        }
        space.last_update = now;

        let free = (space.base_free - total_file_size).max(0);
        if free == 0 {
            warn!(%ip, total = space.total, "no free disk space");
        }
        Ok(DiskBytes {
            free,
            total: space.total,
        })
    }
}

/// Resolve an open against the machine's open-file table, falling through
/// to the host OS on a miss. Runs on the machine-process context.
fn open_on_machine(
    sim: &SimWorld,
    caller: ProcessId,
    path: &str,
    flags: OpenFlags,
    mode: u32,
) -> SimResult<u64> {
    let mut guard = sim.inner.borrow_mut();
    let inner = &mut *guard;
    let zone = inner
        .registry
        .process(caller)
        .machine
        .clone()
        .expect("only processes on a machine open files");

    let actual = if flags.contains(OpenFlags::ATOMIC_WRITE_AND_CREATE) {
        assert!(
            flags.contains(OpenFlags::CREATE)
                && flags.contains(OpenFlags::READWRITE)
                && !flags.contains(OpenFlags::EXCLUSIVE),
            "atomic-create-and-write requires CREATE | READWRITE without EXCLUSIVE"
        );
        format!("{path}.part")
    } else {
        path.to_string()
    };

    let machine = inner
        .registry
        .machines
        .get_mut(&zone)
        .expect("caller's machine exists");
    if let Some(&fid) = machine.open_files.get(&actual) {
        return Ok(fid);
    }

    let mut options = OpenOptions::new();
    options.read(true);
    if flags.contains(OpenFlags::READWRITE) {
        options.write(true);
    }
    if flags.contains(OpenFlags::CREATE) {
        options.create(true);
    }
    if flags.contains(OpenFlags::EXCLUSIVE) {
        options.create_new(true);
    }
    if flags.contains(OpenFlags::ATOMIC_WRITE_AND_CREATE) {
        options.truncate(true);
    }
    #[cfg(unix)]
    if flags.contains(OpenFlags::CREATE) {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let handle = match options.open(&actual) {
        Ok(handle) => handle,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(file = path, "file open failed: not found");
            return Err(SimError::FileNotFound);
        }
        Err(e) => {
            error!(file = path, %e, "file open failed");
            return Err(SimError::IoError);
        }
    };

    let fid = inner.fs.next_file_id;
    inner.fs.next_file_id += 1;
    let disk = DiskParameters::new(inner.config.disk.iops, inner.config.disk.bandwidth);
    let approximate_size = handle.metadata().map(|m| m.len()).unwrap_or(0);
    let dbgid = UID::random();
    debug!(file = path, fid, %dbgid, "file opened");
    inner.fs.files.insert(
        fid,
        FileState {
            filename: path.to_string(),
            actual_filename: actual.clone(),
            handle,
            flags,
            zone: zone.clone(),
            disk,
            approximate_size,
            dbgid,
        },
    );
    machine.open_files.insert(actual, fid);
    Ok(fid)
}

impl SimWorld {
    /// Create a filesystem surface bound to this world.
    pub fn file_system(&self) -> SimFileSystem {
        SimFileSystem::new(self.downgrade())
    }
}
