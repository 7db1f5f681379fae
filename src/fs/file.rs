//! Simulated file handles and disk timing.

use std::io::{Read, Seek, SeekFrom, Write};

use tracing::{info, trace, warn};

use crate::error::{SimError, SimResult};
use crate::fault::inject_fault;
use crate::rng::sim_random01;
use crate::sim::world::WeakSimWorld;

/// Open flags, translated to host-OS semantics at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(u32);

impl OpenFlags {
    /// Open for reading and writing.
    pub const READWRITE: Self = Self(1);
    /// Create the file if absent.
    pub const CREATE: Self = Self(1 << 1);
    /// Open read-only.
    pub const READONLY: Self = Self(1 << 2);
    /// Fail if the file already exists.
    pub const EXCLUSIVE: Self = Self(1 << 3);
    /// Create-and-write atomically: the file lives at `<name>.part` and
    /// appears at `<name>` only when a sync completes.
    pub const ATOMIC_WRITE_AND_CREATE: Self = Self(1 << 4);

    /// Empty flag set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Whether all bits of `other` are set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Remove the bits of `other`.
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for OpenFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Shared performance parameters of one simulated disk.
///
/// `next_operation` is the rolling deadline all operations on the file push
/// forward; its spacing models the iops and bandwidth budget.
#[derive(Debug, Clone)]
pub struct DiskParameters {
    /// Operations per second.
    pub iops: f64,
    /// Bytes per second.
    pub bandwidth: f64,
    /// Virtual time at which the disk is next free.
    pub next_operation: f64,
}

impl DiskParameters {
    pub(crate) fn new(iops: f64, bandwidth: f64) -> Self {
        Self {
            iops,
            bandwidth,
            next_operation: 0.0,
        }
    }
}

/// A simulated file.
///
/// Cloning shares the underlying machine-cached entry, so every holder of
/// one logical file observes the same crash behavior.
#[derive(Debug, Clone)]
pub struct SimFile {
    sim: WeakSimWorld,
    id: u64,
}

impl SimFile {
    pub(crate) fn new(sim: WeakSimWorld, id: u64) -> Self {
        Self { sim, id }
    }

    /// Logical filename this file was opened as.
    pub fn filename(&self) -> SimResult<String> {
        let sim = self.sim.upgrade()?;
        let inner = sim.inner.borrow();
        inner
            .fs
            .files
            .get(&self.id)
            .map(|f| f.filename.clone())
            .ok_or(SimError::IoError)
    }

    /// Real host path currently backing this file.
    pub fn actual_filename(&self) -> SimResult<String> {
        let sim = self.sim.upgrade()?;
        let inner = sim.inner.borrow();
        inner
            .fs
            .files
            .get(&self.id)
            .map(|f| f.actual_filename.clone())
            .ok_or(SimError::IoError)
    }

    /// Read up to `buf.len()` bytes at `offset`.
    pub async fn read(&self, buf: &mut [u8], offset: u64) -> SimResult<usize> {
        self.wait_until_disk_ready(buf.len() as u64, false).await?;
        let sim = self.sim.upgrade()?;
        let n = {
            let inner = sim.inner.borrow();
            let file = inner.fs.files.get(&self.id).ok_or(SimError::IoError)?;
            let mut handle = &file.handle;
            handle
                .seek(SeekFrom::Start(offset))
                .map_err(|_| SimError::IoError)?;
            let mut filled = 0;
            while filled < buf.len() {
                match handle.read(&mut buf[filled..]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => return Err(SimError::IoError),
                }
            }
            filled
        };
        if inject_fault(&sim, "SimFile::read", line!()) {
            return Err(SimError::IoError);
        }
        if inject_fault(&sim, "SimFile::read", line!()) {
            return Err(SimError::IoTimeout);
        }
        Ok(n)
    }

    /// Write all of `data` at `offset`.
    pub async fn write(&self, data: &[u8], offset: u64) -> SimResult<()> {
        self.wait_until_disk_ready(data.len() as u64, false).await?;
        let sim = self.sim.upgrade()?;
        {
            let mut inner = sim.inner.borrow_mut();
            let file = inner.fs.files.get_mut(&self.id).ok_or(SimError::IoError)?;
            let mut handle = &file.handle;
            handle
                .seek(SeekFrom::Start(offset))
                .map_err(|_| SimError::IoError)?;
            handle.write_all(data).map_err(|_| SimError::IoError)?;
            file.approximate_size = file.approximate_size.max(offset + data.len() as u64);
        }
        if inject_fault(&sim, "SimFile::write", line!()) {
            return Err(SimError::IoError);
        }
        if inject_fault(&sim, "SimFile::write", line!()) {
            return Err(SimError::IoTimeout);
        }
        Ok(())
    }

    /// Truncate or extend to `size` bytes.
    pub async fn truncate(&self, size: u64) -> SimResult<()> {
        self.wait_until_disk_ready(0, false).await?;
        let sim = self.sim.upgrade()?;
        {
            let mut inner = sim.inner.borrow_mut();
            let file = inner.fs.files.get_mut(&self.id).ok_or(SimError::IoError)?;
            file.handle.set_len(size).map_err(|_| SimError::IoError)?;
            file.approximate_size = size;
        }
        if inject_fault(&sim, "SimFile::truncate", line!()) {
            return Err(SimError::IoError);
        }
        Ok(())
    }

    /// Make preceding writes durable.
    ///
    /// The first sync of an atomic-create file also flips `<name>.part` to
    /// `<name>` in both the host filesystem and the machine's open-file
    /// table; until then the logical name does not exist.
    pub async fn sync(&self) -> SimResult<()> {
        self.wait_until_disk_ready(0, true).await?;
        let sim = self.sim.upgrade()?;
        {
            let mut guard = sim.inner.borrow_mut();
            let inner = &mut *guard;
            let file = inner.fs.files.get_mut(&self.id).ok_or(SimError::IoError)?;
            if file.flags.contains(OpenFlags::ATOMIC_WRITE_AND_CREATE) {
                file.flags.remove(OpenFlags::ATOMIC_WRITE_AND_CREATE);
                let source = format!("{}.part", file.filename);
                let target = file.filename.clone();
                let machine = inner
                    .registry
                    .machines
                    .get_mut(&file.zone)
                    .ok_or(SimError::IoError)?;
                if machine.open_files.contains_key(&source) {
                    info!(from = %source, to = %target, dbgid = %file.dbgid, "atomic rename on sync");
                    std::fs::rename(&source, &target).map_err(|_| SimError::IoError)?;
                    assert!(
                        !machine.open_files.contains_key(&target),
                        "atomic rename destination {target} already in the open-file table"
                    );
                    let fid = machine
                        .open_files
                        .remove(&source)
                        .expect("source entry checked above");
                    machine.open_files.insert(target.clone(), fid);
                    file.actual_filename = target;
                }
            }
        }
        if inject_fault(&sim, "SimFile::sync", line!()) {
            return Err(SimError::IoError);
        }
        Ok(())
    }

    /// Current size in bytes.
    pub async fn size(&self) -> SimResult<u64> {
        self.wait_until_disk_ready(0, false).await?;
        let sim = self.sim.upgrade()?;
        let len = {
            let inner = sim.inner.borrow();
            let file = inner.fs.files.get(&self.id).ok_or(SimError::IoError)?;
            file.handle
                .metadata()
                .map_err(|_| SimError::IoError)?
                .len()
        };
        if inject_fault(&sim, "SimFile::size", line!()) {
            return Err(SimError::IoError);
        }
        Ok(len)
    }

    /// Consume the disk's iops/bandwidth budget for an operation of `size`
    /// bytes, then pay the sampled per-operation latency.
    async fn wait_until_disk_ready(&self, size: u64, is_sync: bool) -> SimResult<()> {
        let sim = self.sim.upgrade()?;
        let delay = {
            let mut inner = sim.inner.borrow_mut();
            if !inner.enable_connection_failures {
                1e-4
            } else {
                let now = inner.time;
                let file = inner.fs.files.get_mut(&self.id).ok_or(SimError::IoError)?;
                file.disk.next_operation = file.disk.next_operation.max(now)
                    + 1.0 / file.disk.iops
                    + size as f64 / file.disk.bandwidth;
                let latency = if is_sync {
                    0.005 + sim_random01() * if crate::buggify!() { 1.0 } else { 0.010 }
                } else {
                    10.0 * sim_random01() / file.disk.iops
                };
                let deadline = file.disk.next_operation + latency;
                trace!(size, is_sync, deadline, "disk ready wait");
                deadline - now
            }
        };
        match sim.sleep(delay).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(%e, "disk wait interrupted");
                Err(e)
            }
        }
    }
}
