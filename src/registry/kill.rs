//! The kill planner: kill kinds, the survivability filter, and reboots.
//!
//! Destructive kills are filtered through the registry's replication
//! policies: a kill that would already leave the cluster unavailable, or
//! would leave the survivors unable to satisfy a policy, is downgraded to a
//! reboot. The filter is deterministic given the seed.

use tracing::{debug, info, warn};

use crate::registry::policy::validate_all_combinations;
use crate::registry::ProcessId;
use crate::rng::{sim_random, sim_random01};
use crate::sim::queue::{Event, TaskPriority};
use crate::sim::world::{SimInner, SimWorld};
use crate::types::{Locality, ProcessClass};

/// Kinds of simulated kills, ordered from most to least destructive.
///
/// The discriminant order matters: `kind < RebootAndDelete` selects the
/// instant kills, `kind >= RebootAndDelete` the reboot family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KillKind {
    /// Mark the process failed; all its pending tasks become never.
    KillInstantly,
    /// Arm probabilistic fault injection on the process going forward.
    InjectFaults,
    /// Restart every process on the machine, wiping data and coordination
    /// state.
    RebootAndDelete,
    /// Restart one process, wiping its data and coordination state.
    RebootProcessAndDelete,
    /// Restart every process on the machine; durable data survives.
    Reboot,
    /// Restart one process; durable data survives.
    RebootProcess,
    /// No kill.
    None,
}

impl KillKind {
    /// Whether this kind marks processes failed immediately.
    pub fn is_instant(self) -> bool {
        self < Self::RebootAndDelete
    }

    /// Whether this kind goes through the survivability filter.
    pub fn is_destructive(self) -> bool {
        matches!(
            self,
            Self::KillInstantly
                | Self::InjectFaults
                | Self::RebootAndDelete
                | Self::RebootProcessAndDelete
        )
    }

    /// Whether this kind restarts processes rather than failing them.
    pub fn is_reboot(self) -> bool {
        matches!(
            self,
            Self::RebootAndDelete | Self::RebootProcessAndDelete | Self::Reboot | Self::RebootProcess
        )
    }
}

/// Immediately fail a process or arm fault injection on it.
pub(crate) fn kill_process_internal(inner: &mut SimInner, id: ProcessId, kind: KillKind) {
    let process = inner.registry.process(id);
    match kind {
        KillKind::KillInstantly => {
            warn!(name = %process.name, address = %process.address, "process failed");
            inner.registry.process_mut(id).failed = true;
            // Shutdown-signal waiters observe the broken promise rather
            // than hanging on a sender that died without firing.
            if let Some(wakers) = inner.wakers.shutdown_wakers.remove(&id) {
                for waker in wakers {
                    waker.wake();
                }
            }
            crate::fs::drop_unsynced_atomic_files(inner, id);
        }
        KillKind::InjectFaults => {
            warn!(name = %process.name, address = %process.address, "process faulted");
            let p = inner.registry.process_mut(id);
            p.fault_injection_r = sim_random();
            p.fault_injection_p1 = 0.1;
            p.fault_injection_p2 = sim_random01();
        }
        _ => panic!("kill_process_internal called with reboot kind {kind:?}"),
    }
}

/// Schedule a process reboot: hop onto the process's own context via the
/// queue, then mark it rebooting and fire its shutdown signal.
pub(crate) fn do_reboot(inner: &mut SimInner, id: ProcessId, kind: KillKind) {
    assert!(kind.is_reboot(), "do_reboot called with {kind:?}");
    inner.schedule(Event::Reboot { process: id, kind }, id, 0.0, TaskPriority::DEFAULT_DELAY);
}

/// Event handler for a scheduled reboot. A reboot requested from within a
/// process's own continuation is a no-op once `rebooting` is set.
pub(crate) fn handle_reboot(inner: &mut SimInner, id: ProcessId, kind: KillKind) {
    let process = inner.registry.process_mut(id);
    if process.rebooting {
        return;
    }
    info!(address = %process.address, ?kind, "rebooting process");
    process.rebooting = true;
    process.shutdown = Some(kind);
    if let Some(wakers) = inner.wakers.shutdown_wakers.remove(&id) {
        for waker in wakers {
            waker.wake();
        }
    }
}

/// Decide whether killing `dead` while `left` survives keeps the cluster
/// alive, downgrading the kill kind when it does not.
pub(crate) fn can_kill_processes(
    inner: &mut SimInner,
    left: &[ProcessId],
    dead: &[ProcessId],
    kind: KillKind,
) -> (bool, KillKind) {
    if !kind.is_destructive() {
        return (true, kind);
    }

    let left_locs: Vec<Locality> = left
        .iter()
        .map(|&p| inner.registry.process(p).locality.clone())
        .collect();
    let dead_locs: Vec<Locality> = dead
        .iter()
        .map(|&p| inner.registry.process(p).locality.clone())
        .collect();
    let left_refs: Vec<&Locality> = left_locs.iter().collect();
    let dead_refs: Vec<&Locality> = dead_locs.iter().collect();

    let tlog = inner.registry.tlog_policy.clone();
    let storage = inner.registry.storage_policy.clone();
    let anti_quorum = inner.registry.tlog_write_anti_quorum;

    // The dead set already satisfying a policy means the cluster would be
    // unavailable: the kill becomes a reboot.
    if tlog.validate(&dead_refs) {
        debug!(policy = %tlog.info(), dead = dead_refs.len(), "kill downgraded: tlog policy validates against dead set");
        return (false, KillKind::Reboot);
    }
    if storage.validate(&dead_refs) {
        debug!(policy = %storage.info(), dead = dead_refs.len(), "kill downgraded: storage policy validates against dead set");
        return (false, KillKind::Reboot);
    }
    if anti_quorum > 0 {
        let (ok, bad) = validate_all_combinations(&dead_refs, &tlog, &left_refs, anti_quorum);
        if !ok {
            debug!(bad = bad.len(), anti_quorum, "kill downgraded: anti-quorum violated against dead set");
            return (false, KillKind::Reboot);
        }
    }

    // The survivors failing a policy is recoverable, so sometimes escalate
    // the reboot to one that also deletes data.
    let delete_kinds = matches!(
        kind,
        KillKind::RebootAndDelete | KillKind::RebootProcessAndDelete
    );
    if !delete_kinds && !tlog.validate(&left_refs) {
        let new_kind = if sim_random01() < 0.33 {
            KillKind::RebootAndDelete
        } else {
            KillKind::Reboot
        };
        debug!(policy = %tlog.info(), left = left_refs.len(), ?new_kind, "kill downgraded: tlog policy fails against remaining set");
        return (false, new_kind);
    }
    if !delete_kinds && !storage.validate(&left_refs) {
        let new_kind = if sim_random01() < 0.33 {
            KillKind::RebootAndDelete
        } else {
            KillKind::Reboot
        };
        debug!(policy = %storage.info(), left = left_refs.len(), ?new_kind, "kill downgraded: storage policy fails against remaining set");
        return (false, new_kind);
    }

    debug!(left = left_refs.len(), dead = dead_refs.len(), "kill can proceed");
    (true, kind)
}

/// Partition every non-tester process into (left, dead) for a proposed kill
/// of the given zones.
fn partition_processes(
    inner: &SimInner,
    dead_zone: impl Fn(&str) -> bool,
) -> (Vec<ProcessId>, Vec<ProcessId>) {
    let mut left = Vec::new();
    let mut dead = Vec::new();
    for machine in inner.registry.machines.values() {
        for &p in &machine.processes {
            let process = inner.registry.process(p);
            if process.class == ProcessClass::Tester {
                continue;
            }
            if process.failed || machine.dead || dead_zone(&machine.zone) {
                dead.push(p);
            } else {
                left.push(p);
            }
        }
    }
    (left, dead)
}

impl SimWorld {
    /// Kill or fault a single process. Reboot kinds are ignored here; use
    /// [`SimWorld::reboot_process`].
    pub fn kill_process(&self, id: ProcessId, kind: KillKind) {
        let mut inner = self.inner.borrow_mut();
        if kind.is_instant() {
            kill_process_internal(&mut inner, id, kind);
        }
    }

    /// Reboot a single process. Protected addresses never lose data:
    /// a requested delete-reboot is silently rewritten to a plain reboot.
    pub fn reboot_process(&self, id: ProcessId, mut kind: KillKind) {
        let mut inner = self.inner.borrow_mut();
        let address = inner.registry.process(id).address;
        if kind == KillKind::RebootProcessAndDelete && inner.registry.protected.contains(&address) {
            kind = KillKind::RebootProcess;
        }
        do_reboot(&mut inner, id, kind);
    }

    /// Kill a machine (zone). Returns whether anything was done; the
    /// requested kind may be downgraded by the survivability filter.
    pub fn kill_machine(&self, zone: &str, kind: KillKind, kill_is_safe: bool, force: bool) -> bool {
        let mut inner = self.inner.borrow_mut();
        let orig = kind;
        let mut kind = kind;
        if kill_is_safe {
            assert_eq!(kind, KillKind::RebootAndDelete, "only delete-reboots may be marked safe");
        }
        if inner.speed_up_simulation && !force {
            return false;
        }
        let Some(machine) = inner.registry.machines.get(zone) else {
            return false;
        };

        let mut processes_on_machine = 0usize;
        let machine_processes = machine.processes.clone();
        for &p in &machine_processes {
            let process = inner.registry.process(p);
            if inner.registry.protected.contains(&process.address) {
                kind = KillKind::Reboot;
            }
            if !process.rebooting {
                processes_on_machine += 1;
            }
        }

        if kind.is_destructive() {
            let (left, dead) = partition_processes(&inner, |z| z == zone);
            let (can_survive, new_kind) = can_kill_processes(&mut inner, &left, &dead, kind);
            if !can_survive {
                kind = new_kind;
                if kind != KillKind::Reboot && !kill_is_safe {
                    kind = KillKind::Reboot;
                }
                info!(zone, ?orig, ?kind, "kill machine downgraded");
            } else if matches!(kind, KillKind::KillInstantly | KillKind::InjectFaults) {
                info!(zone, ?kind, "machine dead");
                if let Some(machine) = inner.registry.machines.get_mut(zone) {
                    machine.dead = true;
                }
            }
        }

        // A machine-level reboot with stragglers already mid-reboot would
        // tear down a partially running machine; abort instead.
        if processes_on_machine != machine_processes.len() && kind >= KillKind::RebootAndDelete {
            warn!(
                zone,
                running = processes_on_machine,
                total = machine_processes.len(),
                "aborted reboot: target did not have all of its processes running"
            );
            return false;
        }

        info!(zone, ?kind, ?orig, "kill machine");
        if kind.is_instant() {
            for &p in &machine_processes {
                if inner.registry.process(p).class != ProcessClass::Tester {
                    kill_process_internal(&mut inner, p, kind);
                }
            }
        } else if kind == KillKind::Reboot || kill_is_safe {
            for &p in &machine_processes {
                if inner.registry.process(p).class != ProcessClass::Tester {
                    do_reboot(&mut inner, p, kind);
                }
            }
        }
        true
    }

    /// Kill every machine of a datacenter, applying the survivability filter
    /// once across the whole set.
    pub fn kill_datacenter(&self, datacenter: &str, kind: KillKind) {
        let mut inner = self.inner.borrow_mut();
        let orig = kind;
        let mut kind = kind;

        let mut datacenter_zones: Vec<String> = Vec::new();
        for machine in inner.registry.machines.values() {
            for &p in &machine.processes {
                let process = inner.registry.process(p);
                if process.locality.datacenter.as_deref() == Some(datacenter) {
                    if inner.registry.protected.contains(&process.address) {
                        kind = KillKind::Reboot;
                    }
                    if !datacenter_zones.contains(&machine.zone) {
                        datacenter_zones.push(machine.zone.clone());
                    }
                }
            }
        }
        datacenter_zones.sort();

        if kind.is_destructive() {
            let (left, dead) =
                partition_processes(&inner, |z| datacenter_zones.iter().any(|dz| dz == z));
            let (can_survive, new_kind) = can_kill_processes(&mut inner, &left, &dead, kind);
            if !can_survive {
                kind = new_kind;
                warn!(datacenter, ?orig, ?kind, "kill datacenter downgraded");
            } else {
                info!(datacenter, zones = datacenter_zones.len(), ?kind, "datacenter dead");
            }
        }
        drop(inner);

        for zone in &datacenter_zones {
            self.kill_machine(zone, kind, kind == KillKind::RebootAndDelete, true);
        }
    }
}
