//! The process and machine registry: simulated cluster topology.
//!
//! Datacenters contain machines (zones), machines contain processes, and
//! processes own network addresses. Every machine also carries a hidden
//! "machine-process" that outlives individual processes, so machine-scoped
//! state (the open-file table) survives process kills. Machines are keyed by
//! `locality.zone`; datacenters have no storage of their own and are derived
//! by scanning machines.

pub mod kill;
pub mod policy;

pub use kill::KillKind;
pub use policy::{validate_all_combinations, ReplicationPolicy};

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::Ipv4Addr;

use tracing::debug;

use crate::sim::world::SimWorld;
use crate::types::{Locality, NetworkAddress, ProcessClass};

/// Stable handle to a simulated process (an index into the process arena;
/// processes are never removed, only marked failed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub usize);

#[derive(Debug, Default)]
pub(crate) struct ListenerState {
    /// Connections delivered by the network but not yet accepted.
    pub(crate) pending: VecDeque<u64>,
}

#[derive(Debug)]
pub(crate) struct ProcessState {
    pub(crate) name: String,
    pub(crate) address: NetworkAddress,
    pub(crate) locality: Locality,
    pub(crate) class: ProcessClass,
    pub(crate) data_folder: String,
    pub(crate) coord_folder: String,
    /// Zone of the owning machine; `None` only for the bootstrap process.
    pub(crate) machine: Option<String>,
    pub(crate) failed: bool,
    pub(crate) rebooting: bool,
    pub(crate) shutdown: Option<KillKind>,
    pub(crate) fault_injection_p1: f64,
    pub(crate) fault_injection_p2: f64,
    pub(crate) fault_injection_r: u64,
    pub(crate) listener: ListenerState,
}

impl ProcessState {
    fn new(
        name: impl Into<String>,
        address: NetworkAddress,
        locality: Locality,
        class: ProcessClass,
        data_folder: impl Into<String>,
        coord_folder: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            address,
            locality,
            class,
            data_folder: data_folder.into(),
            coord_folder: coord_folder.into(),
            machine: None,
            failed: false,
            rebooting: false,
            shutdown: None,
            fault_injection_p1: 0.0,
            fault_injection_p2: 0.0,
            fault_injection_r: 0,
            listener: ListenerState::default(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct MachineState {
    pub(crate) zone: String,
    pub(crate) dead: bool,
    pub(crate) processes: Vec<ProcessId>,
    /// Hidden process at `(ip, 0)` hosting machine-scoped work.
    pub(crate) machine_process: ProcessId,
    /// Open-file table keyed by actual filename; values index the world's
    /// file arena. Shared handles make crashes visible identically to every
    /// consumer of a file.
    pub(crate) open_files: HashMap<String, u64>,
}

#[derive(Debug)]
pub(crate) struct RegistryState {
    pub(crate) processes: Vec<ProcessState>,
    pub(crate) machines: HashMap<String, MachineState>,
    pub(crate) address_map: HashMap<NetworkAddress, ProcessId>,
    /// Addresses of processes currently tearing down, so replacements may
    /// bind the same address.
    pub(crate) currently_rebooting: HashMap<NetworkAddress, ProcessId>,
    pub(crate) protected: HashSet<NetworkAddress>,
    pub(crate) tlog_policy: ReplicationPolicy,
    pub(crate) storage_policy: ReplicationPolicy,
    pub(crate) tlog_write_anti_quorum: usize,
}

impl RegistryState {
    pub(crate) fn new() -> Self {
        // A non-null bootstrap process eliminates special cases before any
        // real process exists.
        let bootstrap = ProcessState::new(
            "simulator",
            NetworkAddress::new(Ipv4Addr::UNSPECIFIED, 0),
            Locality::default(),
            ProcessClass::Unset,
            "",
            "",
        );
        Self {
            processes: vec![bootstrap],
            machines: HashMap::new(),
            address_map: HashMap::new(),
            currently_rebooting: HashMap::new(),
            protected: HashSet::new(),
            tlog_policy: ReplicationPolicy::One,
            storage_policy: ReplicationPolicy::One,
            tlog_write_anti_quorum: 0,
        }
    }

    pub(crate) fn process(&self, id: ProcessId) -> &ProcessState {
        &self.processes[id.0]
    }

    pub(crate) fn process_mut(&mut self, id: ProcessId) -> &mut ProcessState {
        &mut self.processes[id.0]
    }

    /// The hidden machine-process hosting machine-scoped work for `id`.
    /// Falls back to the process itself when it has no machine.
    pub(crate) fn machine_process_of(&self, id: ProcessId) -> ProcessId {
        match self.process(id).machine.as_ref() {
            Some(zone) => self.machines[zone].machine_process,
            None => id,
        }
    }
}

impl SimWorld {
    /// Create a new simulated process.
    ///
    /// Allocates the zone's machine (and its hidden machine-process at
    /// `(ip, 0)`) on first use. All processes of one machine share an ip and
    /// must use distinct ports; violations are bugs in the caller and panic.
    #[allow(clippy::too_many_arguments)]
    pub fn new_process(
        &self,
        name: &str,
        ip: Ipv4Addr,
        port: u16,
        locality: Locality,
        class: ProcessClass,
        data_folder: &str,
        coord_folder: &str,
    ) -> ProcessId {
        let mut inner = self.inner.borrow_mut();
        let zone = locality
            .zone
            .clone()
            .expect("every real process requires locality.zone");

        if !inner.registry.machines.contains_key(&zone) {
            let machine_address = NetworkAddress::new(ip, 0);
            let mut machine_process = ProcessState::new(
                "machine",
                machine_address,
                locality.clone(),
                class,
                "",
                "",
            );
            machine_process.machine = Some(zone.clone());
            let machine_process_id = ProcessId(inner.registry.processes.len());
            inner.registry.processes.push(machine_process);
            inner.registry.machines.insert(
                zone.clone(),
                MachineState {
                    zone: zone.clone(),
                    dead: false,
                    processes: Vec::new(),
                    machine_process: machine_process_id,
                    open_files: HashMap::new(),
                },
            );
        }

        let address = NetworkAddress::new(ip, port);
        for &existing in &inner.registry.machines[&zone].processes {
            let other = inner.registry.process(existing);
            assert_eq!(
                other.address.ip, ip,
                "all processes of zone {zone} must share one ip"
            );
            assert_ne!(
                other.address.port, port,
                "duplicate (ip, port) {address} on zone {zone}"
            );
        }

        let mut process = ProcessState::new(name, address, locality, class, data_folder, coord_folder);
        process.machine = Some(zone.clone());
        let id = ProcessId(inner.registry.processes.len());
        inner.registry.processes.push(process);
        inner
            .registry
            .machines
            .get_mut(&zone)
            .expect("machine just ensured")
            .processes
            .push(id);
        inner.registry.currently_rebooting.remove(&address);
        inner.registry.address_map.insert(address, id);

        debug!(name, %address, %zone, "new process");
        id
    }

    /// Tear a process out of its machine after reboot, keeping its address
    /// reserved in the currently-rebooting map so a replacement can bind it.
    pub fn destroy_process(&self, id: ProcessId) {
        let mut inner = self.inner.borrow_mut();
        let address = inner.registry.process(id).address;
        debug!(%address, "process destroyed");
        inner.registry.currently_rebooting.insert(address, id);
        if let Some(zone) = inner.registry.process(id).machine.clone() {
            let machine = inner
                .registry
                .machines
                .get_mut(&zone)
                .expect("destroyed process's machine exists");
            machine.processes.retain(|&p| p != id);
        }
        kill::kill_process_internal(&mut inner, id, KillKind::KillInstantly);
    }

    /// Destroy a machine whose processes have all failed.
    pub fn destroy_machine(&self, zone: &str) {
        let mut inner = self.inner.borrow_mut();
        let machine = inner.registry.machines.get(zone).expect("machine exists");
        for &p in &machine.processes {
            assert!(
                inner.registry.process(p).failed,
                "machine {zone} destroyed while process {} alive",
                inner.registry.process(p).address
            );
        }
        let machine_process = machine.machine_process;
        if let Some(machine) = inner.registry.machines.get_mut(zone) {
            machine.dead = true;
        }
        kill::kill_process_internal(&mut inner, machine_process, KillKind::KillInstantly);
        inner.registry.machines.remove(zone);
    }

    /// Mark an address as protected: it never undergoes a destructive kill.
    pub fn protect_address(&self, address: NetworkAddress) {
        self.inner.borrow_mut().registry.protected.insert(address);
    }

    /// Set the replication policies and anti-quorum the kill planner
    /// validates against.
    pub fn set_replication_policies(
        &self,
        tlog: ReplicationPolicy,
        storage: ReplicationPolicy,
        tlog_write_anti_quorum: usize,
    ) {
        let mut inner = self.inner.borrow_mut();
        inner.registry.tlog_policy = tlog;
        inner.registry.storage_policy = storage;
        inner.registry.tlog_write_anti_quorum = tlog_write_anti_quorum;
    }

    /// All real processes, in creation order (machine-processes and the
    /// bootstrap process excluded).
    pub fn all_processes(&self) -> Vec<ProcessId> {
        let inner = self.inner.borrow();
        let mut out = Vec::new();
        for machine in inner.registry.machines.values() {
            out.extend(machine.processes.iter().copied());
        }
        out.sort();
        out
    }

    /// Look up the process currently bound to an address.
    pub fn process_by_address(&self, address: NetworkAddress) -> Option<ProcessId> {
        self.inner.borrow().registry.address_map.get(&address).copied()
    }

    /// The zones of a datacenter, derived by scanning machines.
    pub fn datacenter_zones(&self, datacenter: &str) -> Vec<String> {
        let inner = self.inner.borrow();
        let mut zones: Vec<String> = inner
            .registry
            .machines
            .values()
            .filter(|m| {
                m.processes.iter().any(|&p| {
                    inner.registry.process(p).locality.datacenter.as_deref() == Some(datacenter)
                })
            })
            .map(|m| m.zone.clone())
            .collect();
        zones.sort();
        zones
    }

    /// Address of a process.
    pub fn process_address(&self, id: ProcessId) -> NetworkAddress {
        self.inner.borrow().registry.process(id).address
    }

    /// Locality of a process.
    pub fn process_locality(&self, id: ProcessId) -> Locality {
        self.inner.borrow().registry.process(id).locality.clone()
    }

    /// Whether a process has failed.
    pub fn process_failed(&self, id: ProcessId) -> bool {
        self.inner.borrow().registry.process(id).failed
    }

    /// Whether a process is rebooting.
    pub fn process_rebooting(&self, id: ProcessId) -> bool {
        self.inner.borrow().registry.process(id).rebooting
    }

    /// The kill kind published on a process's shutdown signal, if any.
    pub fn shutdown_kind(&self, id: ProcessId) -> Option<KillKind> {
        self.inner.borrow().registry.process(id).shutdown
    }

    /// Data folder a process was started with; reboot harnesses wipe it on
    /// delete-reboots.
    pub fn process_data_folder(&self, id: ProcessId) -> String {
        self.inner.borrow().registry.process(id).data_folder.clone()
    }

    /// Coordination folder a process was started with.
    pub fn process_coord_folder(&self, id: ProcessId) -> String {
        self.inner.borrow().registry.process(id).coord_folder.clone()
    }

    /// Whether fault injection has been armed on a process (via an
    /// `InjectFaults` kill).
    pub fn fault_injection_armed(&self, id: ProcessId) -> bool {
        self.inner.borrow().registry.process(id).fault_injection_p2 > 0.0
    }

    /// Whether a machine has been marked dead.
    pub fn machine_dead(&self, zone: &str) -> bool {
        self.inner
            .borrow()
            .registry
            .machines
            .get(zone)
            .map(|m| m.dead)
            .unwrap_or(true)
    }

    /// Process ids of a machine, in creation order.
    pub fn machine_processes(&self, zone: &str) -> Vec<ProcessId> {
        self.inner
            .borrow()
            .registry
            .machines
            .get(zone)
            .map(|m| m.processes.clone())
            .unwrap_or_default()
    }
}
