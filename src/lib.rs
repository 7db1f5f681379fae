//! # Stillwater
//!
//! Deterministic discrete-event simulation for driving an entire
//! distributed database inside a single process, inspired by
//! [FoundationDB's simulation testing](https://apple.github.io/foundationdb/testing.html).
//!
//! The simulator replaces the real network, filesystem, clock, and thread
//! primitives with deterministic surrogates: hundreds of simulated
//! processes on simulated machines in simulated datacenters exchange bytes
//! over simulated TCP connections with simulated latencies, faults, clogs,
//! and reboots — reproducibly from a seed, on one real thread, usually
//! faster than wall clock.
//!
//! ## Core components
//!
//! - [`SimWorld`]: virtual time, the event queue, and the run loop
//! - [`registry`]: machines, processes, the kill planner and its
//!   survivability filter
//! - [`net`]: connection pairs with a latency-and-drop byte pipeline,
//!   clogging, listeners
//! - [`fs`]: machine-cached files over real OS files, disk timing,
//!   atomic-rename fidelity
//! - [`fault`]: the per-process fault-injection capability
//! - [`quiesce`]: the probe that observes when the cluster has gone quiet
//! - [`runner`]: the single-threaded driver marrying the event queue to a
//!   tokio `LocalSet`
//!
//! ## Quick start
//!
//! ```ignore
//! use stillwater::{Locality, ProcessClass, SimWorld};
//!
//! let world = SimWorld::new(0xDEADBEEF);
//! let p1 = world.new_process(
//!     "server", "10.0.0.1".parse().unwrap(), 1,
//!     Locality::zoned("zone-1"), ProcessClass::Storage, "/data/1", "/coord/1",
//! );
//! stillwater::runner::block_on(&world, async move {
//!     // drive workloads against world.network_provider() / world.file_system()
//! });
//! ```
//!
//! ## Determinism
//!
//! All randomness flows through one seeded thread-local RNG; tasks at equal
//! virtual time dispatch in insertion order; one OS thread runs everything.
//! Two runs with the same seed and topology produce identical `(time,
//! process, sequence)` dispatch traces.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod buggify;
pub mod config;
pub mod error;
pub mod fault;
pub mod fs;
pub mod net;
pub mod quiesce;
pub mod registry;
pub mod rng;
pub mod runner;
pub mod sim;
pub mod types;

pub use config::{DiskConfig, NetworkConfig, QuietGates, SimConfig};
pub use error::{SimError, SimResult};
pub use fault::inject_fault;
pub use fs::{DiskBytes, OpenFlags, SimFile, SimFileSystem};
pub use net::{ClogMode, ConnCounters, SimNetworkProvider, SimTcpStream};
pub use quiesce::{
    quiet_database_with_watchdog, wait_for_quiet_database, ClusterTelemetry, TelemetryServer,
};
pub use registry::{KillKind, ProcessId, ReplicationPolicy};
pub use rng::{current_sim_seed, set_sim_seed, sim_random, sim_random01, sim_random_range};
pub use runner::{block_on, SimContext, Simulation, SimulationReport, Workload};
pub use sim::{SimWorld, SimulationMetrics, TaskPriority};
pub use types::{Locality, LocalityField, NetworkAddress, ProcessClass, UID};
