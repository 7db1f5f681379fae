//! Driving async workloads against the simulation.
//!
//! The simulator is strictly cooperative: one tokio current-thread runtime
//! polls workload futures on a `LocalSet`, and between polls the drive loop
//! dispatches event-queue tasks. Time advances only when every future is
//! stalled on a scheduled task, so runs are deterministic for a seed.

use std::future::Future;
use std::rc::Rc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::{SimError, SimResult};
use crate::fs::SimFileSystem;
use crate::net::SimNetworkProvider;
use crate::registry::{KillKind, ProcessId};
use crate::rng::current_sim_seed;
use crate::sim::world::{SimWorld, SimulationMetrics};

/// Iterations of the drive loop without queue progress before the run is
/// declared deadlocked.
const DEADLOCK_LIMIT: u32 = 1000;

/// Everything a workload needs: its process identity and the simulated
/// network and filesystem surfaces.
#[derive(Clone)]
pub struct SimContext {
    world: SimWorld,
    process: ProcessId,
    network: SimNetworkProvider,
    file_system: SimFileSystem,
    shutdown: CancellationToken,
}

impl SimContext {
    /// Build a context for a process.
    pub fn new(world: &SimWorld, process: ProcessId) -> Self {
        Self {
            network: world.network_provider(),
            file_system: world.file_system(),
            world: world.clone(),
            process,
            shutdown: CancellationToken::new(),
        }
    }

    /// The owning world.
    pub fn world(&self) -> &SimWorld {
        &self.world
    }

    /// The process this workload runs as.
    pub fn process(&self) -> ProcessId {
        self.process
    }

    /// Simulated network surface.
    pub fn network(&self) -> &SimNetworkProvider {
        &self.network
    }

    /// Simulated filesystem surface.
    pub fn file_system(&self) -> &SimFileSystem {
        &self.file_system
    }

    /// Cancelled once every workload's run phase has completed; long-lived
    /// server loops should select against it.
    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }
}

/// A test workload with setup/run/check phases.
#[async_trait(?Send)]
pub trait Workload {
    /// Display name for the report.
    fn name(&self) -> &str;

    /// Sequential preparation before any run phase starts.
    async fn setup(&self, _ctx: &SimContext) -> SimResult<()> {
        Ok(())
    }

    /// The workload body; all workloads run concurrently.
    async fn run(&self, ctx: &SimContext) -> SimResult<()>;

    /// Sequential validation after every run phase finished.
    async fn check(&self, _ctx: &SimContext) -> SimResult<()> {
        Ok(())
    }
}

/// Per-run report: one result per workload plus the world's counters.
#[derive(Debug)]
pub struct SimulationReport {
    /// Seed the run used.
    pub seed: u64,
    /// `(workload name, result)` pairs in registration order.
    pub results: Vec<(String, SimResult<()>)>,
    /// Final world counters.
    pub metrics: SimulationMetrics,
}

impl SimulationReport {
    /// Whether every workload succeeded.
    pub fn ok(&self) -> bool {
        self.results.iter().all(|(_, r)| r.is_ok())
    }
}

/// Orchestrates a set of workloads over one world.
pub struct Simulation {
    world: SimWorld,
    workloads: Vec<(ProcessId, Rc<dyn Workload>)>,
}

impl Simulation {
    /// Create an orchestrator over `world`.
    pub fn new(world: SimWorld) -> Self {
        Self {
            world,
            workloads: Vec::new(),
        }
    }

    /// Register a workload to run as `process`.
    pub fn add_workload(&mut self, process: ProcessId, workload: Rc<dyn Workload>) -> &mut Self {
        self.workloads.push((process, workload));
        self
    }

    /// Run setup phases sequentially, all run phases concurrently, then
    /// check phases sequentially.
    ///
    /// A panic escaping a workload is a bug in the code under test: the
    /// workload's process is killed instantly after an error trace and its
    /// result reports cancellation.
    pub fn run(self) -> SimulationReport {
        let world = self.world.clone();
        let workloads = self.workloads;
        block_on(&self.world, async move {
            let shutdown = CancellationToken::new();
            let contexts: Vec<SimContext> = workloads
                .iter()
                .map(|(process, _)| SimContext {
                    network: world.network_provider(),
                    file_system: world.file_system(),
                    world: world.clone(),
                    process: *process,
                    shutdown: shutdown.clone(),
                })
                .collect();

            let mut results: Vec<(String, SimResult<()>)> = Vec::new();

            for ((_, workload), ctx) in workloads.iter().zip(&contexts) {
                debug!(workload = workload.name(), "setup phase");
                if let Err(e) = workload.setup(ctx).await {
                    error!(workload = workload.name(), %e, "setup failed");
                    results.push((workload.name().to_string(), Err(e)));
                    return SimulationReport {
                        seed: current_sim_seed(),
                        results,
                        metrics: world.metrics(),
                    };
                }
            }

            let mut handles = Vec::new();
            for ((_, workload), ctx) in workloads.iter().zip(&contexts) {
                debug!(workload = workload.name(), "run phase");
                let workload = Rc::clone(workload);
                let ctx = ctx.clone();
                handles.push(tokio::task::spawn_local(async move {
                    workload.run(&ctx).await
                }));
            }

            for (i, handle) in handles.into_iter().enumerate() {
                let workload = &workloads[i].1;
                let result = match handle.await {
                    Ok(result) => result,
                    Err(join_err) if join_err.is_panic() => {
                        // An error outside the closed set escaped the
                        // continuation; convert it into an instant kill.
                        error!(
                            workload = workload.name(),
                            "workload panicked; killing its process"
                        );
                        world.kill_process(contexts[i].process(), KillKind::KillInstantly);
                        Err(SimError::ActorCancelled)
                    }
                    Err(_) => Err(SimError::ActorCancelled),
                };
                results.push((workload.name().to_string(), result));
            }
            shutdown.cancel();

            for ((_, workload), ctx) in workloads.iter().zip(&contexts) {
                debug!(workload = workload.name(), "check phase");
                if let Err(e) = workload.check(ctx).await {
                    error!(workload = workload.name(), %e, "check failed");
                    results.push((format!("{}/check", workload.name()), Err(e)));
                }
            }

            SimulationReport {
                seed: current_sim_seed(),
                results,
                metrics: world.metrics(),
            }
        })
    }
}

/// Drive `future` to completion against `world`.
///
/// Interleaves one event-queue dispatch with one executor turn, so futures
/// woken by a dispatch run before time advances again. Panics on deadlock
/// (futures pending, queue empty, nothing finishing) with the seed to
/// reproduce.
pub fn block_on<T: 'static>(world: &SimWorld, future: impl Future<Output = T> + 'static) -> T {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("current-thread runtime");
    let local = tokio::task::LocalSet::new();
    let world = world.clone();
    local.block_on(&runtime, async move {
        let mut handle = tokio::task::spawn_local(future);
        let mut idle = 0u32;
        loop {
            tokio::select! {
                biased;
                result = &mut handle => {
                    return match result {
                        Ok(value) => value,
                        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                        Err(_) => unreachable!("root task is never aborted"),
                    };
                }
                _ = tokio::task::yield_now() => {}
            }
            if world.has_pending_tasks() {
                world.step();
                idle = 0;
            } else {
                idle += 1;
                assert!(
                    idle <= DEADLOCK_LIMIT,
                    "simulation deadlock: futures pending with an empty event queue (seed {})",
                    current_sim_seed()
                );
            }
        }
    })
}
