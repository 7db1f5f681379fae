//! The central simulation coordinator.
//!
//! `SimWorld` owns all mutable simulation state behind one `Rc<RefCell>`
//! and advances virtual time by dispatching the earliest scheduled task.
//! Everything else — registry, network, filesystem — hangs off the same
//! inner state and is mutated only from dispatched tasks, so no locking
//! beyond the single-threaded discipline is needed.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::{Rc, Weak};
use std::task::Waker;

use tracing::{debug, instrument};

use crate::config::SimConfig;
use crate::error::{SimError, SimResult};
use crate::fs::FsState;
use crate::net::conn::NetState;
use crate::registry::{kill, ProcessId, RegistryState};
use crate::rng::{reset_sim_rng, set_sim_seed, sim_random01, sim_random_range};
use crate::sim::queue::{Event, EventQueue, ScheduledTask, TaskPriority};
use crate::sim::sleep::{ShutdownFuture, TaskFuture, TaskState, YieldFuture};
use crate::sim::wakers::WakerRegistry;

/// Counters a simulation run reports at the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SimulationMetrics {
    /// Total tasks ever enqueued.
    pub tasks_scheduled: u64,
    /// Tasks dispatched on live processes.
    pub events_processed: u64,
}

impl SimulationMetrics {
    /// Zero every counter.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug)]
pub(crate) struct SimInner {
    pub(crate) time: f64,
    /// Drifted timer, up to 100ms ahead of `time`.
    pub(crate) timer_time: f64,
    pub(crate) queue: EventQueue,
    pub(crate) next_stable: u64,
    pub(crate) task_count: u64,
    pub(crate) events_processed: u64,
    pub(crate) next_task_id: u64,
    /// Tasks dispatched but not yet observed by their future.
    pub(crate) awakened: HashSet<u64>,
    /// Tasks whose target died before dispatch.
    pub(crate) cancelled: HashSet<u64>,
    /// Tasks whose future was dropped before dispatch; their wake is a no-op.
    pub(crate) orphaned: HashSet<u64>,
    pub(crate) wakers: WakerRegistry,
    pub(crate) current_process: ProcessId,
    /// Whether a yield was granted during the current dispatch.
    pub(crate) yielded: bool,
    /// Down-counter forcing an occasional true yield; unbounded cooperative
    /// runs would otherwise blow the real stack.
    pub(crate) yield_limit: i32,
    pub(crate) config: SimConfig,
    pub(crate) speed_up_simulation: bool,
    pub(crate) enable_connection_failures: bool,
    pub(crate) registry: RegistryState,
    pub(crate) net: NetState,
    pub(crate) fs: FsState,
}

impl SimInner {
    fn new(config: SimConfig) -> Self {
        let enable_connection_failures = config.network.enable_connection_failures;
        Self {
            time: 0.0,
            timer_time: 0.0,
            queue: EventQueue::new(),
            next_stable: 0,
            task_count: 0,
            events_processed: 0,
            next_task_id: 0,
            awakened: HashSet::new(),
            cancelled: HashSet::new(),
            orphaned: HashSet::new(),
            wakers: WakerRegistry::default(),
            current_process: ProcessId(0),
            yielded: false,
            yield_limit: 0,
            config,
            speed_up_simulation: false,
            enable_connection_failures,
            registry: RegistryState::new(),
            net: NetState::default(),
            fs: FsState::default(),
        }
    }

    /// Enqueue an event `delay` virtual seconds from now on behalf of
    /// `target`.
    pub(crate) fn schedule(
        &mut self,
        event: Event,
        target: ProcessId,
        delay: f64,
        priority: TaskPriority,
    ) {
        debug_assert!(priority.is_valid(), "priority out of range");
        debug_assert!(delay >= 0.0);
        let stable = self.next_stable;
        self.next_stable += 1;
        self.task_count += 1;
        self.queue.push(ScheduledTask {
            time: self.time + delay,
            priority,
            stable,
            target,
            event,
        });
    }

    /// Schedule a wake task and return its id for a future to wait on.
    pub(crate) fn new_task(&mut self, target: ProcessId, delay: f64, priority: TaskPriority) -> u64 {
        let task_id = self.next_task_id;
        self.next_task_id += 1;
        self.schedule(Event::Wake { task_id }, target, delay, priority);
        task_id
    }
}

/// The simulation world: virtual time, the event queue, and all simulated
/// machines, processes, connections, and files.
///
/// Cheap to clone (a shared handle). Use [`SimWorld::downgrade`] for
/// references that must not keep the world alive.
#[derive(Debug, Clone)]
pub struct SimWorld {
    pub(crate) inner: Rc<RefCell<SimInner>>,
}

/// Weak handle to a [`SimWorld`].
#[derive(Debug, Clone)]
pub struct WeakSimWorld {
    inner: Weak<RefCell<SimInner>>,
}

impl WeakSimWorld {
    /// Upgrade to a strong handle, failing with `BrokenPromise` once the
    /// world is gone.
    pub(crate) fn upgrade(&self) -> SimResult<SimWorld> {
        self.inner
            .upgrade()
            .map(|inner| SimWorld { inner })
            .ok_or(SimError::BrokenPromise)
    }
}

impl SimWorld {
    /// Create a world with default (quiet) configuration.
    pub fn new(seed: u64) -> Self {
        Self::with_config(SimConfig::default(), seed)
    }

    /// Create a world with explicit configuration.
    ///
    /// Resets the thread-local RNG before seeding, so consecutive
    /// simulations on one thread start from clean state.
    pub fn with_config(config: SimConfig, seed: u64) -> Self {
        reset_sim_rng();
        set_sim_seed(seed);
        crate::buggify::buggify_reset();
        Self {
            inner: Rc::new(RefCell::new(SimInner::new(config))),
        }
    }

    /// Create a weak handle.
    pub fn downgrade(&self) -> WeakSimWorld {
        WeakSimWorld {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Current virtual time in seconds.
    pub fn now(&self) -> f64 {
        self.inner.borrow().time
    }

    /// Drifted per-query timer: up to 100ms ahead of [`SimWorld::now`],
    /// never behind it, approaching the bound in random damped steps.
    pub fn timer(&self) -> f64 {
        const MAX_DRIFT: f64 = 0.1;
        let mut inner = self.inner.borrow_mut();
        let max_timer = inner.time + MAX_DRIFT;
        if inner.timer_time < max_timer {
            inner.timer_time += sim_random01() * (max_timer - inner.timer_time) / 2.0;
        }
        inner.timer_time = inner.timer_time.max(inner.time);
        inner.timer_time
    }

    /// The process whose continuation is currently running.
    pub fn current_process(&self) -> ProcessId {
        self.inner.borrow().current_process
    }

    /// Total tasks ever enqueued.
    pub fn task_count(&self) -> u64 {
        self.inner.borrow().task_count
    }

    /// Snapshot run counters.
    pub fn metrics(&self) -> SimulationMetrics {
        let inner = self.inner.borrow();
        SimulationMetrics {
            tasks_scheduled: inner.task_count,
            events_processed: inner.events_processed,
        }
    }

    /// Whether the simulation is in speed-up mode (congestion and fault
    /// injection suppressed so a run can finish).
    pub fn speed_up_simulation(&self) -> bool {
        self.inner.borrow().speed_up_simulation
    }

    /// Toggle speed-up mode.
    pub fn set_speed_up_simulation(&self, on: bool) {
        self.inner.borrow_mut().speed_up_simulation = on;
    }

    /// Whether random connection failures are active.
    pub fn connection_failures_enabled(&self) -> bool {
        self.inner.borrow().enable_connection_failures
    }

    /// Toggle random connection failures.
    pub fn set_connection_failures(&self, on: bool) {
        self.inner.borrow_mut().enable_connection_failures = on;
    }

    /// Schedule a resolution at least `seconds` of virtual time from now on
    /// behalf of `target`.
    ///
    /// Slightly negative delays (down to `-1e-4`, floating-point slop from
    /// deadline arithmetic) clamp to zero; anything more negative is an
    /// invariant violation. While buggified delays are enabled, 25% of
    /// same-process delays stretch by `max_buggified_delay * random01()^1000`.
    pub fn delay(&self, seconds: f64, priority: TaskPriority, target: ProcessId) -> TaskFuture {
        assert!(priority.is_valid(), "priority {priority:?} out of range");
        assert!(
            seconds >= -1e-4,
            "delay of {seconds} seconds is an invariant violation"
        );
        let mut seconds = seconds.max(0.0);
        let mut inner = self.inner.borrow_mut();
        let current = inner.current_process;
        let process = inner.registry.process(current);
        let max_buggified = inner.config.network.max_buggified_delay;
        if !process.rebooting
            && process.shutdown.is_none()
            && target == current
            && max_buggified > 0.0
            && sim_random01() < 0.25
        {
            seconds += max_buggified * sim_random01().powf(1000.0);
        }
        let task_id = inner.new_task(target, seconds, priority);
        TaskFuture::new(self.downgrade(), task_id)
    }

    /// `delay` on the current process with the conventional priority.
    pub fn sleep(&self, seconds: f64) -> TaskFuture {
        let current = self.current_process();
        self.delay(seconds, TaskPriority::DEFAULT_DELAY, current)
    }

    /// Hop onto `process`'s context.
    pub fn on_process(&self, process: ProcessId, priority: TaskPriority) -> TaskFuture {
        self.delay(0.0, priority, process)
    }

    /// Re-enter the event queue on the current process at the current time.
    ///
    /// Code that has been computing for a while uses this to fall back into
    /// dispatch order behind anything already enqueued.
    pub fn on_main_thread(&self, priority: TaskPriority) -> TaskFuture {
        let current = self.current_process();
        self.delay(0.0, priority, current)
    }

    /// Hop onto the hidden machine-process of `process`'s machine.
    pub fn on_machine(&self, process: ProcessId, priority: TaskPriority) -> TaskFuture {
        let machine_process = self.inner.borrow().registry.machine_process_of(process);
        self.delay(0.0, priority, machine_process)
    }

    /// Whether the caller should yield: true once per dispatch, when the
    /// yield down-counter runs out, or occasionally at random.
    pub fn check_yield(&self, _priority: TaskPriority) -> bool {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.yielded {
                return true;
            }
            inner.yield_limit -= 1;
            if inner.yield_limit <= 0 {
                inner.yield_limit = sim_random_range(1..150);
                inner.yielded = true;
                return true;
            }
        }
        let yielded = crate::buggify_with_prob!(0.01);
        self.inner.borrow_mut().yielded = yielded;
        yielded
    }

    /// Cooperatively yield. When the yield check fires, this suspends for a
    /// tick (instantly on a rebooting process) raced against the current
    /// process's shutdown signal; a fired signal resolves
    /// `Err(ActorCancelled)`.
    pub fn yield_now(&self, priority: TaskPriority) -> YieldFuture {
        if !self.check_yield(priority) {
            return YieldFuture::ready();
        }
        let (current, rebooting) = {
            let inner = self.inner.borrow();
            let current = inner.current_process;
            (current, inner.registry.process(current).rebooting)
        };
        let delay = self.delay(
            if rebooting { 0.0 } else { 0.001 },
            priority,
            current,
        );
        YieldFuture::suspended(delay, ShutdownFuture::new(self.downgrade(), current))
    }

    /// A future for `process`'s shutdown signal.
    pub fn shutdown_signal(&self, process: ProcessId) -> ShutdownFuture {
        ShutdownFuture::new(self.downgrade(), process)
    }

    /// Dispatch the earliest task. Returns whether more tasks remain.
    ///
    /// A task whose target has failed is resolved as never: time does not
    /// advance and the waiting future (if any) observes cancellation.
    #[instrument(skip(self), level = "trace")]
    pub fn step(&self) -> bool {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        let Some(task) = inner.queue.pop_earliest() else {
            return false;
        };
        if inner.registry.process(task.target).failed {
            if let Event::Wake { task_id } = task.event {
                if !inner.orphaned.remove(&task_id) {
                    inner.cancelled.insert(task_id);
                    if let Some(waker) = inner.wakers.task_wakers.remove(&task_id) {
                        waker.wake();
                    }
                }
            }
            return !inner.queue.is_empty();
        }

        debug_assert!(task.time >= inner.time, "virtual time went backwards");
        inner.time = task.time;
        inner.current_process = task.target;
        inner.yielded = false;
        inner.events_processed += 1;

        match task.event {
            Event::Wake { task_id } => {
                if !inner.orphaned.remove(&task_id) {
                    inner.awakened.insert(task_id);
                    if let Some(waker) = inner.wakers.task_wakers.remove(&task_id) {
                        waker.wake();
                    }
                }
            }
            Event::ConnSent { conn } => inner.handle_conn_sent(conn),
            Event::ConnDeliverHop { conn, pos } => inner.handle_conn_deliver_hop(conn, pos),
            Event::ConnDeliver { conn, pos } => inner.handle_conn_deliver(conn, pos),
            Event::ConnLeakCheck { conn } => inner.handle_conn_leak_check(conn),
            Event::ListenerDeliver { conn } => inner.handle_listener_deliver(conn),
            Event::Reboot { process, kind } => kill::handle_reboot(inner, process, kind),
        }
        !inner.queue.is_empty()
    }

    /// Dispatch tasks until the queue drains.
    pub fn run_until_empty(&self) {
        while self.step() {}
        // Dispatch the final task's effects too.
        debug!(now = self.now(), "event queue drained");
    }

    /// Whether any tasks are waiting.
    pub fn has_pending_tasks(&self) -> bool {
        !self.inner.borrow().queue.is_empty()
    }

    /// Number of tasks waiting.
    pub fn pending_task_count(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    // ---- internals used by the suspension futures ----

    pub(crate) fn take_task_state(&self, task_id: u64) -> TaskState {
        let mut inner = self.inner.borrow_mut();
        if inner.awakened.remove(&task_id) {
            TaskState::Awake
        } else if inner.cancelled.remove(&task_id) {
            TaskState::Cancelled
        } else {
            TaskState::Pending
        }
    }

    pub(crate) fn register_task_waker(&self, task_id: u64, waker: Waker) {
        self.inner.borrow_mut().wakers.task_wakers.insert(task_id, waker);
    }

    pub(crate) fn register_shutdown_waker(&self, process: ProcessId, waker: Waker) {
        self.inner
            .borrow_mut()
            .wakers
            .shutdown_wakers
            .entry(process)
            .or_default()
            .push(waker);
    }
}
