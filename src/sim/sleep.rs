//! Futures that suspend on event-queue tasks.
//!
//! Every suspending operation in the simulation resumes when a scheduled
//! task fires. A task whose target process died resolves with
//! `Err(ActorCancelled)` — the Rust rendition of a signal that "never
//! fires" — so dependent futures tear down promptly instead of leaking.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::{SimError, SimResult};
use crate::registry::{KillKind, ProcessId};
use crate::sim::world::WeakSimWorld;

/// Outcome of a scheduled task, as observed by its future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskState {
    /// Not yet dispatched.
    Pending,
    /// Dispatched on a live process.
    Awake,
    /// The target process died before dispatch.
    Cancelled,
}

/// Future resolved when a scheduled task dispatches.
///
/// Returned by `delay`, `sleep`, `on_process`, and `on_machine`.
#[derive(Debug)]
pub struct TaskFuture {
    sim: WeakSimWorld,
    task_id: u64,
    done: bool,
}

impl TaskFuture {
    pub(crate) fn new(sim: WeakSimWorld, task_id: u64) -> Self {
        Self {
            sim,
            task_id,
            done: false,
        }
    }
}

impl Future for TaskFuture {
    type Output = SimResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Ok(sim) = this.sim.upgrade() else {
            return Poll::Ready(Err(SimError::BrokenPromise));
        };
        match sim.take_task_state(this.task_id) {
            TaskState::Awake => {
                this.done = true;
                Poll::Ready(Ok(()))
            }
            TaskState::Cancelled => {
                this.done = true;
                Poll::Ready(Err(SimError::ActorCancelled))
            }
            TaskState::Pending => {
                sim.register_task_waker(this.task_id, cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl Drop for TaskFuture {
    fn drop(&mut self) {
        // A future dropped mid-wait abandons its task; mark the eventual
        // dispatch a no-op so the bookkeeping does not accumulate (timeouts
        // drop these a lot).
        if self.done {
            return;
        }
        if let Ok(sim) = self.sim.upgrade() {
            let mut inner = sim.inner.borrow_mut();
            let fired =
                inner.awakened.remove(&self.task_id) || inner.cancelled.remove(&self.task_id);
            if !fired {
                inner.orphaned.insert(self.task_id);
            }
            inner.wakers.task_wakers.remove(&self.task_id);
        }
    }
}

/// Future resolved when a process's shutdown signal fires with a kill kind.
#[derive(Debug)]
pub struct ShutdownFuture {
    sim: WeakSimWorld,
    process: ProcessId,
}

impl ShutdownFuture {
    pub(crate) fn new(sim: WeakSimWorld, process: ProcessId) -> Self {
        Self { sim, process }
    }
}

impl Future for ShutdownFuture {
    type Output = SimResult<KillKind>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Ok(sim) = self.sim.upgrade() else {
            return Poll::Ready(Err(SimError::BrokenPromise));
        };
        if let Some(kind) = sim.shutdown_kind(self.process) {
            return Poll::Ready(Ok(kind));
        }
        if sim.process_failed(self.process) {
            // Killed instantly: the signal's sender died without firing.
            return Poll::Ready(Err(SimError::BrokenPromise));
        }
        sim.register_shutdown_waker(self.process, cx.waker().clone());
        Poll::Pending
    }
}

/// Future returned by `yield_now`.
///
/// Either immediately ready (the yield check declined) or a short delay
/// raced against the yielding process's shutdown signal, giving long
/// cooperative runs a cancellation point.
#[derive(Debug)]
pub struct YieldFuture {
    inner: Option<TaskFuture>,
    shutdown: Option<ShutdownFuture>,
}

impl YieldFuture {
    pub(crate) fn ready() -> Self {
        Self {
            inner: None,
            shutdown: None,
        }
    }

    pub(crate) fn suspended(inner: TaskFuture, shutdown: ShutdownFuture) -> Self {
        Self {
            inner: Some(inner),
            shutdown: Some(shutdown),
        }
    }
}

impl Future for YieldFuture {
    type Output = SimResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        if let Some(shutdown) = this.shutdown.as_mut() {
            if let Poll::Ready(result) = Pin::new(shutdown).poll(cx) {
                return Poll::Ready(match result {
                    Ok(_) | Err(SimError::BrokenPromise) => Err(SimError::ActorCancelled),
                    Err(e) => Err(e),
                });
            }
        }
        Pin::new(inner).poll(cx)
    }
}
