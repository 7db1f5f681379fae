//! The event queue: future tasks ordered by `(virtual_time, stable)`.
//!
//! Every scheduled action in the simulation is a [`ScheduledTask`]. Ordering
//! is earliest time first; ties break by ascending insertion order, so two
//! tasks enqueued at the same instant dispatch FIFO. Priority is carried on
//! tasks purely as caller metadata — within a tick, only insertion order
//! decides.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::registry::ProcessId;

/// Task priority, an integer in `[MIN, MAX]` carried as metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskPriority(pub i32);

impl TaskPriority {
    /// Lowest legal priority.
    pub const MIN: Self = Self(0);
    /// Conventional priority for yields.
    pub const DEFAULT_YIELD: Self = Self(7_000);
    /// Conventional priority for delays.
    pub const DEFAULT_DELAY: Self = Self(7_010);
    /// Highest legal priority.
    pub const MAX: Self = Self(1_000_000);

    /// Whether this priority lies in the legal range.
    pub fn is_valid(self) -> bool {
        (Self::MIN..=Self::MAX).contains(&self)
    }
}

/// What happens when a task dispatches.
#[derive(Debug, Clone)]
pub(crate) enum Event {
    /// Wake the future waiting on this task id.
    Wake { task_id: u64 },
    /// Sender step of a connection pipeline: `sent = written`.
    ConnSent { conn: u64 },
    /// Outbound half of a delivery elapsed; schedule the inbound half.
    ConnDeliverHop { conn: u64, pos: u64 },
    /// Inbound half elapsed: `received = pos`, wake readers.
    ConnDeliver { conn: u64, pos: u64 },
    /// Leak check 20 seconds after a peer closed.
    ConnLeakCheck { conn: u64 },
    /// Hand a half-open connection to the target process's listener.
    ListenerDeliver { conn: u64 },
    /// Mark a process rebooting and fire its shutdown signal.
    Reboot {
        process: ProcessId,
        kind: crate::registry::KillKind,
    },
}

/// A task on the event queue.
#[derive(Debug)]
pub(crate) struct ScheduledTask {
    pub(crate) time: f64,
    #[allow(dead_code)] // metadata only; ordering is (time, stable)
    pub(crate) priority: TaskPriority,
    pub(crate) stable: u64,
    pub(crate) target: ProcessId,
    pub(crate) event: Event,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.stable == other.stable
    }
}

impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest (time, stable)
        // pops first.
        self.time
            .total_cmp(&other.time)
            .then(self.stable.cmp(&other.stable))
            .reverse()
    }
}

/// Priority queue of scheduled tasks.
#[derive(Debug, Default)]
pub(crate) struct EventQueue {
    heap: BinaryHeap<ScheduledTask>,
}

impl EventQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, task: ScheduledTask) {
        self.heap.push(task);
    }

    pub(crate) fn pop_earliest(&mut self) -> Option<ScheduledTask> {
        self.heap.pop()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(time: f64, stable: u64) -> ScheduledTask {
        ScheduledTask {
            time,
            priority: TaskPriority::DEFAULT_DELAY,
            stable,
            target: ProcessId(0),
            event: Event::Wake { task_id: stable },
        }
    }

    #[test]
    fn earliest_time_pops_first() {
        let mut queue = EventQueue::new();
        queue.push(task(2.0, 0));
        queue.push(task(1.0, 1));
        queue.push(task(3.0, 2));

        assert_eq!(queue.pop_earliest().expect("task").time, 1.0);
        assert_eq!(queue.pop_earliest().expect("task").time, 2.0);
        assert_eq!(queue.pop_earliest().expect("task").time, 3.0);
    }

    #[test]
    fn ties_break_by_insertion_order() {
        let mut queue = EventQueue::new();
        for stable in 0..10 {
            queue.push(task(5.0, stable));
        }
        for expected in 0..10 {
            assert_eq!(queue.pop_earliest().expect("task").stable, expected);
        }
    }

    #[test]
    fn priority_does_not_affect_ordering() {
        let mut queue = EventQueue::new();
        queue.push(ScheduledTask {
            priority: TaskPriority::MIN,
            ..task(1.0, 0)
        });
        queue.push(ScheduledTask {
            priority: TaskPriority::MAX,
            ..task(1.0, 1)
        });
        assert_eq!(queue.pop_earliest().expect("task").stable, 0);
    }

    #[test]
    fn priority_range() {
        assert!(TaskPriority::DEFAULT_DELAY.is_valid());
        assert!(!TaskPriority(-1).is_valid());
        assert!(!TaskPriority(1_000_001).is_valid());
    }
}
