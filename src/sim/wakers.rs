//! Waker bookkeeping bridging the event queue to async tasks.

use std::collections::HashMap;
use std::task::Waker;

use crate::registry::ProcessId;

/// All registered wakers, keyed by what they wait on.
#[derive(Debug, Default)]
pub(crate) struct WakerRegistry {
    /// Futures waiting on a scheduled task, by task id.
    pub(crate) task_wakers: HashMap<u64, Waker>,
    /// Readers waiting for `received` to advance, by connection id.
    pub(crate) read_wakers: HashMap<u64, Waker>,
    /// Writers waiting for destination buffer capacity, by destination
    /// connection id.
    pub(crate) write_wakers: HashMap<u64, Vec<Waker>>,
    /// Accept calls waiting on a process's listener.
    pub(crate) accept_wakers: HashMap<ProcessId, Waker>,
    /// Futures waiting on a process's shutdown signal.
    pub(crate) shutdown_wakers: HashMap<ProcessId, Vec<Waker>>,
}

impl WakerRegistry {
    /// Wake every waker in a keyed list.
    pub(crate) fn wake_all(wakers: &mut HashMap<u64, Vec<Waker>>, key: u64) {
        if let Some(list) = wakers.remove(&key) {
            for waker in list {
                waker.wake();
            }
        }
    }
}
