//! The fault-injection capability hook.
//!
//! `inject_fault` returns a plain boolean; call sites decide which error to
//! raise. It is a pure function of the current process's armed parameters
//! and the call site, so refactoring that moves code does not change which
//! faults fire for a seed beyond the lines involved.

use tracing::warn;

use crate::rng::sim_random01;
use crate::sim::world::SimWorld;

/// Whether a fault should fire at this call site.
///
/// Fires only when the current process has fault injection armed (via an
/// `InjectFaults` kill), its `p2` roll hits, speed-up is off, and the
/// deterministic hash of `(line, seed)` falls under `p1 * 2^32`.
pub fn inject_fault(sim: &SimWorld, context: &str, line: u32) -> bool {
    let inner = sim.inner.borrow();
    let process = inner.registry.process(inner.current_process);
    if process.fault_injection_p2 > 0.0
        && sim_random01() < process.fault_injection_p2
        && !inner.speed_up_simulation
    {
        let h1 = (line as u64).wrapping_add(process.fault_injection_r >> 32) as u32;
        if (h1 as f64) < process.fault_injection_p1 * u32::MAX as f64 {
            warn!(context, line, "fault injected");
            return true;
        }
    }
    false
}
