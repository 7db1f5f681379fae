//! Seeded, low-probability perturbations at marked code locations.
//!
//! Each location is randomly activated once per run; active locations then
//! fire probabilistically on each call. Both decisions come from the
//! simulation RNG, so a seed reproduces exactly which perturbations happen.

use std::cell::RefCell;
use std::collections::HashMap;

use crate::rng::sim_random01;

thread_local! {
    static STATE: RefCell<BuggifyState> = RefCell::new(BuggifyState::default());
}

#[derive(Default)]
struct BuggifyState {
    enabled: bool,
    active_locations: HashMap<&'static str, bool>,
    activation_prob: f64,
}

/// Enable buggification for the current run with the given per-location
/// activation probability (0.25 is the conventional value).
pub fn buggify_init(activation_prob: f64) {
    STATE.with(|state| {
        let mut state = state.borrow_mut();
        state.enabled = true;
        state.active_locations.clear();
        state.activation_prob = activation_prob;
    });
}

/// Disable buggification and forget all activation decisions.
pub fn buggify_reset() {
    STATE.with(|state| {
        let mut state = state.borrow_mut();
        state.enabled = false;
        state.active_locations.clear();
        state.activation_prob = 0.0;
    });
}

/// Implementation behind the macros; prefer [`buggify!`](crate::buggify!)
/// and [`buggify_with_prob!`](crate::buggify_with_prob!).
pub fn buggify_internal(prob: f64, location: &'static str) -> bool {
    STATE.with(|state| {
        let mut state = state.borrow_mut();
        if !state.enabled || prob <= 0.0 {
            return false;
        }

        let activation_prob = state.activation_prob;
        let is_active = *state
            .active_locations
            .entry(location)
            .or_insert_with(|| sim_random01() < activation_prob);

        is_active && sim_random01() < prob
    })
}

/// Fire with 25% probability at an activated location.
#[macro_export]
macro_rules! buggify {
    () => {
        $crate::buggify::buggify_internal(0.25, concat!(file!(), ":", line!()))
    };
}

/// Fire with a custom probability at an activated location.
#[macro_export]
macro_rules! buggify_with_prob {
    ($prob:expr) => {
        $crate::buggify::buggify_internal($prob as f64, concat!(file!(), ":", line!()))
    };
}
