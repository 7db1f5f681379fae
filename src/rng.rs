//! Thread-local seeded random number generation.
//!
//! All randomness in a simulation flows through one thread-local ChaCha8
//! generator, so a single seed reproduces an entire run while independent
//! test threads stay isolated from each other.

use std::cell::RefCell;

use rand::distr::uniform::SampleUniform;
use rand::distr::{Distribution, StandardUniform};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

thread_local! {
    static SIM_RNG: RefCell<ChaCha8Rng> = RefCell::new(ChaCha8Rng::seed_from_u64(0));
    static CURRENT_SEED: RefCell<u64> = const { RefCell::new(0) };
}

/// Seed the thread-local simulation RNG. The same seed always produces the
/// same sequence of samples within a thread.
pub fn set_sim_seed(seed: u64) {
    SIM_RNG.with(|rng| *rng.borrow_mut() = ChaCha8Rng::seed_from_u64(seed));
    CURRENT_SEED.with(|s| *s.borrow_mut() = seed);
}

/// The seed last set via [`set_sim_seed`], for failure reports.
pub fn current_sim_seed() -> u64 {
    CURRENT_SEED.with(|s| *s.borrow())
}

/// Reset the RNG to its initial (seed 0) state. Call between consecutive
/// simulations on the same thread.
pub fn reset_sim_rng() {
    SIM_RNG.with(|rng| *rng.borrow_mut() = ChaCha8Rng::seed_from_u64(0));
    CURRENT_SEED.with(|s| *s.borrow_mut() = 0);
}

/// Sample a random value from the simulation RNG.
pub fn sim_random<T>() -> T
where
    StandardUniform: Distribution<T>,
{
    SIM_RNG.with(|rng| rng.borrow_mut().sample(StandardUniform))
}

/// Sample a random value in `range` (half-open) from the simulation RNG.
pub fn sim_random_range<T>(range: std::ops::Range<T>) -> T
where
    T: SampleUniform + PartialOrd,
{
    SIM_RNG.with(|rng| rng.borrow_mut().random_range(range))
}

/// Uniform f64 in `[0, 1)`, the workhorse of every probability roll.
pub fn sim_random01() -> f64 {
    sim_random::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_sequence() {
        set_sim_seed(42);
        let a: f64 = sim_random();
        let b: u32 = sim_random();
        let c = sim_random_range(0u64..1000);

        set_sim_seed(42);
        assert_eq!(a, sim_random::<f64>());
        assert_eq!(b, sim_random::<u32>());
        assert_eq!(c, sim_random_range(0u64..1000));
    }

    #[test]
    fn different_seeds_diverge() {
        set_sim_seed(1);
        let a: f64 = sim_random();
        set_sim_seed(2);
        let b: f64 = sim_random();
        assert_ne!(a, b);
    }

    #[test]
    fn range_bounds_hold() {
        set_sim_seed(7);
        for _ in 0..200 {
            let v = sim_random_range(10..20);
            assert!((10..20).contains(&v));
            let f = sim_random01();
            assert!((0.0..1.0).contains(&f));
        }
    }

    #[test]
    fn reset_restores_initial_state() {
        set_sim_seed(42);
        let _: f64 = sim_random();
        let advanced: f64 = sim_random();

        reset_sim_rng();
        set_sim_seed(42);
        let first: f64 = sim_random();
        assert_ne!(advanced, first);
        assert_eq!(current_sim_seed(), 42);
    }
}
