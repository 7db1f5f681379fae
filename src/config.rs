//! Simulation configuration knobs.
//!
//! Defaults reproduce the conventional values from FoundationDB's simulator;
//! `random_for_seed` draws a chaos-flavored configuration from the seeded
//! RNG so every seed explores a different operating point.

use crate::rng::sim_random01;

/// Network latency and failure knobs. All times are virtual seconds.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Floor for sampled one-way latencies.
    pub min_network_latency: f64,
    /// Upper bound of the fast (99.9%) latency mode.
    pub fast_network_latency: f64,
    /// Upper bound of the slow (0.1%) long-tail latency mode.
    pub slow_network_latency: f64,
    /// Upper bound of the permanent per-ip-pair latency installed at connect
    /// time (`max_clogging_latency * random01()`).
    pub max_clogging_latency: f64,
    /// Upper bound of buggified extra delay on `delay` calls; 0 disables.
    pub max_buggified_delay: f64,
    /// Whether random connection closes and full disk timing are active at
    /// simulation start.
    pub enable_connection_failures: bool,
    /// Per-I/O probability of a random connection close roll.
    pub connection_failure_probability: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            min_network_latency: 100e-6,
            fast_network_latency: 800e-6,
            slow_network_latency: 100e-3,
            max_clogging_latency: 0.0,
            max_buggified_delay: 0.0,
            enable_connection_failures: false,
            connection_failure_probability: 1e-5,
        }
    }
}

impl NetworkConfig {
    /// Draw a chaos configuration from the seeded RNG.
    pub fn random_for_seed() -> Self {
        Self {
            max_clogging_latency: 0.1 * sim_random01(),
            max_buggified_delay: 0.2 * sim_random01(),
            enable_connection_failures: sim_random01() < 0.5,
            ..Self::default()
        }
    }
}

/// Simulated disk performance knobs.
#[derive(Debug, Clone)]
pub struct DiskConfig {
    /// Operations per second each file's disk sustains.
    pub iops: f64,
    /// Bytes per second each file's disk sustains.
    pub bandwidth: f64,
    /// Minimum virtual time an `open` consumes.
    pub min_open_time: f64,
    /// Maximum virtual time an `open` consumes.
    pub max_open_time: f64,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            iops: 25_000.0,
            bandwidth: 150e6,
            min_open_time: 0.0002,
            max_open_time: 0.0012,
        }
    }
}

/// Gates and pacing for the quiescence probe.
#[derive(Debug, Clone)]
pub struct QuietGates {
    /// Maximum bytes in flight between storage servers.
    pub max_data_in_flight: i64,
    /// Maximum transaction log queue size.
    pub max_tlog_queue: i64,
    /// Maximum storage server queue size.
    pub max_storage_queue: i64,
    /// Maximum data-distribution queue size.
    pub max_data_distribution_queue: i64,
    /// Settle delay before the first poll.
    pub settle_delay: f64,
    /// Watchdog deadline after which the probe continues with connection
    /// failures disabled.
    pub watchdog: f64,
}

impl Default for QuietGates {
    fn default() -> Self {
        Self {
            max_data_in_flight: 2_000_000,
            max_tlog_queue: 5_000_000,
            max_storage_queue: 5_000_000,
            max_data_distribution_queue: 0,
            settle_delay: 5.0,
            watchdog: 300.0,
        }
    }
}

/// Bundle of all simulation knobs, held by the world.
#[derive(Debug, Clone, Default)]
pub struct SimConfig {
    /// Network knobs.
    pub network: NetworkConfig,
    /// Disk knobs.
    pub disk: DiskConfig,
}

impl SimConfig {
    /// Draw a chaos configuration from the seeded RNG.
    pub fn random_for_seed() -> Self {
        Self {
            network: NetworkConfig::random_for_seed(),
            disk: DiskConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::set_sim_seed;

    #[test]
    fn defaults_are_quiet() {
        let config = SimConfig::default();
        assert_eq!(config.network.max_buggified_delay, 0.0);
        assert!(!config.network.enable_connection_failures);
    }

    #[test]
    fn random_for_seed_is_deterministic() {
        set_sim_seed(99);
        let a = NetworkConfig::random_for_seed();
        set_sim_seed(99);
        let b = NetworkConfig::random_for_seed();
        assert_eq!(a.max_clogging_latency, b.max_clogging_latency);
        assert_eq!(a.enable_connection_failures, b.enable_connection_failures);
    }
}
