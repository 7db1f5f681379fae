//! Network congestion model: per-ip and per-pair clogs plus latency
//! sampling.
//!
//! Clog durations are max-monotonic (a new clog only ever extends the
//! expiry). Each ordered ip pair also carries a permanent latency installed
//! at first connect and reused for the life of the simulation.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::config::NetworkConfig;
use crate::rng::sim_random01;

/// Which direction(s) of an interface to clog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClogMode {
    /// Outbound only.
    Send,
    /// Inbound only.
    Receive,
    /// Both directions.
    All,
    /// Randomize: 30% send, 30% receive, 40% all.
    Default,
}

/// Clog and latency state for the whole simulation.
#[derive(Debug, Default)]
pub(crate) struct Clogging {
    send_until: HashMap<Ipv4Addr, f64>,
    recv_until: HashMap<Ipv4Addr, f64>,
    pair_until: HashMap<(Ipv4Addr, Ipv4Addr), f64>,
    pair_latency: HashMap<(Ipv4Addr, Ipv4Addr), f64>,
}

impl Clogging {
    /// Delay before bytes leave `_from` toward `_to`.
    ///
    /// Only the sampled half-latency applies on the outbound path; send
    /// clogs gate the interface through the composed receive path instead.
    pub(crate) fn send_delay(
        &self,
        config: &NetworkConfig,
        _from: Ipv4Addr,
        _to: Ipv4Addr,
    ) -> f64 {
        half_latency(config)
    }

    /// Delay before bytes from `from` become visible at `to`: half-latency
    /// plus the pair's permanent latency plus any unexpired clogs. All
    /// congestion is suppressed under speed-up.
    pub(crate) fn recv_delay(
        &self,
        config: &NetworkConfig,
        speed_up: bool,
        now: f64,
        from: Ipv4Addr,
        to: Ipv4Addr,
    ) -> f64 {
        let mut t = now + half_latency(config);
        if !speed_up {
            t += self.pair_latency.get(&(from, to)).copied().unwrap_or(0.0);
            if let Some(&until) = self.pair_until.get(&(from, to)) {
                t = t.max(until);
            }
            if let Some(&until) = self.recv_until.get(&to) {
                t = t.max(until);
            }
        }
        t - now
    }

    /// Send clogs still gate `clog_interface(.., Send)` bookkeeping even
    /// though the outbound path ignores them; expose the expiry for the
    /// receive-side composition and for tests.
    #[allow(dead_code)]
    pub(crate) fn send_clogged_until(&self, ip: Ipv4Addr) -> Option<f64> {
        self.send_until.get(&ip).copied()
    }

    pub(crate) fn clog_send_for(&mut self, ip: Ipv4Addr, now: f64, seconds: f64) {
        let until = self.send_until.entry(ip).or_insert(0.0);
        *until = until.max(now + seconds);
    }

    pub(crate) fn clog_recv_for(&mut self, ip: Ipv4Addr, now: f64, seconds: f64) {
        let until = self.recv_until.entry(ip).or_insert(0.0);
        *until = until.max(now + seconds);
    }

    pub(crate) fn clog_pair_for(&mut self, from: Ipv4Addr, to: Ipv4Addr, now: f64, seconds: f64) {
        let until = self.pair_until.entry((from, to)).or_insert(0.0);
        *until = until.max(now + seconds);
    }

    /// Install the pair's permanent latency if absent; returns the latency
    /// in effect.
    pub(crate) fn set_pair_latency_if_not_set(
        &mut self,
        from: Ipv4Addr,
        to: Ipv4Addr,
        latency: f64,
    ) -> f64 {
        *self.pair_latency.entry((from, to)).or_insert(latency)
    }
}

/// Sample half of a one-way latency: with probability 0.999 the fast mode,
/// otherwise a long tail up to the slow latency.
pub(crate) fn half_latency(config: &NetworkConfig) -> f64 {
    let mut a = sim_random01();
    const P_FAST: f64 = 0.999;
    if a <= P_FAST {
        a /= P_FAST;
        0.5 * (config.min_network_latency * (1.0 - a) + config.fast_network_latency / P_FAST * a)
    } else {
        a = (a - P_FAST) / (1.0 - P_FAST);
        0.5 * (config.min_network_latency * (1.0 - a) + config.slow_network_latency * a)
    }
}
