//! Core addressing and topology types.
//!
//! Simulated processes are addressed by [`NetworkAddress`] (virtual IPv4 +
//! port + flags) and placed in the failure-domain hierarchy described by
//! [`Locality`]. These types cross into user workloads and reports, so they
//! carry serde derives.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::rng::sim_random;

/// 128-bit unique identifier, used for debug identities of connections and
/// files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct UID {
    /// First 64 bits.
    pub first: u64,
    /// Second 64 bits.
    pub second: u64,
}

impl UID {
    /// Create a UID with explicit values.
    pub const fn new(first: u64, second: u64) -> Self {
        Self { first, second }
    }

    /// Draw a random UID from the simulation RNG (deterministic per seed).
    pub fn random() -> Self {
        Self {
            first: sim_random(),
            second: sim_random(),
        }
    }

    /// Check whether this UID is valid (non-zero).
    pub const fn is_valid(&self) -> bool {
        self.first != 0 || self.second != 0
    }
}

impl std::fmt::Display for UID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}{:016x}", self.first, self.second)
    }
}

/// Address flags.
pub mod flags {
    /// Connection uses TLS encryption. The simulated transport refuses TLS
    /// endpoints; the flag exists so addresses round-trip faithfully.
    pub const FLAG_TLS: u16 = 1;
}

/// Virtual network address: IPv4 + port + flags.
///
/// Addresses are the primary key of the process registry. All processes on
/// one simulated machine share an ip and differ by port; port 0 is reserved
/// for the hidden machine-process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetworkAddress {
    /// Virtual IPv4 address.
    pub ip: Ipv4Addr,
    /// Port number.
    pub port: u16,
    /// Address flags (TLS).
    pub flags: u16,
}

impl NetworkAddress {
    /// Create a new network address without flags.
    pub const fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port, flags: 0 }
    }

    /// Create a new network address with flags.
    pub const fn with_flags(ip: Ipv4Addr, port: u16, flags: u16) -> Self {
        Self { ip, port, flags }
    }

    /// Check if this address uses TLS.
    pub fn is_tls(&self) -> bool {
        self.flags & flags::FLAG_TLS != 0
    }

    /// Parse from "ip:port" notation.
    pub fn parse(s: &str) -> Result<Self, NetworkAddressParseError> {
        let (ip_str, port_str) = s
            .rsplit_once(':')
            .ok_or(NetworkAddressParseError::MissingPort)?;
        let ip: Ipv4Addr = ip_str
            .parse()
            .map_err(|_| NetworkAddressParseError::InvalidIp)?;
        let port: u16 = port_str
            .parse()
            .map_err(|_| NetworkAddressParseError::InvalidPort)?;
        Ok(Self::new(ip, port))
    }
}

impl std::fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Error parsing a network address from string.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NetworkAddressParseError {
    /// The IP address could not be parsed.
    #[error("invalid IP address")]
    InvalidIp,
    /// The port number could not be parsed.
    #[error("invalid port number")]
    InvalidPort,
    /// No port separator (`:`) found in the input.
    #[error("missing port separator")]
    MissingPort,
}

/// Failure-domain placement of a process.
///
/// `zone` is the unit of correlated failure (a machine); every real process
/// must carry one. The other fields are optional grouping levels used by
/// replication policies and datacenter kills.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Locality {
    /// Datacenter identifier, if placed in one.
    pub datacenter: Option<String>,
    /// Zone (machine fault domain) identifier.
    pub zone: Option<String>,
    /// Data hall identifier, if modeled.
    pub data_hall: Option<String>,
    /// Physical machine identifier, if distinct from the zone.
    pub machine: Option<String>,
}

impl Locality {
    /// Locality with only a zone set.
    pub fn zoned(zone: impl Into<String>) -> Self {
        Self {
            zone: Some(zone.into()),
            ..Self::default()
        }
    }

    /// Locality with a datacenter and zone.
    pub fn placed(datacenter: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            datacenter: Some(datacenter.into()),
            zone: Some(zone.into()),
            ..Self::default()
        }
    }

    /// Read the value of a grouping field.
    pub fn get(&self, field: LocalityField) -> Option<&str> {
        match field {
            LocalityField::Datacenter => self.datacenter.as_deref(),
            LocalityField::Zone => self.zone.as_deref(),
            LocalityField::DataHall => self.data_hall.as_deref(),
            LocalityField::Machine => self.machine.as_deref(),
        }
    }
}

/// Grouping fields a replication policy can distribute across.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LocalityField {
    /// Datacenter level.
    Datacenter,
    /// Zone (machine) level.
    Zone,
    /// Data hall level.
    DataHall,
    /// Physical machine level.
    Machine,
}

/// Role a process was started as.
///
/// Tester-class processes are excluded from kill survivability accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ProcessClass {
    /// No declared specialization.
    #[default]
    Unset,
    /// Storage server.
    Storage,
    /// Transaction log.
    Log,
    /// Stateless role (proxy, resolver, ...).
    Stateless,
    /// Cluster controller / master.
    Master,
    /// Test driver process; invisible to the kill planner.
    Tester,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_parse_and_display() {
        let addr = NetworkAddress::parse("10.0.0.7:4500").expect("parse");
        assert_eq!(addr.ip, Ipv4Addr::new(10, 0, 0, 7));
        assert_eq!(addr.port, 4500);
        assert_eq!(addr.to_string(), "10.0.0.7:4500");
    }

    #[test]
    fn address_parse_errors() {
        assert!(NetworkAddress::parse("10.0.0.7").is_err());
        assert!(NetworkAddress::parse("10.0.0.7:x").is_err());
        assert!(NetworkAddress::parse("nope:4500").is_err());
    }

    #[test]
    fn tls_flag() {
        let addr = NetworkAddress::with_flags(Ipv4Addr::LOCALHOST, 1, flags::FLAG_TLS);
        assert!(addr.is_tls());
        assert!(!NetworkAddress::new(Ipv4Addr::LOCALHOST, 1).is_tls());
    }

    #[test]
    fn locality_fields() {
        let loc = Locality::placed("dc1", "zone3");
        assert_eq!(loc.get(LocalityField::Datacenter), Some("dc1"));
        assert_eq!(loc.get(LocalityField::Zone), Some("zone3"));
        assert_eq!(loc.get(LocalityField::DataHall), None);
    }

    #[test]
    fn address_serde_roundtrip() {
        let addr = NetworkAddress::new(Ipv4Addr::new(192, 168, 0, 1), 4500);
        let json = serde_json::to_string(&addr).expect("serialize");
        let decoded: NetworkAddress = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(addr, decoded);
    }
}
