//! Replication policies: predicates over sets of localities.
//!
//! A policy decides whether a set of processes is "enough" — e.g. at least
//! one replica in each of three zones. The kill planner uses the tlog and
//! storage policies as a survivability filter: a kill that would leave the
//! cluster unable to satisfy them is downgraded.

use crate::types::{Locality, LocalityField};

/// A replication predicate over a set of localities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationPolicy {
    /// Satisfied by any non-empty set.
    One,
    /// Requires `count` distinct values of `field`, each of whose groups
    /// satisfies the inner policy.
    Across {
        /// Number of distinct groups required.
        count: usize,
        /// The locality field to group by.
        field: LocalityField,
        /// Policy each group must satisfy.
        inner: Box<ReplicationPolicy>,
    },
}

impl ReplicationPolicy {
    /// `count` replicas across distinct zones.
    pub fn across_zones(count: usize) -> Self {
        Self::Across {
            count,
            field: LocalityField::Zone,
            inner: Box::new(Self::One),
        }
    }

    /// `count` replicas across distinct datacenters.
    pub fn across_datacenters(count: usize) -> Self {
        Self::Across {
            count,
            field: LocalityField::Datacenter,
            inner: Box::new(Self::One),
        }
    }

    /// Whether `localities` satisfies this policy.
    pub fn validate(&self, localities: &[&Locality]) -> bool {
        match self {
            Self::One => !localities.is_empty(),
            Self::Across {
                count,
                field,
                inner,
            } => {
                let mut groups: std::collections::HashMap<&str, Vec<&Locality>> =
                    std::collections::HashMap::new();
                for loc in localities {
                    if let Some(value) = loc.get(*field) {
                        groups.entry(value).or_default().push(loc);
                    }
                }
                let satisfied = groups
                    .values()
                    .filter(|group| inner.validate(group))
                    .count();
                satisfied >= *count
            }
        }
    }

    /// Short description for trace events.
    pub fn info(&self) -> String {
        match self {
            Self::One => "One".to_string(),
            Self::Across {
                count,
                field,
                inner,
            } => format!("Across({count}, {field:?}, {})", inner.info()),
        }
    }
}

/// Anti-quorum check: enumerate every combination of `anti_quorum` localities
/// from `remaining` and verify that adding it to `dead` never satisfies
/// `policy`. Returns `false` (and the first bad combination) on violation.
pub fn validate_all_combinations<'a>(
    dead: &[&'a Locality],
    policy: &ReplicationPolicy,
    remaining: &[&'a Locality],
    anti_quorum: usize,
) -> (bool, Vec<&'a Locality>) {
    if anti_quorum == 0 || anti_quorum > remaining.len() {
        return (true, Vec::new());
    }

    let mut combo: Vec<&Locality> = Vec::with_capacity(anti_quorum);
    let ok = combinations_ok(dead, policy, remaining, anti_quorum, 0, &mut combo);
    if ok {
        (true, Vec::new())
    } else {
        (false, combo)
    }
}

fn combinations_ok<'a>(
    dead: &[&'a Locality],
    policy: &ReplicationPolicy,
    remaining: &[&'a Locality],
    want: usize,
    start: usize,
    combo: &mut Vec<&'a Locality>,
) -> bool {
    if combo.len() == want {
        let mut candidate: Vec<&Locality> = dead.to_vec();
        candidate.extend_from_slice(combo);
        return !policy.validate(&candidate);
    }
    for i in start..remaining.len() {
        combo.push(remaining[i]);
        if !combinations_ok(dead, policy, remaining, want, i + 1, combo) {
            return false;
        }
        combo.pop();
    }
    true
}
