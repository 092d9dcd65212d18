//! Vector clocks for recovering causal order across systems.
//!
//! Store order only says when an event arrived here. Whether one system's
//! update had seen another's is answered by comparing their vector clocks.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Causal relationship between two clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockOrdering {
    /// `self` happened before `other`
    Before,
    /// `other` happened before `self`
    After,
    /// Identical clocks: the same point in causal history
    Equal,
    /// Neither has seen the other
    Concurrent,
}

impl ClockOrdering {
    pub fn reverse(self) -> Self {
        match self {
            Self::Before => Self::After,
            Self::After => Self::Before,
            other => other,
        }
    }
}

/// Mapping from system identifier to counter.
///
/// Missing entries are zero and zero entries are never stored, so two clocks
/// describing the same history are structurally equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, u64>", into = "BTreeMap<String, u64>")]
pub struct VectorClock(BTreeMap<String, u64>);

impl From<BTreeMap<String, u64>> for VectorClock {
    fn from(entries: BTreeMap<String, u64>) -> Self {
        Self::from_entries(entries)
    }
}

impl From<VectorClock> for BTreeMap<String, u64> {
    fn from(clock: VectorClock) -> Self {
        clock.0
    }
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, u64)>,
        K: Into<String>,
    {
        Self(
            entries
                .into_iter()
                .filter(|(_, v)| *v > 0)
                .map(|(k, v)| (k.into(), v))
                .collect(),
        )
    }

    pub fn get(&self, system: &str) -> u64 {
        self.0.get(system).copied().unwrap_or(0)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Pointwise maximum with `other`.
    pub fn merge(&mut self, other: &VectorClock) {
        for (system, &count) in &other.0 {
            let entry = self.0.entry(system.clone()).or_insert(0);
            *entry = (*entry).max(count);
        }
    }

    pub fn merged(&self, other: &VectorClock) -> VectorClock {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    /// Only reachable through [`LocalClock`], which enforces ownership.
    fn increment(&mut self, system: &str) -> u64 {
        let entry = self.0.entry(system.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Compare two clocks under the vector-clock partial order.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut less = false;
        let mut greater = false;

        for system in self.0.keys().chain(other.0.keys()) {
            match self.get(system).cmp(&other.get(system)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
            if less && greater {
                return ClockOrdering::Concurrent;
            }
        }

        match (less, greater) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    pub fn happens_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Before
    }

    pub fn concurrent_with(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Concurrent
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (system, count)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}:{}", system, count)?;
        }
        write!(f, "}}")
    }
}

/// A clock handle bound to one owning system.
///
/// This is the only way to advance a clock entry, and it only ever advances
/// the owner's entry.
#[derive(Debug, Clone)]
pub struct LocalClock {
    owner: String,
    clock: VectorClock,
}

impl LocalClock {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            clock: VectorClock::new(),
        }
    }

    /// Continue from previously observed history.
    pub fn resume(owner: impl Into<String>, clock: VectorClock) -> Self {
        Self {
            owner: owner.into(),
            clock,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn current(&self) -> &VectorClock {
        &self.clock
    }

    /// Record a local event and return the stamped clock.
    pub fn tick(&mut self) -> VectorClock {
        let owner = self.owner.clone();
        self.clock.increment(&owner);
        self.clock.clone()
    }

    /// Merge a received clock, then tick.
    pub fn observe(&mut self, remote: &VectorClock) -> VectorClock {
        self.clock.merge(remote);
        self.tick()
    }
}
