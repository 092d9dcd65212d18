//! Conflict-free Replicated Data Types (CRDTs) for entity fields written by
//! more than one system.
//!
//! When the legacy and modern sides update the same field concurrently, the
//! values must merge deterministically without coordination. Every merge here
//! is commutative, associative, and idempotent.
//!
//! Provided types:
//! - [`LWWRegister`]: Last-Writer-Wins register for scalar values.
//! - [`ORSet`]: Observed-Remove set with add-wins semantics.
//! - [`GCounter`]: Grow-only counter distributed across actors.
//! - [`PNCounter`]: Counter supporting both increments and decrements.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

// =============================================================================
// LWW Register
// =============================================================================

/// A Last-Writer-Wins Register.
///
/// Conflicts are resolved by timestamp. If timestamps are equal, the higher
/// `actor` (lexicographic) wins. A given actor never issues two different
/// writes with the same timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LWWRegister<T: Clone> {
    value: T,
    timestamp: DateTime<Utc>,
    actor: String,
}

impl<T: Clone> LWWRegister<T> {
    pub fn new(value: T, timestamp: DateTime<Utc>, actor: impl Into<String>) -> Self {
        Self {
            value,
            timestamp,
            actor: actor.into(),
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// Write a value. Ignored unless the write is newer (or equal with a
    /// higher actor).
    pub fn set(&mut self, value: T, timestamp: DateTime<Utc>, actor: impl Into<String>) {
        let actor = actor.into();
        if self.should_accept(timestamp, &actor) {
            self.value = value;
            self.timestamp = timestamp;
            self.actor = actor;
        }
    }

    /// Merge with another register. The winning write is kept.
    pub fn merge(&mut self, other: &LWWRegister<T>) {
        if self.should_accept(other.timestamp, &other.actor) {
            self.value = other.value.clone();
            self.timestamp = other.timestamp;
            self.actor = other.actor.clone();
        }
    }

    /// True when `other` would win a merge against `self`.
    pub fn loses_to(&self, other: &LWWRegister<T>) -> bool {
        self.should_accept(other.timestamp, &other.actor)
    }

    fn should_accept(&self, timestamp: DateTime<Utc>, actor: &str) -> bool {
        timestamp > self.timestamp || (timestamp == self.timestamp && actor > self.actor.as_str())
    }
}

// =============================================================================
// OR-Set (Observed-Remove Set)
// =============================================================================

/// An Observed-Remove Set.
///
/// Each add generates a unique tag. A remove tombstones only the tags that it
/// observed, so an add concurrent with a remove survives the merge ("add wins").
/// Elements with no live tags are never kept in `elements`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "T: Ord + Serialize",
    deserialize = "T: Ord + Deserialize<'de>"
))]
pub struct ORSet<T: Ord + Clone> {
    /// element -> live add-tags
    elements: BTreeMap<T, BTreeSet<Uuid>>,
    /// element -> removed add-tags
    tombstones: BTreeMap<T, BTreeSet<Uuid>>,
}

impl<T: Ord + Clone> ORSet<T> {
    pub fn new() -> Self {
        Self {
            elements: BTreeMap::new(),
            tombstones: BTreeMap::new(),
        }
    }

    /// Add an element, returning the unique tag for this addition.
    pub fn add(&mut self, element: T) -> Uuid {
        let tag = Uuid::new_v4();
        self.add_with_tag(element, tag);
        tag
    }

    /// Add an element under a caller-chosen tag. Re-adding a tombstoned tag
    /// has no effect.
    pub fn add_with_tag(&mut self, element: T, tag: Uuid) {
        let dead = self
            .tombstones
            .get(&element)
            .map_or(false, |tags| tags.contains(&tag));
        if !dead {
            self.elements.entry(element).or_default().insert(tag);
        }
    }

    /// Remove an element by tombstoning all currently observed tags.
    ///
    /// Returns `true` if the element was present and removed.
    pub fn remove(&mut self, element: &T) -> bool {
        match self.elements.remove(element) {
            Some(tags) if !tags.is_empty() => {
                self.tombstones
                    .entry(element.clone())
                    .or_default()
                    .extend(tags);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, element: &T) -> bool {
        self.elements.contains_key(element)
    }

    /// Live elements in ascending order.
    pub fn elements(&self) -> Vec<&T> {
        self.elements.keys().collect()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Merge with another OR-Set.
    ///
    /// Live tags become the union of both sides' live tags minus the union of
    /// both sides' tombstones.
    pub fn merge(&mut self, other: &ORSet<T>) {
        for (elem, other_tombstones) in &other.tombstones {
            self.tombstones
                .entry(elem.clone())
                .or_default()
                .extend(other_tombstones.iter().copied());
        }

        for (elem, other_tags) in &other.elements {
            self.elements
                .entry(elem.clone())
                .or_default()
                .extend(other_tags.iter().copied());
        }

        let tombstones = &self.tombstones;
        self.elements.retain(|elem, live| {
            if let Some(dead) = tombstones.get(elem) {
                live.retain(|tag| !dead.contains(tag));
            }
            !live.is_empty()
        });
    }
}

impl<T: Ord + Clone> Default for ORSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// G-Counter (Grow-Only Counter)
// =============================================================================

/// A grow-only distributed counter.
///
/// Each actor maintains its own monotonically increasing count. The value is
/// the sum across actors. Merge takes the max per actor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GCounter {
    counts: BTreeMap<String, u64>,
}

impl GCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, actor: impl Into<String>, amount: u64) {
        if amount == 0 {
            return;
        }
        let entry = self.counts.entry(actor.into()).or_insert(0);
        *entry = entry.saturating_add(amount);
    }

    pub fn value(&self) -> u64 {
        self.counts.values().fold(0u64, |acc, v| acc.saturating_add(*v))
    }

    pub fn actor_value(&self, actor: &str) -> u64 {
        self.counts.get(actor).copied().unwrap_or(0)
    }

    pub fn merge(&mut self, other: &GCounter) {
        for (actor, &count) in &other.counts {
            let entry = self.counts.entry(actor.clone()).or_insert(0);
            *entry = (*entry).max(count);
        }
    }
}

// =============================================================================
// PN-Counter
// =============================================================================

/// A counter supporting increments and decrements, built from two G-Counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PNCounter {
    increments: GCounter,
    decrements: GCounter,
}

impl PNCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, actor: impl Into<String>, amount: u64) {
        self.increments.increment(actor, amount);
    }

    pub fn decrement(&mut self, actor: impl Into<String>, amount: u64) {
        self.decrements.increment(actor, amount);
    }

    pub fn value(&self) -> i64 {
        self.increments.value() as i64 - self.decrements.value() as i64
    }

    pub fn merge(&mut self, other: &PNCounter) {
        self.increments.merge(&other.increments);
        self.decrements.merge(&other.decrements);
    }
}

// =============================================================================
// Tests
// =============================================================================
