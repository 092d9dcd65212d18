//! Conflict detection and resolution.
//!
//! Detection compares the incoming update's vector clock against every
//! retained update for the same entity. Anything the incoming update has not
//! causally seen is a conflict. Resolution walks a fixed priority list per
//! contested field:
//!
//! 1. causal order, when a stored write already superseded the incoming one
//! 2. ownership rules from configuration
//! 3. CRDT merge, when both sides hold the same mergeable kind
//! 4. last writer wins on `(timestamp, source, event id)`, with a warning
//!
//! Every step is a pure function of the two updates and the rule table, so
//! replaying the same events reproduces the same outcome.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use super::ownership::{default_ownership_rules, OwnershipRule, OwnershipTable};
use super::update::{entity_key, EntityUpdate, FieldValue};
use crate::clock::{ClockOrdering, VectorClock};
use crate::events::{EventId, System};

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictConfig {
    /// Entity types routed through the resolver; `*` means all
    #[serde(default = "default_conflict_prone")]
    pub conflict_prone_entity_types: Vec<String>,

    #[serde(default = "default_ownership_rules")]
    pub ownership_rules: Vec<OwnershipRule>,

    /// Updates retained per entity for detection
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Resolutions kept in the audit log
    #[serde(default = "default_audit_capacity")]
    pub audit_capacity: usize,
}

fn default_conflict_prone() -> Vec<String> {
    vec!["user".into(), "trade".into(), "payment".into()]
}
fn default_history_limit() -> usize {
    256
}
fn default_audit_capacity() -> usize {
    1_000
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            conflict_prone_entity_types: default_conflict_prone(),
            ownership_rules: default_ownership_rules(),
            history_limit: default_history_limit(),
            audit_capacity: default_audit_capacity(),
        }
    }
}

impl ConflictConfig {
    pub fn with_ownership_rules(mut self, rules: Vec<OwnershipRule>) -> Self {
        self.ownership_rules = rules;
        self
    }

    pub fn with_conflict_prone<I, S>(mut self, entity_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conflict_prone_entity_types = entity_types.into_iter().map(Into::into).collect();
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conflicts and Resolutions
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Concurrent writes touching at least one common field
    ConcurrentWrite,
    /// Concurrent writes to different fields
    DisjointConcurrentWrite,
    /// The incoming write is causally older than a stored write to the same field
    StaleWrite,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConcurrentWrite => "concurrent_write",
            Self::DisjointConcurrentWrite => "disjoint_concurrent_write",
            Self::StaleWrite => "stale_write",
        }
    }
}

/// Two competing updates to one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub entity_type: String,
    pub entity_id: String,
    pub conflict_type: ConflictType,
    /// The previously stored update
    pub local: EntityUpdate,
    pub incoming: EntityUpdate,
    /// Fields both updates wrote
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    Uncontested,
    CausalOrder,
    Ownership,
    CrdtMerge,
    LastWriterWins,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uncontested => "uncontested",
            Self::CausalOrder => "causal_order",
            Self::Ownership => "ownership",
            Self::CrdtMerge => "crdt_merge",
            Self::LastWriterWins => "last_writer_wins",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDecision {
    pub field: String,
    pub strategy: ResolutionStrategy,
    pub chosen: FieldValue,
    /// `None` when the value is a merge of both sides
    pub chosen_from: Option<System>,
    pub discarded: Option<FieldValue>,
    pub discarded_from: Option<System>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub entity_type: String,
    pub entity_id: String,
    pub conflict_type: ConflictType,
    pub local_event: EventId,
    pub incoming_event: EventId,
    pub merged: BTreeMap<String, FieldValue>,
    pub decisions: Vec<FieldDecision>,
    pub resolved_at: DateTime<Utc>,
}

impl Resolution {
    pub fn decision(&self, field: &str) -> Option<&FieldDecision> {
        self.decisions.iter().find(|d| d.field == field)
    }

    pub fn strategies(&self) -> BTreeSet<ResolutionStrategy> {
        self.decisions.iter().map(|d| d.strategy).collect()
    }
}

/// Audit entry: both competing updates and the outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub conflict: Conflict,
    pub resolution: Resolution,
}

/// Current merged view of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_type: String,
    pub entity_id: String,
    pub clock: VectorClock,
    pub fields: BTreeMap<String, FieldValue>,
    pub version: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl EntityState {
    fn empty(entity_type: &str, entity_id: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            clock: VectorClock::new(),
            fields: BTreeMap::new(),
            version: 0,
            updated_at: None,
        }
    }

    /// Plain JSON object of the entity's current field values.
    pub fn materialize(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.materialize()))
                .collect(),
        )
    }
}

/// What `process` did with an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessOutcome {
    /// Same event or same causal point already applied; nothing changed
    pub duplicate: bool,
    pub resolutions: Vec<Resolution>,
    pub state: EntityState,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConflictStats {
    pub processed_updates: u64,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    /// Conflicts detected per processed update
    pub conflict_rate: f64,
    pub by_strategy: BTreeMap<String, u64>,
    pub by_entity_type: BTreeMap<String, u64>,
    pub tracked_entities: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Field-level contenders
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct FieldWrite {
    value: FieldValue,
    source: System,
    timestamp: DateTime<Utc>,
    event_id: EventId,
}

impl FieldWrite {
    fn of(update: &EntityUpdate, field: &str) -> Option<Self> {
        update.changes.get(field).map(|value| Self {
            value: value.clone(),
            source: update.source,
            timestamp: update.timestamp,
            event_id: update.event_id,
        })
    }

    /// Total order used by last-writer-wins.
    fn lww_key(&self) -> (DateTime<Utc>, &'static str, EventId) {
        (self.timestamp, self.source.as_str(), self.event_id)
    }
}

struct Decided {
    winner: FieldWrite,
    strategy: ResolutionStrategy,
    loser: Option<FieldWrite>,
}

#[derive(Default)]
struct EntityHistory {
    updates: VecDeque<EntityUpdate>,
    state: Option<EntityState>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Resolver
// ═══════════════════════════════════════════════════════════════════════════════

pub struct ConflictResolver {
    config: ConflictConfig,
    ownership: OwnershipTable,
    entities: DashMap<String, EntityHistory>,
    audit: Mutex<VecDeque<ConflictRecord>>,
    processed: AtomicU64,
    detected: AtomicU64,
    resolved: AtomicU64,
    by_strategy: Mutex<BTreeMap<String, u64>>,
    by_entity_type: Mutex<BTreeMap<String, u64>>,
}

impl ConflictResolver {
    pub fn new(config: ConflictConfig) -> Self {
        let ownership = OwnershipTable::new(config.ownership_rules.clone());
        Self {
            config,
            ownership,
            entities: DashMap::new(),
            audit: Mutex::new(VecDeque::new()),
            processed: AtomicU64::new(0),
            detected: AtomicU64::new(0),
            resolved: AtomicU64::new(0),
            by_strategy: Mutex::new(BTreeMap::new()),
            by_entity_type: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> &ConflictConfig {
        &self.config
    }

    pub fn ownership(&self) -> &OwnershipTable {
        &self.ownership
    }

    pub fn is_conflict_prone(&self, entity_type: &str) -> bool {
        self.config
            .conflict_prone_entity_types
            .iter()
            .any(|t| t == "*" || t == entity_type)
    }

    /// Retained updates the given clock has not causally seen.
    pub fn concurrent_updates(&self, entity_type: &str, entity_id: &str, clock: &VectorClock) -> Vec<EntityUpdate> {
        let Some(history) = self.entities.get(&entity_key(entity_type, entity_id)) else {
            return Vec::new();
        };
        history
            .updates
            .iter()
            .filter(|u| matches!(u.clock.compare(clock), ClockOrdering::Concurrent | ClockOrdering::After))
            .cloned()
            .collect()
    }

    /// Conflicts between the incoming update and retained history.
    pub fn detect(&self, incoming: &EntityUpdate) -> Vec<Conflict> {
        match self.entities.get(&incoming.entity_key()) {
            Some(history) => history
                .updates
                .iter()
                .filter_map(|stored| classify(stored, incoming))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Resolve one conflict into a merged field set.
    pub fn resolve(&self, conflict: &Conflict) -> Resolution {
        let fields: BTreeSet<&String> = conflict
            .local
            .changes
            .keys()
            .chain(conflict.incoming.changes.keys())
            .collect();

        let mut merged = BTreeMap::new();
        let mut decisions = Vec::with_capacity(fields.len());

        for field in fields {
            let local = FieldWrite::of(&conflict.local, field);
            let incoming = FieldWrite::of(&conflict.incoming, field);

            let decided = match (local, incoming) {
                (Some(l), Some(i)) => self.decide(&conflict.entity_type, field, conflict.conflict_type, &l, &i),
                (Some(only), None) | (None, Some(only)) => Decided {
                    winner: only,
                    strategy: ResolutionStrategy::Uncontested,
                    loser: None,
                },
                (None, None) => continue,
            };

            if decided.strategy != ResolutionStrategy::Uncontested {
                counter!("confluence_conflicts_resolved_total", "strategy" => decided.strategy.as_str()).increment(1);
                *self
                    .by_strategy
                    .lock()
                    .entry(decided.strategy.as_str().to_string())
                    .or_insert(0) += 1;
            }

            let chosen_from = match decided.strategy {
                ResolutionStrategy::CrdtMerge => None,
                _ => Some(decided.winner.source),
            };
            merged.insert(field.clone(), decided.winner.value.clone());
            decisions.push(FieldDecision {
                field: field.clone(),
                strategy: decided.strategy,
                chosen: decided.winner.value,
                chosen_from,
                discarded_from: decided.loser.as_ref().map(|l| l.source),
                discarded: decided.loser.map(|l| l.value),
            });
        }

        Resolution {
            entity_type: conflict.entity_type.clone(),
            entity_id: conflict.entity_id.clone(),
            conflict_type: conflict.conflict_type,
            local_event: conflict.local.event_id,
            incoming_event: conflict.incoming.event_id,
            merged,
            decisions,
            resolved_at: Utc::now(),
        }
    }

    /// Detect, resolve, record and commit an update.
    ///
    /// Callers serialize calls per entity; the entity's history entry is held
    /// for the whole call.
    pub fn process(&self, incoming: EntityUpdate) -> ProcessOutcome {
        self.processed.fetch_add(1, Ordering::Relaxed);

        let mut entry = self.entities.entry(incoming.entity_key()).or_default();
        let history = entry.value_mut();

        let already_applied = history.updates.iter().any(|u| {
            u.event_id == incoming.event_id || (!u.clock.is_empty() && u.clock == incoming.clock)
        });
        if already_applied {
            tracing::debug!(event_id = %incoming.event_id, entity = %incoming.entity_key(), "Update already applied");
            return ProcessOutcome {
                duplicate: true,
                resolutions: Vec::new(),
                state: history
                    .state
                    .clone()
                    .unwrap_or_else(|| EntityState::empty(&incoming.entity_type, &incoming.entity_id)),
            };
        }

        let conflicts: Vec<Conflict> = history
            .updates
            .iter()
            .filter_map(|stored| classify(stored, &incoming))
            .collect();

        // Fold every contested field across all conflicting writes.
        let mut effective: BTreeMap<String, FieldWrite> = incoming
            .changes
            .keys()
            .filter_map(|f| FieldWrite::of(&incoming, f).map(|w| (f.clone(), w)))
            .collect();

        let mut resolutions = Vec::with_capacity(conflicts.len());
        for conflict in conflicts {
            self.detected.fetch_add(1, Ordering::Relaxed);
            counter!("confluence_conflicts_detected_total", "entity_type" => conflict.entity_type.clone())
                .increment(1);
            *self
                .by_entity_type
                .lock()
                .entry(conflict.entity_type.clone())
                .or_insert(0) += 1;

            for field in &conflict.fields {
                let (Some(stored), Some(current)) = (FieldWrite::of(&conflict.local, field), effective.get(field))
                else {
                    continue;
                };
                let decided = self.decide(&conflict.entity_type, field, conflict.conflict_type, &stored, current);
                effective.insert(field.clone(), decided.winner);
            }

            let resolution = self.resolve(&conflict);
            self.record(conflict, resolution.clone());
            resolutions.push(resolution);
        }

        let state = history
            .state
            .get_or_insert_with(|| EntityState::empty(&incoming.entity_type, &incoming.entity_id));
        for (field, write) in effective {
            state.fields.insert(field, write.value);
        }
        state.clock.merge(&incoming.clock);
        state.version += 1;
        state.updated_at = Some(state.updated_at.map_or(incoming.timestamp, |t| t.max(incoming.timestamp)));
        let state = state.clone();

        history.updates.push_back(incoming);
        while history.updates.len() > self.config.history_limit.max(1) {
            history.updates.pop_front();
        }

        ProcessOutcome {
            duplicate: false,
            resolutions,
            state,
        }
    }

    pub fn entity_state(&self, entity_type: &str, entity_id: &str) -> Option<EntityState> {
        self.entities
            .get(&entity_key(entity_type, entity_id))
            .and_then(|h| h.state.clone())
    }

    /// Merged clock of everything applied to the entity so far.
    pub fn entity_clock(&self, entity_type: &str, entity_id: &str) -> Option<VectorClock> {
        self.entity_state(entity_type, entity_id).map(|s| s.clock)
    }

    /// Most recent resolutions first.
    pub fn audit_log(&self, limit: usize) -> Vec<ConflictRecord> {
        self.audit.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn stats(&self) -> ConflictStats {
        let processed = self.processed.load(Ordering::Relaxed);
        let detected = self.detected.load(Ordering::Relaxed);
        ConflictStats {
            processed_updates: processed,
            conflicts_detected: detected,
            conflicts_resolved: self.resolved.load(Ordering::Relaxed),
            conflict_rate: if processed == 0 {
                0.0
            } else {
                detected as f64 / processed as f64
            },
            by_strategy: self.by_strategy.lock().clone(),
            by_entity_type: self.by_entity_type.lock().clone(),
            tracked_entities: self.entities.len(),
        }
    }

    fn decide(
        &self,
        entity_type: &str,
        field: &str,
        conflict_type: ConflictType,
        local: &FieldWrite,
        incoming: &FieldWrite,
    ) -> Decided {
        if conflict_type == ConflictType::StaleWrite {
            return Decided {
                winner: local.clone(),
                strategy: ResolutionStrategy::CausalOrder,
                loser: Some(incoming.clone()),
            };
        }

        if let Some(owner) = self.ownership.owner_of(entity_type, field) {
            match (local.source == owner, incoming.source == owner) {
                (true, false) => {
                    return Decided {
                        winner: local.clone(),
                        strategy: ResolutionStrategy::Ownership,
                        loser: Some(incoming.clone()),
                    }
                }
                (false, true) => {
                    return Decided {
                        winner: incoming.clone(),
                        strategy: ResolutionStrategy::Ownership,
                        loser: Some(local.clone()),
                    }
                }
                _ => {}
            }
        }

        let (newer, older) = if incoming.lww_key() > local.lww_key() {
            (incoming, local)
        } else {
            (local, incoming)
        };

        if let Some(value) = local.value.merge(&incoming.value) {
            return Decided {
                winner: FieldWrite { value, ..newer.clone() },
                strategy: ResolutionStrategy::CrdtMerge,
                loser: None,
            };
        }

        tracing::warn!(
            entity_type,
            field,
            winner = %newer.source,
            winner_event = %newer.event_id,
            discarded = %older.source,
            discarded_event = %older.event_id,
            "No rule covers contested field, last writer wins; flag for review"
        );
        Decided {
            winner: newer.clone(),
            strategy: ResolutionStrategy::LastWriterWins,
            loser: Some(older.clone()),
        }
    }

    fn record(&self, conflict: Conflict, resolution: Resolution) {
        self.resolved.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            entity_type = %conflict.entity_type,
            entity_id = %conflict.entity_id,
            conflict_type = conflict.conflict_type.as_str(),
            local = %serde_json::to_string(&conflict.local).unwrap_or_default(),
            incoming = %serde_json::to_string(&conflict.incoming).unwrap_or_default(),
            outcome = %serde_json::to_string(&resolution.decisions).unwrap_or_default(),
            "Conflict resolved"
        );

        let mut audit = self.audit.lock();
        audit.push_back(ConflictRecord { conflict, resolution });
        while audit.len() > self.config.audit_capacity.max(1) {
            audit.pop_front();
        }
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(ConflictConfig::default())
    }
}

fn classify(stored: &EntityUpdate, incoming: &EntityUpdate) -> Option<Conflict> {
    if stored.event_id == incoming.event_id {
        return None;
    }

    let contested: Vec<String> = stored
        .changes
        .keys()
        .filter(|f| incoming.changes.contains_key(*f))
        .cloned()
        .collect();

    let conflict_type = match stored.clock.compare(&incoming.clock) {
        ClockOrdering::Before | ClockOrdering::Equal => return None,
        ClockOrdering::Concurrent if contested.is_empty() => ConflictType::DisjointConcurrentWrite,
        ClockOrdering::Concurrent => ConflictType::ConcurrentWrite,
        // A newer stored write to other fields loses nothing.
        ClockOrdering::After if contested.is_empty() => return None,
        ClockOrdering::After => ConflictType::StaleWrite,
    };

    Some(Conflict {
        entity_type: incoming.entity_type.clone(),
        entity_id: incoming.entity_id.clone(),
        conflict_type,
        local: stored.clone(),
        incoming: incoming.clone(),
        fields: contested,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{LWWRegister, ORSet};
    use chrono::TimeZone;
    use serde_json::json;

    fn update(source: System, clock: &[(&str, u64)], secs: i64, changes: &[(&str, FieldValue)]) -> EntityUpdate {
        EntityUpdate {
            event_id: EventId::new(),
            entity_type: "user".into(),
            entity_id: "u-1".into(),
            source,
            clock: VectorClock::from_entries(clock.iter().map(|(k, v)| (*k, *v))),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            changes: changes.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        }
    }

    fn scalar(v: &str) -> FieldValue {
        FieldValue::Scalar(json!(v))
    }

    #[test]
    fn test_causally_ordered_updates_do_not_conflict() {
        let resolver = ConflictResolver::default();
        resolver.process(update(System::Legacy, &[("legacy", 1)], 100, &[("displayName", scalar("A"))]));

        let next = update(System::Backend, &[("legacy", 1), ("backend", 1)], 101, &[("displayName", scalar("B"))]);
        assert!(resolver.detect(&next).is_empty());

        let outcome = resolver.process(next);
        assert!(outcome.resolutions.is_empty());
        assert_eq!(outcome.state.fields["displayName"], scalar("B"));
    }

    #[test]
    fn test_resolution_is_symmetric() {
        let resolver = ConflictResolver::default();
        let a = update(System::Legacy, &[("legacy", 1)], 100, &[("displayName", scalar("Alice"))]);
        let b = update(System::Backend, &[("backend", 1)], 105, &[("displayName", scalar("Alicia"))]);

        let ab = resolver.resolve(&classify(&a, &b).unwrap());
        let ba = resolver.resolve(&classify(&b, &a).unwrap());
        assert_eq!(ab.merged, ba.merged);
        assert_eq!(ab.merged["displayName"], scalar("Alicia"));
    }

    #[test]
    fn test_ownership_beats_timestamp() {
        let config = ConflictConfig::default()
            .with_ownership_rules(vec![OwnershipRule::new("user", "accountNumber", System::Legacy)]);
        let resolver = ConflictResolver::new(config);

        resolver.process(update(System::Legacy, &[("legacy", 1)], 100, &[("accountNumber", scalar("L-1"))]));
        let outcome = resolver.process(update(
            System::Backend,
            &[("backend", 1)],
            200,
            &[("accountNumber", scalar("M-9"))],
        ));

        let decision = outcome.resolutions[0].decision("accountNumber").unwrap();
        assert_eq!(decision.strategy, ResolutionStrategy::Ownership);
        assert_eq!(decision.chosen_from, Some(System::Legacy));
        assert_eq!(outcome.state.fields["accountNumber"], scalar("L-1"));
    }

    #[test]
    fn test_crdt_fields_merge() {
        let resolver = ConflictResolver::default();
        let mut legacy_set = ORSet::new();
        legacy_set.add("AAPL".to_string());
        let mut modern_set = ORSet::new();
        modern_set.add("MSFT".to_string());

        resolver.process(update(
            System::Legacy,
            &[("legacy", 1)],
            100,
            &[("watchlist", FieldValue::Set(legacy_set))],
        ));
        let outcome = resolver.process(update(
            System::Backend,
            &[("backend", 1)],
            90,
            &[("watchlist", FieldValue::Set(modern_set))],
        ));

        assert_eq!(outcome.resolutions[0].strategies(), BTreeSet::from([ResolutionStrategy::CrdtMerge]));
        assert_eq!(outcome.state.materialize()["watchlist"], json!(["AAPL", "MSFT"]));
    }

    #[test]
    fn test_stale_write_keeps_newer_value() {
        let resolver = ConflictResolver::default();
        let newer = update(
            System::Backend,
            &[("legacy", 2), ("backend", 1)],
            100,
            &[("displayName", scalar("New"))],
        );
        resolver.process(newer);

        let stale = update(System::Legacy, &[("legacy", 1)], 500, &[("displayName", scalar("Old"))]);
        let outcome = resolver.process(stale);

        assert_eq!(outcome.resolutions[0].conflict_type, ConflictType::StaleWrite);
        assert_eq!(outcome.state.fields["displayName"], scalar("New"));
    }

    #[test]
    fn test_disjoint_concurrent_writes_keep_both_fields() {
        let resolver = ConflictResolver::default();
        resolver.process(update(System::Legacy, &[("legacy", 1)], 100, &[("email", scalar("a@x"))]));
        let outcome = resolver.process(update(System::Backend, &[("backend", 1)], 101, &[("phone", scalar("555"))]));

        assert_eq!(outcome.resolutions[0].conflict_type, ConflictType::DisjointConcurrentWrite);
        assert_eq!(outcome.state.fields.len(), 2);
    }

    #[test]
    fn test_duplicate_delivery_is_a_noop() {
        let resolver = ConflictResolver::default();
        let first = update(System::Legacy, &[("legacy", 1)], 100, &[("email", scalar("a@x"))]);
        resolver.process(first.clone());

        let again = resolver.process(first);
        assert!(again.duplicate);
        assert_eq!(again.state.version, 1);
        assert_eq!(resolver.stats().conflicts_detected, 0);
    }

    #[test]
    fn test_register_fields_merge_by_lww() {
        let resolver = ConflictResolver::default();
        let reg = |name: &str, secs: i64, actor: &str| {
            FieldValue::Register(LWWRegister::new(json!(name), Utc.timestamp_opt(secs, 0).unwrap(), actor))
        };

        resolver.process(update(System::Legacy, &[("legacy", 1)], 100, &[("nickname", reg("Al", 100, "legacy"))]));
        let outcome = resolver.process(update(
            System::Backend,
            &[("backend", 1)],
            105,
            &[("nickname", reg("Ally", 105, "backend"))],
        ));

        assert_eq!(outcome.state.materialize()["nickname"], json!("Ally"));
    }
}
