//! Periodic cross-system reconciliation.
//!
//! Real-time conflict resolution only sees updates that reach the core. The
//! sweep closes the remaining gap: it lists each configured entity type on
//! both sides, picks a canonical value for every divergent field and pushes
//! the correction to the side that disagrees.
//!
//! Canonical value, per field:
//! 1. the owning system's value, when an ownership rule names legacy or modern
//! 2. otherwise the value from the record with the newer `updated_at`
//! 3. on a tie, modern
//!
//! A record missing on one side is copied across whole.

use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapters::{Collaborator, Command, EntityRecord, APPLIED_TO};
use crate::conflict::OwnershipTable;
use crate::error::Result;
use crate::events::{event_types, EventId, EventSink, System, UnifiedEvent};

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    #[serde(default = "default_entity_types")]
    pub entity_types: Vec<String>,
}

fn default_enabled() -> bool {
    true
}
fn default_interval() -> Duration {
    Duration::from_secs(600)
}
fn default_entity_types() -> Vec<String> {
    vec!["user".into(), "trade".into(), "payment".into()]
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval: default_interval(),
            entity_types: default_entity_types(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Reports
// ═══════════════════════════════════════════════════════════════════════════════

/// One correction pushed to the divergent side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Correction {
    pub entity_type: String,
    pub entity_id: String,
    pub target: System,
    pub fields: BTreeMap<String, Value>,
    /// The record did not exist on `target` at all
    pub created: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub compared: usize,
    pub corrections: Vec<Correction>,
    /// Corrections or listings that could not be completed this pass
    pub failures: usize,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.corrections.is_empty() && self.failures == 0
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Sweep
// ═══════════════════════════════════════════════════════════════════════════════

pub struct ReconciliationSweep {
    config: ReconciliationConfig,
    legacy: Arc<dyn Collaborator>,
    modern: Arc<dyn Collaborator>,
    ownership: OwnershipTable,
    sink: Option<Arc<dyn EventSink>>,
}

impl ReconciliationSweep {
    pub fn new(
        config: ReconciliationConfig,
        legacy: Arc<dyn Collaborator>,
        modern: Arc<dyn Collaborator>,
        ownership: OwnershipTable,
    ) -> Self {
        Self {
            config,
            legacy,
            modern,
            ownership,
            sink: None,
        }
    }

    /// Where `RECONCILIATION_CORRECTION` events are recorded.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &ReconciliationConfig {
        &self.config
    }

    pub async fn run_once(&self) -> ReconciliationReport {
        let mut report = ReconciliationReport::default();

        for entity_type in &self.config.entity_types {
            let (legacy, modern) = match self.list_both(entity_type).await {
                Ok(records) => records,
                Err(e) => {
                    tracing::warn!(entity_type, error = %e, "Reconciliation listing failed");
                    report.failures += 1;
                    continue;
                }
            };

            let ids: BTreeSet<&String> = legacy.keys().chain(modern.keys()).collect();
            for id in ids {
                report.compared += 1;
                let plan = self.plan(entity_type, legacy.get(id), modern.get(id));
                for correction in plan {
                    match self.apply(&correction).await {
                        Ok(()) => report.corrections.push(correction),
                        Err(e) => {
                            tracing::warn!(
                                entity_type = %correction.entity_type,
                                entity_id = %correction.entity_id,
                                target = %correction.target,
                                error = %e,
                                "Reconciliation correction failed"
                            );
                            report.failures += 1;
                        }
                    }
                }
            }
        }

        report
    }

    /// Corrections needed to make both records agree.
    pub fn plan(
        &self,
        entity_type: &str,
        legacy: Option<&EntityRecord>,
        modern: Option<&EntityRecord>,
    ) -> Vec<Correction> {
        match (legacy, modern) {
            (None, None) => Vec::new(),
            (Some(only), None) => vec![copy_across(only, System::Backend)],
            (None, Some(only)) => vec![copy_across(only, System::Legacy)],
            (Some(legacy), Some(modern)) => {
                let mut to_legacy = BTreeMap::new();
                let mut to_modern = BTreeMap::new();

                let fields: BTreeSet<&String> = legacy.fields.keys().chain(modern.fields.keys()).collect();
                for field in fields {
                    let l = legacy.fields.get(field);
                    let m = modern.fields.get(field);
                    if l == m {
                        continue;
                    }
                    match self.canonical_side(entity_type, field, legacy, modern) {
                        System::Legacy => match l {
                            Some(value) => {
                                to_modern.insert(field.clone(), value.clone());
                            }
                            None => {
                                to_legacy.insert(field.clone(), m.cloned().unwrap_or(Value::Null));
                            }
                        },
                        _ => match m {
                            Some(value) => {
                                to_legacy.insert(field.clone(), value.clone());
                            }
                            None => {
                                to_modern.insert(field.clone(), l.cloned().unwrap_or(Value::Null));
                            }
                        },
                    }
                }

                let mut corrections = Vec::new();
                for (target, fields) in [(System::Legacy, to_legacy), (System::Backend, to_modern)] {
                    if !fields.is_empty() {
                        corrections.push(Correction {
                            entity_type: entity_type.to_string(),
                            entity_id: legacy.entity_id.clone(),
                            target,
                            fields,
                            created: false,
                        });
                    }
                }
                corrections
            }
        }
    }

    fn canonical_side(&self, entity_type: &str, field: &str, legacy: &EntityRecord, modern: &EntityRecord) -> System {
        match self.ownership.owner_of(entity_type, field) {
            Some(System::Legacy) => System::Legacy,
            Some(System::Backend) => System::Backend,
            _ if legacy.updated_at > modern.updated_at => System::Legacy,
            _ => System::Backend,
        }
    }

    async fn list_both(
        &self,
        entity_type: &str,
    ) -> Result<(BTreeMap<String, EntityRecord>, BTreeMap<String, EntityRecord>)> {
        let (legacy, modern) = tokio::try_join!(
            self.legacy.list_entities(entity_type),
            self.modern.list_entities(entity_type)
        )?;
        let index = |records: Vec<EntityRecord>| {
            records
                .into_iter()
                .map(|r| (r.entity_id.clone(), r))
                .collect::<BTreeMap<_, _>>()
        };
        Ok((index(legacy), index(modern)))
    }

    async fn apply(&self, correction: &Correction) -> Result<()> {
        let payload = json!({
            "entityType": correction.entity_type,
            "entityId": correction.entity_id,
            "fields": correction.fields,
            "created": correction.created,
        });
        let event_id = EventId::new();
        let target = match correction.target {
            System::Legacy => &self.legacy,
            _ => &self.modern,
        };

        target
            .send_command(&Command {
                event_id,
                event_type: event_types::RECONCILIATION_CORRECTION.to_string(),
                origin: System::Backend,
                payload: payload.clone(),
                correlation_id: None,
            })
            .await?;

        tracing::info!(
            entity_type = %correction.entity_type,
            entity_id = %correction.entity_id,
            target = %correction.target,
            fields = ?correction.fields.keys().collect::<Vec<_>>(),
            created = correction.created,
            "Reconciliation corrected divergent record"
        );
        counter!(
            "confluence_reconciliation_corrections_total",
            "entity_type" => correction.entity_type.clone()
        )
        .increment(1);

        if let Some(ref sink) = self.sink {
            let event = UnifiedEvent::new(event_types::RECONCILIATION_CORRECTION, System::Backend, payload)
                .with_id(event_id)
                .with_target(correction.target)
                .with_timestamp(Utc::now())
                .with_metadata("producer", "reconciliation")
                .with_metadata(APPLIED_TO, correction.target.as_str());
            if let Err(e) = sink.emit(event).await {
                tracing::warn!(%event_id, error = %e, "Failed to record reconciliation correction");
            }
        }
        Ok(())
    }

    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = self.run_once().await;
                        if !report.is_clean() {
                            tracing::info!(
                                compared = report.compared,
                                corrections = report.corrections.len(),
                                failures = report.failures,
                                "Reconciliation pass"
                            );
                        }
                    }
                }
            }
        })
    }
}

fn copy_across(record: &EntityRecord, target: System) -> Correction {
    Correction {
        entity_type: record.entity_type.clone(),
        entity_id: record.entity_id.clone(),
        target,
        fields: record.fields.clone(),
        created: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryCollaborator;
    use crate::conflict::default_ownership_rules;
    use chrono::TimeZone;

    fn record(entity_type: &str, id: &str, secs: i64, fields: &[(&str, Value)]) -> EntityRecord {
        let mut r = EntityRecord::new(entity_type, id, Utc.timestamp_opt(secs, 0).unwrap());
        for (k, v) in fields {
            r.fields.insert(k.to_string(), v.clone());
        }
        r
    }

    fn sweep() -> ReconciliationSweep {
        ReconciliationSweep::new(
            ReconciliationConfig::default(),
            Arc::new(InMemoryCollaborator::new(System::Legacy)),
            Arc::new(InMemoryCollaborator::new(System::Backend)),
            OwnershipTable::new(default_ownership_rules()),
        )
    }

    #[test]
    fn test_newer_record_wins_without_owner() {
        let legacy = record("user", "u-1", 100, &[("name", json!("Alice"))]);
        let modern = record("user", "u-1", 105, &[("name", json!("Alicia"))]);

        let plan = sweep().plan("user", Some(&legacy), Some(&modern));
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].target, System::Legacy);
        assert_eq!(plan[0].fields["name"], json!("Alicia"));
    }

    #[test]
    fn test_tie_goes_to_modern() {
        let legacy = record("user", "u-1", 100, &[("email", json!("a@old"))]);
        let modern = record("user", "u-1", 100, &[("email", json!("a@new"))]);

        let plan = sweep().plan("user", Some(&legacy), Some(&modern));
        assert_eq!(plan[0].target, System::Legacy);
    }

    #[test]
    fn test_owner_beats_recency() {
        let legacy = record("trade", "t-1", 100, &[("qty", json!(10))]);
        let modern = record("trade", "t-1", 500, &[("qty", json!(12))]);

        let plan = sweep().plan("trade", Some(&legacy), Some(&modern));
        assert_eq!(plan[0].target, System::Backend);
        assert_eq!(plan[0].fields["qty"], json!(10));
    }

    #[test]
    fn test_agreeing_records_need_nothing() {
        let legacy = record("user", "u-1", 100, &[("name", json!("Alice"))]);
        let modern = record("user", "u-1", 300, &[("name", json!("Alice"))]);
        assert!(sweep().plan("user", Some(&legacy), Some(&modern)).is_empty());
    }
}
