//! Cross-system reconciliation sweeps.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use confluence_core::adapters::{Collaborator, CommandForwarder, EntityRecord, InMemoryCollaborator, APPLIED_TO};
use confluence_core::config::Config;
use confluence_core::conflict::{default_ownership_rules, OwnershipTable};
use confluence_core::error::Result;
use confluence_core::events::{event_types, EventSink, InMemoryEventStore, System, UnifiedEvent};
use confluence_core::reconciliation::{ReconciliationConfig, ReconciliationSweep};
use confluence_core::runtime::SyncRuntime;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct RecordingSink(Mutex<Vec<UnifiedEvent>>);

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(&self, event: UnifiedEvent) -> Result<()> {
        self.0.lock().push(event);
        Ok(())
    }
}

struct Systems {
    legacy: Arc<InMemoryCollaborator>,
    modern: Arc<InMemoryCollaborator>,
    sweep: ReconciliationSweep,
}

fn systems(entity_types: &[&str]) -> Systems {
    let legacy = Arc::new(InMemoryCollaborator::new(System::Legacy));
    let modern = Arc::new(InMemoryCollaborator::new(System::Backend));
    let config = ReconciliationConfig {
        entity_types: entity_types.iter().map(|s| s.to_string()).collect(),
        ..ReconciliationConfig::default()
    };
    let sweep = ReconciliationSweep::new(
        config,
        legacy.clone(),
        modern.clone(),
        OwnershipTable::new(default_ownership_rules()),
    );
    Systems { legacy, modern, sweep }
}

fn at(minute: u32) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 8, minute, 0).unwrap()
}

#[tokio::test]
async fn test_missing_record_is_created_on_the_other_side() {
    let s = systems(&["user"]);
    s.legacy
        .upsert_entity(EntityRecord::new("user", "u-1", at(0)).with_field("name", json!("Ada")));

    let report = s.sweep.run_once().await;
    assert_eq!(report.compared, 1);
    assert_eq!(report.corrections.len(), 1);
    assert!(report.corrections[0].created);
    assert_eq!(report.corrections[0].target, System::Backend);

    let copied = s.modern.entity("user", "u-1").unwrap();
    assert_eq!(copied.fields["name"], json!("Ada"));
    assert!(s.sweep.run_once().await.is_clean());
}

#[tokio::test]
async fn test_newer_side_wins_unowned_fields() {
    let s = systems(&["user"]);
    s.legacy.upsert_entity(
        EntityRecord::new("user", "u-2", at(0))
            .with_field("name", json!("Alice"))
            .with_field("tier", json!("gold")),
    );
    s.modern.upsert_entity(
        EntityRecord::new("user", "u-2", at(5))
            .with_field("name", json!("Alicia"))
            .with_field("tier", json!("gold")),
    );

    let report = s.sweep.run_once().await;
    assert_eq!(report.corrections.len(), 1);
    let correction = &report.corrections[0];
    assert_eq!(correction.target, System::Legacy);
    assert_eq!(correction.fields.len(), 1);
    assert_eq!(correction.fields["name"], json!("Alicia"));

    assert_eq!(s.legacy.entity("user", "u-2").unwrap().fields["name"], json!("Alicia"));
}

#[tokio::test]
async fn test_owner_beats_recency() {
    let s = systems(&["trade"]);
    s.legacy
        .upsert_entity(EntityRecord::new("trade", "t-1", at(0)).with_field("quantity", json!(100)));
    s.modern
        .upsert_entity(EntityRecord::new("trade", "t-1", at(30)).with_field("quantity", json!(90)));

    let report = s.sweep.run_once().await;
    assert_eq!(report.corrections.len(), 1);
    assert_eq!(report.corrections[0].target, System::Backend);
    assert_eq!(s.modern.entity("trade", "t-1").unwrap().fields["quantity"], json!(100));
}

#[tokio::test]
async fn test_equal_timestamps_favor_modern() {
    let s = systems(&["user"]);
    s.legacy
        .upsert_entity(EntityRecord::new("user", "u-3", at(1)).with_field("email", json!("a@old.example")));
    s.modern
        .upsert_entity(EntityRecord::new("user", "u-3", at(1)).with_field("email", json!("a@new.example")));

    let plan = s.sweep.plan(
        "user",
        s.legacy.entity("user", "u-3").as_ref(),
        s.modern.entity("user", "u-3").as_ref(),
    );
    assert_eq!(plan.len(), 1);
    assert_eq!(plan[0].target, System::Legacy);
}

#[tokio::test]
async fn test_listing_failure_skips_only_that_type() {
    let s = systems(&["user", "trade"]);
    s.modern
        .upsert_entity(EntityRecord::new("trade", "t-9", Utc::now() - ChronoDuration::minutes(1)));
    s.legacy.fail_next(1);

    let report = s.sweep.run_once().await;
    assert_eq!(report.failures, 1);
    assert_eq!(report.corrections.len(), 1);
    assert!(s.legacy.entity("trade", "t-9").is_some());
}

#[tokio::test]
async fn test_corrections_are_recorded_with_applied_marker() {
    let s = systems(&["user"]);
    let sink = Arc::new(RecordingSink::default());
    let sweep = s.sweep.with_sink(sink.clone());
    s.modern
        .upsert_entity(EntityRecord::new("user", "u-4", at(0)).with_field("name", json!("Grace")));

    sweep.run_once().await;

    let events = sink.0.lock();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.event_type, event_types::RECONCILIATION_CORRECTION);
    assert_eq!(event.target, Some(System::Legacy));
    assert_eq!(event.metadata.get(APPLIED_TO).map(String::as_str), Some("legacy"));
    // The recorded event carries the id of the command that was sent.
    assert_eq!(s.legacy.commands()[0].event_id, event.id);
}

#[tokio::test]
async fn test_recorded_correction_is_not_forwarded_again() {
    let store = Arc::new(InMemoryEventStore::new());
    let legacy = Arc::new(InMemoryCollaborator::new(System::Legacy));
    let modern = Arc::new(InMemoryCollaborator::new(System::Backend));
    let runtime = SyncRuntime::with_parts(
        Config::default(),
        store.clone(),
        Some(legacy.clone() as Arc<dyn Collaborator>),
        Some(modern.clone() as Arc<dyn Collaborator>),
    )
    .unwrap();

    let _to_legacy = CommandForwarder::attach(runtime.bus(), runtime.legacy().unwrap().clone(), 100);
    let _to_modern = CommandForwarder::attach(runtime.bus(), runtime.modern().unwrap().clone(), 100);

    modern.upsert_entity(EntityRecord::new("user", "u-5", at(0)).with_field("name", json!("Hopper")));
    let report = runtime.reconciliation().unwrap().run_once().await;
    assert_eq!(report.corrections.len(), 1);
    assert!(runtime.bus().drain(Duration::from_secs(1)).await);

    assert_eq!(store.len(), 1);
    assert_eq!(legacy.commands().len(), 1);
    assert!(modern.commands().is_empty());
}
