//! Saga execution, reverse-order compensation and cancellation.

use async_trait::async_trait;
use confluence_core::error::{ConfluenceError, ErrorCode, Result};
use confluence_core::events::{event_types, EventSink, UnifiedEvent};
use confluence_core::saga::{action_fn, SagaConfig, SagaDefinition, SagaOrchestrator, SagaStatus, SagaStep};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

type Journal = Arc<Mutex<Vec<String>>>;

/// Step that journals `name` and returns `{"step": name}`.
fn journaled(journal: &Journal, name: &'static str) -> Arc<dyn confluence_core::saga::SagaAction> {
    let journal = journal.clone();
    action_fn(move |_| {
        let journal = journal.clone();
        async move {
            journal.lock().push(name.to_string());
            Ok(json!({ "step": name }))
        }
    })
}

fn failing(journal: &Journal, name: &'static str) -> Arc<dyn confluence_core::saga::SagaAction> {
    let journal = journal.clone();
    action_fn(move |_| {
        let journal = journal.clone();
        async move {
            journal.lock().push(name.to_string());
            Err(ConfluenceError::saga_step_failed(name, "downstream rejected"))
        }
    })
}

fn course_purchase(journal: &Journal, enroll_fails: bool) -> SagaDefinition {
    let enroll = if enroll_fails {
        failing(journal, "enroll")
    } else {
        journaled(journal, "enroll")
    };
    SagaDefinition::new("COURSE_PURCHASE")
        .step(SagaStep::new("validate", journaled(journal, "validate")).with_compensation(journaled(journal, "undo-validate")))
        .step(SagaStep::new("charge", journaled(journal, "charge")).with_compensation(journaled(journal, "refund")))
        .step(SagaStep::new("enroll", enroll).with_compensation(journaled(journal, "unenroll")))
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<UnifiedEvent>>,
}

impl RecordingSink {
    fn types(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.event_type.clone()).collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(&self, event: UnifiedEvent) -> Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

#[tokio::test]
async fn test_course_purchase_completes_in_order() {
    let journal = Journal::default();
    let orchestrator = SagaOrchestrator::default();
    orchestrator.register(course_purchase(&journal, false)).unwrap();

    let id = orchestrator
        .execute("COURSE_PURCHASE", json!({"userId": "u-1", "courseId": "c-9"}))
        .await
        .unwrap();

    let saga = orchestrator.get(id).unwrap();
    assert_eq!(saga.status, SagaStatus::Completed);
    assert!(saga.completed_at.is_some());
    assert_eq!(*journal.lock(), vec!["validate", "charge", "enroll"]);
    assert!(saga.compensated_steps.is_empty());
}

#[tokio::test]
async fn test_steps_see_earlier_outputs() {
    let orchestrator = SagaOrchestrator::default();
    let seen = Arc::new(Mutex::new(None));
    let capture = seen.clone();
    orchestrator
        .register(
            SagaDefinition::new("CHAIN")
                .step(SagaStep::new("reserve", action_fn(|_| async { Ok(json!({"reservation": "r-7"})) })))
                .step(SagaStep::new(
                    "confirm",
                    action_fn(move |ctx| {
                        let capture = capture.clone();
                        async move {
                            *capture.lock() = ctx.output("reserve").cloned();
                            Ok(json!(null))
                        }
                    }),
                )),
        )
        .unwrap();

    orchestrator.execute("CHAIN", json!({})).await.unwrap();
    assert_eq!(*seen.lock(), Some(json!({"reservation": "r-7"})));
}

#[tokio::test]
async fn test_failure_compensates_completed_steps_in_reverse() {
    let journal = Journal::default();
    let orchestrator = SagaOrchestrator::default();
    orchestrator.register(course_purchase(&journal, true)).unwrap();

    let err = orchestrator
        .execute("COURSE_PURCHASE", json!({"userId": "u-1"}))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::SagaExecutionFailed);

    let saga = orchestrator.list(None).pop().unwrap();
    assert_eq!(saga.status, SagaStatus::Compensated);
    assert_eq!(saga.failed_step.as_deref(), Some("enroll"));
    assert!(saga.last_error.is_some());
    // The failed step itself is not compensated.
    assert_eq!(saga.compensated_steps, vec!["charge", "validate"]);
    assert_eq!(
        *journal.lock(),
        vec!["validate", "charge", "enroll", "refund", "undo-validate"]
    );

    let stats = &orchestrator.stats()["COURSE_PURCHASE"];
    assert_eq!(stats.started, 1);
    assert_eq!(stats.step_failures, 1);
    assert_eq!(stats.compensated, 1);
    assert_eq!(stats.completed, 0);
}

#[tokio::test]
async fn test_failed_compensation_is_recorded_and_rest_still_run() {
    let journal = Journal::default();
    let orchestrator = SagaOrchestrator::default();
    orchestrator
        .register(
            SagaDefinition::new("TRANSFER")
                .step(SagaStep::new("debit", journaled(&journal, "debit")).with_compensation(journaled(&journal, "credit-back")))
                .step(SagaStep::new("notify", journaled(&journal, "notify")).with_compensation(failing(&journal, "unnotify")))
                .step(SagaStep::new("credit", failing(&journal, "credit"))),
        )
        .unwrap();

    orchestrator.execute("TRANSFER", json!({})).await.unwrap_err();

    let saga = orchestrator.list(Some(SagaStatus::Compensated)).pop().unwrap();
    assert!(saga.needs_remediation());
    assert_eq!(saga.compensation_errors.len(), 1);
    assert_eq!(saga.compensation_errors[0].step, "unnotify");
    assert_eq!(saga.compensated_steps, vec!["debit"]);
    assert_eq!(orchestrator.stats()["TRANSFER"].compensation_failures, 1);
}

#[tokio::test]
async fn test_lifecycle_events_are_emitted() {
    let journal = Journal::default();
    let sink = Arc::new(RecordingSink::default());
    let orchestrator = SagaOrchestrator::default().with_sink(sink.clone());
    orchestrator.register(course_purchase(&journal, true)).unwrap();

    let _ = orchestrator.execute("COURSE_PURCHASE", json!({})).await;

    assert_eq!(
        sink.types(),
        vec![
            event_types::SAGA_STARTED,
            event_types::SAGA_STEP_COMPLETED,
            event_types::SAGA_STEP_COMPLETED,
            event_types::SAGA_STEP_FAILED,
            event_types::SAGA_COMPENSATED,
        ]
    );
    let saga_id = orchestrator.list(None)[0].id.to_string();
    assert!(sink
        .events
        .lock()
        .iter()
        .all(|e| e.correlation_id.as_deref() == Some(saga_id.as_str())));
}

#[tokio::test]
async fn test_cancel_stops_before_next_step() {
    let journal = Journal::default();
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    let hold = {
        let (journal, started, release) = (journal.clone(), started.clone(), release.clone());
        action_fn(move |_| {
            let (journal, started, release) = (journal.clone(), started.clone(), release.clone());
            async move {
                journal.lock().push("hold".to_string());
                started.notify_one();
                release.notified().await;
                Ok(json!(null))
            }
        })
    };

    let orchestrator = Arc::new(SagaOrchestrator::default());
    orchestrator
        .register(
            SagaDefinition::new("HELD")
                .step(SagaStep::new("hold", hold).with_compensation(journaled(&journal, "unhold")))
                .step(SagaStep::new("after", journaled(&journal, "after"))),
        )
        .unwrap();

    let runner = orchestrator.clone();
    let run = tokio::spawn(async move { runner.execute("HELD", json!({})).await });

    started.notified().await;
    let id = orchestrator.list(Some(SagaStatus::Running))[0].id;
    assert!(orchestrator.cancel(id).unwrap());
    release.notify_one();

    let err = run.await.unwrap().unwrap_err();
    assert_eq!(err.code(), ErrorCode::SagaExecutionFailed);

    let saga = orchestrator.get(id).unwrap();
    assert!(saga.cancelled);
    assert_eq!(saga.status, SagaStatus::Compensated);
    assert_eq!(*journal.lock(), vec!["hold", "unhold"]);
    assert_eq!(orchestrator.stats()["HELD"].cancelled, 1);

    // Already terminal.
    assert!(!orchestrator.cancel(id).unwrap());
}

#[tokio::test]
async fn test_cancel_unknown_saga() {
    let orchestrator = SagaOrchestrator::default();
    let err = orchestrator.cancel(uuid::Uuid::new_v4()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::SagaNotFound);
}

#[tokio::test]
async fn test_step_timeout_fails_and_compensates() {
    let journal = Journal::default();
    let orchestrator = SagaOrchestrator::default();
    orchestrator
        .register(
            SagaDefinition::new("SLOW_PURCHASE")
                .step(SagaStep::new("validate", journaled(&journal, "validate")).with_compensation(journaled(&journal, "undo-validate")))
                .step(
                    SagaStep::new(
                        "charge",
                        action_fn(|_| async {
                            tokio::time::sleep(Duration::from_secs(10)).await;
                            Ok(json!(null))
                        }),
                    )
                    .with_compensation(journaled(&journal, "refund"))
                    .with_timeout(Duration::from_millis(25)),
                ),
        )
        .unwrap();

    orchestrator.execute("SLOW_PURCHASE", json!({})).await.unwrap_err();

    let saga = orchestrator.list(None).pop().unwrap();
    assert_eq!(saga.failed_step.as_deref(), Some("charge"));
    assert_eq!(*journal.lock(), vec!["validate", "undo-validate"]);
}

#[tokio::test]
async fn test_monitor_recovers_saga_whose_caller_went_away() {
    let journal = Journal::default();
    let orchestrator = Arc::new(SagaOrchestrator::new(SagaConfig {
        stale_after: Duration::ZERO,
        ..SagaConfig::default()
    }));
    orchestrator
        .register(
            SagaDefinition::new("HOLD_AND_SHIP")
                .step(SagaStep::new("hold", journaled(&journal, "hold")).with_compensation(journaled(&journal, "unhold")))
                .step(SagaStep::new(
                    "ship",
                    action_fn(|_| async {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        Ok(json!(null))
                    }),
                )),
        )
        .unwrap();

    let caller = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.execute("HOLD_AND_SHIP", json!({})).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    caller.abort();
    assert!(caller.await.unwrap_err().is_cancelled());

    let running = orchestrator.list(Some(SagaStatus::Running));
    assert_eq!(running.len(), 1);
    assert!(!running[0].driver_active);

    let report = orchestrator.run_monitor_once().await;
    assert_eq!(report.compensated, 1);

    let saga = orchestrator.get(running[0].id).unwrap();
    assert_eq!(saga.status, SagaStatus::Compensated);
    assert_eq!(saga.failed_step.as_deref(), Some("ship"));
    assert_eq!(*journal.lock(), vec!["hold", "unhold"]);
}
