//! Saga execution, compensation and stale-instance recovery.
//!
//! A single saga runs its steps strictly in order on the caller's task; many
//! sagas run concurrently. Each step runs in its own spawned task under a
//! timeout. A step that overruns is left to finish in the background but
//! counts as failed, and compensation starts immediately.

use chrono::Utc;
use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use super::definition::{SagaAction, SagaContext, SagaDefinition};
use super::instance::{CompensationError, SagaInstance, SagaStatus};
use crate::error::{ConfluenceError, ErrorCode, Result};
use crate::events::{event_types, EventSink, System, UnifiedEvent};

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaConfig {
    /// Default per-step timeout
    #[serde(default = "default_step_timeout", with = "humantime_serde")]
    pub step_timeout: Duration,

    /// A running saga with no driver and no progress for this long is stale
    #[serde(default = "default_stale_after", with = "humantime_serde")]
    pub stale_after: Duration,

    /// How long terminal sagas are kept for audit
    #[serde(default = "default_retention", with = "humantime_serde")]
    pub retention: Duration,

    #[serde(default = "default_monitor_interval", with = "humantime_serde")]
    pub monitor_interval: Duration,
}

fn default_step_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_stale_after() -> Duration {
    Duration::from_secs(300)
}
fn default_retention() -> Duration {
    Duration::from_secs(3600)
}
fn default_monitor_interval() -> Duration {
    Duration::from_secs(30)
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            step_timeout: default_step_timeout(),
            stale_after: default_stale_after(),
            retention: default_retention(),
            monitor_interval: default_monitor_interval(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaTypeStats {
    pub started: u64,
    pub completed: u64,
    pub compensated: u64,
    pub step_failures: u64,
    pub compensation_failures: u64,
    pub cancelled: u64,
}

/// Outcome of one monitor pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorReport {
    pub purged: usize,
    pub resumed: usize,
    pub compensated: usize,
}

type InstanceHandle = Arc<Mutex<SagaInstance>>;

// ═══════════════════════════════════════════════════════════════════════════════
// Orchestrator
// ═══════════════════════════════════════════════════════════════════════════════

pub struct SagaOrchestrator {
    config: SagaConfig,
    definitions: DashMap<String, Arc<SagaDefinition>>,
    instances: DashMap<Uuid, InstanceHandle>,
    cancellations: DashMap<Uuid, CancellationToken>,
    stats: DashMap<String, SagaTypeStats>,
    sink: Option<Arc<dyn EventSink>>,
}

impl SagaOrchestrator {
    pub fn new(config: SagaConfig) -> Self {
        Self {
            config,
            definitions: DashMap::new(),
            instances: DashMap::new(),
            cancellations: DashMap::new(),
            stats: DashMap::new(),
            sink: None,
        }
    }

    /// Publish saga lifecycle events into `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &SagaConfig {
        &self.config
    }

    pub fn register(&self, definition: SagaDefinition) -> Result<()> {
        definition.validate()?;
        tracing::info!(
            saga_type = %definition.saga_type,
            steps = ?definition.step_names(),
            "Registered saga definition"
        );
        self.definitions
            .insert(definition.saga_type.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn saga_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.definitions.iter().map(|d| d.key().clone()).collect();
        types.sort();
        types
    }

    /// Run a saga to a terminal state and return its id.
    ///
    /// On a step failure the completed steps are compensated in reverse and
    /// the error is `SagaExecutionFailed` wrapping the step's error.
    #[instrument(skip(self, data), fields(saga_id = tracing::field::Empty))]
    pub async fn execute(&self, saga_type: &str, data: Value) -> Result<Uuid> {
        let definition = self.definition(saga_type)?;

        let mut instance = SagaInstance::new(saga_type, data);
        instance.driver_active = true;
        let saga_id = instance.id;
        tracing::Span::current().record("saga_id", tracing::field::display(saga_id));

        let handle = Arc::new(Mutex::new(instance));
        self.instances.insert(saga_id, handle.clone());
        self.cancellations.insert(saga_id, CancellationToken::new());
        // Covers the caller dropping this future before `drive` takes over.
        let _driver = DriverGuard(handle);
        self.bump(saga_type, |s| s.started += 1);
        counter!("confluence_saga_total", "saga_type" => saga_type.to_string(), "status" => "started").increment(1);

        tracing::info!(saga_type, "Saga started");
        self.emit(
            event_types::SAGA_STARTED,
            saga_id,
            json!({"sagaId": saga_id, "sagaType": saga_type}),
        )
        .await;

        self.drive(&definition, saga_id).await.map(|_| saga_id)
    }

    /// Request cancellation. The in-flight step finishes; no further steps
    /// start and completed steps are compensated. Returns `false` if the
    /// saga had already finished.
    pub fn cancel(&self, saga_id: Uuid) -> Result<bool> {
        let handle = self.handle(saga_id)?;
        {
            let mut instance = handle.lock();
            if instance.is_terminal() {
                return Ok(false);
            }
            instance.cancelled = true;
        }
        if let Some(token) = self.cancellations.get(&saga_id) {
            token.cancel();
        }
        tracing::info!(%saga_id, "Saga cancellation requested");
        Ok(true)
    }

    pub fn get(&self, saga_id: Uuid) -> Option<SagaInstance> {
        self.instances.get(&saga_id).map(|h| h.lock().clone())
    }

    /// Instances, oldest first, optionally filtered by status.
    pub fn list(&self, status: Option<SagaStatus>) -> Vec<SagaInstance> {
        let mut out: Vec<SagaInstance> = self
            .instances
            .iter()
            .map(|h| h.lock().clone())
            .filter(|i| status.map_or(true, |s| i.status == s))
            .collect();
        out.sort_by_key(|i| i.created_at);
        out
    }

    pub fn stats(&self) -> BTreeMap<String, SagaTypeStats> {
        self.stats
            .iter()
            .map(|s| (s.key().clone(), s.value().clone()))
            .collect()
    }

    /// Adopt an instance loaded from elsewhere. It has no driver, so the
    /// monitor will pick it up once it is stale.
    pub fn restore(&self, mut instance: SagaInstance) -> Result<()> {
        self.definition(&instance.saga_type)?;
        if self.instances.contains_key(&instance.id) {
            return Err(ConfluenceError::validation(format!(
                "saga {} is already tracked",
                instance.id
            )));
        }
        instance.driver_active = false;
        let saga_id = instance.id;
        if !instance.is_terminal() {
            self.cancellations.insert(saga_id, CancellationToken::new());
        }
        self.instances.insert(saga_id, Arc::new(Mutex::new(instance)));
        tracing::info!(%saga_id, "Restored saga instance");
        Ok(())
    }

    /// Purge expired terminal sagas, then resume or compensate stale ones.
    pub async fn run_monitor_once(&self) -> MonitorReport {
        let mut report = MonitorReport::default();
        let now = Utc::now();
        let older_than = |t: chrono::DateTime<Utc>, limit: Duration| {
            (now - t).to_std().map(|age| age >= limit).unwrap_or(false)
        };

        let expired: Vec<Uuid> = self
            .instances
            .iter()
            .filter(|h| {
                let i = h.lock();
                i.is_terminal() && i.completed_at.is_some_and(|t| older_than(t, self.config.retention))
            })
            .map(|h| *h.key())
            .collect();
        for id in expired {
            self.instances.remove(&id);
            self.cancellations.remove(&id);
            report.purged += 1;
        }

        let stale: Vec<Uuid> = self
            .instances
            .iter()
            .filter(|h| {
                let i = h.lock();
                !i.is_terminal() && !i.driver_active && older_than(i.updated_at, self.config.stale_after)
            })
            .map(|h| *h.key())
            .collect();

        for saga_id in stale {
            let Ok(handle) = self.handle(saga_id) else { continue };
            let (saga_type, status, next_index) = {
                let mut instance = handle.lock();
                if instance.driver_active || instance.is_terminal() {
                    continue;
                }
                instance.driver_active = true;
                (instance.saga_type.clone(), instance.status, instance.current_step_index)
            };

            let definition = match self.definition(&saga_type) {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(%saga_id, saga_type, error = %e, "Stale saga has no definition");
                    handle.lock().driver_active = false;
                    continue;
                }
            };

            if status == SagaStatus::Failed {
                tracing::warn!(%saga_id, saga_type, "Resuming interrupted compensation");
                self.compensate(&definition, &handle).await;
                handle.lock().driver_active = false;
                report.compensated += 1;
                continue;
            }

            let resumable = definition.steps.get(next_index).map_or(true, |s| s.idempotent);
            if resumable {
                tracing::warn!(%saga_id, saga_type, next_index, "Resuming stale saga");
                if let Err(e) = self.drive(&definition, saga_id).await {
                    tracing::warn!(%saga_id, error = %e, "Resumed saga ended in compensation");
                    report.compensated += 1;
                } else {
                    report.resumed += 1;
                }
            } else {
                let step = definition.steps[next_index].name.clone();
                tracing::warn!(%saga_id, saga_type, step = %step, "Stale saga at non-idempotent step, compensating");
                let transitioned = {
                    let mut instance = handle.lock();
                    instance.record_failure(&step, "saga went stale before a non-idempotent step");
                    instance.transition(SagaStatus::Failed)
                };
                if transitioned.is_ok() {
                    self.compensate(&definition, &handle).await;
                    report.compensated += 1;
                }
                handle.lock().driver_active = false;
                self.cancellations.remove(&saga_id);
            }
        }

        report
    }

    /// Run `run_monitor_once` on an interval until cancelled.
    pub fn spawn_monitor(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.monitor_interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = self.run_monitor_once().await;
                        if report != MonitorReport::default() {
                            tracing::info!(
                                purged = report.purged,
                                resumed = report.resumed,
                                compensated = report.compensated,
                                "Saga monitor pass"
                            );
                        }
                    }
                }
            }
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Execution
    // ─────────────────────────────────────────────────────────────────────────

    async fn drive(&self, definition: &SagaDefinition, saga_id: Uuid) -> Result<()> {
        let handle = self.handle(saga_id)?;
        let _driver = DriverGuard(handle.clone());
        let token = self
            .cancellations
            .get(&saga_id)
            .map(|t| t.clone())
            .unwrap_or_default();
        let saga_type = definition.saga_type.as_str();

        let result = loop {
            let (index, ctx) = {
                let instance = handle.lock();
                (instance.current_step_index, instance.context())
            };

            let Some(step) = definition.steps.get(index) else {
                let done = handle.lock().transition(SagaStatus::Completed);
                if let Err(e) = done {
                    break Err(e);
                }
                self.bump(saga_type, |s| s.completed += 1);
                counter!("confluence_saga_total", "saga_type" => saga_type.to_string(), "status" => "completed")
                    .increment(1);
                tracing::info!(%saga_id, saga_type, "Saga completed");
                self.emit(
                    event_types::SAGA_COMPLETED,
                    saga_id,
                    json!({"sagaId": saga_id, "sagaType": saga_type}),
                )
                .await;
                break Ok(());
            };

            let outcome = if token.is_cancelled() {
                self.bump(saga_type, |s| s.cancelled += 1);
                Err(ConfluenceError::new(
                    ErrorCode::SagaCancelled,
                    format!("Saga {} cancelled before step {}", saga_id, step.name),
                ))
            } else {
                let timeout = step.timeout.unwrap_or(self.config.step_timeout);
                run_action(&step.name, step.action.clone(), ctx, timeout).await
            };

            match outcome {
                Ok(output) => {
                    handle.lock().record_step(&step.name, output);
                    tracing::debug!(%saga_id, step = %step.name, index, "Saga step completed");
                    self.emit(
                        event_types::SAGA_STEP_COMPLETED,
                        saga_id,
                        json!({"sagaId": saga_id, "sagaType": saga_type, "step": step.name, "stepIndex": index}),
                    )
                    .await;
                }
                Err(e) => {
                    self.bump(saga_type, |s| s.step_failures += 1);
                    tracing::warn!(%saga_id, step = %step.name, index, error = %e, "Saga step failed");
                    self.emit(
                        event_types::SAGA_STEP_FAILED,
                        saga_id,
                        json!({
                            "sagaId": saga_id,
                            "sagaType": saga_type,
                            "step": step.name,
                            "stepIndex": index,
                            "error": e.to_string(),
                        }),
                    )
                    .await;

                    let failed = {
                        let mut instance = handle.lock();
                        instance.record_failure(&step.name, e.to_string());
                        instance.transition(SagaStatus::Failed)
                    };
                    if let Err(transition_err) = failed {
                        break Err(transition_err);
                    }
                    self.compensate(definition, &handle).await;
                    break Err(ConfluenceError::saga_execution_failed(saga_id, &step.name, e));
                }
            }
        };

        self.cancellations.remove(&saga_id);
        result
    }

    /// Compensate completed steps in reverse order, each at most once.
    /// A failing compensation is escalated and the rest still run.
    async fn compensate(&self, definition: &SagaDefinition, handle: &InstanceHandle) {
        let (saga_id, ctx, to_compensate) = {
            let instance = handle.lock();
            let pending: Vec<String> = instance
                .completed_steps
                .iter()
                .rev()
                .map(|s| s.name.clone())
                .filter(|name| !instance.compensated_steps.contains(name))
                .collect();
            (instance.id, instance.context(), pending)
        };
        let saga_type = definition.saga_type.as_str();

        for name in to_compensate {
            let Some(step) = definition.steps.iter().find(|s| s.name == name) else {
                continue;
            };
            let Some(compensation) = step.compensation.clone() else {
                continue;
            };

            let timeout = step.timeout.unwrap_or(self.config.step_timeout);
            match run_action(&name, compensation, ctx.clone(), timeout).await {
                Ok(_) => {
                    tracing::info!(%saga_id, step = %name, "Compensated saga step");
                    handle.lock().compensated_steps.push(name);
                }
                Err(e) => {
                    tracing::error!(
                        alert = true,
                        %saga_id,
                        saga_type,
                        step = %name,
                        error = %e,
                        "Compensation failed; saga needs manual remediation"
                    );
                    self.bump(saga_type, |s| s.compensation_failures += 1);
                    counter!("confluence_saga_compensation_failures_total", "saga_type" => saga_type.to_string())
                        .increment(1);
                    handle.lock().compensation_errors.push(CompensationError {
                        step: name.clone(),
                        error: e.to_string(),
                    });
                    self.emit(
                        event_types::SAGA_COMPENSATION_FAILED,
                        saga_id,
                        json!({"sagaId": saga_id, "sagaType": saga_type, "step": name, "error": e.to_string()}),
                    )
                    .await;
                }
            }
        }

        let (done, errors) = {
            let mut instance = handle.lock();
            (instance.transition(SagaStatus::Compensated), instance.compensation_errors.len())
        };
        if let Err(e) = done {
            tracing::error!(%saga_id, error = %e, "Could not mark saga compensated");
            return;
        }

        self.bump(saga_type, |s| s.compensated += 1);
        counter!("confluence_saga_total", "saga_type" => saga_type.to_string(), "status" => "compensated").increment(1);
        tracing::info!(%saga_id, saga_type, compensation_errors = errors, "Saga compensated");
        self.emit(
            event_types::SAGA_COMPENSATED,
            saga_id,
            json!({"sagaId": saga_id, "sagaType": saga_type, "compensationErrors": errors}),
        )
        .await;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────────

    fn definition(&self, saga_type: &str) -> Result<Arc<SagaDefinition>> {
        self.definitions
            .get(saga_type)
            .map(|d| d.clone())
            .ok_or_else(|| ConfluenceError::saga_definition_not_found(saga_type))
    }

    fn handle(&self, saga_id: Uuid) -> Result<InstanceHandle> {
        self.instances
            .get(&saga_id)
            .map(|h| h.clone())
            .ok_or_else(|| ConfluenceError::saga_not_found(saga_id))
    }

    fn bump(&self, saga_type: &str, f: impl FnOnce(&mut SagaTypeStats)) {
        f(&mut self.stats.entry(saga_type.to_string()).or_default());
    }

    async fn emit(&self, event_type: &str, saga_id: Uuid, payload: Value) {
        let Some(sink) = &self.sink else { return };
        let event = UnifiedEvent::new(event_type, System::Backend, payload)
            .with_correlation_id(saga_id.to_string())
            .with_metadata("producer", "saga-orchestrator");
        if let Err(e) = sink.emit(event).await {
            tracing::warn!(%saga_id, event_type, error = %e, "Failed to emit saga event");
        }
    }
}

impl Default for SagaOrchestrator {
    fn default() -> Self {
        Self::new(SagaConfig::default())
    }
}

/// Clears `driver_active` when the driving future finishes or is dropped,
/// so the monitor can adopt a saga whose caller went away.
struct DriverGuard(InstanceHandle);

impl Drop for DriverGuard {
    fn drop(&mut self) {
        self.0.lock().driver_active = false;
    }
}

/// Run an action in its own task. On timeout the task keeps running
/// detached and the step is reported as timed out.
async fn run_action(
    step: &str,
    action: Arc<dyn SagaAction>,
    ctx: SagaContext,
    timeout: Duration,
) -> Result<Value> {
    let mut task = tokio::spawn(async move { action.run(ctx).await });
    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(ConfluenceError::saga_step_failed(
            step,
            format!("step task did not complete: {}", join_err),
        )),
        Err(_) => {
            tracing::warn!(step, timeout_ms = timeout.as_millis() as u64, "Saga step timed out");
            Err(ConfluenceError::saga_step_timeout(step, timeout))
        }
    }
}
