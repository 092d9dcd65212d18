//! Saga types: ordered steps with optional compensations.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{ConfluenceError, Result};

/// What a step action sees: the saga input plus the outputs of the steps
/// completed so far.
#[derive(Debug, Clone)]
pub struct SagaContext {
    pub saga_id: Uuid,
    pub saga_type: String,
    pub data: Value,
    pub step_outputs: BTreeMap<String, Value>,
}

impl SagaContext {
    pub fn output(&self, step: &str) -> Option<&Value> {
        self.step_outputs.get(step)
    }
}

/// A step action or compensation.
#[async_trait]
pub trait SagaAction: Send + Sync {
    async fn run(&self, ctx: SagaContext) -> Result<Value>;
}

struct FnAction<F>(F);

#[async_trait]
impl<F, Fut> SagaAction for FnAction<F>
where
    F: Fn(SagaContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn run(&self, ctx: SagaContext) -> Result<Value> {
        (self.0)(ctx).await
    }
}

/// Wrap a closure as a [`SagaAction`].
pub fn action_fn<F, Fut>(f: F) -> Arc<dyn SagaAction>
where
    F: Fn(SagaContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnAction(f))
}

#[derive(Clone)]
pub struct SagaStep {
    pub name: String,
    pub action: Arc<dyn SagaAction>,
    pub compensation: Option<Arc<dyn SagaAction>>,
    /// Overrides the orchestrator's default step timeout
    pub timeout: Option<Duration>,
    /// Safe to run again after a crash, so the stale monitor may resume it
    pub idempotent: bool,
}

impl SagaStep {
    pub fn new(name: impl Into<String>, action: Arc<dyn SagaAction>) -> Self {
        Self {
            name: name.into(),
            action,
            compensation: None,
            timeout: None,
            idempotent: false,
        }
    }

    pub fn with_compensation(mut self, compensation: Arc<dyn SagaAction>) -> Self {
        self.compensation = Some(compensation);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }
}

impl fmt::Debug for SagaStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaStep")
            .field("name", &self.name)
            .field("has_compensation", &self.compensation.is_some())
            .field("timeout", &self.timeout)
            .field("idempotent", &self.idempotent)
            .finish()
    }
}

/// A saga type: a fixed ordered list of steps.
#[derive(Debug, Clone)]
pub struct SagaDefinition {
    pub saga_type: String,
    pub steps: Vec<SagaStep>,
}

impl SagaDefinition {
    pub fn new(saga_type: impl Into<String>) -> Self {
        Self {
            saga_type: saga_type.into(),
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: SagaStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.saga_type.trim().is_empty() {
            return Err(ConfluenceError::validation("saga type must not be empty"));
        }
        if self.steps.is_empty() {
            return Err(ConfluenceError::validation(format!(
                "saga {} has no steps",
                self.saga_type
            )));
        }
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(ConfluenceError::validation(format!(
                    "saga {} has duplicate step {}",
                    self.saga_type, step.name
                )));
            }
        }
        Ok(())
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop() -> Arc<dyn SagaAction> {
        action_fn(|_| async { Ok(json!(null)) })
    }

    #[test]
    fn test_validate_rejects_duplicates_and_empty() {
        assert!(SagaDefinition::new("EMPTY").validate().is_err());

        let dup = SagaDefinition::new("DUP")
            .step(SagaStep::new("a", noop()))
            .step(SagaStep::new("a", noop()));
        assert!(dup.validate().is_err());

        let ok = SagaDefinition::new("OK")
            .step(SagaStep::new("a", noop()))
            .step(SagaStep::new("b", noop()).with_compensation(noop()).idempotent());
        assert!(ok.validate().is_ok());
        assert_eq!(ok.step_names(), vec!["a", "b"]);
    }
}
