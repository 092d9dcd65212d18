//! Per-execution saga state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::definition::SagaContext;
use crate::error::{ConfluenceError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SagaStatus {
    Running,
    Completed,
    Failed,
    Compensated,
}

impl SagaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Compensated => "compensated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Compensated)
    }

    /// `running → completed`, `running → failed → compensated`.
    pub fn can_transition_to(&self, next: SagaStatus) -> bool {
        matches!(
            (self, next),
            (Self::Running, Self::Completed) | (Self::Running, Self::Failed) | (Self::Failed, Self::Compensated)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedStep {
    pub name: String,
    pub output: Value,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationError {
    pub step: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance {
    pub id: Uuid,
    pub saga_type: String,
    pub data: Value,
    /// Index of the next step to run
    pub current_step_index: usize,
    pub completed_steps: Vec<CompletedStep>,
    pub status: SagaStatus,
    pub failed_step: Option<String>,
    pub last_error: Option<String>,
    /// Compensations that ran successfully, in the order they ran
    #[serde(default)]
    pub compensated_steps: Vec<String>,
    #[serde(default)]
    pub compensation_errors: Vec<CompensationError>,
    #[serde(default)]
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Some task in this process is currently driving the saga
    #[serde(skip)]
    pub driver_active: bool,
}

impl SagaInstance {
    pub fn new(saga_type: impl Into<String>, data: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            saga_type: saga_type.into(),
            data,
            current_step_index: 0,
            completed_steps: Vec::new(),
            status: SagaStatus::Running,
            failed_step: None,
            last_error: None,
            compensated_steps: Vec::new(),
            compensation_errors: Vec::new(),
            cancelled: false,
            created_at: now,
            updated_at: now,
            completed_at: None,
            driver_active: false,
        }
    }

    pub fn transition(&mut self, next: SagaStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(ConfluenceError::invalid_state_transition(self.status, next));
        }
        self.status = next;
        self.updated_at = Utc::now();
        if next.is_terminal() {
            self.completed_at = Some(self.updated_at);
        }
        Ok(())
    }

    pub fn record_step(&mut self, name: impl Into<String>, output: Value) {
        self.completed_steps.push(CompletedStep {
            name: name.into(),
            output,
            completed_at: Utc::now(),
        });
        self.current_step_index = self.completed_steps.len();
        self.updated_at = Utc::now();
    }

    pub fn record_failure(&mut self, step: impl Into<String>, error: impl Into<String>) {
        self.failed_step = Some(step.into());
        self.last_error = Some(error.into());
        self.updated_at = Utc::now();
    }

    pub fn context(&self) -> SagaContext {
        SagaContext {
            saga_id: self.id,
            saga_type: self.saga_type.clone(),
            data: self.data.clone(),
            step_outputs: self
                .completed_steps
                .iter()
                .map(|s| (s.name.clone(), s.output.clone()))
                .collect(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Compensated, but some compensation failed: needs manual remediation.
    pub fn needs_remediation(&self) -> bool {
        self.status == SagaStatus::Compensated && !self.compensation_errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;

    #[test]
    fn test_state_machine() {
        let mut saga = SagaInstance::new("COURSE_PURCHASE", json!({}));
        assert!(saga.transition(SagaStatus::Compensated).is_err());

        saga.transition(SagaStatus::Failed).unwrap();
        saga.transition(SagaStatus::Compensated).unwrap();
        assert!(saga.is_terminal());
        assert!(saga.completed_at.is_some());

        let err = saga.transition(SagaStatus::Running).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidStateTransition);
    }

    #[test]
    fn test_context_carries_step_outputs() {
        let mut saga = SagaInstance::new("COURSE_PURCHASE", json!({"userId": "u-1"}));
        saga.record_step("charge", json!({"chargeId": "ch_1"}));

        let ctx = saga.context();
        assert_eq!(ctx.output("charge"), Some(&json!({"chargeId": "ch_1"})));
        assert_eq!(saga.current_step_index, 1);
    }
}
