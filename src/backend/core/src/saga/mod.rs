//! Multi-step cross-system workflows with compensating actions.
//!
//! A [`SagaDefinition`] is registered once per saga type; each call to
//! [`SagaOrchestrator::execute`] creates a [`SagaInstance`] and drives it to
//! `completed` or, after a step failure, through `failed` to `compensated`.

pub mod definition;
pub mod instance;
pub mod orchestrator;

pub use definition::{action_fn, SagaAction, SagaContext, SagaDefinition, SagaStep};
pub use instance::{CompensationError, CompletedStep, SagaInstance, SagaStatus};
pub use orchestrator::{MonitorReport, SagaConfig, SagaOrchestrator, SagaTypeStats};
