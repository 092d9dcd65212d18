//! Resilience wrapper around a collaborator.

use async_trait::async_trait;
use std::sync::Arc;

use super::collaborator::{ChangeBatch, Collaborator, Command, EntityRecord};
use crate::error::Result;
use crate::events::System;
use crate::resilience::{retry_with_backoff, CircuitBreaker, RetryPolicy, SlidingWindowRateLimiter};

/// Every outbound call goes rate limiter → retry → circuit breaker → inner.
///
/// Transient failures are retried with backoff and never reach the caller if
/// a later attempt succeeds. A rejection by an open breaker is not retried,
/// so callers see `CircuitOpen` immediately and can fall back.
pub struct GuardedCollaborator {
    inner: Arc<dyn Collaborator>,
    breaker: Arc<CircuitBreaker>,
    limiter: Option<Arc<SlidingWindowRateLimiter>>,
    retry: RetryPolicy,
}

impl GuardedCollaborator {
    pub fn new(inner: Arc<dyn Collaborator>, breaker: Arc<CircuitBreaker>, retry: RetryPolicy) -> Self {
        Self {
            inner,
            breaker,
            limiter: None,
            retry,
        }
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<SlidingWindowRateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    fn admit(&self) -> Result<()> {
        if let Some(ref limiter) = self.limiter {
            limiter.check(self.inner.system().as_str())?;
        }
        Ok(())
    }
}

#[async_trait]
impl Collaborator for GuardedCollaborator {
    fn system(&self) -> System {
        self.inner.system()
    }

    async fn changes_since(&self, cursor: Option<&str>) -> Result<ChangeBatch> {
        self.admit()?;
        let operation = format!("{}.changes_since", self.system());
        retry_with_backoff(&self.retry, &operation, || {
            self.breaker.call(|| self.inner.changes_since(cursor))
        })
        .await
    }

    async fn send_command(&self, command: &Command) -> Result<()> {
        self.admit()?;
        let operation = format!("{}.send_command", self.system());
        retry_with_backoff(&self.retry, &operation, || {
            self.breaker.call(|| self.inner.send_command(command))
        })
        .await
    }

    async fn list_entities(&self, entity_type: &str) -> Result<Vec<EntityRecord>> {
        self.admit()?;
        let operation = format!("{}.list_entities", self.system());
        retry_with_backoff(&self.retry, &operation, || {
            self.breaker.call(|| self.inner.list_entities(entity_type))
        })
        .await
    }
}
