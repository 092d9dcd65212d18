//! The contract every legacy or modern collaborator exposes to the core.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{ConfluenceError, ErrorCode, Result};
use crate::events::{EventId, System, UnifiedEvent};

// ═══════════════════════════════════════════════════════════════════════════════
// Wire Types
// ═══════════════════════════════════════════════════════════════════════════════

/// A routed event handed to a collaborator's command endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub event_id: EventId,
    pub event_type: String,
    pub origin: System,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Command {
    pub fn from_event(event: &UnifiedEvent) -> Self {
        Self {
            event_id: event.id,
            event_type: event.event_type.clone(),
            origin: event.source,
            payload: event.payload.clone(),
            correlation_id: event.correlation_id.clone(),
        }
    }
}

/// One page of a collaborator's change feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeBatch {
    pub changes: Vec<UnifiedEvent>,
    /// Cursor to pass on the next poll; `None` keeps the current one
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// A collaborator's current view of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    pub entity_id: String,
    pub entity_type: String,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    pub updated_at: DateTime<Utc>,
}

impl EntityRecord {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>, updated_at: DateTime<Utc>) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_type: entity_type.into(),
            fields: BTreeMap::new(),
            updated_at,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Collaborator Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// A black-box system on the far side of an adapter. Shape translation
/// between legacy and modern representations happens behind this trait.
#[async_trait]
pub trait Collaborator: Send + Sync {
    fn system(&self) -> System;

    async fn changes_since(&self, cursor: Option<&str>) -> Result<ChangeBatch>;

    async fn send_command(&self, command: &Command) -> Result<()>;

    async fn list_entities(&self, entity_type: &str) -> Result<Vec<EntityRecord>>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Collaborator
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct MemoryState {
    feed: Vec<UnifiedEvent>,
    commands: Vec<Command>,
    entities: BTreeMap<(String, String), EntityRecord>,
}

/// Collaborator backed by process memory, for local runs and tests.
///
/// The change feed cursor is the index of the next unread event. Commands
/// whose payload carries `entityType`, `entityId` and a `fields` object are
/// applied to the stored entity so reconciliation corrections converge.
#[derive(Debug)]
pub struct InMemoryCollaborator {
    system: System,
    state: Mutex<MemoryState>,
    fail_next: AtomicU32,
}

impl InMemoryCollaborator {
    pub fn new(system: System) -> Self {
        Self {
            system,
            state: Mutex::new(MemoryState::default()),
            fail_next: AtomicU32::new(0),
        }
    }

    /// Make the next `n` calls fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn push_change(&self, event: UnifiedEvent) {
        self.state.lock().feed.push(event);
    }

    pub fn upsert_entity(&self, record: EntityRecord) {
        let key = (record.entity_type.clone(), record.entity_id.clone());
        self.state.lock().entities.insert(key, record);
    }

    pub fn entity(&self, entity_type: &str, entity_id: &str) -> Option<EntityRecord> {
        self.state
            .lock()
            .entities
            .get(&(entity_type.to_string(), entity_id.to_string()))
            .cloned()
    }

    pub fn commands(&self) -> Vec<Command> {
        self.state.lock().commands.clone()
    }

    fn maybe_fail(&self) -> Result<()> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ConfluenceError::collaborator_unavailable(self.system, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl Collaborator for InMemoryCollaborator {
    fn system(&self) -> System {
        self.system
    }

    async fn changes_since(&self, cursor: Option<&str>) -> Result<ChangeBatch> {
        self.maybe_fail()?;
        let start = match cursor {
            Some(raw) => raw.parse::<usize>().map_err(|_| {
                ConfluenceError::new(ErrorCode::InvalidInput, format!("Invalid change cursor: {}", raw))
            })?,
            None => 0,
        };

        let state = self.state.lock();
        let changes = state.feed.iter().skip(start).cloned().collect::<Vec<_>>();
        Ok(ChangeBatch {
            next_cursor: Some(state.feed.len().max(start).to_string()),
            changes,
        })
    }

    async fn send_command(&self, command: &Command) -> Result<()> {
        self.maybe_fail()?;
        let mut state = self.state.lock();

        let payload = &command.payload;
        if let (Some(entity_type), Some(entity_id), Some(fields)) = (
            payload.get("entityType").and_then(Value::as_str),
            payload.get("entityId").and_then(Value::as_str),
            payload.get("fields").and_then(Value::as_object),
        ) {
            let key = (entity_type.to_string(), entity_id.to_string());
            let record = state
                .entities
                .entry(key)
                .or_insert_with(|| EntityRecord::new(entity_type, entity_id, Utc::now()));
            for (name, value) in fields {
                record.fields.insert(name.clone(), value.clone());
            }
            record.updated_at = Utc::now();
        }

        state.commands.push(command.clone());
        Ok(())
    }

    async fn list_entities(&self, entity_type: &str) -> Result<Vec<EntityRecord>> {
        self.maybe_fail()?;
        Ok(self
            .state
            .lock()
            .entities
            .values()
            .filter(|r| r.entity_type == entity_type)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_feed_cursor_advances() {
        let legacy = InMemoryCollaborator::new(System::Legacy);
        legacy.push_change(UnifiedEvent::new("TRADE_BOOKED", System::Legacy, json!({})));

        let first = legacy.changes_since(None).await.unwrap();
        assert_eq!(first.changes.len(), 1);
        assert_eq!(first.next_cursor.as_deref(), Some("1"));

        let second = legacy.changes_since(first.next_cursor.as_deref()).await.unwrap();
        assert!(second.changes.is_empty());
    }

    #[tokio::test]
    async fn test_command_applies_fields() {
        let modern = InMemoryCollaborator::new(System::Backend);
        let event = UnifiedEvent::new(
            "RECONCILIATION_CORRECTION",
            System::Backend,
            json!({"entityType": "user", "entityId": "u-1", "fields": {"name": "Alicia"}}),
        );
        modern.send_command(&Command::from_event(&event)).await.unwrap();

        let record = modern.entity("user", "u-1").unwrap();
        assert_eq!(record.fields["name"], json!("Alicia"));
        assert_eq!(modern.commands().len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let legacy = InMemoryCollaborator::new(System::Legacy);
        legacy.fail_next(1);

        let err = legacy.list_entities("trade").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(legacy.list_entities("trade").await.is_ok());
    }
}
