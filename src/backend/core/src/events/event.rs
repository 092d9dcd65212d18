//! The cross-system event envelope.
//!
//! Every change in either world travels as a [`UnifiedEvent`]. Events are
//! immutable once stored; handlers receive them behind an `Arc` inside an
//! [`EventDelivery`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::VectorClock;
use crate::error::ConfluenceError;

// =============================================================================
// Event IDs
// =============================================================================

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EventId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// =============================================================================
// Systems
// =============================================================================

/// The worlds an event can originate from or be addressed to.
///
/// These double as bus topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum System {
    Frontend,
    Backend,
    Legacy,
}

impl System {
    pub const ALL: [System; 3] = [System::Frontend, System::Backend, System::Legacy];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Frontend => "frontend",
            Self::Backend => "backend",
            Self::Legacy => "legacy",
        }
    }
}

impl fmt::Display for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for System {
    type Err = ConfluenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "frontend" => Ok(Self::Frontend),
            "backend" | "modern" => Ok(Self::Backend),
            "legacy" => Ok(Self::Legacy),
            other => Err(ConfluenceError::validation(format!("unknown system: {}", other))),
        }
    }
}

// =============================================================================
// Well-known event types
// =============================================================================

/// Event types the core itself emits.
pub mod event_types {
    pub const SAGA_STARTED: &str = "SAGA_STARTED";
    pub const SAGA_STEP_COMPLETED: &str = "SAGA_STEP_COMPLETED";
    pub const SAGA_STEP_FAILED: &str = "SAGA_STEP_FAILED";
    pub const SAGA_COMPLETED: &str = "SAGA_COMPLETED";
    pub const SAGA_COMPENSATED: &str = "SAGA_COMPENSATED";
    pub const SAGA_COMPENSATION_FAILED: &str = "SAGA_COMPENSATION_FAILED";
    pub const CONFLICT_RESOLVED: &str = "CONFLICT_RESOLVED";
    pub const RECONCILIATION_CORRECTION: &str = "RECONCILIATION_CORRECTION";
}

// =============================================================================
// Unified Event
// =============================================================================

/// Wire-level event: `{id, type, source, target?, payload, timestamp,
/// correlationId?, vectorClock?, metadata?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedEvent {
    pub id: EventId,

    #[serde(rename = "type")]
    pub event_type: String,

    pub source: System,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<System>,

    #[serde(default)]
    pub payload: serde_json::Value,

    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_clock: Option<VectorClock>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl UnifiedEvent {
    pub fn new(event_type: impl Into<String>, source: System, payload: serde_json::Value) -> Self {
        Self {
            id: EventId::new(),
            event_type: event_type.into(),
            source,
            target: None,
            payload,
            timestamp: Utc::now(),
            correlation_id: None,
            vector_clock: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = id;
        self
    }

    pub fn with_target(mut self, target: System) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_vector_clock(mut self, clock: VectorClock) -> Self {
        self.vector_clock = Some(clock);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// `(entityType, entityId)` when the payload names an entity.
    pub fn entity_ref(&self) -> Option<(&str, &str)> {
        let entity_type = self.payload.get("entityType")?.as_str()?;
        let entity_id = self.payload.get("entityId")?.as_str()?;
        Some((entity_type, entity_id))
    }

    /// Key used to rate-limit the producer of this event.
    pub fn producer_key(&self) -> String {
        match self.metadata.get("producer") {
            Some(producer) => format!("{}:{}", self.source, producer),
            None => self.source.to_string(),
        }
    }
}

// =============================================================================
// Stored and delivered events
// =============================================================================

/// An event as persisted by the store, with its arrival sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Total order of arrival within one store, starting at 1
    pub sequence: u64,
    pub stored_at: DateTime<Utc>,
    pub event: UnifiedEvent,
}

/// What a bus subscriber receives.
#[derive(Debug, Clone)]
pub struct EventDelivery {
    pub event: Arc<UnifiedEvent>,
    pub sequence: Option<u64>,
    /// Re-delivered from the store; side effects that must not repeat
    /// should be suppressed.
    pub replay: bool,
    /// 1-based delivery attempt for this subscriber
    pub attempt: u32,
    /// Topics the bus routed this event to
    pub topics: Arc<BTreeSet<System>>,
}

impl EventDelivery {
    pub fn is_replay(&self) -> bool {
        self.replay
    }

    pub fn id(&self) -> EventId {
        self.event.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_format_uses_camel_case() {
        let event = UnifiedEvent::new("USER_PROFILE_UPDATED", System::Frontend, json!({"name": "A"}))
            .with_target(System::Backend)
            .with_correlation_id("req-1")
            .with_vector_clock(VectorClock::from_entries([("frontend", 1)]));

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "USER_PROFILE_UPDATED");
        assert_eq!(value["source"], "frontend");
        assert_eq!(value["target"], "backend");
        assert_eq!(value["correlationId"], "req-1");
        assert_eq!(value["vectorClock"]["frontend"], 1);
        assert!(value.get("metadata").is_none());
    }

    #[test]
    fn test_optional_fields_may_be_absent() {
        let raw = json!({
            "id": Uuid::new_v4(),
            "type": "PAYMENT_COMPLETED",
            "source": "legacy",
            "payload": {"amount": 10},
            "timestamp": "2024-05-01T12:00:00Z"
        });
        let event: UnifiedEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.source, System::Legacy);
        assert!(event.target.is_none());
        assert!(event.vector_clock.is_none());
    }

    #[test]
    fn test_entity_ref_and_producer_key() {
        let event = UnifiedEvent::new(
            "USER_PROFILE_UPDATED",
            System::Legacy,
            json!({"entityType": "user", "entityId": "u-1"}),
        )
        .with_metadata("producer", "mainframe-batch");

        assert_eq!(event.entity_ref(), Some(("user", "u-1")));
        assert_eq!(event.producer_key(), "legacy:mainframe-batch");
    }

    #[test]
    fn test_system_parse() {
        assert_eq!("modern".parse::<System>().unwrap(), System::Backend);
        assert!("mainframe".parse::<System>().is_err());
    }
}
