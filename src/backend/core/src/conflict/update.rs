//! Entity updates carried inside events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::clock::VectorClock;
use crate::error::{ConfluenceError, Result};
use crate::events::{EventId, LWWRegister, ORSet, PNCounter, System, UnifiedEvent};

/// A field's written value. CRDT kinds merge; scalars do not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum FieldValue {
    Scalar(Value),
    Register(LWWRegister<Value>),
    Set(ORSet<String>),
    Counter(PNCounter),
}

const KINDS: [&str; 4] = ["scalar", "register", "set", "counter"];

impl FieldValue {
    /// Tagged values deserialize as their kind; anything else is a scalar.
    pub fn from_json(raw: Value) -> Result<Self> {
        let tagged = raw
            .get("kind")
            .and_then(Value::as_str)
            .is_some_and(|k| KINDS.contains(&k));
        if tagged {
            Ok(serde_json::from_value(raw)?)
        } else {
            Ok(FieldValue::Scalar(raw))
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Scalar(_) => "scalar",
            Self::Register(_) => "register",
            Self::Set(_) => "set",
            Self::Counter(_) => "counter",
        }
    }

    pub fn is_crdt(&self) -> bool {
        !matches!(self, Self::Scalar(_))
    }

    /// CRDT merge when both sides are the same mergeable kind.
    pub fn merge(&self, other: &FieldValue) -> Option<FieldValue> {
        match (self, other) {
            (Self::Register(a), Self::Register(b)) => {
                let mut merged = a.clone();
                merged.merge(b);
                Some(Self::Register(merged))
            }
            (Self::Set(a), Self::Set(b)) => {
                let mut merged = a.clone();
                merged.merge(b);
                Some(Self::Set(merged))
            }
            (Self::Counter(a), Self::Counter(b)) => {
                let mut merged = a.clone();
                merged.merge(b);
                Some(Self::Counter(merged))
            }
            _ => None,
        }
    }

    /// The plain value a consumer of the entity sees.
    pub fn materialize(&self) -> Value {
        match self {
            Self::Scalar(v) => v.clone(),
            Self::Register(r) => r.value().clone(),
            Self::Set(s) => Value::Array(s.elements().into_iter().map(|e| Value::String(e.clone())).collect()),
            Self::Counter(c) => Value::from(c.value()),
        }
    }
}

/// One system's write to one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityUpdate {
    pub event_id: EventId,
    pub entity_type: String,
    pub entity_id: String,
    pub source: System,
    pub clock: VectorClock,
    pub timestamp: DateTime<Utc>,
    pub changes: BTreeMap<String, FieldValue>,
}

impl EntityUpdate {
    /// Read an update from `{entityType, entityId, changes}` in the payload.
    /// Events without those keys are not entity updates.
    pub fn from_event(event: &UnifiedEvent) -> Result<Option<Self>> {
        let Some((entity_type, entity_id)) = event.entity_ref() else {
            return Ok(None);
        };
        let Some(raw_changes) = event.payload.get("changes") else {
            return Ok(None);
        };
        let Some(fields) = raw_changes.as_object() else {
            return Err(ConfluenceError::invalid_event(format!(
                "event {}: changes must be an object",
                event.id
            )));
        };

        let mut changes = BTreeMap::new();
        for (field, raw) in fields {
            changes.insert(field.clone(), FieldValue::from_json(raw.clone())?);
        }

        Ok(Some(Self {
            event_id: event.id,
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            source: event.source,
            clock: event.vector_clock.clone().unwrap_or_default(),
            timestamp: event.timestamp,
            changes,
        }))
    }

    pub fn entity_key(&self) -> String {
        entity_key(&self.entity_type, &self.entity_id)
    }
}

pub fn entity_key(entity_type: &str, entity_id: &str) -> String {
    format!("{}:{}", entity_type, entity_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_values_are_scalars() {
        let event = UnifiedEvent::new(
            "USER_PROFILE_UPDATED",
            System::Frontend,
            json!({
                "entityType": "user",
                "entityId": "u-1",
                "changes": {
                    "displayName": "Alice",
                    "address": {"city": "Oslo"},
                    "logins": {"kind": "counter", "value": {"increments": {"counts": {"frontend": 2}}, "decrements": {"counts": {}}}}
                }
            }),
        );

        let update = EntityUpdate::from_event(&event).unwrap().unwrap();
        assert_eq!(update.changes["displayName"], FieldValue::Scalar(json!("Alice")));
        assert_eq!(update.changes["address"].kind(), "scalar");
        assert_eq!(update.changes["logins"].materialize(), json!(2));
        assert_eq!(update.entity_key(), "user:u-1");
    }

    #[test]
    fn test_non_entity_events_are_skipped() {
        let event = UnifiedEvent::new("PAGE_VIEWED", System::Frontend, json!({"path": "/"}));
        assert!(EntityUpdate::from_event(&event).unwrap().is_none());
    }

    #[test]
    fn test_malformed_changes_rejected() {
        let event = UnifiedEvent::new(
            "USER_PROFILE_UPDATED",
            System::Frontend,
            json!({"entityType": "user", "entityId": "u-1", "changes": [1, 2]}),
        );
        assert!(EntityUpdate::from_event(&event).is_err());
    }

    #[test]
    fn test_merge_requires_same_kind() {
        let mut a = PNCounter::new();
        a.increment("legacy", 3);
        let mut b = PNCounter::new();
        b.decrement("backend", 1);

        let merged = FieldValue::Counter(a.clone()).merge(&FieldValue::Counter(b)).unwrap();
        assert_eq!(merged.materialize(), json!(2));
        assert!(FieldValue::Counter(a).merge(&FieldValue::Scalar(json!(1))).is_none());
    }
}
