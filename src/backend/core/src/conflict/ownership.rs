//! Authoritative-system rules per entity field.

use serde::{Deserialize, Serialize};

use crate::events::System;

/// `owner` wins any contested write to `entity_type.field`.
/// `field = "*"` covers every field of the entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipRule {
    pub entity_type: String,
    #[serde(default = "any_field")]
    pub field: String,
    pub owner: System,
}

fn any_field() -> String {
    "*".to_string()
}

impl OwnershipRule {
    pub fn new(entity_type: impl Into<String>, field: impl Into<String>, owner: System) -> Self {
        Self {
            entity_type: entity_type.into(),
            field: field.into(),
            owner,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OwnershipTable {
    rules: Vec<OwnershipRule>,
}

impl OwnershipTable {
    pub fn new(rules: Vec<OwnershipRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[OwnershipRule] {
        &self.rules
    }

    /// An exact field rule beats a `*` rule. The first matching rule of
    /// each kind is used.
    pub fn owner_of(&self, entity_type: &str, field: &str) -> Option<System> {
        let mut wildcard = None;
        for rule in self.rules.iter().filter(|r| r.entity_type == entity_type) {
            if rule.field == field {
                return Some(rule.owner);
            }
            if rule.field == "*" && wildcard.is_none() {
                wildcard = Some(rule.owner);
            }
        }
        wildcard
    }
}

/// Trades and payments are booked in legacy, so legacy stays authoritative.
pub fn default_ownership_rules() -> Vec<OwnershipRule> {
    vec![
        OwnershipRule::new("trade", "*", System::Legacy),
        OwnershipRule::new("payment", "*", System::Legacy),
    ]
}
