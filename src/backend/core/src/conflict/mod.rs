//! Merging concurrent updates to shared entities.

pub mod ownership;
pub mod resolver;
pub mod update;

pub use ownership::{default_ownership_rules, OwnershipRule, OwnershipTable};
pub use resolver::{
    Conflict, ConflictConfig, ConflictRecord, ConflictResolver, ConflictStats, ConflictType, EntityState,
    FieldDecision, ProcessOutcome, Resolution, ResolutionStrategy,
};
pub use update::{entity_key, EntityUpdate, FieldValue};
