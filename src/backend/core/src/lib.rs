#![allow(clippy::result_large_err)]
//! # Confluence Core
//!
//! Keeps a legacy system and a modern backend consistent while traffic
//! migrates from one to the other.
//!
//! ## Architecture
//!
//! - **Events**: Append-only event store (PostgreSQL or in-memory) and a topic-routed bus
//! - **Sync**: Ingest pipeline that stamps vector clocks, stores, resolves and publishes
//! - **Conflict**: Field-level conflict detection and resolution, CRDT merges
//! - **Resilience**: Circuit breakers, sliding-window rate limits and retry with backoff
//! - **Saga**: Multi-step operations with reverse-order compensation and a stale monitor
//! - **Strangler**: Per-route migration between legacy and modern implementations
//! - **Reconciliation**: Periodic cross-system comparison and self-healing corrections
//! - **Observability**: Structured logging, OTLP tracing and Prometheus metrics

pub mod adapters;
pub mod api;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod error;
pub mod events;
pub mod observability;
pub mod reconciliation;
pub mod resilience;
pub mod runtime;
pub mod saga;
pub mod strangler;
pub mod sync;

pub use error::{ConfluenceError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::adapters::{Collaborator, Command, EntityRecord, InMemoryCollaborator};
    pub use crate::clock::{ClockOrdering, LocalClock, VectorClock};
    pub use crate::config::Config;
    pub use crate::conflict::{ConflictResolver, EntityUpdate, Resolution, ResolutionStrategy};
    pub use crate::error::{ConfluenceError, ErrorCode, ErrorContext, Result};
    pub use crate::events::{
        event_types, EventBus, EventFilter, EventHandler, EventStore, StoredEvent, System, UnifiedEvent,
    };
    pub use crate::resilience::{CircuitBreaker, CircuitState, RetryPolicy, SlidingWindowRateLimiter};
    pub use crate::runtime::SyncRuntime;
    pub use crate::saga::{SagaDefinition, SagaOrchestrator, SagaStatus, SagaStep};
    pub use crate::strangler::{MigrationStatus, RouteConfig, RouteRequest, StranglerRouter};
    pub use crate::sync::SyncCoordinator;
}
