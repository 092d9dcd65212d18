//! Event plumbing shared by every other component.
//!
//! - **`event`**: the `UnifiedEvent` envelope and delivery wrapper.
//! - **`store`**: append-only persistence (`EventStore`), in memory or PostgreSQL.
//! - **`bus`**: topic routing and subscriber fan-out.
//! - **`crdt`**: mergeable field types used by conflict resolution.

pub mod bus;
pub mod crdt;
pub mod event;
pub mod store;

pub use bus::{
    handler_fn, BusConfig, BusStats, DeadLetter, DedupeWindow, EventBus, EventHandler, EventSink, PublishReceipt,
    RouteRule, RoutingTable, Subscription, SubscriptionFilter, Topic,
};
pub use crdt::{GCounter, LWWRegister, ORSet, PNCounter};
pub use event::{event_types, EventDelivery, EventId, StoredEvent, System, UnifiedEvent};
pub use store::{append_with_retry, AppendAck, EventFilter, EventStore, InMemoryEventStore, PgEventStore};
