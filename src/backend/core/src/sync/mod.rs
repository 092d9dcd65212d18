//! Ingest and replay: the path from a producer to the store and the bus.

pub mod coordinator;
pub mod locks;

pub use coordinator::{IngestOutcome, InternalSink, ReplayReport, SyncCoordinator, SyncStats};
pub use locks::EntityLocks;
