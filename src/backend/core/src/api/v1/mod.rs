//! V1 operator API: component stats, replay, event ingest and strangler
//! route dispatch.

pub mod routes;

pub use routes::{paths, v1_router, V1_PREFIX};
