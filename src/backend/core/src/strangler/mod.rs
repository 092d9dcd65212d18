//! Strangler fig routing: per-route migration from the legacy system to the
//! modern one, with a percentage split, sticky users and automatic fallback.

pub mod router;
pub mod sampler;

pub use router::{
    Implementation, MigrationStatus, RouteConfig, RouteHandler, RouteRequest, RouteResponse, RouteStats,
    RouteSummary, StranglerRouter,
};
pub use sampler::{sticky_bucket, FixedSampler, RandomSampler, TrafficSampler};
