//! Resilience primitives shared by every outbound call path.

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerSnapshot, CircuitState,
};
pub use rate_limiter::{RateLimitConfig, RateLimitDecision, SlidingWindowRateLimiter};
pub use retry::{retry_with_backoff, RetryPolicy};
