//! Sliding-window rate limiting.
//!
//! Requests are counted in fixed-size time buckets keyed by
//! `identifier:windowIndex`. A request is denied once its bucket has reached
//! the configured maximum. Counters are bumped with compare-and-swap, so the
//! bucket map shard lock is held only long enough to look the bucket up.

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ConfluenceError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration and Decisions
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests admitted per window per identifier
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    #[serde(default = "default_window", with = "humantime_serde")]
    pub window: Duration,
}

fn default_max_requests() -> u64 {
    100
}
fn default_window() -> Duration {
    Duration::from_secs(60)
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window: default_window(),
        }
    }
}

impl RateLimitConfig {
    pub fn new(max_requests: u64, window: Duration) -> Self {
        Self { max_requests, window }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// When the current window ends
    pub reset_time: DateTime<Utc>,
    /// How long to wait before a retry can succeed; set only when denied
    #[serde(default, with = "humantime_serde")]
    pub retry_after: Option<Duration>,
}

struct Bucket {
    window_index: u64,
    count: AtomicU64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rate Limiter
// ═══════════════════════════════════════════════════════════════════════════════

pub struct SlidingWindowRateLimiter {
    name: String,
    config: RateLimitConfig,
    buckets: DashMap<String, Arc<Bucket>>,
}

impl SlidingWindowRateLimiter {
    pub fn new(name: impl Into<String>, config: RateLimitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            buckets: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn is_allowed(&self, identifier: &str) -> RateLimitDecision {
        self.is_allowed_at(identifier, Utc::now())
    }

    /// Admission check against an explicit clock reading.
    pub fn is_allowed_at(&self, identifier: &str, now: DateTime<Utc>) -> RateLimitDecision {
        let window_ms = self.window_ms();
        let now_ms = now.timestamp_millis().max(0) as u64;
        let window_index = now_ms / window_ms;
        let reset_ms = (window_index + 1) * window_ms;
        let reset_time = Utc
            .timestamp_millis_opt(reset_ms as i64)
            .single()
            .unwrap_or(now);

        let bucket = self.bucket(identifier, window_index);
        let limit = self.config.max_requests;

        let admitted = bucket
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1));

        match admitted {
            Ok(previous) => RateLimitDecision {
                allowed: true,
                limit,
                remaining: limit.saturating_sub(previous + 1),
                reset_time,
                retry_after: None,
            },
            Err(_) => {
                counter!("confluence_rate_limit_rejections_total", "limiter" => self.name.clone())
                    .increment(1);
                RateLimitDecision {
                    allowed: false,
                    limit,
                    remaining: 0,
                    reset_time,
                    retry_after: Some(Duration::from_millis(reset_ms - now_ms)),
                }
            }
        }
    }

    /// Admission check that turns a denial into a rate-limit error.
    pub fn check(&self, identifier: &str) -> Result<RateLimitDecision> {
        let decision = self.is_allowed(identifier);
        if decision.allowed {
            Ok(decision)
        } else {
            let retry_after = decision.retry_after.unwrap_or(self.config.window);
            // Round up so a caller sleeping `retry_after_secs` lands in the next window.
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            Err(ConfluenceError::rate_limited(
                format!("{}:{}", self.name, identifier),
                decision.limit,
                secs.max(1),
            ))
        }
    }

    /// Drop buckets for windows that have ended. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now())
    }

    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let current = now.timestamp_millis().max(0) as u64 / self.window_ms();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.window_index >= current);
        before.saturating_sub(self.buckets.len())
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Sweep expired buckets every `interval` until cancelled.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = self.sweep_expired();
                        if removed > 0 {
                            tracing::debug!(limiter = %self.name, removed, "Swept expired rate-limit buckets");
                        }
                    }
                }
            }
        })
    }

    fn window_ms(&self) -> u64 {
        (self.config.window.as_millis() as u64).max(1)
    }

    fn bucket(&self, identifier: &str, window_index: u64) -> Arc<Bucket> {
        let key = format!("{}:{}", identifier, window_index);
        if let Some(bucket) = self.buckets.get(&key) {
            return bucket.clone();
        }
        self.buckets
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Bucket {
                    window_index,
                    count: AtomicU64::new(0),
                })
            })
            .clone()
    }
}

impl std::fmt::Debug for SlidingWindowRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowRateLimiter")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("buckets", &self.buckets.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_remaining_counts_down() {
        let limiter = SlidingWindowRateLimiter::new("test", RateLimitConfig::new(3, Duration::from_secs(60)));
        let now = at(1_200);

        assert_eq!(limiter.is_allowed_at("a", now).remaining, 2);
        assert_eq!(limiter.is_allowed_at("a", now).remaining, 1);
        assert_eq!(limiter.is_allowed_at("a", now).remaining, 0);
        let denied = limiter.is_allowed_at("a", now);
        assert!(!denied.allowed);
        assert_eq!(denied.reset_time, at(1_260));
        assert_eq!(denied.retry_after, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_identifiers_are_independent() {
        let limiter = SlidingWindowRateLimiter::new("test", RateLimitConfig::new(1, Duration::from_secs(60)));
        let now = at(600);

        assert!(limiter.is_allowed_at("legacy", now).allowed);
        assert!(!limiter.is_allowed_at("legacy", now).allowed);
        assert!(limiter.is_allowed_at("frontend", now).allowed);
    }

    #[test]
    fn test_sweep_removes_past_windows() {
        let limiter = SlidingWindowRateLimiter::new("test", RateLimitConfig::new(5, Duration::from_secs(10)));
        limiter.is_allowed_at("a", at(100));
        limiter.is_allowed_at("b", at(100));
        limiter.is_allowed_at("a", at(115));
        assert_eq!(limiter.bucket_count(), 3);

        assert_eq!(limiter.sweep_expired_at(at(115)), 2);
        assert_eq!(limiter.bucket_count(), 1);
    }

    #[test]
    fn test_check_returns_retry_after() {
        let limiter = SlidingWindowRateLimiter::new("legacy", RateLimitConfig::new(1, Duration::from_secs(3600)));
        limiter.check("backend").unwrap();

        let err = limiter.check("backend").unwrap_err();
        assert_eq!(err.code(), ErrorCode::RateLimited);
        let retry = err.retry_after_secs().unwrap();
        assert!((1..=3600).contains(&retry));
    }
}
