//! Circuit Breaker for outbound calls.
//!
//! Isolates a failing dependency by short-circuiting calls to it until it is
//! likely healthy again. All state lives in atomics; transitions are
//! compare-and-swap so concurrent callers never take a lock.

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{ConfluenceError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// State and Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum CircuitState {
    /// Normal operation - calls pass through
    Closed = 0,
    /// Too many failures - calls rejected without being attempted
    Open = 1,
    /// Probing recovery - a limited number of trial calls allowed
    HalfOpen = 2,
}

impl CircuitState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in `closed` that open the breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long the breaker stays open before allowing a trial call
    #[serde(default = "default_recovery_timeout", with = "humantime_serde")]
    pub recovery_timeout: Duration,

    /// Consecutive successes in `half-open` that close the breaker
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Concurrent trial calls allowed while half-open
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_success_threshold() -> u32 {
    3
}
fn default_half_open_max_calls() -> u32 {
    3
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout: default_recovery_timeout(),
            success_threshold: default_success_threshold(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Circuit Breaker
// ═══════════════════════════════════════════════════════════════════════════════

/// Circuit breaker for one dependency.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,

    state: AtomicU8,

    /// Consecutive failures while closed
    failure_count: AtomicU32,

    /// Consecutive successes while half-open
    success_count: AtomicU32,

    /// Trial calls currently admitted while half-open
    half_open_in_flight: AtomicU32,

    /// Milliseconds since `epoch` when the breaker last opened
    opened_at_ms: AtomicU64,

    /// Milliseconds since `epoch` when the breaker last went half-open
    half_open_at_ms: AtomicU64,

    /// Unix milliseconds of the last failure, 0 when none
    last_failure_ms: AtomicU64,

    total_successes: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,

    epoch: Instant,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let breaker = Self {
            name: name.into(),
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            half_open_in_flight: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            half_open_at_ms: AtomicU64::new(0),
            last_failure_ms: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
            epoch: Instant::now(),
        };
        breaker.publish_state(CircuitState::Closed);
        breaker
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. An open breaker whose timeout has elapsed still reports
    /// `Open` until the next call moves it to half-open.
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Run `op` through the breaker.
    ///
    /// When the breaker rejects, `op` is never invoked and a circuit-open
    /// error is returned. If the returned future is dropped before `op`
    /// finishes, a half-open trial counts as failed so its slot is freed.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.try_acquire() {
            return Err(self.rejection());
        }

        let mut admission = Admission { breaker: self, settled: false };
        let result = op().await;
        admission.settled = true;

        match result {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    /// Admission check. Every `true` must be followed by exactly one
    /// `record_success` or `record_failure`.
    pub fn try_acquire(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.open_elapsed() < self.config.recovery_timeout {
                    self.note_rejection();
                    return false;
                }
                if self.transition(CircuitState::Open, CircuitState::HalfOpen) {
                    self.success_count.store(0, Ordering::Release);
                    self.half_open_in_flight.store(0, Ordering::Release);
                    self.half_open_at_ms
                        .store(self.epoch.elapsed().as_millis() as u64, Ordering::Release);
                    tracing::info!(dependency = %self.name, "Circuit breaker transitioning to half-open");
                }
                self.acquire_trial()
            }
            CircuitState::HalfOpen => self.acquire_trial(),
        }
    }

    fn acquire_trial(&self) -> bool {
        let max = self.config.half_open_max_calls.max(1);
        let admitted = self
            .half_open_in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .is_ok();
        if !admitted {
            self.note_rejection();
            // Trials that never reported back hold their slots; after a full
            // recovery timeout in half-open, start over from open.
            if self.half_open_elapsed() >= self.config.recovery_timeout && self.trip(CircuitState::HalfOpen) {
                tracing::warn!(
                    dependency = %self.name,
                    "Circuit breaker re-opened after half-open trials went unreported"
                );
            }
        }
        admitted
    }

    /// A call admitted by `try_acquire` was abandoned before completing.
    fn record_abandoned(&self) {
        if self.state() == CircuitState::HalfOpen {
            tracing::debug!(dependency = %self.name, "Half-open trial call abandoned");
            self.record_failure();
        }
    }

    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);

        match self.state() {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::Release);
            }
            CircuitState::HalfOpen => {
                self.release_trial();
                let successes = self.success_count.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold
                    && self.transition(CircuitState::HalfOpen, CircuitState::Closed)
                {
                    self.failure_count.store(0, Ordering::Release);
                    self.success_count.store(0, Ordering::Release);
                    tracing::info!(
                        dependency = %self.name,
                        successes,
                        "Circuit breaker closed after successful recovery"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        self.last_failure_ms
            .store(Utc::now().timestamp_millis().max(1) as u64, Ordering::Release);

        match self.state() {
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold && self.trip(CircuitState::Closed) {
                    tracing::warn!(
                        dependency = %self.name,
                        failures,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker opened due to consecutive failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.release_trial();
                if self.trip(CircuitState::HalfOpen) {
                    tracing::warn!(
                        dependency = %self.name,
                        "Circuit breaker re-opened after failed recovery attempt"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Force the breaker closed and clear counters.
    pub fn reset(&self) {
        self.failure_count.store(0, Ordering::Release);
        self.success_count.store(0, Ordering::Release);
        self.half_open_in_flight.store(0, Ordering::Release);
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        self.publish_state(CircuitState::Closed);
        tracing::info!(dependency = %self.name, "Circuit breaker manually reset");
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let last_failure_ms = self.last_failure_ms.load(Ordering::Acquire);
        CircuitBreakerSnapshot {
            dependency: self.name.clone(),
            state: self.state(),
            failure_count: self.failure_count.load(Ordering::Acquire),
            success_count: self.success_count.load(Ordering::Acquire),
            last_failure_time: (last_failure_ms > 0)
                .then(|| Utc.timestamp_millis_opt(last_failure_ms as i64).single())
                .flatten(),
            failure_threshold: self.config.failure_threshold,
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────

    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        let moved = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            self.publish_state(to);
        }
        moved
    }

    fn trip(&self, from: CircuitState) -> bool {
        // Stamp before the CAS so a concurrent reader of `Open` never sees a stale time.
        self.opened_at_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Release);
        self.transition(from, CircuitState::Open)
    }

    fn release_trial(&self) {
        let _ = self
            .half_open_in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    fn half_open_elapsed(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.half_open_at_ms.load(Ordering::Acquire)))
    }

    fn open_elapsed(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.opened_at_ms.load(Ordering::Acquire)))
    }

    fn note_rejection(&self) {
        self.total_rejections.fetch_add(1, Ordering::Relaxed);
        counter!("confluence_circuit_rejections_total", "dependency" => self.name.clone()).increment(1);
    }

    fn rejection(&self) -> ConfluenceError {
        let remaining = self.config.recovery_timeout.saturating_sub(self.open_elapsed());
        ConfluenceError::circuit_open(&self.name, remaining.as_secs().max(1))
    }

    fn publish_state(&self, state: CircuitState) {
        gauge!("confluence_circuit_state", "dependency" => self.name.clone()).set(state as u8 as f64);
    }
}

/// Settles an admitted call whose future was dropped mid-flight.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record_abandoned();
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Point-in-time view of a breaker for the health surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub dependency: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub failure_threshold: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// Breakers keyed by dependency name, created on first use.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, dependency: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(dependency) {
            return existing.clone();
        }
        self.breakers
            .entry(dependency.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(dependency, self.config.clone())))
            .clone()
    }

    pub fn get(&self, dependency: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(dependency).map(|b| b.clone())
    }

    /// Snapshots of every breaker, sorted by dependency.
    pub fn snapshot(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut all: Vec<_> = self.breakers.iter().map(|b| b.snapshot()).collect();
        all.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        all
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
