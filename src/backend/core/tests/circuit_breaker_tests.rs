//! Circuit breaker state transitions through the public API.
//!
//! Tests cover:
//! - Closed -> Open after consecutive failures
//! - Rejection without invoking the operation while open
//! - Open -> HalfOpen after the recovery timeout
//! - HalfOpen -> Closed after enough trial successes, and back to Open on failure
//! - Abandoned trial calls releasing their half-open slots
//! - Registry sharing one breaker per dependency

use confluence_core::error::{ConfluenceError, ErrorCode};
use confluence_core::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn breaker(threshold: u32, recovery: Duration) -> CircuitBreaker {
    CircuitBreaker::new(
        "legacy",
        CircuitBreakerConfig::default()
            .with_failure_threshold(threshold)
            .with_recovery_timeout(recovery)
            .with_success_threshold(2),
    )
}

async fn fail(cb: &CircuitBreaker) -> ConfluenceError {
    cb.call(|| async { Err::<(), _>(ConfluenceError::collaborator_unavailable("legacy", "connection reset")) })
        .await
        .unwrap_err()
}

async fn succeed(cb: &CircuitBreaker) -> confluence_core::Result<u32> {
    cb.call(|| async { Ok(7) }).await
}

// ============================================================================
// Closed -> Open
// ============================================================================

#[tokio::test]
async fn test_opens_after_threshold_consecutive_failures() {
    let cb = breaker(3, Duration::from_secs(60));

    for _ in 0..2 {
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }
    fail(&cb).await;
    assert_eq!(cb.state(), CircuitState::Open);
}

#[tokio::test]
async fn test_success_resets_failure_streak() {
    let cb = breaker(3, Duration::from_secs(60));

    fail(&cb).await;
    fail(&cb).await;
    succeed(&cb).await.unwrap();
    fail(&cb).await;
    fail(&cb).await;

    assert_eq!(cb.state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_open_breaker_rejects_without_calling() {
    let cb = breaker(1, Duration::from_secs(60));
    fail(&cb).await;

    let calls = AtomicU32::new(0);
    let err = cb
        .call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(err.code(), ErrorCode::CircuitOpen);
    assert!(err.is_circuit_open());
    assert!(!err.is_retryable());
    assert!(err.retry_after_secs().is_some());
    assert_eq!(cb.snapshot().total_rejections, 1);
}

// ============================================================================
// Recovery
// ============================================================================

#[tokio::test]
async fn test_half_open_closes_after_success_threshold() {
    let cb = breaker(1, Duration::from_millis(20));
    fail(&cb).await;
    assert_eq!(cb.state(), CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(40)).await;

    assert_eq!(succeed(&cb).await.unwrap(), 7);
    assert_eq!(cb.state(), CircuitState::HalfOpen);
    succeed(&cb).await.unwrap();
    assert_eq!(cb.state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_half_open_failure_reopens() {
    let cb = breaker(1, Duration::from_millis(20));
    fail(&cb).await;
    tokio::time::sleep(Duration::from_millis(40)).await;

    fail(&cb).await;
    assert_eq!(cb.state(), CircuitState::Open);

    // Fresh recovery window: still rejecting immediately after re-opening.
    assert!(succeed(&cb).await.unwrap_err().is_circuit_open());
}

#[tokio::test]
async fn test_abandoned_trial_calls_do_not_wedge_half_open() {
    let cb = breaker(2, Duration::from_millis(30));
    fail(&cb).await;
    fail(&cb).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Callers give up on trial calls that never complete.
    for _ in 0..3 {
        let abandoned = tokio::time::timeout(
            Duration::from_millis(5),
            cb.call(|| std::future::pending::<confluence_core::Result<u32>>()),
        )
        .await;
        match abandoned {
            Err(_elapsed) => {}
            Ok(result) => assert_eq!(result.unwrap_err().code(), ErrorCode::CircuitOpen),
        }
    }
    assert_eq!(cb.state(), CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(succeed(&cb).await.unwrap(), 7);
    assert_eq!(cb.state(), CircuitState::HalfOpen);
    succeed(&cb).await.unwrap();
    assert_eq!(cb.state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_reset_closes_breaker() {
    let cb = breaker(1, Duration::from_secs(60));
    fail(&cb).await;
    cb.reset();

    assert_eq!(cb.state(), CircuitState::Closed);
    assert!(succeed(&cb).await.is_ok());
}

#[tokio::test]
async fn test_snapshot_counts_outcomes() {
    let cb = breaker(5, Duration::from_secs(60));
    succeed(&cb).await.unwrap();
    succeed(&cb).await.unwrap();
    fail(&cb).await;

    let snap = cb.snapshot();
    assert_eq!(snap.dependency, "legacy");
    assert_eq!(snap.total_successes, 2);
    assert_eq!(snap.total_failures, 1);
    assert_eq!(snap.failure_count, 1);
    assert!(snap.last_failure_time.is_some());
}

// ============================================================================
// Registry
// ============================================================================

#[tokio::test]
async fn test_registry_shares_breaker_per_dependency() {
    let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default().with_failure_threshold(1));

    let a = registry.get_or_create("payments");
    let b = registry.get_or_create("payments");
    assert!(Arc::ptr_eq(&a, &b));

    fail(&a).await;
    assert_eq!(registry.get("payments").unwrap().state(), CircuitState::Open);
    assert!(registry.get("unknown").is_none());

    registry.get_or_create("legacy");
    let names: Vec<String> = registry.snapshot().into_iter().map(|s| s.dependency).collect();
    assert!(names.contains(&"payments".to_string()));
    assert!(names.contains(&"legacy".to_string()));
}

#[tokio::test]
async fn test_concurrent_failures_open_once() {
    let cb = Arc::new(breaker(10, Duration::from_secs(60)));
    let mut handles = Vec::new();
    for _ in 0..20 {
        let cb = cb.clone();
        handles.push(tokio::spawn(async move {
            let _ = cb
                .call(|| async { Err::<(), _>(ConfluenceError::collaborator_unavailable("legacy", "down")) })
                .await;
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    assert_eq!(cb.state(), CircuitState::Open);
    let snap = cb.snapshot();
    assert_eq!(snap.total_failures + snap.total_rejections, 20);
}
