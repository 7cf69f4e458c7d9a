//! Reliability Layer Integration Tests
//!
//! Exercises the file-backed circuit breaker, retry policy and position lock
//! together, the way separate processes sharing one state directory see them.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use trend_bot::broker::BrokerError;
use trend_bot::resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, CircuitError, CircuitRecord, Clock,
    FileCircuitStore, LockError, ManualClock, PositionLock, PositionLockConfig, RecordingSleeper,
    RetryError, RetryPolicy, TokioSleeper, execute_with_retry, guarded_call,
};

// =============================================================================
// Helpers
// =============================================================================

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap()
}

fn config(threshold: u32) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: threshold,
        cooldown: Duration::from_secs(300),
    }
}

fn file_breaker(
    dir: &std::path::Path,
    threshold: u32,
    clock: &ManualClock,
) -> CircuitBreaker<FileCircuitStore> {
    CircuitBreaker::persistent("alpaca", config(threshold), dir).with_clock(Arc::new(clock.clone()))
}

async fn fail(breaker: &CircuitBreaker<FileCircuitStore>) -> CircuitError<BrokerError> {
    breaker
        .call_if_allowed(|| async { Err::<(), _>(BrokerError::Timeout) })
        .await
        .unwrap_err()
}

async fn succeed(breaker: &CircuitBreaker<FileCircuitStore>) -> Result<u32, CircuitError<BrokerError>> {
    breaker.call_if_allowed(|| async { Ok(7) }).await
}

// =============================================================================
// Circuit breaker persistence
// =============================================================================

#[tokio::test]
async fn test_open_circuit_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(start());

    let first = file_breaker(dir.path(), 2, &clock);
    fail(&first).await;
    fail(&first).await;
    assert_eq!(first.state().unwrap(), CircuitBreakerState::Open);
    drop(first);

    let restarted = file_breaker(dir.path(), 2, &clock);
    let record = restarted.snapshot().unwrap();
    assert_eq!(record.state, CircuitBreakerState::Open);
    assert_eq!(record.failure_count, 2);
    assert_eq!(record.opened_at, Some(start()));

    let err = succeed(&restarted).await.unwrap_err();
    match err {
        CircuitError::Open { name, retry_in } => {
            assert_eq!(name, "alpaca");
            assert_eq!(retry_in, Duration::from_secs(300));
        }
        other => panic!("expected open circuit, got {other:?}"),
    }
}

#[tokio::test]
async fn test_record_file_uses_screaming_case_states() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(start());
    let breaker = file_breaker(dir.path(), 1, &clock);

    fail(&breaker).await;

    let path = dir.path().join("circuit_breaker_alpaca.json");
    let json: serde_json::Value = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
    assert_eq!(json["state"], "OPEN");
    assert_eq!(json["failure_count"], 1);
}

#[tokio::test]
async fn test_failure_count_accumulates_across_instances() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(start());

    fail(&file_breaker(dir.path(), 3, &clock)).await;
    fail(&file_breaker(dir.path(), 3, &clock)).await;
    let third = file_breaker(dir.path(), 3, &clock);
    assert_eq!(third.state().unwrap(), CircuitBreakerState::Closed);

    fail(&third).await;
    assert_eq!(third.state().unwrap(), CircuitBreakerState::Open);
}

// =============================================================================
// Half-open probing
// =============================================================================

#[tokio::test]
async fn test_single_probe_across_instances() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(start());
    let a = file_breaker(dir.path(), 1, &clock);
    let b = file_breaker(dir.path(), 1, &clock);

    fail(&a).await;
    clock.advance(Duration::from_secs(301));

    // While `a` is probing, `b` must be turned away without running its call
    let b_calls = AtomicU32::new(0);
    let b_result = a
        .call_if_allowed(|| async {
            let inner = b
                .call_if_allowed(|| async {
                    b_calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, BrokerError>(())
                })
                .await;
            Ok::<_, BrokerError>(inner)
        })
        .await
        .unwrap();

    assert!(b_result.unwrap_err().is_open());
    assert_eq!(b_calls.load(Ordering::SeqCst), 0);
    assert_eq!(a.state().unwrap(), CircuitBreakerState::Closed);
    assert_eq!(succeed(&b).await.unwrap(), 7);
}

#[tokio::test]
async fn test_failed_probe_restarts_cooldown() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(start());
    let breaker = file_breaker(dir.path(), 1, &clock);

    fail(&breaker).await;
    clock.advance(Duration::from_secs(301));
    assert!(matches!(fail(&breaker).await, CircuitError::Inner(BrokerError::Timeout)));

    let record = breaker.snapshot().unwrap();
    assert_eq!(record.state, CircuitBreakerState::Open);
    assert_eq!(record.opened_at, Some(clock.now()));
    assert!(record.probe_started_at.is_none());

    clock.advance(Duration::from_secs(299));
    assert!(succeed(&breaker).await.unwrap_err().is_open());
    clock.advance(Duration::from_secs(2));
    assert_eq!(succeed(&breaker).await.unwrap(), 7);
}

#[tokio::test]
async fn test_abandoned_probe_is_reclaimed() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(start());

    // A prober that crashed mid-call leaves HALF_OPEN with a stale claim
    let stale = CircuitRecord {
        failure_count: 5,
        state: CircuitBreakerState::HalfOpen,
        last_failure_time: Some(start()),
        opened_at: Some(start()),
        probe_started_at: Some(start()),
        last_updated: Some(start()),
    };
    std::fs::write(
        dir.path().join("circuit_breaker_alpaca.json"),
        serde_json::to_vec(&stale).unwrap(),
    )
    .unwrap();
    let breaker = file_breaker(dir.path(), 5, &clock);

    clock.advance(Duration::from_secs(60));
    assert!(succeed(&breaker).await.unwrap_err().is_open());

    clock.advance(Duration::from_secs(300));
    assert_eq!(succeed(&breaker).await.unwrap(), 7);
    assert_eq!(breaker.state().unwrap(), CircuitBreakerState::Closed);
}

#[tokio::test]
async fn test_reset_closes_circuit() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(start());
    let breaker = file_breaker(dir.path(), 1, &clock);

    fail(&breaker).await;
    breaker.reset().unwrap();

    let record = breaker.snapshot().unwrap();
    assert_eq!(record.state, CircuitBreakerState::Closed);
    assert_eq!(record.failure_count, 0);
}

// =============================================================================
// Retry through the breaker
// =============================================================================

#[tokio::test]
async fn test_guarded_retries_exhaust_with_exponential_delays() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(start());
    let breaker = file_breaker(dir.path(), 10, &clock);
    let sleeper = RecordingSleeper::new();
    let policy = RetryPolicy::default().without_jitter();

    let result: Result<(), _> = guarded_call(
        &breaker,
        &policy,
        &sleeper,
        BrokerError::is_retryable,
        |_| async { Err(BrokerError::Server { status: 503, message: "busy".into() }) },
    )
    .await;

    match result.unwrap_err() {
        RetryError::Exhausted { attempts, source } => {
            assert_eq!(attempts, 4);
            assert!(matches!(source, CircuitError::Inner(BrokerError::Server { status: 503, .. })));
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert_eq!(
        sleeper.delays(),
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4)
        ]
    );
    assert_eq!(breaker.snapshot().unwrap().failure_count, 4);
}

#[tokio::test]
async fn test_guarded_call_stops_when_circuit_opens() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(start());
    let breaker = file_breaker(dir.path(), 2, &clock);
    let sleeper = RecordingSleeper::new();
    let calls = AtomicU32::new(0);

    let result: Result<(), _> = guarded_call(
        &breaker,
        &RetryPolicy::default(),
        &sleeper,
        BrokerError::is_retryable,
        |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BrokerError::Timeout) }
        },
    )
    .await;

    assert!(matches!(result, Err(RetryError::Fatal(CircuitError::Open { .. }))));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    // Only the backoff after the first failure; the second one opened the circuit
    assert_eq!(sleeper.delays().len(), 1);
}

#[tokio::test]
async fn test_attempt_numbers_are_passed_to_operation() {
    let sleeper = RecordingSleeper::new();
    let seen = parking_lot::Mutex::new(Vec::new());

    let value = execute_with_retry(
        &RetryPolicy::default(),
        &sleeper,
        BrokerError::is_retryable,
        |attempt| {
            seen.lock().push(attempt);
            async move {
                if attempt < 3 {
                    Err(BrokerError::RateLimited { retry_after_secs: None })
                } else {
                    Ok("filled")
                }
            }
        },
    )
    .await
    .unwrap();

    assert_eq!(value, "filled");
    assert_eq!(*seen.lock(), vec![1, 2, 3]);
    assert_eq!(sleeper.delays().len(), 2);
}

#[tokio::test]
async fn test_shutdown_interrupts_backoff() {
    let shutdown = CancellationToken::new();
    shutdown.cancel();
    let sleeper = TokioSleeper::new(shutdown);

    let result: Result<(), _> = execute_with_retry(
        &RetryPolicy::default(),
        &sleeper,
        BrokerError::is_retryable,
        |_| async { Err(BrokerError::Timeout) },
    )
    .await;

    assert!(matches!(
        result,
        Err(RetryError::Interrupted {
            attempts: 1,
            source: BrokerError::Timeout
        })
    ));
}

// =============================================================================
// Position lock
// =============================================================================

#[tokio::test]
async fn test_lock_serializes_concurrent_holders() {
    let dir = tempfile::tempdir().unwrap();
    let lock = PositionLock::new(PositionLockConfig {
        poll_interval: Duration::from_millis(5),
        ..PositionLockConfig::new(dir.path())
    });
    let active = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let lock = lock.clone();
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        tasks.push(tokio::spawn(async move {
            lock.with_lock(Duration::from_secs(10), async {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            })
            .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert!(lock.holder().unwrap().is_none());
}

#[tokio::test]
async fn test_lock_timeout_reports_wait() {
    let dir = tempfile::tempdir().unwrap();
    let lock = PositionLock::new(PositionLockConfig::new(dir.path()));
    let _held = lock.acquire(Duration::ZERO).await.unwrap();

    let err = lock.acquire(Duration::from_millis(30)).await.unwrap_err();
    match err {
        LockError::Timeout { waited, path } => {
            assert_eq!(waited, Duration::from_millis(30));
            assert_eq!(path, lock.path());
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_expired_lock_is_reclaimed() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(start());
    let lock = PositionLock::new(PositionLockConfig {
        max_hold: Duration::from_secs(60),
        ..PositionLockConfig::new(dir.path())
    })
    .with_clock(Arc::new(clock.clone()));

    let crashed = lock.acquire(Duration::ZERO).await.unwrap();
    let crashed_holder = crashed.holder().to_string();
    std::mem::forget(crashed);

    assert!(lock.acquire(Duration::ZERO).await.is_err());
    clock.advance(Duration::from_secs(61));

    let guard = lock.acquire(Duration::ZERO).await.unwrap();
    assert_ne!(guard.holder(), crashed_holder);
    assert_eq!(lock.holder().unwrap().unwrap().holder, guard.holder());
    guard.release().unwrap();
}
