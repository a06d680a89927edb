// Circuit Breaker Tests
// "Testing the circuit that breaks before we do"

use super::*;
use crate::error::ErrorKind;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use tokio::time::sleep;

fn failing() -> impl Future<Output = Result<(), TypedError>> {
    async { Err(TypedError::server("boom")) }
}

#[tokio::test]
async fn test_circuit_breaker_creation() {
    let breaker = CircuitBreaker::new("test", CircuitBreakerConfig::default());

    assert_eq!(breaker.name(), "test");
    let state = breaker.get_state();
    assert_eq!(state.state, CircuitBreakerState::Closed);
    assert_eq!(state.failure_count, 0);
    assert_eq!(state.threshold, 5);
}

#[tokio::test]
async fn test_circuit_breaker_execute_success() {
    let breaker = CircuitBreaker::new("test", CircuitBreakerConfig::default());

    let result = breaker.execute(async { Ok::<i32, TypedError>(42) }).await;

    assert_eq!(result.unwrap(), 42);

    let stats = breaker.get_stats();
    assert_eq!(stats.successful_requests, 1);
    assert_eq!(stats.total_requests, 1);
}

#[tokio::test]
async fn test_circuit_breaker_rethrows_operation_error() {
    let breaker = CircuitBreaker::new("test", CircuitBreakerConfig::default());
    let original = TypedError::payment("card declined");
    let expected = original.clone();

    let result = breaker.execute(async move { Err::<(), _>(original) }).await;

    assert_eq!(result.unwrap_err(), expected);
    assert_eq!(breaker.get_state().failure_count, 1);
}

#[tokio::test]
async fn test_circuit_breaker_classifies_raw_errors() {
    let breaker = CircuitBreaker::new("test", CircuitBreakerConfig::default());

    let result = breaker
        .execute(async { Err::<(), _>(std::io::Error::other("connection reset by peer")) })
        .await;

    assert_eq!(result.unwrap_err().kind, ErrorKind::Network);
}

#[tokio::test]
async fn test_success_resets_failure_count() {
    let breaker = CircuitBreaker::with_threshold("test", 3, Duration::from_secs(1));

    let _ = breaker.execute(failing()).await;
    let _ = breaker.execute(failing()).await;
    assert_eq!(breaker.get_state().failure_count, 2);

    breaker
        .execute(async { Ok::<(), TypedError>(()) })
        .await
        .unwrap();
    assert_eq!(breaker.get_state().failure_count, 0);

    // Two more failures do not reach the threshold again
    let _ = breaker.execute(failing()).await;
    let _ = breaker.execute(failing()).await;
    assert_eq!(breaker.get_state().state, CircuitBreakerState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_rejects_without_calling_operation() {
    let breaker = CircuitBreaker::with_threshold("api", 3, Duration::from_millis(1000));

    for _ in 0..3 {
        assert!(breaker.execute(failing()).await.is_err());
    }
    assert_eq!(breaker.get_state().state, CircuitBreakerState::Open);

    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let err = breaker
        .execute(async move {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok::<(), TypedError>(())
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(err.kind, ErrorKind::Network);
    assert_eq!(err.context["failure_count"], 3);
    assert!(err.context.contains_key("last_failure_time"));
    assert_eq!(breaker.get_stats().rejected_requests, 1);
}

#[tokio::test(start_paused = true)]
async fn test_successful_trial_closes_circuit() {
    let breaker = CircuitBreaker::with_threshold("api", 3, Duration::from_millis(1000));

    for _ in 0..3 {
        let _ = breaker.execute(failing()).await;
    }

    sleep(Duration::from_millis(1001)).await;

    let value = breaker
        .execute(async { Ok::<&str, TypedError>("ok") })
        .await
        .unwrap();
    assert_eq!(value, "ok");

    let state = breaker.get_state();
    assert_eq!(state.state, CircuitBreakerState::Closed);
    assert_eq!(state.state.to_string(), "CLOSED");
    assert_eq!(state.failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_trial_reopens_circuit() {
    let breaker = CircuitBreaker::with_threshold("api", 1, Duration::from_millis(100));

    let _ = breaker.execute(failing()).await;
    let first_failure = breaker.get_state().last_failure_time.unwrap();

    sleep(Duration::from_millis(150)).await;
    assert!(breaker.execute(failing()).await.is_err());

    let state = breaker.get_state();
    assert_eq!(state.state, CircuitBreakerState::Open);
    assert!(state.last_failure_time.unwrap() > first_failure);

    // Cooldown restarts from the failed trial
    sleep(Duration::from_millis(50)).await;
    let err = breaker
        .execute(async { Ok::<(), TypedError>(()) })
        .await
        .unwrap_err();
    assert!(err.message.contains("rejected"));
}

#[tokio::test(start_paused = true)]
async fn test_half_open_admits_a_single_trial() {
    let breaker = Arc::new(CircuitBreaker::with_threshold(
        "api",
        1,
        Duration::from_millis(100),
    ));
    let _ = breaker.execute(failing()).await;
    sleep(Duration::from_millis(101)).await;

    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let trial_breaker = Arc::clone(&breaker);
    let trial = tokio::spawn(async move {
        trial_breaker
            .execute(async move {
                let _ = release_rx.await;
                Ok::<(), TypedError>(())
            })
            .await
    });

    tokio::task::yield_now().await;
    assert_eq!(breaker.get_state().state, CircuitBreakerState::HalfOpen);

    let concurrent = breaker.execute(async { Ok::<(), TypedError>(()) }).await;
    assert!(concurrent.is_err());

    release_tx.send(()).unwrap();
    trial.await.unwrap().unwrap();
    assert_eq!(breaker.get_state().state, CircuitBreakerState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_trial_frees_half_open_slot() {
    let breaker = CircuitBreaker::with_threshold("api", 1, Duration::from_millis(100));
    let _ = breaker.execute(failing()).await;
    sleep(Duration::from_millis(101)).await;

    let abandoned = tokio::time::timeout(
        Duration::from_millis(10),
        breaker.execute(async {
            std::future::pending::<()>().await;
            Ok::<(), TypedError>(())
        }),
    )
    .await;
    assert!(abandoned.is_err());

    breaker
        .execute(async { Ok::<(), TypedError>(()) })
        .await
        .unwrap();
    assert_eq!(breaker.get_state().state, CircuitBreakerState::Closed);
}

#[tokio::test]
async fn test_force_open_and_reset() {
    let breaker = CircuitBreaker::new("test", CircuitBreakerConfig::default());

    breaker.force_open();
    assert_eq!(breaker.get_state().state, CircuitBreakerState::Open);
    assert!(breaker
        .execute(async { Ok::<(), TypedError>(()) })
        .await
        .is_err());

    breaker.reset();
    let state = breaker.get_state();
    assert_eq!(state.state, CircuitBreakerState::Closed);
    assert!(state.last_failure_time.is_none());
    assert_eq!(breaker.get_stats().state_changes, 2);
}
