// Circuit Breaker Implementation
// "When the wall falls, we must know when to rebuild it"

#[cfg(test)]
mod tests;

use crate::error::{DocFiscalResult, ErrorClassifier, RawFailure, TypedError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitBreakerState {
    /// Normal operation - requests are allowed through
    Closed,
    /// Failing state - requests are rejected immediately
    Open,
    /// One trial request is allowed through to test recovery
    HalfOpen,
}

impl std::fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open the circuit
    pub failure_threshold: u32,
    /// Time to wait after the last failure before a trial request
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Point-in-time view of the breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitState {
    pub state: CircuitBreakerState,
    pub failure_count: u32,
    pub last_failure_time: Option<Instant>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub threshold: u32,
    pub cooldown: Duration,
}

/// Circuit breaker statistics
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub state: CircuitBreakerState,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rejected_requests: u64,
    pub state_changes: u64,
    pub time_in_current_state: Duration,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitBreakerState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    state_change_time: Instant,
    trial_in_flight: bool,
}

/// Guard for an admitted call. A trial that is dropped without an outcome
/// (the caller's future was cancelled) frees the half-open slot again.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            let mut inner = self.breaker.lock();
            inner.trial_in_flight = false;
            debug!(
                "Circuit breaker {} trial abandoned before completion",
                self.breaker.name
            );
        }
    }
}

/// Consecutive-failure circuit breaker.
///
/// State lives behind a mutex that is never held across an await, so every
/// transition is atomic with respect to other calls sharing the breaker.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    classifier: ErrorClassifier,
    inner: Mutex<BreakerInner>,
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    rejected_requests: AtomicU64,
    state_changes: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new<S: Into<String>>(name: S, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            "🔌 Creating circuit breaker: {} (threshold: {}, cooldown: {:?})",
            name, config.failure_threshold, config.cooldown
        );

        Self {
            name,
            config,
            classifier: ErrorClassifier::default(),
            inner: Mutex::new(BreakerInner {
                state: CircuitBreakerState::Closed,
                failure_count: 0,
                last_failure_time: None,
                last_failure_at: None,
                state_change_time: Instant::now(),
                trial_in_flight: false,
            }),
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            rejected_requests: AtomicU64::new(0),
            state_changes: AtomicU64::new(0),
        }
    }

    /// Shorthand for `new` with a threshold and cooldown
    pub fn with_threshold<S: Into<String>>(name: S, threshold: u32, cooldown: Duration) -> Self {
        Self::new(
            name,
            CircuitBreakerConfig {
                failure_threshold: threshold,
                cooldown,
            },
        )
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Execute an operation with circuit breaker protection.
    ///
    /// While open, the operation is not polled and a network error is returned.
    /// The operation's own error is returned unchanged (after classification).
    pub async fn execute<F, T, E>(&self, operation: F) -> DocFiscalResult<T>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<RawFailure>,
    {
        let permit = match self.admit() {
            Ok(permit) => permit,
            Err(rejection) => {
                self.rejected_requests.fetch_add(1, Ordering::Relaxed);
                return Err(rejection);
            }
        };

        self.total_requests.fetch_add(1, Ordering::Relaxed);

        match operation.await {
            Ok(result) => {
                self.record_success();
                permit.settle();
                Ok(result)
            }
            Err(error) => {
                self.record_failure();
                permit.settle();
                Err(self.classifier.classify(error))
            }
        }
    }

    /// Execute a closure producing the operation future
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> DocFiscalResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<RawFailure>,
    {
        self.execute(async move { operation().await }).await
    }

    fn admit(&self) -> Result<Permit<'_>, TypedError> {
        let mut inner = self.lock();

        match inner.state {
            CircuitBreakerState::Closed => Ok(Permit {
                breaker: self,
                trial: false,
                settled: false,
            }),
            CircuitBreakerState::Open => {
                let cooled_down = inner
                    .last_failure_time
                    .map(|t| Instant::now().duration_since(t) > self.config.cooldown)
                    .unwrap_or(true);

                if cooled_down {
                    self.transition(&mut inner, CircuitBreakerState::HalfOpen);
                    inner.trial_in_flight = true;
                    Ok(Permit {
                        breaker: self,
                        trial: true,
                        settled: false,
                    })
                } else {
                    Err(self.rejection(&inner))
                }
            }
            CircuitBreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(self.rejection(&inner))
                } else {
                    inner.trial_in_flight = true;
                    Ok(Permit {
                        breaker: self,
                        trial: true,
                        settled: false,
                    })
                }
            }
        }
    }

    fn rejection(&self, inner: &BreakerInner) -> TypedError {
        let retry_after = inner
            .last_failure_time
            .map(|t| self.config.cooldown.saturating_sub(Instant::now().duration_since(t)))
            .unwrap_or_default();

        let mut error = TypedError::network(format!(
            "Circuit breaker {} is {} - request rejected",
            self.name, inner.state
        ))
        .with_context("circuit_breaker", self.name.clone())
        .with_context("circuit_state", inner.state.to_string())
        .with_context("failure_count", inner.failure_count)
        .with_context("retry_after_ms", retry_after.as_millis() as u64);

        if let Some(at) = inner.last_failure_at {
            error = error.with_context("last_failure_time", at.to_rfc3339());
        }

        debug!("🚫 Circuit breaker {} rejected a request", self.name);
        error
    }

    /// Record a successful request
    pub fn record_success(&self) {
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.lock();
        inner.failure_count = 0;

        match inner.state {
            CircuitBreakerState::Closed => {}
            CircuitBreakerState::HalfOpen => {
                inner.trial_in_flight = false;
                self.transition(&mut inner, CircuitBreakerState::Closed);
            }
            CircuitBreakerState::Open => {
                // A call admitted before the circuit opened finished late
                warn!(
                    "🔌 Recorded success while circuit breaker {} is open",
                    self.name
                );
            }
        }

        debug!("✅ Circuit breaker {} recorded success", self.name);
    }

    /// Record a failed request
    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_time = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());

        match inner.state {
            CircuitBreakerState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitBreakerState::Open);
                }
            }
            CircuitBreakerState::HalfOpen => {
                // Any failure in half-open state should open the circuit
                inner.trial_in_flight = false;
                self.transition(&mut inner, CircuitBreakerState::Open);
            }
            CircuitBreakerState::Open => {}
        }

        debug!(
            "❌ Circuit breaker {} recorded failure ({}/{})",
            self.name, inner.failure_count, self.config.failure_threshold
        );
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitBreakerState) {
        let from = inner.state;
        if from == to {
            return;
        }

        inner.state = to;
        inner.state_change_time = Instant::now();
        self.state_changes.fetch_add(1, Ordering::Relaxed);

        match to {
            CircuitBreakerState::Open => error!(
                "🚨 Circuit breaker {} transitioned from {} to {} after {} failures",
                self.name, from, to, inner.failure_count
            ),
            _ => info!(
                "🔄 Circuit breaker {} transitioned from {} to {}",
                self.name, from, to
            ),
        }
    }

    /// Get current circuit breaker state
    pub fn get_state(&self) -> CircuitState {
        let inner = self.lock();
        CircuitState {
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_time: inner.last_failure_time,
            last_failure_at: inner.last_failure_at,
            threshold: self.config.failure_threshold,
            cooldown: self.config.cooldown,
        }
    }

    /// Get comprehensive statistics
    pub fn get_stats(&self) -> CircuitBreakerStats {
        let (state, time_in_current_state) = {
            let inner = self.lock();
            (inner.state, inner.state_change_time.elapsed())
        };

        CircuitBreakerStats {
            state,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            state_changes: self.state_changes.load(Ordering::Relaxed),
            time_in_current_state,
        }
    }

    /// Reset circuit breaker to initial state
    pub fn reset(&self) {
        let mut inner = self.lock();
        self.transition(&mut inner, CircuitBreakerState::Closed);
        inner.failure_count = 0;
        inner.last_failure_time = None;
        inner.last_failure_at = None;
        inner.trial_in_flight = false;

        info!("🔄 Circuit breaker {} reset to closed state", self.name);
    }

    /// Force circuit breaker to open state (for testing/emergency)
    pub fn force_open(&self) {
        let mut inner = self.lock();
        inner.last_failure_time = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());
        inner.trial_in_flight = false;
        self.transition(&mut inner, CircuitBreakerState::Open);
        warn!("🚨 Circuit breaker {} forced to open state", self.name);
    }

    /// Get the circuit breaker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the circuit breaker configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}

/// Shared handle used by service clients
pub type SharedCircuitBreaker = Arc<CircuitBreaker>;
