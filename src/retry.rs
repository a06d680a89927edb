// Retry with Exponential Backoff
// "Knock again, a little later each time"

use crate::error::{DocFiscalResult, ErrorClassifier, RawFailure, TypedError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_JITTER: Duration = Duration::from_millis(1000);

/// Bounds and timing for [`retry_with_policy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total tries is `max_retries + 1`
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Jitter is drawn uniformly from `[0, max_jitter)`
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_jitter: DEFAULT_MAX_JITTER,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Self::default()
        }
    }

    pub fn with_max_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay slept after failed attempt `attempt` (0-based):
    /// `base_delay * 2^attempt + jitter`
    pub fn backoff_delay(&self, attempt: u32, jitter: Duration) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).saturating_add(jitter)
    }

    fn sample_jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..max_ms))
    }
}

/// Retry `operation` up to `max_retries` times with exponential backoff.
///
/// Retries unconditionally up to the bound. Callers that must not retry
/// permanent failures should check [`TypedError::is_retryable`] first or use
/// [`retry_retryable`]. The final failure is always returned classified.
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation: F,
    max_retries: u32,
    base_delay: Duration,
) -> DocFiscalResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<RawFailure>,
{
    retry_with_policy(&RetryPolicy::new(max_retries, base_delay), operation).await
}

/// [`retry_with_backoff`] with an explicit policy
pub async fn retry_with_policy<F, Fut, T, E>(policy: &RetryPolicy, operation: F) -> DocFiscalResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<RawFailure>,
{
    run(policy, operation, false).await
}

/// Like [`retry_with_policy`], but gives up as soon as a failure classifies
/// as not retryable.
pub async fn retry_retryable<F, Fut, T, E>(policy: &RetryPolicy, operation: F) -> DocFiscalResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<RawFailure>,
{
    run(policy, operation, true).await
}

async fn run<F, Fut, T, E>(
    policy: &RetryPolicy,
    mut operation: F,
    stop_on_permanent: bool,
) -> DocFiscalResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<RawFailure>,
{
    let classifier = ErrorClassifier::default();
    let mut attempt = 0u32;

    loop {
        let error: TypedError = match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => classifier.classify(e),
        };

        if attempt >= policy.max_retries {
            warn!(
                attempts = attempt + 1,
                kind = %error.kind,
                error = %error.message,
                "❌ Retries exhausted"
            );
            return Err(error);
        }

        if stop_on_permanent && !error.retryable {
            debug!(kind = %error.kind, attempt, "Not retrying permanent failure");
            return Err(error);
        }

        let delay = policy.backoff_delay(attempt, policy.sample_jitter());
        warn!(
            attempt = attempt + 1,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            kind = %error.kind,
            error = %error.message,
            "🔄 Operation failed, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
