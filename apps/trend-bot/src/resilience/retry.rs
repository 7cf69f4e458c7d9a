//! Retry policy with exponential backoff for broker API calls.
//!
//! Wraps one external call with a bounded number of retries. The caller
//! supplies a classifier that separates transient failures (retried) from
//! fatal ones (propagated immediately without consuming a retry).
//!
//! # Backoff Schedule (defaults)
//!
//! | Retry | Base delay | With jitter `[0, 50%)` |
//! |-------|------------|------------------------|
//! | 1     | 1s         | 1.0–1.5s               |
//! | 2     | 2s         | 2.0–3.0s               |
//! | 3     | 4s         | 4.0–6.0s               |
//!
//! The base delay is `min(max_delay, base_delay * 2^(retry - 1))`.
//!
//! # Example
//!
//! ```rust,ignore
//! use trend_bot::resilience::{RetryPolicy, TokioSleeper, execute_with_retry};
//!
//! let policy = RetryPolicy::default();
//! let sleeper = TokioSleeper::new(shutdown.clone());
//! let bars = execute_with_retry(&policy, &sleeper, BrokerError::is_retryable, |_| {
//!     broker.get_bars(&symbol, timeframe, start)
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::circuit_breaker::{CircuitBreaker, CircuitError, CircuitStateStore};
use crate::observability;

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (default: 3).
    pub max_retries: u32,
    /// Delay before the first retry (default: 1s).
    pub base_delay: Duration,
    /// Cap on the exponential delay (default: 30s).
    pub max_delay: Duration,
    /// Upper bound of the additive jitter as a fraction of the delay
    /// (default: 0.5, giving `[0, delay * 0.5)`).
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_ratio: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the default jitter ratio.
    #[must_use]
    pub const fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            jitter_ratio: 0.5,
        }
    }

    /// Disable jitter (deterministic delays).
    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.jitter_ratio = 0.0;
        self
    }

    /// Exponential delay for the given retry (1-based), before jitter.
    #[must_use]
    pub fn base_delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Delay to wait before the given retry (1-based), jitter included.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let delay = self.base_delay_for(retry);
        delay + jitter(delay, self.jitter_ratio)
    }

    /// Longest total backoff one call can spend sleeping, jitter included.
    #[must_use]
    pub fn worst_case_backoff(&self) -> Duration {
        let factor = 1.0 + self.jitter_ratio.max(0.0);
        (1..=self.max_retries)
            .map(|retry| {
                Duration::try_from_secs_f64(self.base_delay_for(retry).as_secs_f64() * factor)
                    .unwrap_or(Duration::MAX)
            })
            .fold(Duration::ZERO, Duration::saturating_add)
    }

    /// Iterator over the delays of every retry this policy allows.
    #[must_use]
    pub const fn backoff(&self) -> Backoff<'_> {
        Backoff {
            policy: self,
            retry: 0,
        }
    }
}

/// Delays before each retry of a [`RetryPolicy`], jitter included.
#[derive(Debug, Clone)]
pub struct Backoff<'a> {
    policy: &'a RetryPolicy,
    retry: u32,
}

impl Iterator for Backoff<'_> {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.retry >= self.policy.max_retries {
            return None;
        }
        self.retry += 1;
        Some(self.policy.delay_for(self.retry))
    }
}

/// Uniform jitter in `[0, delay * ratio)`.
fn jitter(delay: Duration, ratio: f64) -> Duration {
    let bound = delay.as_secs_f64() * ratio;
    if !bound.is_finite() || bound <= 0.0 {
        return Duration::ZERO;
    }
    let mut rng = rand::rng();
    Duration::from_secs_f64(rng.random_range(0.0..bound))
}

/// Decides whether a failure is worth retrying.
///
/// Implemented for any `Fn(&E) -> bool`.
pub trait RetryClassifier<E> {
    /// `true` for transient failures, `false` for fatal ones.
    fn is_retryable(&self, error: &E) -> bool;
}

impl<E, F> RetryClassifier<E> for F
where
    F: Fn(&E) -> bool,
{
    fn is_retryable(&self, error: &E) -> bool {
        self(error)
    }
}

/// Backoff sleep was cut short by shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("backoff sleep interrupted by shutdown")]
pub struct Interrupted;

/// Suspends the retry loop between attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Sleep for `duration`, or return early with [`Interrupted`].
    async fn sleep(&self, duration: Duration) -> Result<(), Interrupted>;
}

/// Tokio timer sleep that aborts when the shutdown token is cancelled.
#[derive(Debug, Clone, Default)]
pub struct TokioSleeper {
    shutdown: CancellationToken,
}

impl TokioSleeper {
    /// Create a sleeper bound to `shutdown`.
    #[must_use]
    pub const fn new(shutdown: CancellationToken) -> Self {
        Self { shutdown }
    }
}

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        tokio::select! {
            () = self.shutdown.cancelled() => Err(Interrupted),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

/// Sleeper that records requested delays and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays requested so far.
    #[must_use]
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        self.delays.lock().push(duration);
        Ok(())
    }
}

/// Terminal outcomes of a retried call.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The classifier marked the failure as non-retryable.
    #[error(transparent)]
    Fatal(E),

    /// Every attempt failed with a retryable error.
    #[error("all {attempts} attempts failed: {source}")]
    Exhausted {
        /// Total attempts made (first try plus retries).
        attempts: u32,
        /// The last underlying error.
        source: E,
    },

    /// Shutdown interrupted the backoff sleep.
    #[error("retry interrupted after {attempts} attempts: {source}")]
    Interrupted {
        /// Attempts made before the interruption.
        attempts: u32,
        /// The last underlying error.
        source: E,
    },
}

impl<E> RetryError<E> {
    /// The underlying error, whatever the outcome.
    pub fn into_inner(self) -> E {
        match self {
            Self::Fatal(e) | Self::Exhausted { source: e, .. } | Self::Interrupted { source: e, .. } => e,
        }
    }
}

/// Run `operation` with bounded retries.
///
/// `operation` receives the 1-based attempt number. A failure the
/// classifier rejects propagates immediately as [`RetryError::Fatal`].
/// Retryable failures are retried up to `policy.max_retries` times, sleeping
/// [`RetryPolicy::delay_for`] between attempts; the last one is returned in
/// [`RetryError::Exhausted`].
pub async fn execute_with_retry<T, E, C, F, Fut>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    classifier: C,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    C: RetryClassifier<E>,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        let error = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        let retryable = classifier.is_retryable(&error);
        backoff_or_give_up(policy, sleeper, attempt, error, retryable).await?;
        attempt += 1;
    }
}

/// Retry `operation` with every attempt gated by `breaker`.
///
/// The operation is only invoked once the breaker admits the attempt. An
/// open circuit short-circuits the loop: [`CircuitError::Open`] and breaker
/// storage errors are never retried, and a failure that opens the circuit
/// ends the loop as [`CircuitError::Open`] without a backoff sleep.
pub async fn guarded_call<T, E, S, C, F, Fut>(
    breaker: &CircuitBreaker<S>,
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    classifier: C,
    mut operation: F,
) -> Result<T, RetryError<CircuitError<E>>>
where
    S: CircuitStateStore,
    C: RetryClassifier<E>,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        let error = match breaker.call_if_allowed(|| operation(attempt)).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        let retryable = match &error {
            CircuitError::Inner(inner) => classifier.is_retryable(inner),
            CircuitError::Open { .. } | CircuitError::Store(_) => false,
        };
        if retryable && attempt <= policy.max_retries {
            match breaker.open_for() {
                Ok(Some(retry_in)) => {
                    tracing::warn!(
                        name = breaker.name(),
                        attempt,
                        error = %error,
                        "Circuit opened, abandoning retries"
                    );
                    return Err(RetryError::Fatal(CircuitError::Open {
                        name: breaker.name().to_string(),
                        retry_in,
                    }));
                }
                Ok(None) => {}
                Err(e) => return Err(RetryError::Fatal(CircuitError::Store(e))),
            }
        }
        backoff_or_give_up(policy, sleeper, attempt, error, retryable).await?;
        attempt += 1;
    }
}

/// Sleep before the next attempt, or turn `error` into the terminal outcome.
async fn backoff_or_give_up<E: std::fmt::Display>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    attempt: u32,
    error: E,
    retryable: bool,
) -> Result<(), RetryError<E>> {
    if !retryable {
        tracing::error!(attempt, error = %error, "Non-retryable error");
        return Err(RetryError::Fatal(error));
    }

    if attempt > policy.max_retries {
        tracing::error!(attempts = attempt, error = %error, "All retry attempts failed");
        return Err(RetryError::Exhausted {
            attempts: attempt,
            source: error,
        });
    }

    let delay = policy.delay_for(attempt);
    observability::record_retry_attempt();
    tracing::warn!(
        attempt,
        max_attempts = policy.max_retries + 1,
        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        error = %error,
        "Attempt failed, retrying"
    );

    if sleeper.sleep(delay).await.is_err() {
        tracing::info!(attempt, "Retry loop interrupted by shutdown");
        return Err(RetryError::Interrupted {
            attempts: attempt,
            source: error,
        });
    }
    Ok(())
}
