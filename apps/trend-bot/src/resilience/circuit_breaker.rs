//! Persisted circuit breaker for broker API calls.
//!
//! Stops hammering the brokerage after repeated consecutive failures and
//! probes for recovery after a cooldown. The breaker record is written to
//! durable storage on every mutation, so a restarted process resumes with
//! the same failure history instead of a fresh CLOSED circuit.
//!
//! # State Machine
//!
//! ```text
//! CLOSED → OPEN       (failure_count >= failure_threshold)
//! OPEN → HALF_OPEN    (cooldown elapsed, checked lazily at call time)
//! HALF_OPEN → CLOSED  (probe call succeeds, failure_count reset to 0)
//! HALF_OPEN → OPEN    (probe call fails, cooldown restarts)
//! ```
//!
//! Exactly one probe is admitted while HALF_OPEN. The caller that performs
//! the OPEN → HALF_OPEN transition claims it by stamping `probe_started_at`;
//! anyone else observing HALF_OPEN with a live claim is rejected as if the
//! circuit were still open. A claim older than the cooldown is treated as
//! abandoned (the prober crashed) and may be claimed again.
//!
//! # Configuration
//!
//! - `failure_threshold`: Consecutive failures before opening (default: 5)
//! - `cooldown`: Time to stay open before probing (default: 300s)
//!
//! # Example
//!
//! ```rust,ignore
//! use trend_bot::resilience::{CircuitBreaker, CircuitBreakerConfig};
//!
//! let breaker = CircuitBreaker::persistent("alpaca", CircuitBreakerConfig::default(), "state");
//! let account = breaker.call_if_allowed(|| broker.get_account()).await?;
//! ```

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::clock::{Clock, SystemClock, elapsed_between};
use crate::observability;
use crate::persistence::{JsonStateFile, StoreError};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitBreakerState {
    /// Circuit is closed, calls flow normally.
    #[default]
    Closed,
    /// Circuit is open, calls are rejected.
    Open,
    /// Circuit is admitting a single probe call.
    HalfOpen,
}

impl CircuitBreakerState {
    /// Label used in logs, metrics and the status file.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Duration to stay in `OPEN` state before admitting a probe.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(300),
        }
    }
}

/// Persisted breaker record.
///
/// Invariant: `state == Open` implies `opened_at.is_some()` and
/// `failure_count >= failure_threshold`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitRecord {
    /// Consecutive failures since the last success.
    pub failure_count: u32,
    /// Current state.
    pub state: CircuitBreakerState,
    /// When the most recent failure was recorded.
    pub last_failure_time: Option<DateTime<Utc>>,
    /// When the circuit last opened.
    pub opened_at: Option<DateTime<Utc>>,
    /// When the current `HALF_OPEN` probe was admitted.
    pub probe_started_at: Option<DateTime<Utc>>,
    /// When the record was last written.
    pub last_updated: Option<DateTime<Utc>>,
}

/// Durable storage for a breaker record.
///
/// `update` must run the mutation as a single read-modify-write that no
/// other writer can interleave with.
pub trait CircuitStateStore: Send + Sync {
    /// Read the current record.
    fn load(&self) -> Result<CircuitRecord, StoreError>;

    /// Atomically read, mutate and persist the record.
    fn update<R>(&self, mutate: impl FnOnce(&mut CircuitRecord) -> R) -> Result<R, StoreError>;
}

/// File-backed store, one JSON file per protected dependency.
#[derive(Debug, Clone)]
pub struct FileCircuitStore {
    file: JsonStateFile<CircuitRecord>,
}

impl FileCircuitStore {
    /// Store at `<dir>/circuit_breaker_<name>.json`.
    #[must_use]
    pub fn for_name(dir: impl AsRef<Path>, name: &str) -> Self {
        Self {
            file: JsonStateFile::new(dir.as_ref().join(format!("circuit_breaker_{name}.json"))),
        }
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

impl CircuitStateStore for FileCircuitStore {
    fn load(&self) -> Result<CircuitRecord, StoreError> {
        self.file.load()
    }

    fn update<R>(&self, mutate: impl FnOnce(&mut CircuitRecord) -> R) -> Result<R, StoreError> {
        self.file.update(mutate)
    }
}

/// In-process store, for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct InMemoryCircuitStore {
    record: Mutex<CircuitRecord>,
}

impl InMemoryCircuitStore {
    /// Create an empty (CLOSED) store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CircuitStateStore for InMemoryCircuitStore {
    fn load(&self) -> Result<CircuitRecord, StoreError> {
        Ok(self.record.lock().clone())
    }

    fn update<R>(&self, mutate: impl FnOnce(&mut CircuitRecord) -> R) -> Result<R, StoreError> {
        let mut record = self.record.lock();
        Ok(mutate(&mut record))
    }
}

/// Errors surfaced by [`CircuitBreaker::call_if_allowed`].
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// Circuit is open and the cooldown has not elapsed.
    #[error("circuit breaker '{name}' is OPEN, retry in {retry_in:?}")]
    Open {
        /// Breaker name.
        name: String,
        /// Time until a probe will be admitted.
        retry_in: Duration,
    },

    /// The breaker record could not be read or written.
    #[error("circuit breaker state unavailable: {0}")]
    Store(#[source] StoreError),

    /// The wrapped operation failed; the failure has been recorded.
    #[error(transparent)]
    Inner(E),
}

impl<E> CircuitError<E> {
    /// Whether the call was rejected without invoking the operation.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

/// Decision made before a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Allowed,
    Probe,
    Rejected { retry_in: Duration },
}

type Transition = Option<(CircuitBreakerState, CircuitBreakerState)>;

/// Circuit breaker for one external dependency.
#[derive(Debug)]
pub struct CircuitBreaker<S> {
    /// Dependency name for logging.
    name: String,
    config: CircuitBreakerConfig,
    store: S,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker<FileCircuitStore> {
    /// Breaker whose record lives in `<state_dir>/circuit_breaker_<name>.json`.
    #[must_use]
    pub fn persistent(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        state_dir: impl AsRef<Path>,
    ) -> Self {
        let name = name.into();
        let store = FileCircuitStore::for_name(state_dir, &name);
        Self::new(name, config, store)
    }
}

impl<S: CircuitStateStore> CircuitBreaker<S> {
    /// Create a breaker over `store` using the system clock.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, store: S) -> Self {
        Self {
            name: name.into(),
            config,
            store,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Get the dependency name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current persisted state.
    ///
    /// This is a plain read: an OPEN circuit whose cooldown has elapsed
    /// still reports OPEN until the next call performs the transition.
    pub fn state(&self) -> Result<CircuitBreakerState, StoreError> {
        Ok(self.store.load()?.state)
    }

    /// Full persisted record.
    pub fn snapshot(&self) -> Result<CircuitRecord, StoreError> {
        self.store.load()
    }

    /// Cooldown left on an OPEN circuit, `None` if a call would be admitted.
    pub fn open_for(&self) -> Result<Option<Duration>, StoreError> {
        let record = self.store.load()?;
        if record.state != CircuitBreakerState::Open {
            return Ok(None);
        }
        let now = self.clock.now();
        let opened_at = record.opened_at.or(record.last_failure_time).unwrap_or(now);
        Ok(remaining(self.config.cooldown, opened_at, now))
    }

    /// Run `operation` if the circuit admits it.
    ///
    /// Returns the operation's result on success. Rejected calls fail with
    /// [`CircuitError::Open`] without invoking the operation. Failures are
    /// recorded (possibly opening the circuit) and passed through as
    /// [`CircuitError::Inner`].
    pub async fn call_if_allowed<T, E, F, Fut>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let now = self.clock.now();
        let config = self.config;
        let (admission, transition) = self
            .store
            .update(|record| admit(record, &config, now))
            .map_err(CircuitError::Store)?;
        self.log_transition(transition, None);

        match admission {
            Admission::Rejected { retry_in } => {
                observability::record_circuit_breaker_rejected(&self.name);
                tracing::debug!(
                    name = %self.name,
                    retry_in_secs = retry_in.as_secs(),
                    "Circuit breaker rejected call"
                );
                return Err(CircuitError::Open {
                    name: self.name.clone(),
                    retry_in,
                });
            }
            Admission::Probe => {
                tracing::info!(name = %self.name, "Circuit breaker admitting probe call");
            }
            Admission::Allowed => {}
        }

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Record a successful call.
    ///
    /// A persistence failure is logged rather than returned: the call has
    /// already had its side effects and must not be reported as failed.
    pub fn record_success(&self) {
        let now = self.clock.now();
        observability::record_circuit_breaker_success(&self.name);
        match self.store.update(|record| on_success(record, now)) {
            Ok(transition) => self.log_transition(transition, None),
            Err(e) => tracing::error!(
                name = %self.name,
                error = %e,
                "Failed to persist circuit breaker success"
            ),
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let now = self.clock.now();
        let config = self.config;
        observability::record_circuit_breaker_failure(&self.name);
        match self.store.update(|record| {
            let transition = on_failure(record, &config, now);
            (transition, record.failure_count)
        }) {
            Ok((transition, failures)) => self.log_transition(transition, Some(failures)),
            Err(e) => tracing::error!(
                name = %self.name,
                error = %e,
                "Failed to persist circuit breaker failure"
            ),
        }
    }

    /// Clear the record back to CLOSED with no failures (operator reset).
    pub fn reset(&self) -> Result<(), StoreError> {
        let now = self.clock.now();
        let transition = self.store.update(|record| {
            let previous = record.state;
            *record = CircuitRecord {
                last_updated: Some(now),
                ..CircuitRecord::default()
            };
            (previous != CircuitBreakerState::Closed)
                .then_some((previous, CircuitBreakerState::Closed))
        })?;
        self.log_transition(transition, None);
        Ok(())
    }

    fn log_transition(&self, transition: Transition, failures: Option<u32>) {
        let Some((from, to)) = transition else {
            return;
        };
        observability::record_circuit_breaker_state(&self.name, to);
        match to {
            CircuitBreakerState::Open => tracing::warn!(
                name = %self.name,
                from = %from,
                to = %to,
                failures = failures.unwrap_or_default(),
                "Circuit breaker opened"
            ),
            CircuitBreakerState::HalfOpen => tracing::info!(
                name = %self.name,
                from = %from,
                to = %to,
                "Circuit breaker testing"
            ),
            CircuitBreakerState::Closed => tracing::info!(
                name = %self.name,
                from = %from,
                to = %to,
                "Circuit breaker closed"
            ),
        }
    }
}

fn remaining(cooldown: Duration, since: DateTime<Utc>, now: DateTime<Utc>) -> Option<Duration> {
    let elapsed = elapsed_between(since, now);
    (elapsed < cooldown).then(|| cooldown - elapsed)
}

fn admit(
    record: &mut CircuitRecord,
    config: &CircuitBreakerConfig,
    now: DateTime<Utc>,
) -> (Admission, Transition) {
    match record.state {
        CircuitBreakerState::Closed => (Admission::Allowed, None),
        CircuitBreakerState::Open => {
            // Records written by older versions may lack opened_at.
            let opened_at = *record
                .opened_at
                .get_or_insert(record.last_failure_time.unwrap_or(now));
            if let Some(retry_in) = remaining(config.cooldown, opened_at, now) {
                return (Admission::Rejected { retry_in }, None);
            }
            record.state = CircuitBreakerState::HalfOpen;
            record.probe_started_at = Some(now);
            record.last_updated = Some(now);
            (
                Admission::Probe,
                Some((CircuitBreakerState::Open, CircuitBreakerState::HalfOpen)),
            )
        }
        CircuitBreakerState::HalfOpen => {
            if let Some(started) = record.probe_started_at
                && let Some(retry_in) = remaining(config.cooldown, started, now)
            {
                return (Admission::Rejected { retry_in }, None);
            }
            record.probe_started_at = Some(now);
            record.last_updated = Some(now);
            (Admission::Probe, None)
        }
    }
}

fn on_success(record: &mut CircuitRecord, now: DateTime<Utc>) -> Transition {
    let previous = record.state;
    record.failure_count = 0;
    record.state = CircuitBreakerState::Closed;
    record.opened_at = None;
    record.probe_started_at = None;
    record.last_updated = Some(now);
    (previous != CircuitBreakerState::Closed).then_some((previous, CircuitBreakerState::Closed))
}

fn on_failure(
    record: &mut CircuitRecord,
    config: &CircuitBreakerConfig,
    now: DateTime<Utc>,
) -> Transition {
    let previous = record.state;
    record.failure_count = record.failure_count.saturating_add(1);
    record.last_failure_time = Some(now);
    record.last_updated = Some(now);

    match previous {
        CircuitBreakerState::HalfOpen => {
            record.state = CircuitBreakerState::Open;
            record.opened_at = Some(now);
            record.probe_started_at = None;
            Some((previous, CircuitBreakerState::Open))
        }
        CircuitBreakerState::Closed if record.failure_count >= config.failure_threshold => {
            record.state = CircuitBreakerState::Open;
            record.opened_at = Some(now);
            Some((previous, CircuitBreakerState::Open))
        }
        // A call admitted before another process opened the circuit; the
        // cooldown keeps running from the original opening.
        CircuitBreakerState::Closed | CircuitBreakerState::Open => None,
    }
}
