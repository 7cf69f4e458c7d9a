//! Resilience patterns for broker calls and order placement.
//!
//! - [`CircuitBreaker`]: fail fast while the broker is down, with state
//!   persisted across restarts.
//! - [`execute_with_retry`] / [`guarded_call`]: bounded retries with
//!   exponential backoff and jitter, optionally gated by a breaker.
//! - [`PositionLock`]: cross-process mutual exclusion around the
//!   read-position, compute, submit-order sequence.

mod circuit_breaker;
mod clock;
mod position_lock;
mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, CircuitError, CircuitRecord,
    CircuitStateStore, FileCircuitStore, InMemoryCircuitStore,
};
pub use clock::{Clock, ManualClock, SystemClock, elapsed_between};
pub use position_lock::{
    LockError, LockRecord, PositionLock, PositionLockConfig, PositionLockGuard,
};
pub use retry::{
    Backoff, Interrupted, RecordingSleeper, RetryClassifier, RetryError, RetryPolicy, Sleeper,
    TokioSleeper, execute_with_retry, guarded_call,
};
