//! Rebalance cycle errors.
//!
//! Every variant is recoverable at the cycle level: the scheduler logs it
//! and waits for the next tick. [`CycleError::is_skip`] separates cycles that
//! were deliberately skipped from cycles that failed.
//!
//! | Variant | Meaning | Scheduler |
//! |---------|---------|-----------|
//! | `CircuitOpen` | Broker circuit is open | skip |
//! | `LockTimeout` | Another cycle holds the position lock | skip |
//! | `LockLost` | The lock expired and was reclaimed before the order | fail |
//! | `RetriesExhausted` | Transient broker failures outlasted the retry budget | fail |
//! | `Fatal` | Non-retryable broker failure | fail |
//! | `Interrupted` | Shutdown during a backoff sleep | fail |
//! | `Persistence` | State file could not be read or written | fail |
//! | `InvalidData` | Broker returned unusable data | fail |

use std::time::Duration;

use thiserror::Error;

use crate::broker::BrokerError;
use crate::persistence::StoreError;
use crate::resilience::{CircuitError, LockError, RetryError};

/// Why a rebalance cycle did not complete.
#[derive(Debug, Error)]
pub enum CycleError {
    /// Circuit breaker rejected the call.
    #[error("circuit '{name}' is open, next probe in {retry_in:?}")]
    CircuitOpen {
        /// Breaker name.
        name: String,
        /// Time until a probe is admitted.
        retry_in: Duration,
    },

    /// All retries failed.
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Broker operation.
        operation: &'static str,
        /// Attempts made.
        attempts: u32,
        /// Last failure.
        source: BrokerError,
    },

    /// Position lock is held by another cycle.
    #[error("position lock not acquired within {waited:?}")]
    LockTimeout {
        /// How long we waited.
        waited: Duration,
    },

    /// The position lock was reclaimed by another holder mid-cycle.
    #[error("position lock lost before {operation}")]
    LockLost {
        /// Operation that was abandoned.
        operation: &'static str,
    },

    /// Position lock could not be used.
    #[error(transparent)]
    Lock(LockError),

    /// Non-retryable broker failure.
    #[error("{operation} failed: {source}")]
    Fatal {
        /// Broker operation.
        operation: &'static str,
        /// The failure.
        source: BrokerError,
    },

    /// Shutdown interrupted a retry backoff.
    #[error("{operation} interrupted by shutdown")]
    Interrupted {
        /// Broker operation.
        operation: &'static str,
    },

    /// State file error.
    #[error(transparent)]
    Persistence(#[from] StoreError),

    /// Broker data could not be used.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl CycleError {
    /// Map the outcome of a guarded broker call.
    #[must_use]
    pub fn from_broker_call(
        operation: &'static str,
        error: RetryError<CircuitError<BrokerError>>,
    ) -> Self {
        match error {
            RetryError::Interrupted { .. } => Self::Interrupted { operation },
            RetryError::Fatal(inner) => Self::from_circuit(operation, inner, None),
            RetryError::Exhausted { attempts, source } => {
                Self::from_circuit(operation, source, Some(attempts))
            }
        }
    }

    fn from_circuit(
        operation: &'static str,
        error: CircuitError<BrokerError>,
        attempts: Option<u32>,
    ) -> Self {
        match (error, attempts) {
            (CircuitError::Open { name, retry_in }, _) => Self::CircuitOpen { name, retry_in },
            (CircuitError::Store(e), _) => Self::Persistence(e),
            (CircuitError::Inner(source), Some(attempts)) => Self::RetriesExhausted {
                operation,
                attempts,
                source,
            },
            (CircuitError::Inner(source), None) => Self::Fatal { operation, source },
        }
    }

    /// Whether the cycle was skipped rather than failed.
    #[must_use]
    pub const fn is_skip(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. } | Self::LockTimeout { .. })
    }

    /// Short label for metrics and status.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::CircuitOpen { .. } => "circuit_open",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::LockLost { .. } => "lock_lost",
            Self::Lock(_) => "lock_error",
            Self::Fatal { .. } => "fatal",
            Self::Interrupted { .. } => "interrupted",
            Self::Persistence(_) => "persistence",
            Self::InvalidData(_) => "invalid_data",
        }
    }
}

impl From<LockError> for CycleError {
    fn from(error: LockError) -> Self {
        match error {
            LockError::Timeout { waited, .. } => Self::LockTimeout { waited },
            other => Self::Lock(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn open_circuit_is_a_skip() {
        let err = CycleError::from_broker_call(
            "get_bars",
            RetryError::Fatal(CircuitError::Open {
                name: "alpaca".into(),
                retry_in: Duration::from_secs(42),
            }),
        );
        assert!(matches!(err, CycleError::CircuitOpen { ref name, .. } if name == "alpaca"));
        assert!(err.is_skip());
        assert_eq!(err.kind(), "circuit_open");
    }

    #[test]
    fn exhausted_keeps_last_cause() {
        let err = CycleError::from_broker_call(
            "get_account",
            RetryError::Exhausted {
                attempts: 4,
                source: CircuitError::Inner(BrokerError::Timeout),
            },
        );
        match err {
            CycleError::RetriesExhausted {
                operation,
                attempts,
                source,
            } => {
                assert_eq!(operation, "get_account");
                assert_eq!(attempts, 4);
                assert_eq!(source, BrokerError::Timeout);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fatal_is_not_a_skip() {
        let err = CycleError::from_broker_call(
            "submit_order",
            RetryError::Fatal(CircuitError::Inner(BrokerError::Authentication)),
        );
        assert!(matches!(err, CycleError::Fatal { .. }));
        assert!(!err.is_skip());
        assert!(err.to_string().contains("submit_order"));
    }

    #[test]
    fn interrupted_maps_to_interrupted() {
        let err = CycleError::from_broker_call(
            "get_bars",
            RetryError::Interrupted {
                attempts: 2,
                source: CircuitError::Inner(BrokerError::Timeout),
            },
        );
        assert!(matches!(err, CycleError::Interrupted { operation: "get_bars" }));
    }

    #[test]
    fn lock_timeout_is_a_skip() {
        let err = CycleError::from(LockError::Timeout {
            path: PathBuf::from("/tmp/position.lock"),
            waited: Duration::from_secs(5),
        });
        assert!(matches!(err, CycleError::LockTimeout { .. }));
        assert!(err.is_skip());
    }

    #[test]
    fn lock_lost_is_a_failure() {
        let err = CycleError::LockLost {
            operation: "submit_order",
        };
        assert!(!err.is_skip());
        assert_eq!(err.kind(), "lock_lost");
    }
}
