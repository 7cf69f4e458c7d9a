//! Observability: structured logging, tracing and Prometheus metrics.

mod metrics;
mod tracing;

pub use self::metrics::{
    MetricsConfig, MetricsError, circuit_breaker_state_value, init_metrics,
    record_circuit_breaker_failure, record_circuit_breaker_rejected,
    record_circuit_breaker_state, record_circuit_breaker_success, record_cycle_outcome,
    record_lock_acquired, record_lock_stale_override, record_lock_timeout,
    record_order_submission, record_retry_attempt, record_signal,
};
pub use self::tracing::{DEFAULT_FILTER, TracingConfig, TracingError, TracingGuard, init_tracing};
