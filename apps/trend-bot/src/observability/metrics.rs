//! Prometheus metrics for the trend bot.
//!
//! Covers the reliability layer (circuit breaker, retries, position lock)
//! and the rebalance cycle. Recording is a no-op until [`init_metrics`]
//! installs the exporter, so library code records unconditionally.
//!
//! # Example
//!
//! ```ignore
//! use trend_bot::observability::{init_metrics, MetricsConfig};
//!
//! init_metrics(&MetricsConfig::default())?;
//! record_cycle_outcome("completed", 1.2);
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::resilience::CircuitBreakerState;

/// Configuration for the metrics exporter.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Address to bind the metrics HTTP listener.
    pub listen_addr: SocketAddr,
    /// Histogram buckets for durations (in seconds).
    pub duration_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            // 1ms to 5 minutes: lock waits are short, cycles with retries are long
            duration_buckets: vec![
                0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0,
            ],
        }
    }
}

impl MetricsConfig {
    /// Create a metrics configuration with a custom address.
    #[must_use]
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            listen_addr: addr,
            ..Default::default()
        }
    }
}

/// Error type for metrics operations.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Failed to configure metrics exporter.
    #[error("metrics configuration error: {0}")]
    Configuration(String),
    /// Failed to install metrics exporter.
    #[error("metrics installation error: {0}")]
    Installation(String),
}

/// Initialize the Prometheus metrics exporter.
///
/// This starts an HTTP server that exposes metrics at `/metrics`.
///
/// # Errors
///
/// Returns an error if the exporter fails to start (e.g., port already in use).
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    PrometheusBuilder::new()
        .with_http_listener(config.listen_addr)
        .set_buckets(&config.duration_buckets)
        .map_err(|e| MetricsError::Configuration(e.to_string()))?
        .install()
        .map_err(|e| MetricsError::Installation(e.to_string()))?;

    tracing::info!(
        addr = %config.listen_addr,
        "Prometheus metrics exporter started"
    );

    Ok(())
}

// ============================================================================
// Circuit Breaker Metrics
// ============================================================================

/// Gauge value for a breaker state (0=closed, 1=open, 2=`half_open`).
#[must_use]
pub const fn circuit_breaker_state_value(state: CircuitBreakerState) -> f64 {
    match state {
        CircuitBreakerState::Closed => 0.0,
        CircuitBreakerState::Open => 1.0,
        CircuitBreakerState::HalfOpen => 2.0,
    }
}

/// Update the circuit breaker state gauge and count the transition.
pub fn record_circuit_breaker_state(service: &str, state: CircuitBreakerState) {
    gauge!(
        "circuit_breaker_state",
        "service" => service.to_string()
    )
    .set(circuit_breaker_state_value(state));

    counter!(
        "circuit_breaker_transitions_total",
        "service" => service.to_string(),
        "to" => state.as_str()
    )
    .increment(1);
}

/// Record a failure seen by a circuit breaker.
pub fn record_circuit_breaker_failure(service: &str) {
    counter!(
        "circuit_breaker_failures_total",
        "service" => service.to_string()
    )
    .increment(1);
}

/// Record a success seen by a circuit breaker.
pub fn record_circuit_breaker_success(service: &str) {
    counter!(
        "circuit_breaker_success_total",
        "service" => service.to_string()
    )
    .increment(1);
}

/// Record a call rejected because the circuit is open.
pub fn record_circuit_breaker_rejected(service: &str) {
    counter!(
        "circuit_breaker_rejected_total",
        "service" => service.to_string()
    )
    .increment(1);
}

// ============================================================================
// Retry Metrics
// ============================================================================

/// Record a retry (a failed attempt that will be tried again).
pub fn record_retry_attempt() {
    counter!("retry_attempts_total").increment(1);
}

// ============================================================================
// Position Lock Metrics
// ============================================================================

/// Record a successful lock acquisition and how long it waited.
pub fn record_lock_acquired(waited: Duration) {
    counter!("position_lock_acquisitions_total").increment(1);
    histogram!("position_lock_wait_seconds").record(waited.as_secs_f64());
}

/// Record an acquisition that gave up after its timeout.
pub fn record_lock_timeout() {
    counter!("position_lock_timeouts_total").increment(1);
}

/// Record a reclaimed expired or unreadable lock.
pub fn record_lock_stale_override() {
    counter!("position_lock_stale_overrides_total").increment(1);
}

// ============================================================================
// Rebalance Metrics
// ============================================================================

/// Record the end of a rebalance cycle.
///
/// # Arguments
///
/// * `outcome` - `"completed"`, `"skipped"` or `"failed"`
/// * `duration_seconds` - Wall time of the cycle
pub fn record_cycle_outcome(outcome: &'static str, duration_seconds: f64) {
    counter!("rebalance_cycles_total", "outcome" => outcome).increment(1);
    histogram!("rebalance_cycle_duration_seconds").record(duration_seconds);
}

/// Record the signal produced by the strategy.
pub fn record_signal(symbol: &str, signal: &'static str) {
    counter!(
        "strategy_signals_total",
        "symbol" => symbol.to_string(),
        "signal" => signal
    )
    .increment(1);
}

/// Record an order submission.
///
/// # Arguments
///
/// * `symbol` - Traded symbol
/// * `side` - `"buy"` or `"sell"`
/// * `status` - `"submitted"` or `"error"`
pub fn record_order_submission(symbol: &str, side: &'static str, status: &'static str) {
    counter!(
        "order_submissions_total",
        "symbol" => symbol.to_string(),
        "side" => side,
        "status" => status
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MetricsConfig::default();
        assert_eq!(config.listen_addr.port(), 9090);
        assert!(config.duration_buckets.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_config_with_addr() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let config = MetricsConfig::with_addr(addr);
        assert_eq!(config.listen_addr.port(), 8080);
    }

    #[test]
    fn test_circuit_breaker_state_values() {
        assert_eq!(circuit_breaker_state_value(CircuitBreakerState::Closed), 0.0);
        assert_eq!(circuit_breaker_state_value(CircuitBreakerState::Open), 1.0);
        assert_eq!(circuit_breaker_state_value(CircuitBreakerState::HalfOpen), 2.0);
    }

    #[test]
    fn test_recording_without_exporter_is_noop() {
        // No recorder installed: every call must be safe.
        record_circuit_breaker_state("alpaca", CircuitBreakerState::Open);
        record_circuit_breaker_failure("alpaca");
        record_circuit_breaker_success("alpaca");
        record_circuit_breaker_rejected("alpaca");
        record_retry_attempt();
        record_lock_acquired(Duration::from_millis(3));
        record_lock_timeout();
        record_lock_stale_override();
        record_cycle_outcome("completed", 0.5);
        record_signal("BTC/USD", "BUY");
        record_order_submission("BTC/USD", "buy", "submitted");
    }
}
