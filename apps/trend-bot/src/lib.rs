// Allow unwrap/expect in tests - tests should panic on unexpected errors
// Allow test-specific patterns and pedantic lints in test code
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::option_if_let_else,
        clippy::items_after_statements
    )
)]

//! Trend Bot - SMA trend-following rebalancer
//!
//! Rebalances one symbol on a daily schedule: long while the latest close is
//! above its simple moving average, flat otherwise, with a stop-loss and a
//! volatility filter.
//!
//! # Layers
//!
//! - **Reliability** (`resilience`): persisted circuit breaker, retry with
//!   exponential backoff and jitter, cross-process position lock
//! - **Strategy** (`strategy`): pure signal, sizing and order planning
//! - **Broker** (`broker`): `BrokerPort` and the Alpaca adapter
//! - **Orchestration** (`bot`): the rebalance cycle and its scheduler
//! - **Ambient**: `config`, `observability`, `persistence`, `status`
//!
//! Every broker call goes through [`resilience::guarded_call`], and every
//! cycle runs under a [`resilience::PositionLock`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

/// Rebalance orchestrator and scheduler.
pub mod bot;

/// Broker port and adapters.
pub mod broker;

/// YAML configuration.
pub mod config;

/// Rebalance cycle errors.
pub mod error;

/// Logging, tracing and metrics.
pub mod observability;

/// Durable JSON state files.
pub mod persistence;

/// Circuit breaker, retry policy and position lock.
pub mod resilience;

/// Status file export.
pub mod status;

/// SMA trend strategy.
pub mod strategy;

pub use bot::{CycleAction, CycleReport, DailySchedule, RebalanceBot};
pub use error::CycleError;
