//! SMA trend-following strategy.
//!
//! Long when the latest close is above the simple moving average, flat
//! otherwise, guarded by a stop-loss from the entry price and a volatility
//! filter. Rebalances happen at most once per cadence period.

mod params;
mod trend;

pub use params::{Cadence, Preset, StrategyParams};
pub use trend::{
    MarketSnapshot, OrderPlan, Signal, SignalDecision, generate_signal, plan_order,
    should_rebalance, sma, stop_loss_triggered, target_quantity, volatility_ok,
};
