//! SMA trend signal, sizing and order planning.
//!
//! Pure functions over closes and position state; no I/O.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::params::StrategyParams;
use crate::broker::OrderSide;

/// Sells of at least this fraction of the holding close the position.
const CLOSE_POSITION_FRACTION: Decimal = dec!(0.99);

/// Trading signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    /// Go (or stay) long.
    Buy,
    /// Exit the position.
    Sell,
    /// Do nothing.
    Hold,
}

impl Signal {
    /// Uppercase name used in logs and status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
            Self::Hold => "HOLD",
        }
    }

    /// Whether the signal asks for a trade.
    #[must_use]
    pub const fn is_actionable(self) -> bool {
        matches!(self, Self::Buy | Self::Sell)
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to one signal evaluation.
#[derive(Debug, Clone, Copy)]
pub struct MarketSnapshot<'a> {
    /// Closing prices, oldest first.
    pub closes: &'a [Decimal],
    /// Quantity currently held (zero when flat).
    pub position_qty: Decimal,
    /// Price the current position was entered at.
    pub entry_price: Option<Decimal>,
    /// Time of the last executed rebalance.
    pub last_rebalance_at: Option<DateTime<Utc>>,
    /// Evaluation time.
    pub now: DateTime<Utc>,
}

impl MarketSnapshot<'_> {
    /// Latest close.
    #[must_use]
    pub fn price(&self) -> Option<Decimal> {
        self.closes.last().copied()
    }

    fn has_position(&self) -> bool {
        self.position_qty > Decimal::ZERO
    }
}

/// Signal with the values that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalDecision {
    /// The signal.
    pub signal: Signal,
    /// SMA at evaluation time, when it was computed.
    pub sma: Option<Decimal>,
    /// Human-readable reason.
    pub reason: String,
}

impl SignalDecision {
    fn hold(reason: impl Into<String>, sma: Option<Decimal>) -> Self {
        Self {
            signal: Signal::Hold,
            sma,
            reason: reason.into(),
        }
    }
}

/// Simple moving average of the last `window` closes.
///
/// `None` when the window is empty or there are fewer closes than `window`.
#[must_use]
pub fn sma(closes: &[Decimal], window: usize) -> Option<Decimal> {
    if window == 0 || closes.len() < window {
        return None;
    }
    let sum: Decimal = closes[closes.len() - window..].iter().sum();
    Some(sum / Decimal::from(window))
}

/// Whether recent prices are calm enough to trade.
///
/// Range over mean of the last `lookback` closes must stay below
/// `threshold`. Too little data counts as unsafe.
#[must_use]
pub fn volatility_ok(closes: &[Decimal], lookback: usize, threshold: Decimal) -> bool {
    if lookback == 0 || closes.len() < lookback {
        return false;
    }
    let window = &closes[closes.len() - lookback..];
    let (mut min, mut max) = (window[0], window[0]);
    for &close in window {
        min = min.min(close);
        max = max.max(close);
    }
    let mean = window.iter().sum::<Decimal>() / Decimal::from(lookback);
    if mean <= Decimal::ZERO {
        return false;
    }
    (max - min) / mean < threshold
}

/// Whether the drawdown from `entry` to `price` exceeds `stop_pct`.
#[must_use]
pub fn stop_loss_triggered(entry: Decimal, price: Decimal, stop_pct: Decimal) -> bool {
    if entry <= Decimal::ZERO {
        return false;
    }
    (entry - price) / entry > stop_pct
}

/// Whether the cadence allows a rebalance at `now`.
#[must_use]
pub fn should_rebalance(
    params: &StrategyParams,
    last_rebalance_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    params.cadence.is_due(last_rebalance_at, now)
}

/// Evaluate the trend rule.
///
/// Checks run in order and the first match wins: not enough history,
/// cadence, volatility, stop-loss, then price against the SMA.
#[must_use]
pub fn generate_signal(params: &StrategyParams, market: &MarketSnapshot<'_>) -> SignalDecision {
    let Some(price) = market.price() else {
        return SignalDecision::hold("no price data", None);
    };
    if market.closes.len() < params.sma_window {
        return SignalDecision::hold(
            format!(
                "insufficient data: {} of {} bars",
                market.closes.len(),
                params.sma_window
            ),
            None,
        );
    }
    if !should_rebalance(params, market.last_rebalance_at, market.now) {
        return SignalDecision::hold("not a rebalance day", None);
    }
    if !volatility_ok(
        market.closes,
        params.volatility_lookback,
        params.volatility_threshold,
    ) {
        return SignalDecision::hold("volatility above threshold", None);
    }

    let Some(sma) = sma(market.closes, params.sma_window) else {
        return SignalDecision::hold("insufficient data", None);
    };

    if market.has_position()
        && let Some(entry) = market.entry_price
        && stop_loss_triggered(entry, price, params.stop_loss_pct)
    {
        return SignalDecision {
            signal: Signal::Sell,
            sma: Some(sma),
            reason: format!("stop-loss: price {price} below entry {entry}"),
        };
    }

    if price > sma {
        if market.has_position() && !params.add_to_position {
            return SignalDecision::hold("uptrend, already long", Some(sma));
        }
        return SignalDecision {
            signal: Signal::Buy,
            sma: Some(sma),
            reason: format!("uptrend: price {price} above SMA {sma}"),
        };
    }

    if market.has_position() {
        return SignalDecision {
            signal: Signal::Sell,
            sma: Some(sma),
            reason: format!("downtrend: price {price} at or below SMA {sma}"),
        };
    }

    SignalDecision::hold("downtrend, flat", Some(sma))
}

/// Quantity to hold when long, rounded down to the allowed precision.
#[must_use]
pub fn target_quantity(params: &StrategyParams, equity: Decimal, price: Decimal) -> Decimal {
    if price <= Decimal::ZERO || equity <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    round_qty(equity * params.allocation / price, params.qty_decimals)
}

fn round_qty(qty: Decimal, decimals: u32) -> Decimal {
    qty.round_dp_with_strategy(decimals, RoundingStrategy::ToZero)
}

/// What to send to the broker for a signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderPlan {
    /// Nothing to trade.
    Skip {
        /// Why nothing is traded.
        reason: String,
    },
    /// Submit a market order.
    Submit {
        /// Side.
        side: OrderSide,
        /// Quantity.
        qty: Decimal,
    },
    /// Liquidate the whole position.
    ClosePosition,
}

/// Turn a signal into an order against the current holding.
///
/// BUY moves towards `target_qty` (never reducing), SELL towards flat.
#[must_use]
pub fn plan_order(
    params: &StrategyParams,
    signal: Signal,
    current_qty: Decimal,
    target_qty: Decimal,
) -> OrderPlan {
    let desired = match signal {
        Signal::Hold => {
            return OrderPlan::Skip {
                reason: "hold".to_string(),
            };
        }
        Signal::Buy => target_qty.max(current_qty),
        Signal::Sell => Decimal::ZERO,
    };

    let delta = desired - current_qty;
    if delta.abs() < params.min_trade_qty {
        return OrderPlan::Skip {
            reason: format!("delta {delta} below minimum trade {}", params.min_trade_qty),
        };
    }

    if delta > Decimal::ZERO {
        return OrderPlan::Submit {
            side: OrderSide::Buy,
            qty: round_qty(delta, params.qty_decimals),
        };
    }

    let sell_qty = -delta;
    if sell_qty >= current_qty * CLOSE_POSITION_FRACTION {
        OrderPlan::ClosePosition
    } else {
        OrderPlan::Submit {
            side: OrderSide::Sell,
            qty: round_qty(sell_qty, params.qty_decimals),
        }
    }
}
