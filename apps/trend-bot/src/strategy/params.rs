//! Strategy tuning and the crypto / equity presets.

use chrono::{DateTime, Datelike, Duration, Utc, Weekday};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::broker::{AssetClass, Timeframe};

/// Named parameter preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    /// BTC/USD style: hourly bars, weekly rebalance, stop-loss, 50% allocation.
    Crypto,
    /// SPY style: daily bars, monthly rebalance, whole shares, market hours.
    Equity,
}

impl Preset {
    /// Parameters for this preset.
    #[must_use]
    pub fn params(self) -> StrategyParams {
        match self {
            Self::Crypto => StrategyParams::crypto(),
            Self::Equity => StrategyParams::equity(),
        }
    }
}

impl std::str::FromStr for Preset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "crypto" => Ok(Self::Crypto),
            "equity" => Ok(Self::Equity),
            other => Err(format!("unknown preset '{other}' (expected crypto or equity)")),
        }
    }
}

/// How often a rebalance may happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cadence {
    /// On the given weekday, at most once per ISO week.
    Weekly(Weekday),
    /// At most once per calendar month.
    Monthly,
}

impl Cadence {
    /// Whether a rebalance is due at `now` given the last one.
    ///
    /// The first rebalance is always due.
    #[must_use]
    pub fn is_due(self, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let Some(last) = last else {
            return true;
        };
        match self {
            Self::Weekly(weekday) => now.weekday() == weekday && now.iso_week() != last.iso_week(),
            Self::Monthly => (now.year(), now.month()) != (last.year(), last.month()),
        }
    }
}

/// Strategy parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyParams {
    /// Asset class traded.
    pub asset_class: AssetClass,
    /// Bar period.
    pub timeframe: Timeframe,
    /// SMA window in bars.
    pub sma_window: usize,
    /// Rebalance cadence.
    pub cadence: Cadence,
    /// Exit when price falls this fraction below entry (e.g. 0.15).
    pub stop_loss_pct: Decimal,
    /// Bars in the volatility window.
    pub volatility_lookback: usize,
    /// Skip trading when (max - min) / mean over the window reaches this.
    pub volatility_threshold: Decimal,
    /// Fraction of equity to hold when long.
    pub allocation: Decimal,
    /// Deltas smaller than this are not traded.
    pub min_trade_qty: Decimal,
    /// Decimal places of order quantities (0 = whole shares).
    pub qty_decimals: u32,
    /// Only trade while the market is open.
    pub requires_market_open: bool,
    /// Top an existing position up to the target on a BUY signal.
    pub add_to_position: bool,
    /// Calendar days of history to request.
    pub history_days: i64,
}

impl StrategyParams {
    /// Crypto preset: 50-day SMA over hourly bars, weekly on Monday.
    #[must_use]
    pub fn crypto() -> Self {
        Self {
            asset_class: AssetClass::Crypto,
            timeframe: Timeframe::Hour,
            sma_window: 50 * 24,
            cadence: Cadence::Weekly(Weekday::Mon),
            stop_loss_pct: dec!(0.15),
            volatility_lookback: 24,
            volatility_threshold: dec!(0.10),
            allocation: dec!(0.50),
            min_trade_qty: dec!(0.001),
            qty_decimals: 6,
            requires_market_open: false,
            add_to_position: false,
            history_days: 100,
        }
    }

    /// Equity preset: 200-day SMA over daily bars, monthly.
    #[must_use]
    pub fn equity() -> Self {
        Self {
            asset_class: AssetClass::Equity,
            timeframe: Timeframe::Day,
            sma_window: 200,
            cadence: Cadence::Monthly,
            stop_loss_pct: dec!(0.10),
            volatility_lookback: 5,
            volatility_threshold: dec!(0.10),
            allocation: dec!(0.95),
            min_trade_qty: dec!(1),
            qty_decimals: 0,
            requires_market_open: true,
            add_to_position: true,
            history_days: 400,
        }
    }

    /// Start of the history window ending at `now`.
    #[must_use]
    pub fn history_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(self.history_days)
    }
}
