//! Broker Port (Driven Port)
//!
//! Interface the bot uses to read the account, positions and price history
//! and to place orders. [`AlpacaBroker`](alpaca::AlpacaBroker) is the
//! production adapter; tests substitute in-memory fakes.
//!
//! Adapters never retry. Transient failures surface as errors for which
//! [`BrokerError::is_retryable`] is `true`, and the reliability layer decides
//! what to do with them.

pub mod alpaca;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Asset class of the traded symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetClass {
    /// 24/7 crypto pair, e.g. `BTC/USD`.
    Crypto,
    /// US equity or ETF, e.g. `SPY`.
    Equity,
}

impl AssetClass {
    /// Time in force used for market orders in this asset class.
    #[must_use]
    pub const fn default_time_in_force(self) -> TimeInForce {
        match self {
            Self::Crypto => TimeInForce::Gtc,
            Self::Equity => TimeInForce::Day,
        }
    }
}

/// Bar aggregation period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeframe {
    /// One-hour bars.
    Hour,
    /// One-day bars.
    Day,
}

impl Timeframe {
    /// Alpaca query value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hour => "1Hour",
            Self::Day => "1Day",
        }
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    /// Buy.
    Buy,
    /// Sell.
    Sell,
}

impl OrderSide {
    /// Lowercase wire value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    /// Day order.
    Day,
    /// Good til cancelled.
    Gtc,
}

impl TimeInForce {
    /// Lowercase wire value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Gtc => "gtc",
        }
    }
}

/// Account snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Total account equity.
    pub equity: Decimal,
    /// Buying power.
    pub buying_power: Decimal,
    /// Cash balance.
    pub cash: Decimal,
}

/// Open position in one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Symbol as reported by the broker.
    pub symbol: String,
    /// Signed quantity held.
    pub qty: Decimal,
    /// Average entry price.
    pub avg_entry_price: Option<Decimal>,
    /// Latest price.
    pub current_price: Option<Decimal>,
    /// Market value of the position.
    pub market_value: Option<Decimal>,
}

/// OHLCV bar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    /// Bar start time.
    pub timestamp: DateTime<Utc>,
    /// Open price.
    pub open: Decimal,
    /// High price.
    pub high: Decimal,
    /// Low price.
    pub low: Decimal,
    /// Close price.
    pub close: Decimal,
    /// Traded volume.
    pub volume: Decimal,
}

/// Market order to submit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketOrderRequest {
    /// Symbol to trade.
    pub symbol: String,
    /// Order side.
    pub side: OrderSide,
    /// Quantity (fractional for crypto).
    pub qty: Decimal,
    /// Time in force.
    pub time_in_force: TimeInForce,
    /// Client order ID. Reused across retries so a resubmission cannot
    /// create a second order.
    pub client_order_id: String,
}

impl MarketOrderRequest {
    /// Create a request with a fresh client order ID.
    #[must_use]
    pub fn new(symbol: impl Into<String>, side: OrderSide, qty: Decimal, tif: TimeInForce) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            qty,
            time_in_force: tif,
            client_order_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Acknowledgment from broker after order submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAck {
    /// Broker-assigned order ID.
    pub id: String,
    /// Client order ID echoed back.
    pub client_order_id: String,
    /// Broker order status (e.g. `accepted`, `filled`).
    pub status: String,
}

/// Broker port error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// Transport failure before a response arrived.
    #[error("Broker connection error: {message}")]
    Connection {
        /// Error details.
        message: String,
    },

    /// The request timed out.
    #[error("Broker request timed out")]
    Timeout,

    /// Rate limited.
    #[error("Rate limited by broker")]
    RateLimited {
        /// Suggested delay, if the broker sent one.
        retry_after_secs: Option<u64>,
    },

    /// Broker-side failure (5xx or 408).
    #[error("Broker server error {status}: {message}")]
    Server {
        /// HTTP status.
        status: u16,
        /// Error details.
        message: String,
    },

    /// Credentials were rejected.
    #[error("Broker authentication failed")]
    Authentication,

    /// Credentials lack permission for the request.
    #[error("Broker request forbidden: {message}")]
    Forbidden {
        /// Error details.
        message: String,
    },

    /// The requested resource does not exist.
    #[error("Not found: {resource}")]
    NotFound {
        /// Resource path.
        resource: String,
    },

    /// Order rejected by broker.
    #[error("Order rejected: {reason}")]
    OrderRejected {
        /// Rejection reason.
        reason: String,
    },

    /// Other client errors (4xx).
    #[error("Invalid broker request {status}: {message}")]
    InvalidRequest {
        /// HTTP status.
        status: u16,
        /// Error details.
        message: String,
    },

    /// The broker answered with data we cannot use.
    #[error("Invalid broker response: {message}")]
    InvalidResponse {
        /// Error details.
        message: String,
    },
}

impl BrokerError {
    /// Whether the failure is transient and worth retrying.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout | Self::RateLimited { .. } | Self::Server { .. }
        )
    }
}

/// Port for broker interactions.
#[async_trait]
pub trait BrokerPort: Send + Sync {
    /// Get the account snapshot.
    async fn get_account(&self) -> Result<Account, BrokerError>;

    /// Get the open position in `symbol`, or `None` when flat.
    async fn get_position(&self, symbol: &str) -> Result<Option<Position>, BrokerError>;

    /// Get bars for `symbol` from `start` to now, oldest first.
    async fn get_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
    ) -> Result<Vec<Bar>, BrokerError>;

    /// Whether the equity market is open now.
    async fn is_market_open(&self) -> Result<bool, BrokerError>;

    /// Submit a market order.
    async fn submit_market_order(&self, order: &MarketOrderRequest)
    -> Result<OrderAck, BrokerError>;

    /// Liquidate the whole position in `symbol`.
    async fn close_position(&self, symbol: &str) -> Result<OrderAck, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use test_case::test_case;

    #[test_case(BrokerError::Connection { message: "reset".into() }, true ; "connection")]
    #[test_case(BrokerError::Timeout, true ; "timeout")]
    #[test_case(BrokerError::RateLimited { retry_after_secs: Some(1) }, true ; "rate limited")]
    #[test_case(BrokerError::Server { status: 503, message: String::new() }, true ; "server")]
    #[test_case(BrokerError::Authentication, false ; "authentication")]
    #[test_case(BrokerError::Forbidden { message: String::new() }, false ; "forbidden")]
    #[test_case(BrokerError::NotFound { resource: "/v2/orders/x".into() }, false ; "not found")]
    #[test_case(BrokerError::OrderRejected { reason: "qty".into() }, false ; "rejected")]
    #[test_case(BrokerError::InvalidRequest { status: 400, message: String::new() }, false ; "bad request")]
    #[test_case(BrokerError::InvalidResponse { message: "eof".into() }, false ; "malformed")]
    fn test_retryable_classification(error: BrokerError, retryable: bool) {
        assert_eq!(error.is_retryable(), retryable);
    }

    #[test]
    fn test_asset_class_time_in_force() {
        assert_eq!(AssetClass::Crypto.default_time_in_force(), TimeInForce::Gtc);
        assert_eq!(AssetClass::Equity.default_time_in_force(), TimeInForce::Day);
    }

    #[test]
    fn test_market_order_ids_are_unique() {
        let a = MarketOrderRequest::new("SPY", OrderSide::Buy, dec!(1), TimeInForce::Day);
        let b = MarketOrderRequest::new("SPY", OrderSide::Buy, dec!(1), TimeInForce::Day);
        assert_ne!(a.client_order_id, b.client_order_id);
    }

    #[test]
    fn test_wire_values() {
        assert_eq!(Timeframe::Hour.as_str(), "1Hour");
        assert_eq!(Timeframe::Day.as_str(), "1Day");
        assert_eq!(OrderSide::Sell.to_string(), "sell");
        assert_eq!(TimeInForce::Gtc.as_str(), "gtc");
    }
}
