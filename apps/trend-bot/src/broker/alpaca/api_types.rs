//! Alpaca API request and response types.
//!
//! These types map directly to Alpaca's REST API format. Alpaca encodes
//! money and quantities as JSON strings; `rust_decimal` accepts both.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::broker::{Account, Bar, MarketOrderRequest, OrderAck, Position};

// ============================================================================
// Order Types
// ============================================================================

/// Order request for Alpaca API.
#[derive(Debug, Clone, Serialize)]
pub struct AlpacaOrderRequest {
    /// Symbol.
    pub symbol: String,
    /// Quantity.
    pub qty: String,
    /// Order side.
    pub side: &'static str,
    /// Order type.
    #[serde(rename = "type")]
    pub order_type: &'static str,
    /// Time in force.
    pub time_in_force: &'static str,
    /// Client order ID.
    pub client_order_id: String,
}

impl From<&MarketOrderRequest> for AlpacaOrderRequest {
    fn from(order: &MarketOrderRequest) -> Self {
        Self {
            symbol: order.symbol.clone(),
            qty: order.qty.normalize().to_string(),
            side: order.side.as_str(),
            order_type: "market",
            time_in_force: order.time_in_force.as_str(),
            client_order_id: order.client_order_id.clone(),
        }
    }
}

/// Order response from Alpaca API (fields the bot uses).
#[derive(Debug, Clone, Deserialize)]
pub struct AlpacaOrderResponse {
    /// Broker order ID.
    pub id: String,
    /// Client order ID.
    #[serde(default)]
    pub client_order_id: String,
    /// Order status.
    #[serde(default)]
    pub status: String,
}

impl From<AlpacaOrderResponse> for OrderAck {
    fn from(resp: AlpacaOrderResponse) -> Self {
        Self {
            id: resp.id,
            client_order_id: resp.client_order_id,
            status: resp.status,
        }
    }
}

// ============================================================================
// Account and Position Types
// ============================================================================

/// Account response from Alpaca API.
#[derive(Debug, Clone, Deserialize)]
pub struct AlpacaAccountResponse {
    /// Total equity.
    pub equity: Decimal,
    /// Buying power.
    pub buying_power: Decimal,
    /// Cash.
    pub cash: Decimal,
}

impl From<AlpacaAccountResponse> for Account {
    fn from(resp: AlpacaAccountResponse) -> Self {
        Self {
            equity: resp.equity,
            buying_power: resp.buying_power,
            cash: resp.cash,
        }
    }
}

/// Position response from Alpaca API.
#[derive(Debug, Clone, Deserialize)]
pub struct AlpacaPositionResponse {
    /// Symbol.
    pub symbol: String,
    /// Quantity.
    pub qty: Decimal,
    /// Average entry price.
    #[serde(default)]
    pub avg_entry_price: Option<Decimal>,
    /// Current price.
    #[serde(default)]
    pub current_price: Option<Decimal>,
    /// Market value.
    #[serde(default)]
    pub market_value: Option<Decimal>,
}

impl From<AlpacaPositionResponse> for Position {
    fn from(resp: AlpacaPositionResponse) -> Self {
        Self {
            symbol: resp.symbol,
            qty: resp.qty,
            avg_entry_price: resp.avg_entry_price,
            current_price: resp.current_price,
            market_value: resp.market_value,
        }
    }
}

/// Market clock response.
#[derive(Debug, Clone, Deserialize)]
pub struct AlpacaClockResponse {
    /// Whether the market is open.
    pub is_open: bool,
}

// ============================================================================
// Market Data Types
// ============================================================================

/// One bar in Alpaca's compact format.
#[derive(Debug, Clone, Deserialize)]
pub struct AlpacaBar {
    /// Timestamp.
    pub t: DateTime<Utc>,
    /// Open.
    pub o: Decimal,
    /// High.
    pub h: Decimal,
    /// Low.
    pub l: Decimal,
    /// Close.
    pub c: Decimal,
    /// Volume.
    #[serde(default)]
    pub v: Decimal,
}

impl From<AlpacaBar> for Bar {
    fn from(bar: AlpacaBar) -> Self {
        Self {
            timestamp: bar.t,
            open: bar.o,
            high: bar.h,
            low: bar.l,
            close: bar.c,
            volume: bar.v,
        }
    }
}

/// Crypto bars page: bars keyed by symbol.
#[derive(Debug, Clone, Deserialize)]
pub struct CryptoBarsPage {
    /// Bars per symbol.
    #[serde(default)]
    pub bars: HashMap<String, Vec<AlpacaBar>>,
    /// Token for the next page.
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Stock bars page for a single symbol.
#[derive(Debug, Clone, Deserialize)]
pub struct StockBarsPage {
    /// Bars (`null` when the range is empty).
    #[serde(default)]
    pub bars: Option<Vec<AlpacaBar>>,
    /// Token for the next page.
    #[serde(default)]
    pub next_page_token: Option<String>,
}

// ============================================================================
// Error Types
// ============================================================================

/// Error body returned by Alpaca.
#[derive(Debug, Clone, Deserialize)]
pub struct AlpacaErrorResponse {
    /// Numeric error code.
    #[serde(default)]
    pub code: Option<serde_json::Value>,
    /// Error message.
    #[serde(default)]
    pub message: String,
}
