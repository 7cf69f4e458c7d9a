//! `BrokerPort` implementation for Alpaca.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};

use super::api_types::{
    AlpacaAccountResponse, AlpacaClockResponse, AlpacaOrderRequest, AlpacaOrderResponse,
    AlpacaPositionResponse, CryptoBarsPage, StockBarsPage,
};
use super::config::AlpacaConfig;
use super::error::AlpacaError;
use super::http_client::{AlpacaHttpClient, Api};
use crate::broker::{
    Account, Bar, BrokerError, BrokerPort, MarketOrderRequest, OrderAck, Position, Timeframe,
};

/// Bars requested per page.
const PAGE_LIMIT: &str = "10000";

/// Upper bound on pages fetched for one history request.
const MAX_PAGES: usize = 100;

/// Alpaca broker adapter.
///
/// Symbols containing `/` (e.g. `BTC/USD`) are treated as crypto pairs and
/// read from the crypto data API; anything else is a US equity.
#[derive(Debug, Clone)]
pub struct AlpacaBroker {
    client: AlpacaHttpClient,
    environment: super::AlpacaEnvironment,
}

impl AlpacaBroker {
    /// Create a new adapter.
    pub fn new(config: &AlpacaConfig) -> Result<Self, AlpacaError> {
        let client = AlpacaHttpClient::new(config)?;
        tracing::info!(
            environment = %config.environment,
            trading_url = config.trading_base_url(),
            "Alpaca broker initialized"
        );
        Ok(Self {
            client,
            environment: config.environment,
        })
    }

    /// Trading environment.
    #[must_use]
    pub const fn environment(&self) -> super::AlpacaEnvironment {
        self.environment
    }

    async fn crypto_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: &str,
    ) -> Result<Vec<Bar>, AlpacaError> {
        let mut bars = Vec::new();
        let mut page_token: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let mut query = vec![
                ("symbols", symbol.to_string()),
                ("timeframe", timeframe.as_str().to_string()),
                ("start", start.to_string()),
                ("limit", PAGE_LIMIT.to_string()),
            ];
            if let Some(token) = page_token.take() {
                query.push(("page_token", token));
            }
            let page: CryptoBarsPage = self
                .client
                .get(Api::Data, "/v1beta3/crypto/us/bars", &query)
                .await?;
            let mut page_bars = page.bars;
            if let Some(symbol_bars) = page_bars.remove(symbol) {
                bars.extend(symbol_bars.into_iter().map(Bar::from));
            }
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(bars),
            }
        }
        tracing::warn!(symbol, pages = MAX_PAGES, "Bar history truncated at page limit");
        Ok(bars)
    }

    async fn stock_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: &str,
    ) -> Result<Vec<Bar>, AlpacaError> {
        let path = format!("/v2/stocks/{symbol}/bars");
        let mut bars = Vec::new();
        let mut page_token: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let mut query = vec![
                ("timeframe", timeframe.as_str().to_string()),
                ("start", start.to_string()),
                ("limit", PAGE_LIMIT.to_string()),
                ("adjustment", "raw".to_string()),
                ("feed", "iex".to_string()),
            ];
            if let Some(token) = page_token.take() {
                query.push(("page_token", token));
            }
            let page: StockBarsPage = self.client.get(Api::Data, &path, &query).await?;
            bars.extend(page.bars.unwrap_or_default().into_iter().map(Bar::from));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(bars),
            }
        }
        tracing::warn!(symbol, pages = MAX_PAGES, "Bar history truncated at page limit");
        Ok(bars)
    }
}

/// Position endpoints take crypto pairs without the slash.
fn position_path(symbol: &str) -> String {
    format!("/v2/positions/{}", symbol.replace('/', ""))
}

#[async_trait]
impl BrokerPort for AlpacaBroker {
    async fn get_account(&self) -> Result<Account, BrokerError> {
        let account: AlpacaAccountResponse = self
            .client
            .get(Api::Trading, "/v2/account", &[] as &[(&str, &str)])
            .await?;
        Ok(account.into())
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<Position>, BrokerError> {
        match self
            .client
            .get::<AlpacaPositionResponse, _>(
                Api::Trading,
                &position_path(symbol),
                &[] as &[(&str, &str)],
            )
            .await
        {
            Ok(position) => Ok(Some(position.into())),
            Err(AlpacaError::NotFound { .. }) => {
                tracing::debug!(symbol, "No open position");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
    ) -> Result<Vec<Bar>, BrokerError> {
        let start = start.to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut bars = if symbol.contains('/') {
            self.crypto_bars(symbol, timeframe, &start).await?
        } else {
            self.stock_bars(symbol, timeframe, &start).await?
        };
        bars.sort_by_key(|bar| bar.timestamp);
        tracing::debug!(symbol, count = bars.len(), "Fetched bars");
        Ok(bars)
    }

    async fn is_market_open(&self) -> Result<bool, BrokerError> {
        let clock: AlpacaClockResponse = self
            .client
            .get(Api::Trading, "/v2/clock", &[] as &[(&str, &str)])
            .await?;
        Ok(clock.is_open)
    }

    async fn submit_market_order(
        &self,
        order: &MarketOrderRequest,
    ) -> Result<OrderAck, BrokerError> {
        let request = AlpacaOrderRequest::from(order);
        let response: AlpacaOrderResponse = self.client.post("/v2/orders", &request).await?;
        tracing::info!(
            order_id = %response.id,
            client_order_id = %order.client_order_id,
            symbol = %order.symbol,
            side = %order.side,
            qty = %order.qty,
            "Order submitted"
        );
        Ok(response.into())
    }

    async fn close_position(&self, symbol: &str) -> Result<OrderAck, BrokerError> {
        let response: AlpacaOrderResponse = self.client.delete(&position_path(symbol)).await?;
        tracing::info!(order_id = %response.id, symbol, "Position close submitted");
        Ok(response.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_path_strips_pair_separator() {
        assert_eq!(position_path("BTC/USD"), "/v2/positions/BTCUSD");
        assert_eq!(position_path("SPY"), "/v2/positions/SPY");
    }
}
