//! Alpaca Adapter Integration Tests
//!
//! Runs `AlpacaBroker` against a local mock of the trading and market data
//! REST APIs and checks request shape, response mapping and error
//! classification.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use chrono::{TimeZone, Utc};
use rust_decimal_macros::dec;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use trend_bot::broker::alpaca::{AlpacaBroker, AlpacaConfig, AlpacaEnvironment};
use trend_bot::broker::{BrokerError, BrokerPort, MarketOrderRequest, OrderSide, TimeInForce, Timeframe};

// =============================================================================
// Helpers
// =============================================================================

fn broker_for(server: &MockServer) -> AlpacaBroker {
    broker_with_timeout(server, Duration::from_secs(5))
}

fn broker_with_timeout(server: &MockServer, timeout: Duration) -> AlpacaBroker {
    let config = AlpacaConfig::new("test-key".into(), "test-secret".into(), AlpacaEnvironment::Paper)
        .with_timeout(timeout)
        .with_base_urls(server.uri(), server.uri());
    AlpacaBroker::new(&config).unwrap()
}

fn bar(t: &str, close: f64) -> serde_json::Value {
    json!({"t": t, "o": close, "h": close, "l": close, "c": close, "v": 1.25, "n": 3, "vw": close})
}

fn order_json(id: &str, client_order_id: &str) -> serde_json::Value {
    json!({
        "id": id,
        "client_order_id": client_order_id,
        "status": "accepted",
        "symbol": "BTC/USD",
        "qty": "0.5",
        "type": "market"
    })
}

// =============================================================================
// Account, position and clock
// =============================================================================

#[tokio::test]
async fn test_get_account_sends_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/account"))
        .and(header("APCA-API-KEY-ID", "test-key"))
        .and(header("APCA-API-SECRET-KEY", "test-secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "equity": "10250.75",
            "buying_power": "20501.50",
            "cash": "5000",
            "status": "ACTIVE"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let account = broker_for(&server).get_account().await.unwrap();

    assert_eq!(account.equity, dec!(10250.75));
    assert_eq!(account.buying_power, dec!(20501.50));
    assert_eq!(account.cash, dec!(5000));
}

#[tokio::test]
async fn test_missing_position_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/positions/BTCUSD"))
        .respond_with(
            ResponseTemplate::new(404)
                .set_body_json(json!({"code": 40410000, "message": "position does not exist"})),
        )
        .mount(&server)
        .await;

    let position = broker_for(&server).get_position("BTC/USD").await.unwrap();

    assert!(position.is_none());
}

#[tokio::test]
async fn test_open_position_is_mapped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/positions/SPY"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "symbol": "SPY",
            "qty": "12",
            "avg_entry_price": "501.25",
            "current_price": "510.10",
            "market_value": "6121.20",
            "side": "long"
        })))
        .mount(&server)
        .await;

    let position = broker_for(&server)
        .get_position("SPY")
        .await
        .unwrap()
        .unwrap();

    assert_eq!(position.qty, dec!(12));
    assert_eq!(position.avg_entry_price, Some(dec!(501.25)));
    assert_eq!(position.current_price, Some(dec!(510.10)));
}

#[tokio::test]
async fn test_market_clock() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/clock"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "timestamp": "2024-03-11T10:00:00-04:00",
            "is_open": true,
            "next_open": "2024-03-12T09:30:00-04:00",
            "next_close": "2024-03-11T16:00:00-04:00"
        })))
        .mount(&server)
        .await;

    assert!(broker_for(&server).is_market_open().await.unwrap());
}

// =============================================================================
// Bars
// =============================================================================

#[tokio::test]
async fn test_crypto_bars_follow_pagination() {
    let server = MockServer::start().await;
    let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();

    // Registered first so the follow-up request matches it
    Mock::given(method("GET"))
        .and(path("/v1beta3/crypto/us/bars"))
        .and(query_param("page_token", "page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "bars": {"BTC/USD": [bar("2024-03-01T02:00:00Z", 62500.0)]},
            "next_page_token": null
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1beta3/crypto/us/bars"))
        .and(query_param("symbols", "BTC/USD"))
        .and(query_param("timeframe", "1Hour"))
        .and(query_param("start", "2024-03-01T00:00:00Z"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "bars": {"BTC/USD": [
                bar("2024-03-01T01:00:00Z", 62000.0),
                bar("2024-03-01T00:00:00Z", 61500.5)
            ]},
            "next_page_token": "page-2"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let bars = broker_for(&server)
        .get_bars("BTC/USD", Timeframe::Hour, start)
        .await
        .unwrap();

    let closes: Vec<_> = bars.iter().map(|b| b.close).collect();
    assert_eq!(closes, vec![dec!(61500.5), dec!(62000), dec!(62500)]);
    assert!(bars.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
}

#[tokio::test]
async fn test_stock_bars_with_empty_range() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/stocks/SPY/bars"))
        .and(query_param("timeframe", "1Day"))
        .and(query_param("feed", "iex"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "bars": null,
            "symbol": "SPY",
            "next_page_token": null
        })))
        .mount(&server)
        .await;

    let bars = broker_for(&server)
        .get_bars("SPY", Timeframe::Day, Utc::now())
        .await
        .unwrap();

    assert!(bars.is_empty());
}

// =============================================================================
// Orders
// =============================================================================

#[tokio::test]
async fn test_submit_market_order() {
    let server = MockServer::start().await;
    let order = MarketOrderRequest {
        symbol: "BTC/USD".into(),
        side: OrderSide::Buy,
        qty: dec!(0.500000),
        time_in_force: TimeInForce::Gtc,
        client_order_id: "cid-42".into(),
    };
    Mock::given(method("POST"))
        .and(path("/v2/orders"))
        .and(body_partial_json(json!({
            "symbol": "BTC/USD",
            "qty": "0.5",
            "side": "buy",
            "type": "market",
            "time_in_force": "gtc",
            "client_order_id": "cid-42"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(order_json("ord-1", "cid-42")))
        .expect(1)
        .mount(&server)
        .await;

    let ack = broker_for(&server).submit_market_order(&order).await.unwrap();

    assert_eq!(ack.id, "ord-1");
    assert_eq!(ack.client_order_id, "cid-42");
    assert_eq!(ack.status, "accepted");
}

#[tokio::test]
async fn test_close_position() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/v2/positions/BTCUSD"))
        .respond_with(ResponseTemplate::new(200).set_body_json(order_json("close-1", "")))
        .expect(1)
        .mount(&server)
        .await;

    let ack = broker_for(&server).close_position("BTC/USD").await.unwrap();

    assert_eq!(ack.id, "close-1");
}

// =============================================================================
// Error classification
// =============================================================================

async fn account_error(template: ResponseTemplate) -> BrokerError {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/account"))
        .respond_with(template)
        .mount(&server)
        .await;
    broker_for(&server).get_account().await.unwrap_err()
}

#[tokio::test]
async fn test_rate_limit_is_retryable() {
    let err = account_error(
        ResponseTemplate::new(429)
            .insert_header("Retry-After", "7")
            .set_body_json(json!({"message": "too many requests"})),
    )
    .await;

    assert_eq!(
        err,
        BrokerError::RateLimited {
            retry_after_secs: Some(7)
        }
    );
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_server_error_is_retryable() {
    let err = account_error(ResponseTemplate::new(503).set_body_string("upstream unavailable")).await;

    assert!(matches!(err, BrokerError::Server { status: 503, .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_unauthorized_is_fatal() {
    let err = account_error(
        ResponseTemplate::new(401).set_body_json(json!({"code": 40110000, "message": "request is not authorized"})),
    )
    .await;

    assert_eq!(err, BrokerError::Authentication);
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_malformed_body_is_fatal() {
    let err = account_error(ResponseTemplate::new(200).set_body_string("{not json")).await;

    assert!(matches!(err, BrokerError::InvalidResponse { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_order_rejection_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/orders"))
        .respond_with(
            ResponseTemplate::new(422)
                .set_body_json(json!({"code": 40310000, "message": "qty must be > 0"})),
        )
        .mount(&server)
        .await;
    let order = MarketOrderRequest::new("SPY", OrderSide::Sell, dec!(0), TimeInForce::Day);

    let err = broker_for(&server).submit_market_order(&order).await.unwrap_err();

    assert_eq!(
        err,
        BrokerError::OrderRejected {
            reason: "qty must be > 0".into()
        }
    );
}

#[tokio::test]
async fn test_slow_response_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/clock"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"is_open": false}))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let err = broker_with_timeout(&server, Duration::from_millis(100))
        .is_market_open()
        .await
        .unwrap_err();

    assert_eq!(err, BrokerError::Timeout);
    assert!(err.is_retryable());
}
