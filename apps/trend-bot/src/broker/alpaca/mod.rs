//! Alpaca Markets Broker Adapter
//!
//! Implementation of `BrokerPort` for the Alpaca trading and market data
//! REST APIs:
//! - Account, position, clock and order endpoints
//! - Paginated crypto and stock bar history
//! - Status-based error classification (no internal retries)

mod adapter;
mod api_types;
mod config;
mod error;
mod http_client;

pub use adapter::AlpacaBroker;
pub use config::{AlpacaConfig, AlpacaEnvironment};
pub use error::AlpacaError;
