//! Thin authenticated HTTP client for the Alpaca REST APIs.
//!
//! One request per call. Failures are classified into [`AlpacaError`]
//! variants; retrying is left to the caller.

use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::api_types::AlpacaErrorResponse;
use super::config::AlpacaConfig;
use super::error::AlpacaError;

/// Which Alpaca API a request targets.
#[derive(Debug, Clone, Copy)]
pub enum Api {
    /// Trading API (account, positions, orders, clock).
    Trading,
    /// Market data API (bars).
    Data,
}

/// HTTP client for Alpaca API.
#[derive(Debug, Clone)]
pub struct AlpacaHttpClient {
    client: Client,
    api_key: String,
    api_secret: String,
    trading_base_url: String,
    data_base_url: String,
}

impl AlpacaHttpClient {
    /// Create a new HTTP client from config.
    pub fn new(config: &AlpacaConfig) -> Result<Self, AlpacaError> {
        if config.api_key.is_empty() || config.api_secret.is_empty() {
            return Err(AlpacaError::AuthenticationFailed);
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("trend-bot/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AlpacaError::Config(e.to_string()))?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            trading_base_url: config.trading_base_url().trim_end_matches('/').to_string(),
            data_base_url: config.data_base_url().trim_end_matches('/').to_string(),
        })
    }

    /// GET with query parameters.
    pub async fn get<T, Q>(&self, api: Api, path: &str, query: &Q) -> Result<T, AlpacaError>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized + Sync,
    {
        let request = self.request(Method::GET, api, path).query(query);
        self.send(request, path).await
    }

    /// POST a JSON body to the trading API.
    pub async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, AlpacaError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized + Sync,
    {
        let request = self.request(Method::POST, Api::Trading, path).json(body);
        self.send(request, path).await
    }

    /// DELETE on the trading API.
    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, AlpacaError> {
        let request = self.request(Method::DELETE, Api::Trading, path);
        self.send(request, path).await
    }

    fn request(&self, method: Method, api: Api, path: &str) -> RequestBuilder {
        let base = match api {
            Api::Trading => &self.trading_base_url,
            Api::Data => &self.data_base_url,
        };
        self.client
            .request(method, format!("{base}{path}"))
            .header("APCA-API-KEY-ID", &self.api_key)
            .header("APCA-API-SECRET-KEY", &self.api_secret)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        path: &str,
    ) -> Result<T, AlpacaError> {
        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            let text = response.text().await?;
            let text = if text.is_empty() { "null" } else { text.as_str() };
            return serde_json::from_str(text).map_err(|e| AlpacaError::JsonParse(e.to_string()));
        }

        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let error_body = response.text().await.unwrap_or_default();
        let (code, message) = match serde_json::from_str::<AlpacaErrorResponse>(&error_body) {
            Ok(err) => (
                err.code
                    .map_or_else(|| status.as_u16().to_string(), |c| c.to_string()),
                err.message,
            ),
            Err(_) => (status.as_u16().to_string(), error_body),
        };

        tracing::debug!(
            status = status.as_u16(),
            code = %code,
            message = %message,
            path,
            "Alpaca request failed"
        );

        Err(match status {
            StatusCode::UNAUTHORIZED => AlpacaError::AuthenticationFailed,
            StatusCode::FORBIDDEN => AlpacaError::Forbidden(message),
            StatusCode::NOT_FOUND => AlpacaError::NotFound {
                path: path.to_string(),
            },
            StatusCode::UNPROCESSABLE_ENTITY => AlpacaError::OrderRejected(message),
            StatusCode::TOO_MANY_REQUESTS => AlpacaError::RateLimited {
                retry_after_secs: retry_after,
            },
            _ => AlpacaError::Api {
                status: status.as_u16(),
                code,
                message,
            },
        })
    }
}
