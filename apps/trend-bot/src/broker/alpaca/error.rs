//! Alpaca-specific error types.

use thiserror::Error;

use crate::broker::BrokerError;

/// Errors from the Alpaca adapter.
#[derive(Debug, Error, Clone)]
pub enum AlpacaError {
    /// Transport failure (connect, TLS, body read).
    #[error("Network error: {0}")]
    Network(String),

    /// The request timed out.
    #[error("Request timed out")]
    Timeout,

    /// API returned an error.
    #[error("API error {status}: {code} - {message}")]
    Api {
        /// HTTP status.
        status: u16,
        /// Error code from the API.
        code: String,
        /// Error message from the API.
        message: String,
    },

    /// Order was rejected.
    #[error("Order rejected: {0}")]
    OrderRejected(String),

    /// Authentication failed.
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// Forbidden (e.g. insufficient permissions or buying power).
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Resource not found.
    #[error("Not found: {path}")]
    NotFound {
        /// Request path.
        path: String,
    },

    /// Rate limited.
    #[error("Rate limited")]
    RateLimited {
        /// Suggested retry delay in seconds.
        retry_after_secs: Option<u64>,
    },

    /// JSON parsing error.
    #[error("JSON parsing error: {0}")]
    JsonParse(String),

    /// Adapter misconfiguration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<reqwest::Error> for AlpacaError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::JsonParse(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<AlpacaError> for BrokerError {
    fn from(err: AlpacaError) -> Self {
        match err {
            AlpacaError::Network(message) => Self::Connection { message },
            AlpacaError::Timeout => Self::Timeout,
            AlpacaError::Api {
                status,
                code,
                message,
            } => {
                let message = format!("{code}: {message}");
                if status == 408 || status >= 500 {
                    Self::Server { status, message }
                } else {
                    Self::InvalidRequest { status, message }
                }
            }
            AlpacaError::OrderRejected(reason) => Self::OrderRejected { reason },
            AlpacaError::AuthenticationFailed => Self::Authentication,
            AlpacaError::Forbidden(message) => Self::Forbidden { message },
            AlpacaError::NotFound { path } => Self::NotFound { resource: path },
            AlpacaError::RateLimited { retry_after_secs } => Self::RateLimited { retry_after_secs },
            AlpacaError::JsonParse(message) | AlpacaError::Config(message) => {
                Self::InvalidResponse { message }
            }
        }
    }
}
