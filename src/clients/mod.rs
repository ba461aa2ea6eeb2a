// External API clients

pub mod kraken_rest;

pub use kraken_rest::KrakenRestClient;

use async_trait::async_trait;
use serde_json::Value;

use crate::gateway::ApiRequest;

/// Raw transport failures, before the gateway classifies them
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Errors reported in the exchange's own `error` array
    #[error("exchange error: {0}")]
    Exchange(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("signing error: {0}")]
    Signing(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout(err.to_string())
        } else if err.is_decode() {
            TransportError::Malformed(err.to_string())
        } else if let Some(status) = err.status() {
            TransportError::Http {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

/// One round trip to the exchange. Implementations return the `result`
/// payload of a successful call.
#[async_trait]
pub trait ExchangeTransport: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> Result<Value, TransportError>;
}
