// Kraken REST client with request signing

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::{Digest, Sha256, Sha512};
use std::time::Duration;
use tracing::debug;

use crate::clients::{ExchangeTransport, TransportError};
use crate::config::ExchangeConfig;
use crate::gateway::ApiRequest;

type HmacSha512 = Hmac<Sha512>;

pub struct KrakenRestClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl std::fmt::Debug for KrakenRestClient {
    // Credentials stay out of debug output
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KrakenRestClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl KrakenRestClient {
    pub fn new(config: &ExchangeConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .user_agent(concat!("xrp-grid-bot/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.rest_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
        })
    }

    /// API-Sign = base64(HMAC-SHA512(base64decode(secret), path + SHA256(nonce + body)))
    pub fn sign(secret: &str, path: &str, nonce: u64, body: &str) -> Result<String, TransportError> {
        let key = STANDARD
            .decode(secret)
            .map_err(|e| TransportError::Signing(format!("API secret is not valid base64: {}", e)))?;

        let mut sha = Sha256::new();
        sha.update(nonce.to_string().as_bytes());
        sha.update(body.as_bytes());
        let digest = sha.finalize();

        let mut mac = HmacSha512::new_from_slice(&key).map_err(|e| TransportError::Signing(e.to_string()))?;
        mac.update(path.as_bytes());
        mac.update(&digest);

        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    fn encode_params<'a>(params: impl Iterator<Item = (&'a String, &'a String)>) -> String {
        params
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    fn nonce() -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }

    fn path_for(request: &ApiRequest) -> String {
        let visibility = if request.endpoint.is_private() { "private" } else { "public" };
        format!("/0/{}/{}", visibility, request.endpoint.name())
    }

    /// Unwrap Kraken's `{"error": [...], "result": ...}` envelope
    pub fn parse_envelope(json: Value) -> Result<Value, TransportError> {
        let errors: Vec<String> = json
            .get("error")
            .and_then(|e| e.as_array())
            .map(|arr| arr.iter().filter_map(|e| e.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        if !errors.is_empty() {
            return Err(TransportError::Exchange(errors.join("; ")));
        }

        match json.get("result") {
            Some(result) => Ok(result.clone()),
            None => Err(TransportError::Malformed("response has no result field".to_string())),
        }
    }
}

#[async_trait]
impl ExchangeTransport for KrakenRestClient {
    async fn send(&self, request: &ApiRequest) -> Result<Value, TransportError> {
        let path = Self::path_for(request);
        let url = format!("{}{}", self.base_url, path);

        let builder = if request.endpoint.is_private() {
            if self.api_key.is_empty() || self.api_secret.is_empty() {
                return Err(TransportError::Signing("API credentials are not configured".to_string()));
            }

            let nonce = Self::nonce();
            let nonce_str = nonce.to_string();
            let nonce_key = "nonce".to_string();
            let body = Self::encode_params(std::iter::once((&nonce_key, &nonce_str)).chain(request.params.iter()));
            let signature = Self::sign(&self.api_secret, &path, nonce, &body)?;

            self.client
                .post(&url)
                .header("API-Key", &self.api_key)
                .header("API-Sign", signature)
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(body)
        } else {
            self.client
                .post(&url)
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(Self::encode_params(request.params.iter()))
        };

        debug!("➡️  {} {}", request.endpoint.name(), path);

        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(TransportError::Http {
                status: status.as_u16(),
                body: text.chars().take(200).collect(),
            });
        }

        let json: Value = serde_json::from_str(&text).map_err(|e| TransportError::Malformed(e.to_string()))?;
        Self::parse_envelope(json)
    }
}
