//! Rate-limited, cached, retrying façade over the exchange API
//!
//! [`ExchangeGateway::execute`] is the single path to the exchange. Read-only
//! public endpoints are served from [`ResponseCache`] while fresh; every call
//! waits on the shared [`RateLimiter`]; transient failures are retried under
//! [`RetryPolicy`]. The final outcome of each call is reported to the
//! [`ErrorHandler`] before it is returned.

pub mod cache;
pub mod rate_limiter;
pub mod retry;

pub use cache::{CacheStats, ResponseCache};
pub use rate_limiter::RateLimiter;
pub use retry::RetryPolicy;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use crate::clients::{ExchangeTransport, TransportError};
use crate::config::BotConfig;
use crate::core::error_handler::{ErrorCategory, ErrorHandler, ErrorReport, Severity};
use crate::core::types::{
    Balances, BookLevel, Candle, ExchangeOrder, ExchangeOrderStatus, OrderBook, Ticker, TradeSide,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Time,
    Assets,
    AssetPairs,
    Ticker,
    Depth,
    Ohlc,
    Trades,
    Spread,
    Balance,
    OpenOrders,
    QueryOrders,
    AddOrder,
    CancelOrder,
    CancelAll,
}

impl Endpoint {
    /// Kraken method name, also the key of the cache TTL table
    pub fn name(&self) -> &'static str {
        match self {
            Endpoint::Time => "Time",
            Endpoint::Assets => "Assets",
            Endpoint::AssetPairs => "AssetPairs",
            Endpoint::Ticker => "Ticker",
            Endpoint::Depth => "Depth",
            Endpoint::Ohlc => "OHLC",
            Endpoint::Trades => "Trades",
            Endpoint::Spread => "Spread",
            Endpoint::Balance => "Balance",
            Endpoint::OpenOrders => "OpenOrders",
            Endpoint::QueryOrders => "QueryOrders",
            Endpoint::AddOrder => "AddOrder",
            Endpoint::CancelOrder => "CancelOrder",
            Endpoint::CancelAll => "CancelAll",
        }
    }

    pub fn is_private(&self) -> bool {
        matches!(
            self,
            Endpoint::Balance
                | Endpoint::OpenOrders
                | Endpoint::QueryOrders
                | Endpoint::AddOrder
                | Endpoint::CancelOrder
                | Endpoint::CancelAll
        )
    }

    pub fn is_mutating(&self) -> bool {
        matches!(self, Endpoint::AddOrder | Endpoint::CancelOrder | Endpoint::CancelAll)
    }

    /// Only public, idempotent reads are cached
    pub fn is_cacheable(&self) -> bool {
        !self.is_private()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub endpoint: Endpoint,
    pub params: BTreeMap<String, String>,
}

impl ApiRequest {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            params: BTreeMap::new(),
        }
    }

    pub fn param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// Endpoint name plus parameters in sorted order
    pub fn cache_key(&self) -> String {
        let params = self
            .params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        format!("{}:{}", self.endpoint.name(), params)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("server error {0}: {1}")]
    ServerError(u16, String),

    #[error("client error {0}: {1}")]
    ClientError(u16, String),

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Timeout(_)
                | GatewayError::RateLimited(_)
                | GatewayError::ServerError(..)
                | GatewayError::Network(_)
        )
    }

    /// The request may or may not have reached the exchange
    pub fn is_ambiguous(&self) -> bool {
        matches!(
            self,
            GatewayError::Timeout(_) | GatewayError::ServerError(..) | GatewayError::Network(_)
        )
    }
}

impl From<TransportError> for GatewayError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(msg) => GatewayError::Timeout(msg),
            TransportError::Http { status: 408, body } => GatewayError::Timeout(body),
            TransportError::Http { status: 429, body } => GatewayError::RateLimited(body),
            TransportError::Http { status, body } if status >= 500 => GatewayError::ServerError(status, body),
            TransportError::Http { status, body } => GatewayError::ClientError(status, body),
            TransportError::Exchange(msg) => {
                if msg.contains("Rate limit exceeded") {
                    GatewayError::RateLimited(msg)
                } else if msg.contains("EService:Unavailable") || msg.contains("EService:Busy") {
                    GatewayError::ServerError(503, msg)
                } else {
                    GatewayError::ClientError(400, msg)
                }
            }
            TransportError::Network(msg) => GatewayError::Network(msg),
            TransportError::Malformed(msg) => GatewayError::MalformedResponse(msg),
            TransportError::Signing(msg) => GatewayError::ClientError(401, msg),
        }
    }
}

/// Error category and severity for a failed call to `endpoint`
pub fn classify(endpoint: Endpoint, error: &GatewayError) -> (ErrorCategory, Severity) {
    match error {
        GatewayError::Timeout(_) => (ErrorCategory::ApiTimeout, Severity::Medium),
        GatewayError::Network(_) => (ErrorCategory::NetworkError, Severity::Medium),
        GatewayError::RateLimited(_) => (ErrorCategory::ExchangeError, Severity::Low),
        GatewayError::ServerError(..) => (ErrorCategory::ExchangeError, Severity::High),
        GatewayError::ClientError(..) if endpoint == Endpoint::AddOrder => {
            (ErrorCategory::OrderPlacementError, Severity::High)
        }
        GatewayError::ClientError(..) => (ErrorCategory::ExchangeError, Severity::Medium),
        GatewayError::MalformedResponse(_) => (ErrorCategory::DataProcessingError, Severity::Medium),
    }
}

fn success_category(endpoint: Endpoint) -> ErrorCategory {
    if endpoint.is_mutating() {
        ErrorCategory::OrderPlacementError
    } else {
        ErrorCategory::ExchangeError
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GatewayStats {
    pub total_calls: u64,
    pub public_calls: u64,
    pub private_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub cached_calls: u64,
    pub total_attempts: u64,
    pub average_latency_ms: f64,
    pub cache: CacheStats,
}

#[derive(Debug, Default)]
struct StatsInner {
    total_calls: u64,
    public_calls: u64,
    private_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    cached_calls: u64,
    total_attempts: u64,
    latencies_ms: VecDeque<f64>,
}

const LATENCY_WINDOW: usize = 100;

/// New limit order, already rounded to exchange precision
#[derive(Debug, Clone, PartialEq)]
pub struct LimitOrder {
    pub pair: String,
    pub side: TradeSide,
    pub price: String,
    pub volume: String,
    /// Tag for finding the order again after an ambiguous failure
    pub userref: Option<i32>,
}

pub struct ExchangeGateway {
    transport: Arc<dyn ExchangeTransport>,
    limiter: RateLimiter,
    cache: Mutex<ResponseCache>,
    retry: RetryPolicy,
    request_timeout: Duration,
    errors: Arc<ErrorHandler>,
    stats: Mutex<StatsInner>,
}

impl ExchangeGateway {
    pub fn new(transport: Arc<dyn ExchangeTransport>, config: &BotConfig, errors: Arc<ErrorHandler>) -> Self {
        Self::with_parts(
            transport,
            RateLimiter::from_config(&config.rate_limits),
            ResponseCache::from_config(&config.cache),
            RetryPolicy::from_config(&config.retry),
            Duration::from_secs(config.exchange.request_timeout_seconds),
            errors,
        )
    }

    pub fn with_parts(
        transport: Arc<dyn ExchangeTransport>,
        limiter: RateLimiter,
        cache: ResponseCache,
        retry: RetryPolicy,
        request_timeout: Duration,
        errors: Arc<ErrorHandler>,
    ) -> Self {
        Self {
            transport,
            limiter,
            cache: Mutex::new(cache),
            retry,
            request_timeout,
            errors,
            stats: Mutex::new(StatsInner::default()),
        }
    }

    pub fn error_handler(&self) -> &Arc<ErrorHandler> {
        &self.errors
    }

    pub async fn execute(&self, request: &ApiRequest) -> Result<Value, GatewayError> {
        let endpoint = request.endpoint;
        let cacheable = endpoint.is_cacheable();
        let key = request.cache_key();

        {
            let mut stats = self.stats.lock();
            stats.total_calls += 1;
            if endpoint.is_private() {
                stats.private_calls += 1;
            } else {
                stats.public_calls += 1;
            }
        }

        if cacheable {
            let cached = self.cache.lock().get(&key);
            if let Some(value) = cached {
                debug!("📦 Cache hit for {}", key);
                self.stats.lock().cached_calls += 1;
                self.errors.record_success(success_category(endpoint));
                return Ok(value);
            }
        }

        let started = Instant::now();
        let mut attempt: u32 = 0;
        let outcome = loop {
            self.limiter.acquire().await;
            self.stats.lock().total_attempts += 1;

            let result = match timeout(self.request_timeout, self.transport.send(request)).await {
                Ok(result) => result.map_err(GatewayError::from),
                Err(_) => Err(GatewayError::Timeout(format!(
                    "{} exceeded {:?}",
                    endpoint.name(),
                    self.request_timeout
                ))),
            };

            match result {
                Ok(value) => break Ok(value),
                Err(e) if attempt < self.retry.max_retries() && self.retry.should_retry(endpoint, &e) => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "🔄 {} failed (attempt {}), retrying in {:?}: {}",
                        endpoint.name(),
                        attempt + 1,
                        delay,
                        e
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => break Err(e),
            }
        };

        self.record_latency(started.elapsed());

        match outcome {
            Ok(value) => {
                if cacheable {
                    self.cache.lock().insert(key, endpoint.name(), value.clone());
                }
                self.stats.lock().successful_calls += 1;
                self.errors.record_success(success_category(endpoint));
                Ok(value)
            }
            Err(e) => {
                self.stats.lock().failed_calls += 1;
                let (category, severity) = classify(endpoint, &e);
                self.errors.record(
                    ErrorReport::new(category, severity, e.to_string())
                        .with_context(format!("{} after {} attempt(s)", endpoint.name(), attempt + 1)),
                );
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> GatewayStats {
        let cache = self.cache.lock().stats();
        let stats = self.stats.lock();
        let average_latency_ms = if stats.latencies_ms.is_empty() {
            0.0
        } else {
            stats.latencies_ms.iter().sum::<f64>() / stats.latencies_ms.len() as f64
        };

        GatewayStats {
            total_calls: stats.total_calls,
            public_calls: stats.public_calls,
            private_calls: stats.private_calls,
            successful_calls: stats.successful_calls,
            failed_calls: stats.failed_calls,
            cached_calls: stats.cached_calls,
            total_attempts: stats.total_attempts,
            average_latency_ms,
            cache,
        }
    }

    pub fn invalidate(&self, request: &ApiRequest) -> bool {
        self.cache.lock().invalidate(&request.cache_key())
    }

    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    fn record_latency(&self, elapsed: Duration) {
        let mut stats = self.stats.lock();
        stats.latencies_ms.push_back(elapsed.as_secs_f64() * 1000.0);
        while stats.latencies_ms.len() > LATENCY_WINDOW {
            stats.latencies_ms.pop_front();
        }
    }

    /// Responses that parse but have the wrong shape abort the operation.
    /// A cached copy of the bad response is dropped.
    fn malformed(&self, request: &ApiRequest, msg: impl Into<String>) -> GatewayError {
        let msg = msg.into();
        if request.endpoint.is_cacheable() {
            self.invalidate(request);
        }
        self.errors.record(
            ErrorReport::new(ErrorCategory::DataProcessingError, Severity::Medium, msg.clone())
                .with_context(request.endpoint.name()),
        );
        GatewayError::MalformedResponse(msg)
    }

    // ── Typed operations ──────────────────────────────────────────────

    pub async fn server_time(&self) -> Result<DateTime<Utc>, GatewayError> {
        let request = ApiRequest::new(Endpoint::Time);
        let result = self.execute(&request).await?;
        result
            .get("unixtime")
            .and_then(Value::as_i64)
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .ok_or_else(|| self.malformed(&request, "missing unixtime"))
    }

    pub async fn ticker(&self, pair: &str) -> Result<Ticker, GatewayError> {
        let request = ApiRequest::new(Endpoint::Ticker).param("pair", pair);
        let result = self.execute(&request).await?;

        let parse = || -> Option<Ticker> {
            let data = first_pair_entry(&result)?;
            Some(Ticker {
                last: parse_f64(data.get("c")?.get(0)?)?,
                ask: parse_f64(data.get("a")?.get(0)?)?,
                bid: parse_f64(data.get("b")?.get(0)?)?,
            })
        };

        match parse() {
            Some(ticker) if ticker.last > 0.0 => Ok(ticker),
            _ => Err(self.malformed(&request, format!("unexpected ticker shape for {}", pair))),
        }
    }

    pub async fn order_book(&self, pair: &str, depth: u32) -> Result<OrderBook, GatewayError> {
        let request = ApiRequest::new(Endpoint::Depth)
            .param("pair", pair)
            .param("count", depth.to_string());
        let result = self.execute(&request).await?;

        let side = |data: &Value, key: &str| -> Option<Vec<BookLevel>> {
            data.get(key)?
                .as_array()?
                .iter()
                .map(|row| {
                    Some(BookLevel {
                        price: parse_f64(row.get(0)?)?,
                        volume: parse_f64(row.get(1)?)?,
                    })
                })
                .collect()
        };

        first_pair_entry(&result)
            .and_then(|data| {
                Some(OrderBook {
                    bids: side(data, "bids")?,
                    asks: side(data, "asks")?,
                })
            })
            .ok_or_else(|| self.malformed(&request, format!("unexpected order book shape for {}", pair)))
    }

    pub async fn balances(&self) -> Result<Balances, GatewayError> {
        let request = ApiRequest::new(Endpoint::Balance);
        let result = self.execute(&request).await?;
        let map = result
            .as_object()
            .ok_or_else(|| self.malformed(&request, "balance result is not an object"))?;

        let mut assets = HashMap::new();
        for (asset, amount) in map {
            let amount = parse_f64(amount)
                .ok_or_else(|| self.malformed(&request, format!("bad amount for {}", asset)))?;
            assets.insert(asset.clone(), amount);
        }
        Ok(Balances { assets })
    }

    pub async fn query_orders(&self, order_ids: &[String]) -> Result<HashMap<String, ExchangeOrder>, GatewayError> {
        if order_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let request = ApiRequest::new(Endpoint::QueryOrders).param("txid", order_ids.join(","));
        let result = self.execute(&request).await?;
        let map = result
            .as_object()
            .ok_or_else(|| self.malformed(&request, "order query result is not an object"))?;
        self.parse_orders(&request, map)
    }

    /// Orders still on the book, optionally only those tagged with `userref`
    pub async fn open_orders(&self, userref: Option<i32>) -> Result<HashMap<String, ExchangeOrder>, GatewayError> {
        let mut request = ApiRequest::new(Endpoint::OpenOrders);
        if let Some(userref) = userref {
            request = request.param("userref", userref.to_string());
        }

        let result = self.execute(&request).await?;
        let map = result
            .get("open")
            .and_then(Value::as_object)
            .ok_or_else(|| self.malformed(&request, "OpenOrders returned no open map"))?;
        self.parse_orders(&request, map)
    }

    fn parse_orders(
        &self,
        request: &ApiRequest,
        map: &serde_json::Map<String, Value>,
    ) -> Result<HashMap<String, ExchangeOrder>, GatewayError> {
        let mut orders = HashMap::new();
        for (order_id, info) in map {
            let order = parse_exchange_order(order_id, info)
                .ok_or_else(|| self.malformed(request, format!("unexpected shape for order {}", order_id)))?;
            orders.insert(order_id.clone(), order);
        }
        Ok(orders)
    }

    /// OHLC bars of `interval_minutes`, oldest first
    pub async fn ohlc(
        &self,
        pair: &str,
        interval_minutes: u32,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Candle>, GatewayError> {
        let mut request = ApiRequest::new(Endpoint::Ohlc)
            .param("pair", pair)
            .param("interval", interval_minutes.to_string());
        if let Some(since) = since {
            request = request.param("since", since.timestamp().to_string());
        }

        let result = self.execute(&request).await?;
        // The bars sit under the exchange's pair name, next to a "last" cursor
        let rows = result
            .as_object()
            .and_then(|map| map.iter().find(|(key, _)| key.as_str() != "last"))
            .and_then(|(_, rows)| rows.as_array())
            .ok_or_else(|| self.malformed(&request, format!("unexpected OHLC shape for {}", pair)))?;

        let mut candles = rows
            .iter()
            .map(parse_candle)
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| self.malformed(&request, format!("unexpected OHLC row for {}", pair)))?;
        candles.sort_by_key(|c| c.time);
        Ok(candles)
    }

    /// Submit a limit order, returning the exchange order id
    pub async fn place_limit_order(&self, order: &LimitOrder) -> Result<String, GatewayError> {
        let mut request = ApiRequest::new(Endpoint::AddOrder)
            .param("pair", order.pair.clone())
            .param("type", order.side.as_str())
            .param("ordertype", "limit")
            .param("price", order.price.clone())
            .param("volume", order.volume.clone());
        if let Some(userref) = order.userref {
            request = request.param("userref", userref.to_string());
        }

        let result = self.execute(&request).await?;
        result
            .get("txid")
            .and_then(Value::as_array)
            .and_then(|ids| ids.first())
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| self.malformed(&request, "AddOrder returned no txid"))
    }

    /// Cancel one order, returning how many orders the exchange canceled
    pub async fn cancel_order(&self, order_id: &str) -> Result<u64, GatewayError> {
        let request = ApiRequest::new(Endpoint::CancelOrder).param("txid", order_id);
        let result = self.execute(&request).await?;
        result
            .get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| self.malformed(&request, "CancelOrder returned no count"))
    }
}

/// Kraken keys pair data by its own pair name (e.g. `XXRPZGBP`)
fn first_pair_entry(result: &Value) -> Option<&Value> {
    result.as_object()?.values().next()
}

/// Kraken encodes decimals as strings
pub(crate) fn parse_f64(value: &Value) -> Option<f64> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// `[time, open, high, low, close, vwap, volume, count]`
fn parse_candle(row: &Value) -> Option<Candle> {
    let row = row.as_array()?;
    let field = |i: usize| row.get(i).and_then(parse_f64);
    Some(Candle {
        time: Utc.timestamp_opt(row.first()?.as_i64()?, 0).single()?,
        open: field(1)?,
        high: field(2)?,
        low: field(3)?,
        close: field(4)?,
        vwap: field(5)?,
        volume: field(6)?,
        trades: row.get(7).and_then(Value::as_u64).unwrap_or(0),
    })
}

fn parse_exchange_order(order_id: &str, info: &Value) -> Option<ExchangeOrder> {
    let status = ExchangeOrderStatus::parse(info.get("status")?.as_str()?)?;
    let average_price = info
        .get("price")
        .and_then(parse_f64)
        .filter(|p| *p > 0.0);
    let closed_at = info
        .get("closetm")
        .and_then(parse_f64)
        .and_then(|ts| Utc.timestamp_opt(ts.trunc() as i64, 0).single());

    Some(ExchangeOrder {
        order_id: order_id.to_string(),
        status,
        volume: info.get("vol").and_then(parse_f64).unwrap_or(0.0),
        volume_executed: info.get("vol_exec").and_then(parse_f64).unwrap_or(0.0),
        cost: info.get("cost").and_then(parse_f64).unwrap_or(0.0),
        fee: info.get("fee").and_then(parse_f64).unwrap_or(0.0),
        average_price,
        closed_at,
    })
}
