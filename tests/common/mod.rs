// Common test utilities and helpers
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use xrp_grid_bot::clients::{ExchangeTransport, TransportError};
use xrp_grid_bot::config::BotConfig;
use xrp_grid_bot::core::types::{Trade, TradeSide, TradeStatus};
use xrp_grid_bot::gateway::{ApiRequest, Endpoint};

/// Create a test configuration with sensible defaults: a small grid, no
/// throttling, no ticker caching and instant retries
pub fn create_test_config() -> BotConfig {
    let mut config = BotConfig::default();
    config.exchange.api_key = "test-key".to_string();
    config.exchange.api_secret = "dGVzdC1zZWNyZXQ=".to_string();

    config.trading.grid_levels = 4;
    config.trading.grid_range_percentage = 4.0;
    config.trading.total_allocation = 1000.0;
    config.trading.tick_deadline_seconds = 60;

    config.rate_limits.max_requests_per_second = 1000.0;
    config.rate_limits.max_requests_per_minute = 100_000;

    config.cache.ttl_seconds.insert("Ticker".to_string(), 0);

    config.retry.max_retries = 2;
    config.retry.base_delay_seconds = 0.0;
    config.retry.max_delay_seconds = 0.0;

    config
}

/// Create a temporary directory for test databases
pub fn create_temp_db_dir() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let db_path = temp_dir.path().join("test.db");
    (temp_dir, db_path)
}

/// Generate a random-walk price series
pub fn generate_test_prices(base_price: f64, count: usize, volatility: f64, seed: u64) -> Vec<f64> {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut prices = Vec::with_capacity(count);
    let mut current_price = base_price;

    for _ in 0..count {
        let change_pct = rng.gen_range(-volatility..volatility);
        current_price *= 1.0 + change_pct;
        prices.push(current_price);
    }

    prices
}

/// A filled trade, as the order desk would record it after reconciliation
pub fn filled_trade(side: TradeSide, price: f64, volume: f64, fee: f64, minutes_ago: i64) -> Trade {
    let at = Utc::now() - chrono::Duration::minutes(minutes_ago);
    let mut trade = Trade::new("XRPGBP", side, price, volume, at - chrono::Duration::minutes(1));
    trade.status = TradeStatus::Filled;
    trade.external_order_id = Some(format!("O-{}", trade.id));
    trade.filled_volume = volume;
    trade.actual_price = Some(price);
    trade.cost = price * volume;
    trade.fee = fee;
    trade.filled_at = Some(at);
    trade.updated_at = at;
    trade
}

#[derive(Debug, Clone)]
pub struct MockOrder {
    pub side: TradeSide,
    pub price: f64,
    pub volume: f64,
    pub status: &'static str,
    pub volume_executed: f64,
    pub closed_at: Option<i64>,
    pub userref: Option<i32>,
}

#[derive(Debug, Default)]
struct MockState {
    price: f64,
    balances: HashMap<String, f64>,
    orders: BTreeMap<String, MockOrder>,
    next_id: u64,
    calls: Vec<(Endpoint, BTreeMap<String, String>)>,
    cancel_error: Option<TransportError>,
    failing_orders: HashSet<String>,
    rejecting_orders: bool,
    add_order_delay: Option<Duration>,
    /// Some(accepted): AddOrder times out, after booking the order if accepted
    add_order_timeout: Option<bool>,
    /// QueryOrders calls beyond this many time out
    queries_before_failure: Option<usize>,
    daily_closes: Vec<f64>,
}

/// In-memory exchange speaking the Kraken result shapes
#[derive(Debug, Default)]
pub struct MockExchange {
    state: Mutex<MockState>,
}

impl MockExchange {
    pub fn new(price: f64, base: f64, quote: f64) -> Arc<Self> {
        let exchange = Self::default();
        {
            let mut state = exchange.state.lock();
            state.price = price;
            state.balances.insert("XXRP".to_string(), base);
            state.balances.insert("ZGBP".to_string(), quote);
        }
        Arc::new(exchange)
    }

    pub fn set_price(&self, price: f64) {
        self.state.lock().price = price;
    }

    /// Every CancelOrder call fails with a non-retryable exchange error
    pub fn fail_cancels(&self, failing: bool) {
        self.state.lock().cancel_error =
            failing.then(|| TransportError::Exchange("EGeneral:Internal error".to_string()));
    }

    /// Every CancelOrder call fails with `error`
    pub fn fail_cancels_with(&self, error: TransportError) {
        self.state.lock().cancel_error = Some(error);
    }

    /// CancelOrder fails for this one order only
    pub fn fail_cancel_of(&self, order_id: &str) {
        self.state.lock().failing_orders.insert(order_id.to_string());
    }

    pub fn reject_orders(&self, rejecting: bool) {
        self.state.lock().rejecting_orders = rejecting;
    }

    pub fn delay_add_order(&self, delay: Duration) {
        self.state.lock().add_order_delay = Some(delay);
    }

    /// AddOrder times out; `accepted` decides whether the order was booked anyway
    pub fn time_out_add_orders(&self, accepted: bool) {
        self.state.lock().add_order_timeout = Some(accepted);
    }

    /// Let `count` QueryOrders calls through, then time out every later one
    pub fn fail_queries_after(&self, count: usize) {
        self.state.lock().queries_before_failure = Some(count);
    }

    /// Daily bars ending today, one per close
    pub fn set_daily_closes(&self, closes: &[f64]) {
        self.state.lock().daily_closes = closes.to_vec();
    }

    /// Execute part of an open order, leaving it on the book
    pub fn partial_fill(&self, order_id: &str, volume: f64) {
        if let Some(order) = self.state.lock().orders.get_mut(order_id) {
            order.volume_executed = volume.min(order.volume);
        }
    }

    /// Fully execute an open order at its limit price
    pub fn fill(&self, order_id: &str) {
        let mut state = self.state.lock();
        if let Some(order) = state.orders.get_mut(order_id) {
            order.status = "closed";
            order.volume_executed = order.volume;
            order.closed_at = Some(Utc::now().timestamp());
        }
    }

    pub fn order(&self, order_id: &str) -> Option<MockOrder> {
        self.state.lock().orders.get(order_id).cloned()
    }

    /// Open orders as (id, order), lowest price first
    pub fn open_orders(&self) -> Vec<(String, MockOrder)> {
        let mut open: Vec<(String, MockOrder)> = self
            .state
            .lock()
            .orders
            .iter()
            .filter(|(_, o)| o.status == "open")
            .map(|(id, o)| (id.clone(), o.clone()))
            .collect();
        open.sort_by(|a, b| a.1.price.total_cmp(&b.1.price));
        open
    }

    pub fn calls(&self) -> Vec<Endpoint> {
        self.state.lock().calls.iter().map(|(e, _)| *e).collect()
    }

    /// Parameters of every call to `endpoint`, oldest first
    pub fn params_of(&self, endpoint: Endpoint) -> Vec<BTreeMap<String, String>> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(e, _)| *e == endpoint)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn call_count(&self, endpoint: Endpoint) -> usize {
        self.state.lock().calls.iter().filter(|(e, _)| *e == endpoint).count()
    }

    /// How many CancelOrder calls named `order_id`
    pub fn cancel_attempts(&self, order_id: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(e, p)| *e == Endpoint::CancelOrder && p.get("txid").map(String::as_str) == Some(order_id))
            .count()
    }

    fn ticker(state: &MockState) -> Value {
        let price = format!("{:.5}", state.price);
        json!({ "XXRPZGBP": { "c": [price, "10.0"], "a": [price, "1", "1.0"], "b": [price, "1", "1.0"] } })
    }

    fn add_order(state: &mut MockState, params: &BTreeMap<String, String>) -> Result<Value, TransportError> {
        if state.rejecting_orders {
            return Err(TransportError::Exchange("EOrder:Insufficient funds".to_string()));
        }
        let parse = |key: &str| -> Result<f64, TransportError> {
            params
                .get(key)
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| TransportError::Exchange(format!("EGeneral:Invalid arguments:{}", key)))
        };
        let side = match params.get("type").map(String::as_str) {
            Some("buy") => TradeSide::Buy,
            Some("sell") => TradeSide::Sell,
            _ => return Err(TransportError::Exchange("EGeneral:Invalid arguments:type".to_string())),
        };
        let (price, volume) = (parse("price")?, parse("volume")?);
        let userref = params.get("userref").and_then(|v| v.parse().ok());
        if state.add_order_timeout == Some(false) {
            return Err(TransportError::Timeout("AddOrder".to_string()));
        }

        state.next_id += 1;
        let id = format!("OMOCK-{:05}", state.next_id);
        state.orders.insert(
            id.clone(),
            MockOrder {
                side,
                price,
                volume,
                status: "open",
                volume_executed: 0.0,
                closed_at: None,
                userref,
            },
        );
        if state.add_order_timeout == Some(true) {
            return Err(TransportError::Timeout("AddOrder".to_string()));
        }
        Ok(json!({ "descr": { "order": format!("{} {} @ limit {}", side, volume, price) }, "txid": [id] }))
    }

    fn cancel_order(state: &mut MockState, params: &BTreeMap<String, String>) -> Result<Value, TransportError> {
        let id = params.get("txid").cloned().unwrap_or_default();
        if let Some(error) = &state.cancel_error {
            return Err(error.clone());
        }
        if state.failing_orders.contains(&id) {
            return Err(TransportError::Exchange("EGeneral:Internal error".to_string()));
        }
        match state.orders.get_mut(&id) {
            Some(order) if order.status == "open" => {
                order.status = "canceled";
                Ok(json!({ "count": 1 }))
            }
            _ => Err(TransportError::Exchange("EOrder:Unknown order".to_string())),
        }
    }

    fn order_info(order: &MockOrder) -> Value {
        let cost = order.volume_executed * order.price;
        json!({
            "status": order.status,
            "userref": order.userref,
            "vol": format!("{:.8}", order.volume),
            "vol_exec": format!("{:.8}", order.volume_executed),
            "cost": format!("{:.8}", cost),
            "fee": format!("{:.8}", cost * 0.0016),
            "price": if order.volume_executed > 0.0 { format!("{:.5}", order.price) } else { "0.00000".to_string() },
            "closetm": order.closed_at,
        })
    }

    fn query_orders(state: &MockState, params: &BTreeMap<String, String>) -> Result<Value, TransportError> {
        let queries = state.calls.iter().filter(|(e, _)| *e == Endpoint::QueryOrders).count();
        if state.queries_before_failure.is_some_and(|allowed| queries > allowed) {
            return Err(TransportError::Timeout("QueryOrders".to_string()));
        }

        let mut result = Map::new();
        for id in params.get("txid").map(|s| s.split(',')).into_iter().flatten() {
            if let Some(order) = state.orders.get(id) {
                result.insert(id.to_string(), Self::order_info(order));
            }
        }
        Ok(Value::Object(result))
    }

    fn open_orders_response(state: &MockState, params: &BTreeMap<String, String>) -> Value {
        let userref: Option<i32> = params.get("userref").and_then(|v| v.parse().ok());
        let open: Map<String, Value> = state
            .orders
            .iter()
            .filter(|(_, o)| o.status == "open")
            .filter(|(_, o)| userref.is_none() || o.userref == userref)
            .map(|(id, o)| (id.clone(), Self::order_info(o)))
            .collect();
        json!({ "open": open })
    }

    fn ohlc(state: &MockState) -> Value {
        let today = Utc::now().timestamp() / 86_400 * 86_400;
        let days = state.daily_closes.len() as i64;
        let rows: Vec<Value> = state
            .daily_closes
            .iter()
            .enumerate()
            .map(|(i, close)| {
                let time = today - (days - 1 - i as i64) * 86_400;
                let close = format!("{:.5}", close);
                json!([time, close, close, close, close, close, "1000.0", 10])
            })
            .collect();
        json!({ "XXRPZGBP": rows, "last": today })
    }
}

#[async_trait]
impl ExchangeTransport for MockExchange {
    async fn send(&self, request: &ApiRequest) -> Result<Value, TransportError> {
        let delay = {
            let mut state = self.state.lock();
            state.calls.push((request.endpoint, request.params.clone()));
            match request.endpoint {
                Endpoint::AddOrder => state.add_order_delay,
                _ => None,
            }
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        match request.endpoint {
            Endpoint::Time => Ok(json!({ "unixtime": Utc::now().timestamp() })),
            Endpoint::Ticker => Ok(Self::ticker(&state)),
            Endpoint::Balance => Ok(Value::Object(
                state
                    .balances
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(format!("{:.8}", v))))
                    .collect(),
            )),
            Endpoint::AddOrder => Self::add_order(&mut state, &request.params),
            Endpoint::CancelOrder => Self::cancel_order(&mut state, &request.params),
            Endpoint::QueryOrders => Self::query_orders(&state, &request.params),
            Endpoint::OpenOrders => Ok(Self::open_orders_response(&state, &request.params)),
            Endpoint::Ohlc => Ok(Self::ohlc(&state)),
            other => Err(TransportError::Exchange(format!("EGeneral:Unknown method {}", other.name()))),
        }
    }
}
