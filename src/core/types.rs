// Common types used across the bot

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(TradeSide::Buy),
            "sell" => Some(TradeSide::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order lifecycle: pending → open → {filled | canceled | failed}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Pending,
    Open,
    Filled,
    Canceled,
    Failed,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Pending => "pending",
            TradeStatus::Open => "open",
            TradeStatus::Filled => "filled",
            TradeStatus::Canceled => "canceled",
            TradeStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TradeStatus::Pending),
            "open" => Some(TradeStatus::Open),
            "filled" => Some(TradeStatus::Filled),
            "canceled" => Some(TradeStatus::Canceled),
            "failed" => Some(TradeStatus::Failed),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            TradeStatus::Pending => 0,
            TradeStatus::Open => 1,
            TradeStatus::Filled | TradeStatus::Canceled | TradeStatus::Failed => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }

    /// Whether moving from `self` to `next` is a legal forward step.
    /// Re-recording the same status is allowed (fill progress on an open order).
    pub fn can_transition_to(&self, next: TradeStatus) -> bool {
        if *self == next {
            return true;
        }
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single order and its execution record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub pair: String,
    pub side: TradeSide,
    pub requested_price: f64,
    pub requested_volume: f64,
    pub status: TradeStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
    pub external_order_id: Option<String>,
    pub filled_volume: f64,
    pub actual_price: Option<f64>,
    pub cost: f64,
    pub fee: f64,
    /// Grid generation the order belongs to (None for reinvestment orders)
    pub generation: Option<i64>,
    pub level_index: Option<usize>,
}

impl Trade {
    pub fn new(pair: &str, side: TradeSide, price: f64, volume: f64, now: DateTime<Utc>) -> Self {
        Trade {
            id: uuid::Uuid::new_v4().to_string(),
            pair: pair.to_string(),
            side,
            requested_price: price,
            requested_volume: volume,
            status: TradeStatus::Pending,
            created_at: now,
            updated_at: now,
            filled_at: None,
            external_order_id: None,
            filled_volume: 0.0,
            actual_price: None,
            cost: 0.0,
            fee: 0.0,
            generation: None,
            level_index: None,
        }
    }

    pub fn with_level(mut self, generation: i64, level_index: usize) -> Self {
        self.generation = Some(generation);
        self.level_index = Some(level_index);
        self
    }

    /// Execution price, falling back to the limit price
    pub fn execution_price(&self) -> f64 {
        self.actual_price.unwrap_or(self.requested_price)
    }

    /// Time used to order fills chronologically
    pub fn fill_time(&self) -> DateTime<Utc> {
        self.filled_at.unwrap_or(self.created_at)
    }

    /// Kraken `userref` tag sent with the order, derived from the trade id
    pub fn userref(&self) -> i32 {
        let hex: String = self.id.chars().filter(char::is_ascii_hexdigit).take(8).collect();
        (u32::from_str_radix(&hex, 16).unwrap_or(0) & 0x7fff_ffff) as i32
    }

    pub fn is_live(&self) -> bool {
        matches!(self.status, TradeStatus::Pending | TradeStatus::Open)
    }

    /// Compares the write-once execution fields of two filled records
    pub fn same_execution(&self, other: &Trade) -> bool {
        self.filled_volume == other.filled_volume
            && self.actual_price == other.actual_price
            && self.cost == other.cost
            && self.fee == other.fee
            // The ledger keeps timestamps to the microsecond
            && self.filled_at.map(|t| t.timestamp_micros()) == other.filled_at.map(|t| t.timestamp_micros())
            && self.external_order_id == other.external_order_id
    }
}

/// Which side of the reference price a level sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelSide {
    Buy,
    Sell,
    /// Exactly at the reference price; no order is kept here
    AtReference,
}

impl LevelSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            LevelSide::Buy => "buy",
            LevelSide::Sell => "sell",
            LevelSide::AtReference => "at_reference",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(LevelSide::Buy),
            "sell" => Some(LevelSide::Sell),
            "at_reference" => Some(LevelSide::AtReference),
            _ => None,
        }
    }

    pub fn trade_side(&self) -> Option<TradeSide> {
        match self {
            LevelSide::Buy => Some(TradeSide::Buy),
            LevelSide::Sell => Some(TradeSide::Sell),
            LevelSide::AtReference => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLevel {
    pub index: usize,
    pub target_price: f64,
    pub side: LevelSide,
    /// Share of the total allocation assigned to this level
    pub size_fraction: f64,
}

impl GridLevel {
    /// Quote-currency amount for this level
    pub fn allocation(&self, total_allocation: f64) -> f64 {
        self.size_fraction * total_allocation
    }

    /// Base-asset volume for this level
    pub fn volume(&self, total_allocation: f64) -> f64 {
        if self.target_price <= 0.0 {
            return 0.0;
        }
        self.allocation(total_allocation) / self.target_price
    }
}

/// Realized profit from matching part of a sell against a cheaper buy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Margin {
    pub buy_trade_id: String,
    pub sell_trade_id: String,
    pub buy_price: f64,
    pub sell_price: f64,
    pub matched_volume: f64,
    pub fees: f64,
    pub gross_margin: f64,
    pub margin_percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trend {
    Bullish,
    Bearish,
    Neutral,
}

impl Trend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trend::Bullish => "bullish",
            Trend::Bearish => "bearish",
            Trend::Neutral => "neutral",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bullish" => Some(Trend::Bullish),
            "bearish" => Some(Trend::Bearish),
            "neutral" => Some(Trend::Neutral),
            _ => None,
        }
    }
}

/// Why a new grid generation was built
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegenerationTrigger {
    Initial,
    TrendShift,
    LevelTimeout,
    StopLossRecovery,
}

impl RegenerationTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegenerationTrigger::Initial => "initial",
            RegenerationTrigger::TrendShift => "trend_shift",
            RegenerationTrigger::LevelTimeout => "level_timeout",
            RegenerationTrigger::StopLossRecovery => "stop_loss_recovery",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initial" => Some(RegenerationTrigger::Initial),
            "trend_shift" => Some(RegenerationTrigger::TrendShift),
            "level_timeout" => Some(RegenerationTrigger::LevelTimeout),
            "stop_loss_recovery" => Some(RegenerationTrigger::StopLossRecovery),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Volatility {
    Low,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub last: f64,
    pub bid: f64,
    pub ask: f64,
}

/// One OHLC bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub vwap: f64,
    pub volume: f64,
    pub trades: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Balances {
    pub assets: HashMap<String, f64>,
}

impl Balances {
    pub fn get(&self, asset: &str) -> f64 {
        self.assets.get(asset).copied().unwrap_or(0.0)
    }
}

/// Exchange-side view of an order, as returned by QueryOrders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeOrderStatus {
    Pending,
    Open,
    Closed,
    Canceled,
    Expired,
}

impl ExchangeOrderStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExchangeOrderStatus::Pending),
            "open" => Some(ExchangeOrderStatus::Open),
            "closed" => Some(ExchangeOrderStatus::Closed),
            "canceled" => Some(ExchangeOrderStatus::Canceled),
            "expired" => Some(ExchangeOrderStatus::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub order_id: String,
    pub status: ExchangeOrderStatus,
    pub volume: f64,
    pub volume_executed: f64,
    pub cost: f64,
    pub fee: f64,
    pub average_price: Option<f64>,
    pub closed_at: Option<DateTime<Utc>>,
}
