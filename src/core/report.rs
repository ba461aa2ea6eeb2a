//! Performance report: recent daily market behaviour next to the ledger's
//! order counts, halt state and realized margins, saved as JSON

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::BotConfig;
use crate::core::orchestrator::{BotStatus, OrchestratorState};
use crate::core::stop_loss::StopLossState;
use crate::core::types::{Candle, TradeStatus};
use crate::db::{Database, MarginReport, TradeLedger};
use crate::error::{TradingError, TradingResult};
use crate::gateway::ExchangeGateway;

/// Daily bars
const DAILY_INTERVAL_MINUTES: u32 = 1440;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSummary {
    pub candles: usize,
    pub first_close: f64,
    pub last_close: f64,
    pub price_change_percent: f64,
    /// Standard deviation of bar-to-bar returns
    pub volatility_percent: f64,
    /// Largest fall from a running peak close
    pub max_drawdown_percent: f64,
}

impl MarketSummary {
    pub fn from_candles(candles: &[Candle]) -> Option<Self> {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let (first, last) = (*closes.first()?, *closes.last()?);
        if first <= 0.0 {
            return None;
        }

        Some(Self {
            candles: closes.len(),
            first_close: first,
            last_close: last,
            price_change_percent: (last - first) / first * 100.0,
            volatility_percent: volatility_percent(&return_series(&closes)),
            max_drawdown_percent: max_drawdown_percent(&closes),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarginSummary {
    pub matched_pairs: usize,
    pub matched_volume: f64,
    pub gross_margin: f64,
    pub fees: f64,
    pub average_margin_percent: f64,
    pub unmatched_sells: usize,
}

impl From<&MarginReport> for MarginSummary {
    fn from(report: &MarginReport) -> Self {
        Self {
            matched_pairs: report.margins.len(),
            matched_volume: report.total_matched_volume,
            gross_margin: report.total_gross_margin,
            fees: report.total_fees,
            average_margin_percent: report.average_margin_percent * 100.0,
            unmatched_sells: report.unmatched_sells.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub generated_at: DateTime<Utc>,
    pub pair: String,
    pub period_days: u32,
    pub current_price: Option<f64>,
    /// Base holdings at the current price plus quote holdings
    pub portfolio_value: Option<f64>,
    pub market: Option<MarketSummary>,
    pub completed_orders: usize,
    pub active_orders: usize,
    pub canceled_orders: usize,
    pub failed_orders: usize,
    pub halted: bool,
    pub halt_reason: Option<String>,
    pub stop_loss: Option<StopLossState>,
    pub margins: MarginSummary,
}

impl PerformanceReport {
    /// Write `performance_report_YYYYMMDD.json` under `dir`
    pub fn save(&self, dir: impl AsRef<Path>) -> TradingResult<PathBuf> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| TradingError::FileWrite(format!("{}: {}", dir.display(), e)))?;

        let path = dir.join(format!("performance_report_{}.json", self.generated_at.format("%Y%m%d")));
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).map_err(|e| TradingError::FileWrite(format!("{}: {}", path.display(), e)))?;
        Ok(path)
    }
}

/// Build a report for the last `days` days. Market data that cannot be
/// fetched is left out; ledger failures abort.
pub async fn generate(
    gateway: &ExchangeGateway,
    db: &Database,
    config: &BotConfig,
    days: u32,
    with_balances: bool,
    now: DateTime<Utc>,
) -> TradingResult<PerformanceReport> {
    let pair = &config.trading.trading_pair;
    info!("📈 Generating performance report for the last {} days", days);

    let since = now - Duration::days(days as i64);
    let market = match gateway.ohlc(pair, DAILY_INTERVAL_MINUTES, Some(since)).await {
        Ok(candles) => MarketSummary::from_candles(&candles),
        Err(e) => {
            warn!("⚠️  No OHLC data for {}: {}", pair, e);
            None
        }
    };

    let current_price = match gateway.ticker(pair).await {
        Ok(ticker) => Some(ticker.last),
        Err(e) => {
            warn!("⚠️  No current price for {}: {}", pair, e);
            market.as_ref().map(|m| m.last_close)
        }
    };

    let portfolio_value = match (with_balances, current_price) {
        (true, Some(price)) => match gateway.balances().await {
            Ok(balances) => Some(
                balances.get(&config.exchange.base_asset) * price + balances.get(&config.exchange.quote_asset),
            ),
            Err(e) => {
                warn!("⚠️  Balances unavailable: {}", e);
                None
            }
        },
        _ => None,
    };

    let ledger = TradeLedger::new(db);
    let status = BotStatus::load(db)?;
    let (halted, halt_reason) = match status.state {
        OrchestratorState::Running => (false, None),
        OrchestratorState::Halted { reason, .. } => (true, Some(reason)),
    };

    Ok(PerformanceReport {
        generated_at: now,
        pair: pair.clone(),
        period_days: days,
        current_price,
        portfolio_value,
        market,
        completed_orders: status.filled_trades,
        active_orders: status.open_orders.len(),
        canceled_orders: ledger.count_by_status(TradeStatus::Canceled)?,
        failed_orders: ledger.count_by_status(TradeStatus::Failed)?,
        halted,
        halt_reason,
        stop_loss: status.stop_loss,
        margins: MarginSummary::from(&ledger.margin_report()?),
    })
}

pub fn return_series(closes: &[f64]) -> Vec<f64> {
    closes
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect()
}

/// Sample standard deviation of `returns`, in percent
pub fn volatility_percent(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
    variance.sqrt() * 100.0
}

pub fn max_drawdown_percent(closes: &[f64]) -> f64 {
    let Some(&first) = closes.first() else {
        return 0.0;
    };

    let mut peak = first;
    let mut max_drawdown: f64 = 0.0;
    for &close in &closes[1..] {
        if close > peak {
            peak = close;
        } else if peak > 0.0 {
            max_drawdown = max_drawdown.max((peak - close) / peak);
        }
    }
    max_drawdown * 100.0
}
