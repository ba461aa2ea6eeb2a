// Trend and volatility classification over recent prices

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::info;

use crate::config::TrendConfig;
use crate::core::types::{Trend, Volatility};

/// Fewer observations than this always read as neutral / low
const MIN_SAMPLES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendSnapshot {
    pub trend: Trend,
    pub volatility: Volatility,
    /// Percent change from the oldest to the newest sample in the window
    pub change_percent: f64,
    /// Standard deviation of tick-to-tick returns, in percent
    pub volatility_percent: f64,
    pub samples: usize,
}

impl Default for TrendSnapshot {
    fn default() -> Self {
        Self {
            trend: Trend::Neutral,
            volatility: Volatility::Low,
            change_percent: 0.0,
            volatility_percent: 0.0,
            samples: 0,
        }
    }
}

impl TrendSnapshot {
    pub fn is_trending(&self) -> bool {
        self.trend != Trend::Neutral
    }
}

#[derive(Debug, Clone)]
pub struct TrendAnalyzer {
    price_history: VecDeque<f64>,
    config: TrendConfig,
    current: TrendSnapshot,
}

impl TrendAnalyzer {
    pub fn new(config: TrendConfig) -> Self {
        Self {
            price_history: VecDeque::with_capacity(config.price_history_size),
            config,
            current: TrendSnapshot::default(),
        }
    }

    pub fn snapshot(&self) -> TrendSnapshot {
        self.current
    }

    pub fn samples(&self) -> usize {
        self.price_history.len()
    }

    /// Apply new thresholds without dropping the collected history
    pub fn set_config(&mut self, config: TrendConfig) {
        self.config = config;
        while self.price_history.len() > self.config.price_history_size {
            self.price_history.pop_front();
        }
    }

    /// Add an observation; returns the new snapshot when the trend changed
    pub fn update(&mut self, price: f64) -> Option<TrendSnapshot> {
        if !(price.is_finite() && price > 0.0) {
            return None;
        }

        self.price_history.push_back(price);
        while self.price_history.len() > self.config.price_history_size {
            self.price_history.pop_front();
        }

        let previous = self.current;
        self.current = self.classify();

        if previous.trend != self.current.trend {
            info!(
                "🔄 Trend changed: {} → {} ({:+.2}%, volatility {:.2}%)",
                previous.trend.as_str(),
                self.current.trend.as_str(),
                self.current.change_percent,
                self.current.volatility_percent
            );
            Some(self.current)
        } else {
            None
        }
    }

    fn classify(&self) -> TrendSnapshot {
        let samples = self.price_history.len();
        if samples < MIN_SAMPLES {
            return TrendSnapshot {
                samples,
                ..TrendSnapshot::default()
            };
        }

        let (Some(&first), Some(&last)) = (self.price_history.front(), self.price_history.back()) else {
            return TrendSnapshot::default();
        };
        let change_percent = (last - first) / first * 100.0;
        let volatility_percent = returns_std_dev(&self.price_history) * 100.0;

        let trend = if change_percent >= self.config.trend_threshold_percent {
            Trend::Bullish
        } else if change_percent <= -self.config.trend_threshold_percent {
            Trend::Bearish
        } else {
            Trend::Neutral
        };

        let volatility = if volatility_percent > self.config.volatility_threshold_percent {
            Volatility::High
        } else {
            Volatility::Low
        };

        TrendSnapshot {
            trend,
            volatility,
            change_percent,
            volatility_percent,
            samples,
        }
    }
}

fn returns_std_dev(prices: &VecDeque<f64>) -> f64 {
    let returns: Vec<f64> = prices
        .iter()
        .zip(prices.iter().skip(1))
        .map(|(prev, next)| (next - prev) / prev)
        .collect();

    if returns.len() < 2 {
        return 0.0;
    }

    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
    variance.sqrt()
}
