// Stop-loss state machine: Armed → Triggered → Cooldown → Armed

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::StopLossConfig;
use crate::core::trend_analyzer::TrendSnapshot;
use crate::core::types::{Trend, Volatility};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StopLossState {
    /// Watching for a drop below `reference`, which follows new peaks up
    Armed { reference: f64 },
    /// Fired; waiting for every open order to be confirmed canceled
    Triggered { price: f64, reference: f64, at: DateTime<Utc> },
    Cooldown { until: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopLossAction {
    Hold,
    Trigger {
        price: f64,
        reference: f64,
        drop_percent: f64,
        threshold_percent: f64,
    },
    /// Cooldown elapsed; rebuild the grid around `price`
    Rearm { price: f64 },
}

#[derive(Debug, Clone)]
pub struct StopLossController {
    config: StopLossConfig,
    state: StopLossState,
}

impl StopLossController {
    pub fn new(config: StopLossConfig, reference: f64) -> Self {
        Self {
            config,
            state: StopLossState::Armed { reference },
        }
    }

    pub fn state(&self) -> StopLossState {
        self.state
    }

    /// Resume from a persisted state
    pub fn restore(&mut self, state: StopLossState) {
        self.state = state;
    }

    pub fn set_config(&mut self, config: StopLossConfig) {
        self.config = config;
    }

    /// Re-arm at a new reference, e.g. after a grid regeneration
    pub fn arm(&mut self, reference: f64) {
        if let StopLossState::Armed { .. } = self.state {
            self.state = StopLossState::Armed { reference };
        }
    }

    /// New orders are blocked unless armed
    pub fn blocks_orders(&self) -> bool {
        !matches!(self.state, StopLossState::Armed { .. })
    }

    /// Threshold after volatility and trend adjustments
    pub fn effective_threshold(&self, snapshot: &TrendSnapshot) -> f64 {
        let mut threshold = self.config.stop_loss_percentage;
        if snapshot.volatility == Volatility::High {
            threshold *= self.config.high_volatility_multiplier;
        }
        if snapshot.trend == Trend::Bearish {
            threshold *= self.config.bearish_multiplier;
        }
        threshold
    }

    pub fn check(&mut self, price: f64, now: DateTime<Utc>, snapshot: &TrendSnapshot) -> StopLossAction {
        match self.state {
            StopLossState::Armed { reference } => {
                let reference = if price > reference { price } else { reference };
                self.state = StopLossState::Armed { reference };

                let drop_percent = (reference - price) / reference * 100.0;
                let threshold_percent = self.effective_threshold(snapshot);
                if drop_percent > threshold_percent {
                    warn!(
                        "🛑 Stop-loss triggered: £{:.5} is {:.2}% below £{:.5} (threshold {:.2}%)",
                        price, drop_percent, reference, threshold_percent
                    );
                    self.state = StopLossState::Triggered { price, reference, at: now };
                    return StopLossAction::Trigger {
                        price,
                        reference,
                        drop_percent,
                        threshold_percent,
                    };
                }
                StopLossAction::Hold
            }
            StopLossState::Triggered { .. } => StopLossAction::Hold,
            StopLossState::Cooldown { until } => {
                if now >= until {
                    info!("🟢 Stop-loss cooldown over, re-arming at £{:.5}", price);
                    self.state = StopLossState::Armed { reference: price };
                    StopLossAction::Rearm { price }
                } else {
                    info!("⏸️  Stop-loss cooldown active until {}, not trading", until.format("%H:%M:%S"));
                    StopLossAction::Hold
                }
            }
        }
    }

    /// All orders confirmed canceled; start the cooldown
    pub fn enter_cooldown(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let until = now + Duration::minutes(self.config.cooldown_minutes as i64);
        self.state = StopLossState::Cooldown { until };
        until
    }
}
