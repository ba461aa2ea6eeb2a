//! Grid construction and regeneration
//!
//! Levels are spread between `reference × (1 ∓ range/200)` with power-law
//! spacing `lower + (i/(n-1))^γ × (upper - lower)`. With dynamic sizing,
//! buy levels get more of the allocation close to the reference and sell
//! levels get more far from it.
//!
//! Regeneration is strictly cancel-then-place: the new generation is written
//! as pending, the previous generation's live orders are canceled, and only
//! then is the new generation activated and its orders placed. Each step
//! checks the tick deadline; an expired deadline leaves the work for the
//! next tick to resume.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::TradingConfig;
use crate::core::error_handler::{ErrorCategory, ErrorHandler};
use crate::core::order_desk::{CancelOutcome, OrderDesk, Placement};
use crate::core::types::{GridLevel, LevelSide, RegenerationTrigger, Trade, TradeSide, TradeStatus, Trend};
use crate::db::{GridGeneration, GridStateStore, NewGeneration};
use crate::error::{TradingError, TradingResult};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridBounds {
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridParams {
    pub reference_price: f64,
    pub range_percent: f64,
    pub level_count: usize,
    pub total_allocation: f64,
    pub dynamic_sizing: bool,
    pub spacing_exponent: f64,
    pub sizing_strength: f64,
}

pub fn grid_bounds(reference_price: f64, range_percent: f64) -> GridBounds {
    let half = range_percent / 200.0;
    GridBounds {
        lower: reference_price * (1.0 - half),
        upper: reference_price * (1.0 + half),
    }
}

/// Relative size weight for a level at normalized distance `distance`
/// (0 at the reference, 1 at the bound)
pub fn size_weight(side: LevelSide, distance: f64, strength: f64) -> f64 {
    let d = distance.clamp(0.0, 1.0);
    match side {
        LevelSide::Buy => 1.0 + strength * (1.0 - d),
        LevelSide::Sell => 1.0 + strength * d,
        LevelSide::AtReference => 0.0,
    }
}

pub fn compute_levels(params: &GridParams) -> TradingResult<Vec<GridLevel>> {
    if !(params.reference_price.is_finite() && params.reference_price > 0.0) {
        return Err(TradingError::ConfigValidation(format!(
            "reference price must be positive, got {}",
            params.reference_price
        )));
    }
    if params.level_count < 2 {
        return Err(TradingError::ConfigValidation("grid needs at least 2 levels".to_string()));
    }
    if !(params.range_percent > 0.0 && params.range_percent < 200.0) {
        return Err(TradingError::ConfigValidation(format!(
            "grid range {}% is out of bounds",
            params.range_percent
        )));
    }
    if params.spacing_exponent < 1.0 {
        return Err(TradingError::ConfigValidation("spacing exponent must be at least 1".to_string()));
    }

    let reference = params.reference_price;
    let bounds = grid_bounds(reference, params.range_percent);
    let span = bounds.upper - bounds.lower;
    let half_span = span / 2.0;
    let tolerance = reference * 1e-9;
    let last = (params.level_count - 1) as f64;

    let mut levels: Vec<GridLevel> = (0..params.level_count)
        .map(|i| {
            let t = (i as f64 / last).powf(params.spacing_exponent);
            let target_price = bounds.lower + t * span;
            let side = if (target_price - reference).abs() <= tolerance {
                LevelSide::AtReference
            } else if target_price < reference {
                LevelSide::Buy
            } else {
                LevelSide::Sell
            };
            GridLevel {
                index: i,
                target_price,
                side,
                size_fraction: 0.0,
            }
        })
        .collect();

    let weights: Vec<f64> = levels
        .iter()
        .map(|level| match level.side {
            LevelSide::AtReference => 0.0,
            _ if !params.dynamic_sizing => 1.0,
            side => size_weight(side, (level.target_price - reference).abs() / half_span, params.sizing_strength),
        })
        .collect();

    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return Err(TradingError::Internal("grid has no tradable levels".to_string()));
    }

    for (level, weight) in levels.iter_mut().zip(&weights) {
        level.size_fraction = weight / total;
    }

    Ok(levels)
}

/// How the active generation's orders have aged
#[derive(Debug, Clone, PartialEq)]
pub enum Staleness {
    Fresh,
    /// Some orders outlived the timeout; replace them in place
    Stale(Vec<Trade>),
    /// Every live order timed out and nothing has filled: rebuild the grid
    Expired,
}

pub fn assess_staleness(generation_trades: &[Trade], now: DateTime<Utc>, timeout: chrono::Duration) -> Staleness {
    let live: Vec<&Trade> = generation_trades.iter().filter(|t| t.is_live()).collect();
    if live.is_empty() {
        return Staleness::Fresh;
    }

    let stale: Vec<Trade> = live
        .iter()
        .filter(|t| now - t.created_at >= timeout)
        .map(|t| (*t).clone())
        .collect();
    let any_filled = generation_trades.iter().any(|t| t.status == TradeStatus::Filled);

    if stale.len() == live.len() && !any_filled {
        Staleness::Expired
    } else if stale.is_empty() {
        Staleness::Fresh
    } else {
        Staleness::Stale(stale)
    }
}

/// Trend-driven adaptation: the trend moved away from the one the grid was
/// built for, and the grid is at least one trend-check interval old
pub fn trend_shift_due(generation: &GridGeneration, trend: Trend, now: DateTime<Utc>, interval: chrono::Duration) -> bool {
    trend != generation.trend && now - generation.created_at >= interval
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegenerationRequest {
    pub reference_price: f64,
    pub trend: Trend,
    pub trigger: RegenerationTrigger,
}

#[derive(Debug)]
pub enum RegenerationOutcome {
    Completed {
        generation: GridGeneration,
        orders_placed: usize,
    },
    /// Stopped early; the next tick resumes from the persisted state
    Deferred { generation: i64, reason: String },
    /// An order of the previous generation could not be canceled
    CancelFailed {
        generation: i64,
        trade_id: String,
        error: TradingError,
    },
}

/// Funds available for new orders during one placement pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlacementBudget {
    pub base: f64,
    pub quote: f64,
}

fn expired(deadline: Instant) -> bool {
    Instant::now() >= deadline
}

pub struct GridEngine {
    config: TradingConfig,
    desk: Arc<OrderDesk>,
    store: GridStateStore,
    errors: Arc<ErrorHandler>,
}

impl GridEngine {
    pub fn new(config: TradingConfig, desk: Arc<OrderDesk>, store: GridStateStore, errors: Arc<ErrorHandler>) -> Self {
        Self {
            config,
            desk,
            store,
            errors,
        }
    }

    pub fn set_config(&mut self, config: TradingConfig) {
        self.config = config;
    }

    pub fn store(&self) -> &GridStateStore {
        &self.store
    }

    /// Grid parameters for a reference price; trending markets get a wider range
    pub fn params_for(&self, reference_price: f64, trend: Trend) -> GridParams {
        let range_percent = if trend == Trend::Neutral {
            self.config.grid_range_percentage
        } else {
            self.config.grid_range_percentage * self.config.trending_range_multiplier
        };

        GridParams {
            reference_price,
            range_percent,
            level_count: self.config.grid_levels,
            total_allocation: self.config.total_allocation,
            dynamic_sizing: self.config.dynamic_sizing,
            spacing_exponent: self.config.spacing_exponent,
            sizing_strength: self.config.sizing_strength,
        }
    }

    /// Unfinished regeneration or placement left by an earlier tick (or run)
    pub async fn resume(&self, budget: PlacementBudget, deadline: Instant) -> TradingResult<Option<RegenerationOutcome>> {
        if let Some(pending) = self.store.pending()? {
            info!("♻️  Resuming regeneration of generation {}", pending.id);
            return self.drive(pending, budget, deadline).await.map(Some);
        }

        match self.store.active()? {
            Some(active) if !active.placement_done => {
                info!("♻️  Resuming order placement for generation {}", active.id);
                self.place_levels(active, budget, deadline).await.map(Some)
            }
            _ => Ok(None),
        }
    }

    pub fn has_unfinished_work(&self) -> TradingResult<bool> {
        if self.store.pending()?.is_some() {
            return Ok(true);
        }
        Ok(matches!(self.store.active()?, Some(active) if !active.placement_done))
    }

    /// Build a new generation around `request.reference_price` and swap it in
    pub async fn regenerate(
        &self,
        request: RegenerationRequest,
        budget: PlacementBudget,
        deadline: Instant,
    ) -> TradingResult<RegenerationOutcome> {
        if let Some(pending) = self.store.pending()? {
            warn!("⚠️  Generation {} is still pending, resuming it instead", pending.id);
            return self.drive(pending, budget, deadline).await;
        }

        let params = self.params_for(request.reference_price, request.trend);
        let levels = compute_levels(&params)?;
        let generation = self.store.create_pending(
            &NewGeneration {
                reference_price: request.reference_price,
                range_percent: params.range_percent,
                trigger: request.trigger,
                trend: request.trend,
                levels: &levels,
            },
            Utc::now(),
        )?;

        let bounds = grid_bounds(request.reference_price, params.range_percent);
        info!(
            "🎯 Regenerating grid ({}): generation {} around £{:.5}, range £{:.5}–£{:.5}, {} levels",
            request.trigger.as_str(),
            generation.id,
            request.reference_price,
            bounds.lower,
            bounds.upper,
            levels.len()
        );

        self.drive(generation, budget, deadline).await
    }

    async fn drive(
        &self,
        generation: GridGeneration,
        budget: PlacementBudget,
        deadline: Instant,
    ) -> TradingResult<RegenerationOutcome> {
        // Cancel everything that belongs to any other generation
        let previous: Vec<Trade> = self
            .desk
            .ledger()
            .live_trades()?
            .into_iter()
            .filter(|t| matches!(t.generation, Some(g) if g != generation.id))
            .collect();

        for trade in &previous {
            if expired(deadline) {
                return Ok(self.defer(generation.id, "tick deadline reached while canceling"));
            }
            match self.desk.cancel(trade).await {
                Ok(outcome) => debug!("Previous-generation order {} -> {}", trade.id, outcome.trade().status),
                Err(error) => {
                    return Ok(RegenerationOutcome::CancelFailed {
                        generation: generation.id,
                        trade_id: trade.id.clone(),
                        error,
                    })
                }
            }
        }

        if expired(deadline) {
            return Ok(self.defer(generation.id, "tick deadline reached before activation"));
        }

        let now = Utc::now();
        self.store.activate(generation.id, now)?;
        let active = GridGeneration {
            status: crate::db::GenerationStatus::Active,
            activated_at: Some(now),
            ..generation
        };

        self.place_levels(active, budget, deadline).await
    }

    async fn place_levels(
        &self,
        generation: GridGeneration,
        mut budget: PlacementBudget,
        deadline: Instant,
    ) -> TradingResult<RegenerationOutcome> {
        let levels = self.store.levels(generation.id)?;
        let attempted: HashSet<usize> = self
            .desk
            .ledger()
            .trades_for_generation(generation.id)?
            .iter()
            .filter_map(|t| t.level_index)
            .collect();

        let mut placed = 0;
        for level in levels.iter().filter(|l| !attempted.contains(&l.index)) {
            let Some(side) = level.side.trade_side() else {
                continue;
            };

            if expired(deadline) {
                return Ok(self.defer(generation.id, "tick deadline reached while placing orders"));
            }
            if self.errors.is_cooling_down(ErrorCategory::OrderPlacementError) {
                return Ok(self.defer(generation.id, "order placement is cooling down"));
            }

            let volume = level.volume(self.config.total_allocation);
            let affordable = match side {
                TradeSide::Buy => level.target_price * volume <= budget.quote,
                TradeSide::Sell => volume <= budget.base,
            };
            if !affordable {
                info!(
                    "💤 Level {} ({} @ £{:.5}) skipped: insufficient balance",
                    level.index, side, level.target_price
                );
                continue;
            }

            match self
                .desk
                .place(side, level.target_price, volume, Some((generation.id, level.index)))
                .await
            {
                Ok(Placement::Placed(trade)) => {
                    placed += 1;
                    match side {
                        TradeSide::Buy => budget.quote -= trade.requested_price * trade.requested_volume,
                        TradeSide::Sell => budget.base -= trade.requested_volume,
                    }
                }
                Ok(Placement::Skipped(reason)) => info!("💤 Level {} skipped: {}", level.index, reason),
                Err(e) => warn!("⚠️  Level {} placement failed: {}", level.index, e),
            }
        }

        self.store.mark_placement_done(generation.id)?;
        info!("✅ Generation {} placed {} orders", generation.id, placed);

        Ok(RegenerationOutcome::Completed {
            generation: GridGeneration {
                placement_done: true,
                ..generation
            },
            orders_placed: placed,
        })
    }

    /// Cancel and re-place individual stale orders at their own level
    pub async fn replace_stale(&self, stale: Vec<Trade>, deadline: Instant) -> TradingResult<usize> {
        let mut replaced = 0;
        for trade in stale {
            if expired(deadline) {
                info!("⏱️  Tick deadline reached, remaining stale orders wait for the next tick");
                break;
            }
            if self.errors.is_cooling_down(ErrorCategory::OrderPlacementError) {
                info!("⏸️  Order placement cooling down, not replacing stale orders");
                break;
            }

            match self.desk.cancel(&trade).await {
                Ok(CancelOutcome::Canceled(_)) => {
                    let level = trade.generation.zip(trade.level_index);
                    match self
                        .desk
                        .place(trade.side, trade.requested_price, trade.requested_volume, level)
                        .await
                    {
                        Ok(Placement::Placed(_)) => replaced += 1,
                        Ok(Placement::Skipped(reason)) => info!("💤 Stale order {} not re-placed: {}", trade.id, reason),
                        Err(e) => warn!("⚠️  Re-placing stale order {} failed: {}", trade.id, e),
                    }
                }
                Ok(CancelOutcome::AlreadyClosed(t)) => {
                    debug!("Stale order {} already closed as {}", trade.id, t.status)
                }
                Err(e) => warn!("⚠️  Could not cancel stale order {}: {}", trade.id, e),
            }
        }
        Ok(replaced)
    }

    fn defer(&self, generation: i64, reason: &str) -> RegenerationOutcome {
        info!("⏸️  Generation {} deferred: {}", generation, reason);
        RegenerationOutcome::Deferred {
            generation,
            reason: reason.to_string(),
        }
    }
}
