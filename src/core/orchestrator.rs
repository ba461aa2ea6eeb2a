//! The control loop
//!
//! One tick: market data → trend → stop-loss → reconcile → adapt the grid
//! (or replace stale orders) → reinvest newly realized margin. Ticks never
//! overlap; each carries a deadline that bounds regeneration work, and
//! whatever does not fit is resumed on the next tick from persisted state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::clients::ExchangeTransport;
use crate::config::BotConfig;
use crate::core::error_handler::{ErrorCategory, ErrorHandler, ErrorReport, Severity};
use crate::core::events::{BotEvent, EventSink};
use crate::core::grid_engine::{
    assess_staleness, trend_shift_due, GridEngine, PlacementBudget, RegenerationOutcome, RegenerationRequest,
    Staleness,
};
use crate::core::order_desk::OrderDesk;
use crate::core::reinvestor::ProfitReinvestor;
use crate::core::stop_loss::{StopLossAction, StopLossController, StopLossState};
use crate::core::trend_analyzer::{TrendAnalyzer, TrendSnapshot};
use crate::core::types::{Balances, RegenerationTrigger, Trade, TradeSide, TradeStatus, Trend};
use crate::db::{Database, GridGeneration, GridStateStore, TradeLedger};
use crate::error::{TradingError, TradingResult};
use crate::gateway::ExchangeGateway;

const STATE_KEY: &str = "orchestrator_state";
const STOP_LOSS_KEY: &str = "stop_loss_state";

/// Market data is not fetched while these categories are cooling down
const MARKET_DATA_GATES: [ErrorCategory; 2] = [ErrorCategory::ApiTimeout, ErrorCategory::NetworkError];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OrchestratorState {
    Running,
    /// Fail-safe stop; only an operator clears it
    Halted { reason: String, since: DateTime<Utc> },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub price: Option<f64>,
    /// Why the tick stopped before trading, if it did
    pub skipped: Option<String>,
    pub trend: Option<TrendSnapshot>,
    pub stop_loss: Option<StopLossAction>,
    pub filled: Vec<Trade>,
    pub regenerated: Option<i64>,
    pub deferred: Option<String>,
    pub stale_replaced: usize,
    pub reinvested: usize,
    pub halted: bool,
}

impl TickReport {
    fn skip(mut self, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        info!("⏭️  Skipping tick: {}", reason);
        self.skipped = Some(reason);
        self
    }
}

/// Snapshot of persisted bot state, readable without an exchange connection
#[derive(Debug, Clone, PartialEq)]
pub struct BotStatus {
    pub state: OrchestratorState,
    pub stop_loss: Option<StopLossState>,
    pub active_generation: Option<GridGeneration>,
    pub pending_generation: Option<GridGeneration>,
    pub open_orders: Vec<Trade>,
    pub filled_trades: usize,
}

impl BotStatus {
    pub fn load(db: &Database) -> TradingResult<Self> {
        let store = GridStateStore::new(db);
        let ledger = TradeLedger::new(db);

        let state = match store.get_state(STATE_KEY)? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => OrchestratorState::Running,
        };
        let stop_loss = match store.get_state(STOP_LOSS_KEY)? {
            Some(raw) => Some(serde_json::from_str::<StopLossState>(&raw)?),
            None => None,
        };

        Ok(Self {
            state,
            stop_loss,
            active_generation: store.active()?,
            pending_generation: store.pending()?,
            open_orders: ledger.live_trades()?,
            filled_trades: ledger.count_by_status(TradeStatus::Filled)?,
        })
    }
}

/// Operator action: lift a fail-safe halt. Returns false when not halted.
pub fn clear_halt(db: &Database) -> TradingResult<bool> {
    let store = GridStateStore::new(db);
    let halted = match store.get_state(STATE_KEY)? {
        Some(raw) => matches!(serde_json::from_str::<OrchestratorState>(&raw)?, OrchestratorState::Halted { .. }),
        None => false,
    };
    if halted {
        store.set_state(STATE_KEY, &serde_json::to_string(&OrchestratorState::Running)?, Utc::now())?;
        info!("▶️  Halt cleared, trading may resume");
    }
    Ok(halted)
}

pub struct Orchestrator {
    config: BotConfig,
    gateway: Arc<ExchangeGateway>,
    desk: Arc<OrderDesk>,
    grid: GridEngine,
    store: GridStateStore,
    errors: Arc<ErrorHandler>,
    events: EventSink,
    trend: Option<TrendAnalyzer>,
    stop_loss: Option<StopLossController>,
    reinvestor: Option<ProfitReinvestor>,
    state: OrchestratorState,
    config_source: Option<(PathBuf, Option<SystemTime>)>,
}

impl Orchestrator {
    /// Wire every component from a validated configuration and recover
    /// persisted state
    pub fn new(
        config: BotConfig,
        transport: Arc<dyn ExchangeTransport>,
        db: &Database,
        events: EventSink,
    ) -> TradingResult<Self> {
        config.validate()?;

        let errors = Arc::new(ErrorHandler::new(config.errors.clone(), events.clone()));
        let gateway = Arc::new(ExchangeGateway::new(transport, &config, errors.clone()));
        let ledger = TradeLedger::new(db);
        let store = GridStateStore::new(db);
        let desk = Arc::new(OrderDesk::new(gateway.clone(), ledger, &config.trading));
        let grid = GridEngine::new(config.trading.clone(), desk.clone(), store.clone(), errors.clone());

        let mut orchestrator = Self {
            trend: config.trend.enabled.then(|| TrendAnalyzer::new(config.trend.clone())),
            stop_loss: config
                .stop_loss
                .enabled
                .then(|| StopLossController::new(config.stop_loss.clone(), 0.0)),
            reinvestor: config
                .reinvestment
                .enabled
                .then(|| ProfitReinvestor::new(config.reinvestment.clone())),
            config,
            gateway,
            desk,
            grid,
            store,
            errors,
            events,
            state: OrchestratorState::Running,
            config_source: None,
        };
        orchestrator.restore()?;
        Ok(orchestrator)
    }

    fn restore(&mut self) -> TradingResult<()> {
        if let Some(raw) = self.store.get_state(STATE_KEY)? {
            self.state = serde_json::from_str(&raw)?;
            if let OrchestratorState::Halted { reason, since } = &self.state {
                warn!("🛑 Trading has been halted since {}: {}", since.format("%Y-%m-%d %H:%M:%S"), reason);
            }
        }

        let active = self.store.active()?;
        if let Some(stop_loss) = self.stop_loss.as_mut() {
            match self.store.get_state(STOP_LOSS_KEY)? {
                Some(raw) => stop_loss.restore(serde_json::from_str(&raw)?),
                None => {
                    if let Some(generation) = &active {
                        stop_loss.arm(generation.reference_price);
                    }
                }
            }
        }

        if let Some(pending) = self.store.pending()? {
            info!("♻️  Found unfinished regeneration (generation {}), resuming on the next tick", pending.id);
        }
        if let Some(generation) = active {
            info!(
                "📂 Recovered generation {} around £{:.5} ({})",
                generation.id,
                generation.reference_price,
                generation.trigger.as_str()
            );
        }
        Ok(())
    }

    pub fn state(&self) -> &OrchestratorState {
        &self.state
    }

    pub fn is_halted(&self) -> bool {
        matches!(self.state, OrchestratorState::Halted { .. })
    }

    pub fn stop_loss_state(&self) -> Option<StopLossState> {
        self.stop_loss.as_ref().map(|s| s.state())
    }

    pub fn trend_snapshot(&self) -> Option<TrendSnapshot> {
        self.trend.as_ref().map(|t| t.snapshot())
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    pub fn errors(&self) -> &Arc<ErrorHandler> {
        &self.errors
    }

    pub fn gateway(&self) -> &Arc<ExchangeGateway> {
        &self.gateway
    }

    pub fn ledger(&self) -> &TradeLedger {
        self.desk.ledger()
    }

    pub fn store(&self) -> &GridStateStore {
        &self.store
    }

    /// Re-read `path` between ticks whenever its modification time changes
    pub fn watch_config(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        let modified = modified_time(&path);
        self.config_source = Some((path, modified));
    }

    /// Swap in a new configuration, keeping the last-known-good one when the
    /// candidate is invalid. Exchange, storage and gateway sections only take
    /// effect on restart.
    pub fn apply_config(&mut self, mut candidate: BotConfig) -> bool {
        if let Err(e) = candidate.validate() {
            self.errors.record(
                ErrorReport::new(ErrorCategory::ConfigurationError, Severity::Medium, e.to_string())
                    .with_context("configuration reload"),
            );
            warn!("⚠️  Keeping the previous configuration: {}", e);
            return false;
        }

        candidate.exchange = self.config.exchange.clone();
        candidate.storage = self.config.storage.clone();
        candidate.rate_limits = self.config.rate_limits.clone();
        candidate.cache = self.config.cache.clone();
        candidate.retry = self.config.retry.clone();
        candidate.errors = self.config.errors.clone();
        candidate.trading.trading_pair = self.config.trading.trading_pair.clone();
        candidate.trading.price_decimals = self.config.trading.price_decimals;
        candidate.trading.volume_decimals = self.config.trading.volume_decimals;
        candidate.trading.min_order_volume = self.config.trading.min_order_volume;

        self.grid.set_config(candidate.trading.clone());

        match (&mut self.trend, candidate.trend.enabled) {
            (Some(trend), true) => trend.set_config(candidate.trend.clone()),
            (None, true) => self.trend = Some(TrendAnalyzer::new(candidate.trend.clone())),
            (_, false) => self.trend = None,
        }
        match (&mut self.stop_loss, candidate.stop_loss.enabled) {
            (Some(stop_loss), true) => stop_loss.set_config(candidate.stop_loss.clone()),
            (None, true) => self.stop_loss = Some(StopLossController::new(candidate.stop_loss.clone(), 0.0)),
            (_, false) => self.stop_loss = None,
        }
        match (&mut self.reinvestor, candidate.reinvestment.enabled) {
            (Some(reinvestor), true) => reinvestor.set_config(candidate.reinvestment.clone()),
            (None, true) => self.reinvestor = Some(ProfitReinvestor::new(candidate.reinvestment.clone())),
            (_, false) => self.reinvestor = None,
        }

        self.config = candidate;
        info!("🔧 Configuration reloaded");
        true
    }

    fn reload_config_if_changed(&mut self) {
        let Some((path, seen)) = &self.config_source else {
            return;
        };
        let modified = modified_time(path);
        if modified == *seen {
            return;
        }

        let path = path.clone();
        self.config_source = Some((path.clone(), modified));
        info!("📁 {} changed, reloading", path.display());

        match BotConfig::from_file(&path) {
            Ok(candidate) => {
                self.apply_config(candidate);
            }
            Err(e) => {
                self.errors.record(
                    ErrorReport::new(ErrorCategory::ConfigurationError, Severity::Medium, e.to_string())
                        .with_context(path.display().to_string()),
                );
                warn!("⚠️  Keeping the previous configuration: {}", e);
            }
        }
    }

    /// Run ticks at the configured cadence until Ctrl-C or a halt
    pub async fn run(&mut self) -> TradingResult<()> {
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = stop_tx.send(());
            }
        });

        let mut interval = tokio::time::interval(self.config.trading.price_check_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "🚀 Trading {} every {} min ({} levels, ±{}%)",
            self.config.trading.trading_pair,
            self.config.trading.price_check_interval_minutes,
            self.config.trading.grid_levels,
            self.config.trading.grid_range_percentage / 2.0
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = &mut stop_rx => {
                    info!("🛑 Shutdown requested, stopping between ticks");
                    return Ok(());
                }
            }

            self.reload_config_if_changed();

            match self.tick().await {
                Ok(report) => log_report(&report),
                Err(e) if e.is_retryable() => warn!("⚠️  Tick failed [{}], retrying next tick: {}", e.category(), e),
                Err(e) => error!("❌ Tick failed [{}]: {}", e.category(), e),
            }

            if let OrchestratorState::Halted { reason, .. } = &self.state {
                return Err(TradingError::Halted(reason.clone()));
            }
        }
    }

    pub async fn tick(&mut self) -> TradingResult<TickReport> {
        let report = TickReport::default();

        if let OrchestratorState::Halted { reason, .. } = &self.state {
            let reason = format!("trading halted: {}", reason);
            return Ok(TickReport { halted: true, ..report }.skip(reason));
        }

        if let Some(category) = MARKET_DATA_GATES.into_iter().find(|c| self.errors.is_cooling_down(*c)) {
            return Ok(report.skip(format!("{} is cooling down", category.as_str())));
        }

        let deadline = Instant::now() + self.config.trading.tick_deadline();
        let now = Utc::now();

        // 1. Market data
        let ticker = match self.gateway.ticker(&self.config.trading.trading_pair).await {
            Ok(ticker) => ticker,
            Err(e) => return Ok(report.skip(format!("price unavailable: {}", e))),
        };
        let balances = match self.gateway.balances().await {
            Ok(balances) => balances,
            Err(e) => return Ok(report.skip(format!("balances unavailable: {}", e))),
        };
        let price = ticker.last;
        let mut report = TickReport {
            price: Some(price),
            ..report
        };
        debug!("💹 {} @ £{:.5}", self.config.trading.trading_pair, price);

        // 2. Trend
        let snapshot = match self.trend.as_mut() {
            Some(trend) => {
                trend.update(price);
                let snapshot = trend.snapshot();
                report.trend = Some(snapshot);
                snapshot
            }
            None => TrendSnapshot::default(),
        };

        // 3. Stop-loss
        let action = self.stop_loss.as_mut().map(|s| s.check(price, now, &snapshot));
        report.stop_loss = action;
        let halted =
            matches!(self.stop_loss_state(), Some(StopLossState::Triggered { .. })) && self.stop_loss_sweep(now).await?;
        let swept = self.desk.take_closed_fills();
        self.record_fills(swept, &mut report);
        if halted {
            report.halted = true;
            self.persist_state(now)?;
            return Ok(report);
        }

        // 4. Reconcile
        let reconciled = match self.desk.reconcile().await {
            Ok(filled) => filled,
            Err(TradingError::Gateway(e)) => {
                warn!("⚠️  Reconcile incomplete, retrying next tick: {}", e);
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        self.record_fills(reconciled, &mut report);

        // 5. Adapt
        let blocked = self.stop_loss.as_ref().is_some_and(|s| s.blocks_orders());
        if blocked {
            info!("⏸️  Stop-loss is not armed, no new orders this tick");
        } else {
            let rearmed = matches!(action, Some(StopLossAction::Rearm { .. }));
            self.adapt(price, snapshot.trend, &balances, rearmed, now, deadline, &mut report)
                .await?;
            // Orders that filled while being canceled or replaced
            let replaced = self.desk.take_closed_fills();
            self.record_fills(replaced, &mut report);
        }

        // 6. Reinvest
        if !blocked {
            report.reinvested = self.reinvest(&report.filled, price).await?;
        }

        self.persist_state(now)?;
        Ok(report)
    }

    fn record_fills(&self, fills: Vec<Trade>, report: &mut TickReport) {
        for trade in fills {
            self.events.emit(BotEvent::TradeFilled { trade: trade.clone() });
            report.filled.push(trade);
        }
    }

    /// Cancel every live order once. Any failure halts trading.
    async fn stop_loss_sweep(&mut self, now: DateTime<Utc>) -> TradingResult<bool> {
        let Some(StopLossState::Triggered { price, reference, at }) = self.stop_loss_state() else {
            return Ok(false);
        };

        let live = self.desk.ledger().live_trades()?;
        info!("🛑 Stop-loss canceling {} open orders", live.len());

        let mut canceled = 0;
        let mut failures = Vec::new();
        for trade in &live {
            match self.desk.cancel(trade).await {
                Ok(_) => canceled += 1,
                Err(e) => {
                    error!("❌ Stop-loss could not cancel {}: {}", trade.id, e);
                    failures.push(format!("{} ({})", trade.id, e));
                }
            }
        }

        if !failures.is_empty() {
            let reason = format!(
                "stop-loss left {} order(s) uncanceled: {}",
                failures.len(),
                failures.join(", ")
            );
            self.errors
                .escalate_critical(ErrorCategory::OrderPlacementError, reason.clone());
            self.halt(reason, now)?;
            return Ok(true);
        }

        let mut until = now;
        if let Some(stop_loss) = self.stop_loss.as_mut() {
            until = stop_loss.enter_cooldown(now);
        }
        info!(
            "⏸️  All orders canceled, stop-loss cooldown until {}",
            until.format("%Y-%m-%d %H:%M:%S")
        );

        self.events.emit(BotEvent::StopLossTriggered {
            price,
            reference_price: reference,
            drop_percent: (reference - price) / reference * 100.0,
            canceled_orders: canceled,
            at,
        });
        Ok(false)
    }

    fn halt(&mut self, reason: String, now: DateTime<Utc>) -> TradingResult<()> {
        error!("🛑 HALTING TRADING: {}", reason);
        self.state = OrchestratorState::Halted { reason, since: now };
        self.persist_state(now)
    }

    #[allow(clippy::too_many_arguments)]
    async fn adapt(
        &mut self,
        price: f64,
        trend: Trend,
        balances: &Balances,
        rearmed: bool,
        now: DateTime<Utc>,
        deadline: Instant,
        report: &mut TickReport,
    ) -> TradingResult<()> {
        let budget = PlacementBudget {
            base: balances.get(&self.config.exchange.base_asset),
            quote: balances.get(&self.config.exchange.quote_asset),
        };
        let request = |trigger| RegenerationRequest {
            reference_price: price,
            trend,
            trigger,
        };

        if rearmed {
            let outcome = self
                .grid
                .regenerate(request(RegenerationTrigger::StopLossRecovery), budget, deadline)
                .await?;
            return self.handle_outcome(outcome, now, report);
        }

        if let Some(outcome) = self.grid.resume(budget, deadline).await? {
            return self.handle_outcome(outcome, now, report);
        }

        let Some(active) = self.store.active()? else {
            info!("🆕 No active grid, building the first generation");
            let outcome = self
                .grid
                .regenerate(request(RegenerationTrigger::Initial), budget, deadline)
                .await?;
            return self.handle_outcome(outcome, now, report);
        };

        if self.trend.is_some() && trend_shift_due(&active, trend, now, self.config.trading.trend_check_interval()) {
            info!(
                "🔄 Market is {} but generation {} was built for {}, regenerating",
                trend.as_str(),
                active.id,
                active.trend.as_str()
            );
            let outcome = self
                .grid
                .regenerate(request(RegenerationTrigger::TrendShift), budget, deadline)
                .await?;
            return self.handle_outcome(outcome, now, report);
        }

        let trades = self.desk.ledger().trades_for_generation(active.id)?;
        match assess_staleness(&trades, now, self.config.trading.order_timeout()) {
            Staleness::Expired => {
                info!(
                    "⏰ Every order in generation {} outlived {}h without a fill, regenerating",
                    active.id, self.config.trading.order_timeout_hours
                );
                let outcome = self
                    .grid
                    .regenerate(request(RegenerationTrigger::LevelTimeout), budget, deadline)
                    .await?;
                self.handle_outcome(outcome, now, report)
            }
            Staleness::Stale(stale) => {
                info!("⏰ Replacing {} stale orders", stale.len());
                report.stale_replaced = self.grid.replace_stale(stale, deadline).await?;
                Ok(())
            }
            Staleness::Fresh => {
                debug!("Generation {} is fresh, nothing to adapt", active.id);
                Ok(())
            }
        }
    }

    fn handle_outcome(
        &mut self,
        outcome: RegenerationOutcome,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> TradingResult<()> {
        match outcome {
            RegenerationOutcome::Completed {
                generation,
                orders_placed,
            } => {
                report.regenerated = Some(generation.id);
                if let Some(stop_loss) = self.stop_loss.as_mut() {
                    stop_loss.arm(generation.reference_price);
                }
                self.events.emit(BotEvent::GridRegenerated {
                    generation: generation.id,
                    reference_price: generation.reference_price,
                    trigger: generation.trigger,
                    orders_placed,
                    at: now,
                });
            }
            RegenerationOutcome::Deferred { reason, .. } => report.deferred = Some(reason),
            RegenerationOutcome::CancelFailed {
                generation,
                trade_id,
                error,
            } => {
                // Nothing of the new generation has been placed; the next tick resumes the cancels
                let message = format!(
                    "generation {} blocked: could not cancel previous order {}: {}",
                    generation, trade_id, error
                );
                self.errors
                    .escalate_critical(ErrorCategory::OrderPlacementError, message.clone());
                report.deferred = Some(message);
            }
        }
        Ok(())
    }

    async fn reinvest(&self, filled: &[Trade], market_price: f64) -> TradingResult<usize> {
        let Some(reinvestor) = &self.reinvestor else {
            return Ok(0);
        };
        let sells: Vec<&Trade> = filled.iter().filter(|t| t.side == TradeSide::Sell).collect();
        if sells.is_empty() {
            return Ok(0);
        }
        if self.errors.is_cooling_down(ErrorCategory::OrderPlacementError) {
            info!("💤 Reinvestment skipped: order placement is cooling down");
            return Ok(0);
        }

        let margins = self.desk.ledger().margin_report()?;
        let mut quote_available = match self.gateway.balances().await {
            Ok(balances) => balances.get(&self.config.exchange.quote_asset),
            Err(e) => {
                info!("💤 Reinvestment skipped: balances unavailable ({})", e);
                return Ok(0);
            }
        };

        let mut placed = 0;
        for sell in sells {
            if let Some(trade) = reinvestor
                .on_sell_filled(
                    &self.desk,
                    sell,
                    &margins,
                    market_price,
                    quote_available,
                    self.config.trading.min_order_volume,
                )
                .await
            {
                quote_available -= trade.requested_price * trade.requested_volume;
                placed += 1;
            }
        }
        Ok(placed)
    }

    fn persist_state(&self, now: DateTime<Utc>) -> TradingResult<()> {
        self.store
            .set_state(STATE_KEY, &serde_json::to_string(&self.state)?, now)?;
        if let Some(stop_loss) = &self.stop_loss {
            self.store
                .set_state(STOP_LOSS_KEY, &serde_json::to_string(&stop_loss.state())?, now)?;
        }
        Ok(())
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn log_report(report: &TickReport) {
    if report.skipped.is_some() {
        return;
    }
    info!(
        "📊 Tick: £{:.5}, {} filled, {} stale replaced, {} reinvested{}{}",
        report.price.unwrap_or_default(),
        report.filled.len(),
        report.stale_replaced,
        report.reinvested,
        report
            .regenerated
            .map(|g| format!(", generation {} active", g))
            .unwrap_or_default(),
        report
            .deferred
            .as_ref()
            .map(|r| format!(", deferred ({})", r))
            .unwrap_or_default()
    );
}
