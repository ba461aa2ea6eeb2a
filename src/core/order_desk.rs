// Order lifecycle: place, cancel and reconcile against the exchange

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::TradingConfig;
use crate::core::types::{ExchangeOrder, ExchangeOrderStatus, Trade, TradeSide, TradeStatus};
use crate::db::TradeLedger;
use crate::error::{TradingError, TradingResult};
use crate::gateway::{ExchangeGateway, GatewayError, LimitOrder};

/// QueryOrders accepts at most 50 transaction ids per call
const QUERY_BATCH_SIZE: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub enum Placement {
    Placed(Trade),
    /// Nothing was sent to the exchange
    Skipped(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    Canceled(Trade),
    /// The order had already left the book (filled or canceled elsewhere)
    AlreadyClosed(Trade),
}

impl CancelOutcome {
    pub fn trade(&self) -> &Trade {
        match self {
            CancelOutcome::Canceled(t) | CancelOutcome::AlreadyClosed(t) => t,
        }
    }
}

pub struct OrderDesk {
    gateway: Arc<ExchangeGateway>,
    ledger: TradeLedger,
    pair: String,
    price_decimals: u32,
    volume_decimals: u32,
    min_order_volume: f64,
    /// Fills discovered while canceling, not yet handed to the caller
    closed_fills: Mutex<Vec<Trade>>,
}

impl OrderDesk {
    pub fn new(gateway: Arc<ExchangeGateway>, ledger: TradeLedger, config: &TradingConfig) -> Self {
        Self {
            gateway,
            ledger,
            pair: config.trading_pair.clone(),
            price_decimals: config.price_decimals,
            volume_decimals: config.volume_decimals,
            min_order_volume: config.min_order_volume,
            closed_fills: Mutex::new(Vec::new()),
        }
    }

    /// Trades a cancel found already filled since the last call
    pub fn take_closed_fills(&self) -> Vec<Trade> {
        std::mem::take(&mut *self.closed_fills.lock())
    }

    pub fn ledger(&self) -> &TradeLedger {
        &self.ledger
    }

    pub fn gateway(&self) -> &Arc<ExchangeGateway> {
        &self.gateway
    }

    pub fn pair(&self) -> &str {
        &self.pair
    }

    pub fn round_price(&self, price: f64) -> f64 {
        round_to(price, self.price_decimals)
    }

    pub fn round_volume(&self, volume: f64) -> f64 {
        round_to(volume, self.volume_decimals)
    }

    /// Record a pending trade, submit it, and record the exchange's answer.
    ///
    /// A rejected order is kept in the ledger as `failed`.
    pub async fn place(
        &self,
        side: TradeSide,
        price: f64,
        volume: f64,
        level: Option<(i64, usize)>,
    ) -> TradingResult<Placement> {
        let price = self.round_price(price);
        let volume = self.round_volume(volume);

        if price <= 0.0 {
            return Ok(Placement::Skipped(format!("non-positive price {}", price)));
        }
        if volume < self.min_order_volume {
            return Ok(Placement::Skipped(format!(
                "volume {} below minimum {}",
                volume, self.min_order_volume
            )));
        }

        let now = Utc::now();
        let mut trade = Trade::new(&self.pair, side, price, volume, now);
        if let Some((generation, index)) = level {
            trade = trade.with_level(generation, index);
        }
        self.ledger.record(&trade)?;

        let order = LimitOrder {
            pair: self.pair.clone(),
            side,
            price: format!("{:.*}", self.price_decimals as usize, price),
            volume: format!("{:.*}", self.volume_decimals as usize, volume),
            userref: Some(trade.userref()),
        };

        let submitted = match self.gateway.place_limit_order(&order).await {
            Err(e) if e.is_ambiguous() => self.find_submitted(trade.userref(), e).await,
            other => other,
        };

        match submitted {
            Ok(order_id) => {
                trade.status = TradeStatus::Open;
                trade.external_order_id = Some(order_id.clone());
                trade.updated_at = Utc::now();
                self.ledger.record(&trade)?;
                info!("📝 Placed {} {} {} @ £{} ({})", side, volume, self.pair, order.price, order_id);
                Ok(Placement::Placed(trade))
            }
            Err(e) => {
                trade.status = TradeStatus::Failed;
                trade.updated_at = Utc::now();
                self.ledger.record(&trade)?;
                warn!("❌ {} order at £{} rejected: {}", side, order.price, e);
                Err(TradingError::Gateway(e))
            }
        }
    }

    /// After a timeout the order may still have been accepted; look for it
    /// by its tag before declaring the placement failed
    async fn find_submitted(&self, userref: i32, error: GatewayError) -> Result<String, GatewayError> {
        match self.gateway.open_orders(Some(userref)).await {
            Ok(open) => match open.into_keys().next() {
                Some(order_id) => {
                    info!("🔎 Order tagged {} reached the exchange as {} despite: {}", userref, order_id, error);
                    Ok(order_id)
                }
                None => Err(error),
            },
            Err(lookup) => {
                warn!("⚠️  Could not look up order tagged {}: {}", userref, lookup);
                Err(error)
            }
        }
    }

    /// Cancel one live trade. The exchange's record of the order is written
    /// to the ledger, so executions since the last reconcile are kept.
    pub async fn cancel(&self, trade: &Trade) -> TradingResult<CancelOutcome> {
        let Some(order_id) = trade.external_order_id.clone() else {
            // Never reached the exchange
            let mut canceled = trade.clone();
            canceled.status = TradeStatus::Canceled;
            canceled.updated_at = Utc::now();
            self.ledger.record(&canceled)?;
            return Ok(CancelOutcome::Canceled(canceled));
        };

        match self.gateway.cancel_order(&order_id).await {
            Ok(_) => {
                let canceled = self.confirm_canceled(trade, &order_id).await;
                self.ledger.record(&canceled)?;
                debug!("🗑️  Canceled {} ({} executed)", order_id, canceled.filled_volume);
                if canceled.status == TradeStatus::Filled {
                    return Ok(self.closed(canceled));
                }
                Ok(CancelOutcome::Canceled(canceled))
            }
            Err(GatewayError::ClientError(_, msg)) if msg.contains("Unknown order") => {
                let orders = self.gateway.query_orders(std::slice::from_ref(&order_id)).await?;
                let order = orders.get(&order_id).ok_or_else(|| {
                    TradingError::Gateway(GatewayError::ClientError(400, format!("order {} not found", order_id)))
                })?;

                match apply_exchange_state(trade, order, Utc::now()) {
                    Some(updated) if updated.status.is_terminal() => {
                        self.ledger.record(&updated)?;
                        info!("ℹ️  Order {} had already closed as {}", order_id, updated.status);
                        Ok(self.closed(updated))
                    }
                    _ => Err(TradingError::Gateway(GatewayError::ClientError(400, msg))),
                }
            }
            Err(e) => Err(TradingError::Gateway(e)),
        }
    }

    /// The canceled trade as the exchange reports it. Falls back to the
    /// last reconciled state when the lookup fails.
    async fn confirm_canceled(&self, trade: &Trade, order_id: &str) -> Trade {
        let now = Utc::now();
        let confirmed = match self.gateway.query_orders(&[order_id.to_string()]).await {
            Ok(orders) => orders
                .get(order_id)
                .map(|order| apply_exchange_state(trade, order, now).unwrap_or_else(|| trade.clone())),
            Err(e) => {
                warn!("⚠️  Canceled {} but could not confirm its executions: {}", order_id, e);
                None
            }
        };

        let mut canceled = confirmed.unwrap_or_else(|| trade.clone());
        canceled.updated_at = now;
        if !canceled.status.is_terminal() {
            canceled.status = TradeStatus::Canceled;
        }
        canceled
    }

    fn closed(&self, trade: Trade) -> CancelOutcome {
        if trade.status == TradeStatus::Filled {
            self.closed_fills.lock().push(trade.clone());
        }
        CancelOutcome::AlreadyClosed(trade)
    }

    /// Pull exchange state for every live trade; returns trades that became
    /// filled. A failed batch ends the pass early, keeping what was found.
    pub async fn reconcile(&self) -> TradingResult<Vec<Trade>> {
        let live = self.ledger.live_trades()?;
        let by_order: HashMap<String, Trade> = live
            .into_iter()
            .filter_map(|t| {
                if t.external_order_id.is_none() {
                    debug!("Trade {} has no exchange id yet, skipping reconcile", t.id);
                }
                t.external_order_id.clone().map(|id| (id, t))
            })
            .collect();

        if by_order.is_empty() {
            return Ok(Vec::new());
        }

        let mut ids: Vec<String> = by_order.keys().cloned().collect();
        ids.sort();

        let mut newly_filled = Vec::new();
        let now = Utc::now();
        for batch in ids.chunks(QUERY_BATCH_SIZE) {
            let orders = match self.gateway.query_orders(batch).await {
                Ok(orders) => orders,
                Err(e) => {
                    warn!(
                        "⚠️  Reconcile stopped after {} new fill(s), retrying the rest next tick: {}",
                        newly_filled.len(),
                        e
                    );
                    break;
                }
            };
            for order_id in batch {
                let (Some(trade), Some(order)) = (by_order.get(order_id), orders.get(order_id)) else {
                    continue;
                };
                if let Some(updated) = apply_exchange_state(trade, order, now) {
                    self.ledger.record(&updated)?;
                    if updated.status == TradeStatus::Filled {
                        info!(
                            "✅ {} filled: {} @ £{:.5}",
                            updated.side,
                            updated.filled_volume,
                            updated.execution_price()
                        );
                        newly_filled.push(updated);
                    }
                }
            }
        }

        Ok(newly_filled)
    }
}

/// The ledger update implied by the exchange's view of an order, if any
pub fn apply_exchange_state(trade: &Trade, order: &ExchangeOrder, now: DateTime<Utc>) -> Option<Trade> {
    let mut updated = trade.clone();
    updated.updated_at = now;
    updated.filled_volume = order.volume_executed;
    updated.cost = order.cost;
    updated.fee = order.fee;

    match order.status {
        ExchangeOrderStatus::Closed if order.volume_executed > 0.0 => {
            updated.status = TradeStatus::Filled;
            updated.actual_price = order
                .average_price
                .or_else(|| (order.cost > 0.0).then(|| order.cost / order.volume_executed));
            updated.filled_at = Some(order.closed_at.unwrap_or(now));
        }
        ExchangeOrderStatus::Closed | ExchangeOrderStatus::Canceled | ExchangeOrderStatus::Expired => {
            updated.status = TradeStatus::Canceled;
        }
        ExchangeOrderStatus::Open | ExchangeOrderStatus::Pending => {
            if trade.status == TradeStatus::Open && order.volume_executed == trade.filled_volume {
                return None;
            }
            updated.status = TradeStatus::Open;
        }
    }

    Some(updated)
}

fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}
