//! Deterministic margin matching over filled trades
//!
//! Margins are never persisted: every call rebuilds them from the filled
//! trades, so repeated calls on the same trade set return identical results.
//! Buys are consumed cheapest first (ties broken by creation time, then id);
//! sells are processed in fill order.

use serde::Serialize;
use std::cmp::Ordering;

use crate::core::types::{Margin, Trade, TradeSide, TradeStatus};

const VOLUME_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnmatchedSell {
    pub sell_trade_id: String,
    pub sell_price: f64,
    pub unmatched_volume: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MarginReport {
    pub margins: Vec<Margin>,
    pub unmatched_sells: Vec<UnmatchedSell>,
    pub total_matched_volume: f64,
    pub total_gross_margin: f64,
    pub total_fees: f64,
    /// Gross margin over the cost basis of all matched volume
    pub average_margin_percent: f64,
}

impl MarginReport {
    pub fn margins_for_sell<'a>(&'a self, sell_trade_id: &'a str) -> impl Iterator<Item = &'a Margin> + 'a {
        self.margins.iter().filter(move |m| m.sell_trade_id == sell_trade_id)
    }

    /// Realized gross margin attributed to one sell
    pub fn realized_for_sell(&self, sell_trade_id: &str) -> f64 {
        self.margins_for_sell(sell_trade_id).map(|m| m.gross_margin).sum()
    }
}

struct BuyLot<'a> {
    trade: &'a Trade,
    remaining: f64,
}

fn is_matchable(trade: &Trade, side: TradeSide) -> bool {
    trade.side == side && trade.status == TradeStatus::Filled && trade.filled_volume > VOLUME_EPSILON
}

fn by_price_then_age(a: &Trade, b: &Trade) -> Ordering {
    a.execution_price()
        .total_cmp(&b.execution_price())
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

fn by_fill_time(a: &Trade, b: &Trade) -> Ordering {
    a.fill_time()
        .cmp(&b.fill_time())
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Match filled sells against strictly cheaper filled buys
pub fn calculate_margins(trades: &[Trade]) -> MarginReport {
    let mut buys: Vec<BuyLot> = trades
        .iter()
        .filter(|t| is_matchable(t, TradeSide::Buy))
        .map(|t| BuyLot {
            trade: t,
            remaining: t.filled_volume,
        })
        .collect();
    buys.sort_by(|a, b| by_price_then_age(a.trade, b.trade));

    let mut sells: Vec<&Trade> = trades.iter().filter(|t| is_matchable(t, TradeSide::Sell)).collect();
    sells.sort_by(|a, b| by_fill_time(a, b));

    let mut report = MarginReport::default();
    let mut cost_basis = 0.0;

    for sell in sells {
        let sell_price = sell.execution_price();
        let mut sell_remaining = sell.filled_volume;

        for lot in buys.iter_mut() {
            if sell_remaining <= VOLUME_EPSILON {
                break;
            }
            let buy_price = lot.trade.execution_price();
            // Sorted ascending, so nothing further along is eligible either
            if buy_price >= sell_price {
                break;
            }
            if lot.remaining <= VOLUME_EPSILON {
                continue;
            }

            let matched = lot.remaining.min(sell_remaining);
            lot.remaining -= matched;
            sell_remaining -= matched;

            let fees = lot.trade.fee * matched / lot.trade.filled_volume + sell.fee * matched / sell.filled_volume;
            let gross_margin = (sell_price - buy_price) * matched - fees;
            let basis = buy_price * matched;

            report.total_matched_volume += matched;
            report.total_gross_margin += gross_margin;
            report.total_fees += fees;
            cost_basis += basis;

            report.margins.push(Margin {
                buy_trade_id: lot.trade.id.clone(),
                sell_trade_id: sell.id.clone(),
                buy_price,
                sell_price,
                matched_volume: matched,
                fees,
                gross_margin,
                margin_percent: if basis > 0.0 { gross_margin / basis } else { 0.0 },
            });
        }

        if sell_remaining > VOLUME_EPSILON {
            report.unmatched_sells.push(UnmatchedSell {
                sell_trade_id: sell.id.clone(),
                sell_price,
                unmatched_volume: sell_remaining,
            });
        }
    }

    if cost_basis > 0.0 {
        report.average_margin_percent = report.total_gross_margin / cost_basis;
    }

    report
}
