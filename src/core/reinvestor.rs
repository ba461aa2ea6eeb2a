// Recycles realized margin into discounted buy orders

use tracing::{info, warn};

use crate::config::ReinvestmentConfig;
use crate::core::order_desk::{OrderDesk, Placement};
use crate::core::types::{Trade, TradeSide};
use crate::db::MarginReport;

#[derive(Debug, Clone, PartialEq)]
pub enum ReinvestDecision {
    Place { price: f64, volume: f64, quote_amount: f64 },
    Skip(String),
}

#[derive(Debug, Clone)]
pub struct ProfitReinvestor {
    config: ReinvestmentConfig,
}

impl ProfitReinvestor {
    pub fn new(config: ReinvestmentConfig) -> Self {
        Self { config }
    }

    pub fn set_config(&mut self, config: ReinvestmentConfig) {
        self.config = config;
    }

    /// Size a reinvestment buy from a realized margin
    pub fn plan(&self, realized_margin: f64, market_price: f64, quote_available: f64, min_volume: f64) -> ReinvestDecision {
        if realized_margin <= 0.0 {
            return ReinvestDecision::Skip(format!("no positive margin ({:.4})", realized_margin));
        }
        if market_price <= 0.0 {
            return ReinvestDecision::Skip("no market price".to_string());
        }

        let wanted = realized_margin * self.config.profit_reinvestment_fraction;
        let quote_amount = wanted.min(quote_available);
        if quote_amount <= 0.0 {
            return ReinvestDecision::Skip(format!("no quote balance available (wanted £{:.4})", wanted));
        }

        let price = market_price * (1.0 - self.config.price_discount_percent / 100.0);
        let volume = quote_amount / price;
        if volume < min_volume {
            return ReinvestDecision::Skip(format!(
                "£{:.4} buys {:.4} units, below minimum order {}",
                quote_amount, volume, min_volume
            ));
        }

        ReinvestDecision::Place {
            price,
            volume,
            quote_amount,
        }
    }

    /// React to a newly filled sell. Failures are logged and swallowed.
    pub async fn on_sell_filled(
        &self,
        desk: &OrderDesk,
        sell: &Trade,
        report: &MarginReport,
        market_price: f64,
        quote_available: f64,
        min_volume: f64,
    ) -> Option<Trade> {
        if sell.side != TradeSide::Sell {
            return None;
        }

        let realized = report.realized_for_sell(&sell.id);
        match self.plan(realized, market_price, quote_available, min_volume) {
            ReinvestDecision::Skip(reason) => {
                info!("💤 Reinvestment skipped for sell {}: {}", sell.id, reason);
                None
            }
            ReinvestDecision::Place { price, volume, quote_amount } => {
                match desk.place(TradeSide::Buy, price, volume, None).await {
                    Ok(Placement::Placed(trade)) => {
                        info!("♻️  Reinvested £{:.4} of margin from sell {}", quote_amount, sell.id);
                        Some(trade)
                    }
                    Ok(Placement::Skipped(reason)) => {
                        info!("💤 Reinvestment skipped for sell {}: {}", sell.id, reason);
                        None
                    }
                    Err(e) => {
                        warn!("⚠️  Reinvestment for sell {} failed: {}", sell.id, e);
                        None
                    }
                }
            }
        }
    }
}
