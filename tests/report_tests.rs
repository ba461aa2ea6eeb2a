// Performance report built from mock market data and an on-disk ledger

mod common;

use chrono::Utc;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

use common::{create_temp_db_dir, create_test_config, filled_trade, MockExchange};
use xrp_grid_bot::core::error_handler::ErrorHandler;
use xrp_grid_bot::core::report::{self, PerformanceReport};
use xrp_grid_bot::core::types::TradeSide;
use xrp_grid_bot::core::EventSink;
use xrp_grid_bot::db::{Database, TradeLedger};
use xrp_grid_bot::gateway::ExchangeGateway;

#[tokio::test]
async fn test_report_combines_market_moves_and_ledger() {
    let config = create_test_config();
    let exchange = MockExchange::new(0.52, 1_000.0, 500.0);
    exchange.set_daily_closes(&[0.50, 0.55, 0.44, 0.52]);

    let (_dir, path) = create_temp_db_dir();
    let db = Database::new(&path).unwrap();
    let ledger = TradeLedger::new(&db);
    ledger.record(&filled_trade(TradeSide::Buy, 0.49, 100.0, 0.08, 120)).unwrap();
    ledger.record(&filled_trade(TradeSide::Sell, 0.51, 100.0, 0.08, 60)).unwrap();

    let errors = Arc::new(ErrorHandler::new(config.errors.clone(), EventSink::disabled()));
    let gateway = ExchangeGateway::new(exchange.clone(), &config, errors);
    let report = report::generate(&gateway, &db, &config, 7, true, Utc::now()).await.unwrap();

    assert_eq!(report.pair, "XRPGBP");
    assert_eq!(report.period_days, 7);
    assert_eq!(report.current_price, Some(0.52));
    assert!((report.portfolio_value.unwrap() - (1_000.0 * 0.52 + 500.0)).abs() < 1e-9);

    let market = report.market.as_ref().expect("market summary");
    assert_eq!(market.candles, 4);
    assert!((market.price_change_percent - 4.0).abs() < 1e-9);
    assert!((market.max_drawdown_percent - 20.0).abs() < 1e-9);

    assert_eq!(report.completed_orders, 2);
    assert_eq!(report.active_orders, 0);
    assert!(!report.halted);
    assert_eq!(report.margins.matched_pairs, 1);
    assert!(report.margins.gross_margin > 0.0);

    let out = TempDir::new().unwrap();
    let file = report.save(out.path().join("reports")).unwrap();
    assert!(file.file_name().unwrap().to_string_lossy().starts_with("performance_report_"));

    let saved: PerformanceReport = serde_json::from_str(&fs::read_to_string(&file).unwrap()).unwrap();
    assert_eq!(saved.completed_orders, 2);
    assert_eq!(saved.margins.matched_pairs, 1);
    assert_eq!(saved.generated_at, report.generated_at);
}

#[tokio::test]
async fn test_report_without_market_data_still_covers_the_ledger() {
    let config = create_test_config();
    // No bars configured: the exchange answers with an empty series
    let exchange = MockExchange::new(0.50, 0.0, 0.0);
    let db = Database::new_in_memory().unwrap();

    let errors = Arc::new(ErrorHandler::new(config.errors.clone(), EventSink::disabled()));
    let gateway = ExchangeGateway::new(exchange.clone(), &config, errors);
    let report = report::generate(&gateway, &db, &config, 30, false, Utc::now()).await.unwrap();

    assert!(report.market.is_none());
    assert_eq!(report.current_price, Some(0.50));
    assert!(report.portfolio_value.is_none());
    assert_eq!(report.completed_orders, 0);
    assert_eq!(report.margins.matched_pairs, 0);
}
