// Order desk behaviour against an in-memory exchange

mod common;

use std::sync::Arc;

use common::{create_test_config, MockExchange};
use xrp_grid_bot::core::error_handler::ErrorHandler;
use xrp_grid_bot::core::order_desk::{CancelOutcome, OrderDesk, Placement};
use xrp_grid_bot::core::types::{Trade, TradeSide, TradeStatus};
use xrp_grid_bot::core::EventSink;
use xrp_grid_bot::db::{Database, TradeLedger};
use xrp_grid_bot::gateway::{Endpoint, ExchangeGateway, GatewayError};
use xrp_grid_bot::TradingError;

fn desk_for(exchange: &Arc<MockExchange>, db: &Database) -> OrderDesk {
    let config = create_test_config();
    let errors = Arc::new(ErrorHandler::new(config.errors.clone(), EventSink::disabled()));
    let gateway = Arc::new(ExchangeGateway::new(exchange.clone(), &config, errors));
    OrderDesk::new(gateway, TradeLedger::new(db), &config.trading)
}

async fn place_buy(desk: &OrderDesk, price: f64) -> Trade {
    match desk.place(TradeSide::Buy, price, 10.0, None).await.unwrap() {
        Placement::Placed(trade) => trade,
        Placement::Skipped(reason) => panic!("order skipped: {}", reason),
    }
}

#[tokio::test]
async fn test_failed_query_batch_keeps_fills_from_earlier_batches() {
    let exchange = MockExchange::new(0.50, 10_000.0, 10_000.0);
    let db = Database::new_in_memory().unwrap();
    let desk = desk_for(&exchange, &db);

    for i in 0..60 {
        place_buy(&desk, 0.40 + i as f64 * 0.001).await;
    }
    exchange.fill("OMOCK-00003");
    exchange.fail_queries_after(1);

    let filled = desk.reconcile().await.unwrap();
    assert_eq!(filled.len(), 1);
    assert_eq!(filled[0].external_order_id.as_deref(), Some("OMOCK-00003"));
    assert_eq!(desk.ledger().count_by_status(TradeStatus::Filled).unwrap(), 1);
    assert_eq!(desk.ledger().live_trades().unwrap().len(), 59);
    // One good batch, then the second batch with its retries
    assert_eq!(exchange.call_count(Endpoint::QueryOrders), 4);

    // The next pass covers the second batch again
    exchange.fail_queries_after(usize::MAX);
    exchange.fill("OMOCK-00055");
    let filled = desk.reconcile().await.unwrap();
    assert_eq!(filled.len(), 1);
    assert_eq!(filled[0].external_order_id.as_deref(), Some("OMOCK-00055"));
}

#[tokio::test]
async fn test_cancel_records_executions_since_last_reconcile() {
    let exchange = MockExchange::new(0.50, 10_000.0, 10_000.0);
    let db = Database::new_in_memory().unwrap();
    let desk = desk_for(&exchange, &db);

    let trade = place_buy(&desk, 0.49).await;
    let order_id = trade.external_order_id.clone().unwrap();
    exchange.partial_fill(&order_id, 4.0);

    let CancelOutcome::Canceled(canceled) = desk.cancel(&trade).await.unwrap() else {
        panic!("expected a plain cancel");
    };
    assert_eq!(canceled.status, TradeStatus::Canceled);
    assert_eq!(canceled.filled_volume, 4.0);
    assert!((canceled.cost - 4.0 * 0.49).abs() < 1e-9);
    assert!(canceled.fee > 0.0);

    let stored = desk.ledger().find_by_id(&trade.id).unwrap().unwrap();
    assert_eq!(stored.status, TradeStatus::Canceled);
    assert_eq!(stored.filled_volume, 4.0);
    assert!(desk.take_closed_fills().is_empty());
}

#[tokio::test]
async fn test_cancel_of_filled_order_is_handed_over_once() {
    let exchange = MockExchange::new(0.50, 10_000.0, 10_000.0);
    let db = Database::new_in_memory().unwrap();
    let desk = desk_for(&exchange, &db);

    let trade = place_buy(&desk, 0.49).await;
    exchange.fill(trade.external_order_id.as_deref().unwrap());

    let outcome = desk.cancel(&trade).await.unwrap();
    assert!(matches!(&outcome, CancelOutcome::AlreadyClosed(t) if t.status == TradeStatus::Filled));

    let fills = desk.take_closed_fills();
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].id, trade.id);
    assert!(desk.take_closed_fills().is_empty());
}

#[tokio::test]
async fn test_timed_out_order_that_reached_the_book_is_adopted() {
    let exchange = MockExchange::new(0.50, 10_000.0, 10_000.0);
    exchange.time_out_add_orders(true);
    let db = Database::new_in_memory().unwrap();
    let desk = desk_for(&exchange, &db);

    let trade = place_buy(&desk, 0.49).await;

    assert_eq!(trade.status, TradeStatus::Open);
    assert_eq!(trade.external_order_id.as_deref(), Some("OMOCK-00001"));
    assert_eq!(exchange.call_count(Endpoint::AddOrder), 1);
    assert_eq!(exchange.open_orders().len(), 1);

    let userref = trade.userref().to_string();
    assert_eq!(exchange.params_of(Endpoint::AddOrder)[0].get("userref"), Some(&userref));
    assert_eq!(exchange.params_of(Endpoint::OpenOrders)[0].get("userref"), Some(&userref));
}

#[tokio::test]
async fn test_timed_out_order_that_never_landed_is_failed_without_resending() {
    let exchange = MockExchange::new(0.50, 10_000.0, 10_000.0);
    exchange.time_out_add_orders(false);
    let db = Database::new_in_memory().unwrap();
    let desk = desk_for(&exchange, &db);

    let err = desk.place(TradeSide::Buy, 0.49, 10.0, None).await.unwrap_err();

    assert!(matches!(err, TradingError::Gateway(GatewayError::Timeout(_))));
    assert_eq!(exchange.call_count(Endpoint::AddOrder), 1);
    assert!(exchange.open_orders().is_empty());
    assert_eq!(desk.ledger().count_by_status(TradeStatus::Failed).unwrap(), 1);
}
