// End-to-end tick scenarios against an in-memory exchange

mod common;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

use common::{create_test_config, MockExchange};
use xrp_grid_bot::clients::TransportError;
use xrp_grid_bot::config::BotConfig;
use xrp_grid_bot::core::error_handler::{ErrorCategory, Severity};
use xrp_grid_bot::core::orchestrator::{clear_halt, BotStatus, Orchestrator, OrchestratorState};
use xrp_grid_bot::core::stop_loss::{StopLossAction, StopLossState};
use xrp_grid_bot::core::types::{RegenerationTrigger, TradeSide, TradeStatus, Trend};
use xrp_grid_bot::core::{BotEvent, EventSink};
use xrp_grid_bot::db::{Database, GenerationStatus};
use xrp_grid_bot::gateway::{Endpoint, GatewayError};

fn start_bot(config: BotConfig, exchange: &Arc<MockExchange>, db: &Database) -> (Orchestrator, UnboundedReceiver<BotEvent>) {
    let (events, receiver) = EventSink::channel();
    let bot = Orchestrator::new(config, exchange.clone(), db, events).expect("orchestrator should start");
    (bot, receiver)
}

fn drain(receiver: &mut UnboundedReceiver<BotEvent>) -> Vec<BotEvent> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}

fn funded_exchange() -> Arc<MockExchange> {
    MockExchange::new(0.50, 10_000.0, 10_000.0)
}

#[tokio::test]
async fn test_first_tick_builds_and_places_the_grid() {
    let exchange = funded_exchange();
    let db = Database::new_in_memory().unwrap();
    let (mut bot, mut events) = start_bot(create_test_config(), &exchange, &db);

    let report = bot.tick().await.unwrap();

    assert_eq!(report.price, Some(0.50));
    assert_eq!(report.regenerated, Some(1));
    assert_eq!(exchange.call_count(Endpoint::AddOrder), 4);

    let active = bot.store().active().unwrap().expect("an active generation");
    assert_eq!(active.trigger, RegenerationTrigger::Initial);
    assert!(active.placement_done);

    let open = exchange.open_orders();
    assert_eq!(open.len(), 4);
    assert!((open[0].1.price - 0.49).abs() < 1e-9);
    assert!((open[3].1.price - 0.51).abs() < 1e-9);
    assert_eq!(open.iter().filter(|(_, o)| o.side == TradeSide::Buy).count(), 2);

    let trades = bot.ledger().trades_for_generation(1).unwrap();
    assert_eq!(trades.len(), 4);
    assert!(trades.iter().all(|t| t.status == TradeStatus::Open));

    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        BotEvent::GridRegenerated { generation: 1, orders_placed: 4, trigger: RegenerationTrigger::Initial, .. }
    )));

    // A quiet second tick changes nothing
    let report = bot.tick().await.unwrap();
    assert_eq!(report.regenerated, None);
    assert_eq!(exchange.call_count(Endpoint::AddOrder), 4);
}

#[tokio::test]
async fn test_stop_loss_cancels_each_order_once_and_blocks_placement() {
    let exchange = funded_exchange();
    let db = Database::new_in_memory().unwrap();
    let (mut bot, mut events) = start_bot(create_test_config(), &exchange, &db);

    bot.tick().await.unwrap();
    let order_ids: Vec<String> = exchange.open_orders().into_iter().map(|(id, _)| id).collect();
    drain(&mut events);

    // 14% below the 0.50 reference, past the 12% threshold
    exchange.set_price(0.43);
    let report = bot.tick().await.unwrap();

    assert!(matches!(report.stop_loss, Some(StopLossAction::Trigger { .. })));
    assert!(!report.halted);
    assert!(exchange.open_orders().is_empty());
    for id in &order_ids {
        assert_eq!(exchange.cancel_attempts(id), 1, "order {} canceled once", id);
    }
    assert!(matches!(bot.stop_loss_state(), Some(StopLossState::Cooldown { .. })));
    assert!(bot.ledger().live_trades().unwrap().is_empty());

    let events = drain(&mut events);
    assert!(events
        .iter()
        .any(|e| matches!(e, BotEvent::StopLossTriggered { canceled_orders: 4, .. })));

    // Still cooling down: no orders, no more cancels
    let report = bot.tick().await.unwrap();
    assert_eq!(report.stop_loss, Some(StopLossAction::Hold));
    assert_eq!(exchange.call_count(Endpoint::AddOrder), 4);
    assert_eq!(exchange.call_count(Endpoint::CancelOrder), 4);
}

#[tokio::test]
async fn test_failed_stop_loss_cancellation_halts_trading() {
    let exchange = funded_exchange();
    let db = Database::new_in_memory().unwrap();
    let (mut bot, _events) = start_bot(create_test_config(), &exchange, &db);

    bot.tick().await.unwrap();
    exchange.fail_cancels(true);
    exchange.set_price(0.43);

    let report = bot.tick().await.unwrap();
    assert!(report.halted);
    assert!(bot.is_halted());
    for (id, _) in exchange.open_orders() {
        assert_eq!(exchange.cancel_attempts(&id), 1);
    }

    let critical = bot
        .errors()
        .recent()
        .into_iter()
        .filter(|r| r.severity == Severity::Critical)
        .count();
    assert_eq!(critical, 1);

    // Halted ticks touch nothing
    let report = bot.tick().await.unwrap();
    assert!(report.halted);
    assert!(report.skipped.is_some());
    assert_eq!(exchange.call_count(Endpoint::AddOrder), 4);
    assert_eq!(exchange.call_count(Endpoint::CancelOrder), 4);

    // The halt survives a restart until an operator clears it
    assert!(matches!(BotStatus::load(&db).unwrap().state, OrchestratorState::Halted { .. }));
    let (restarted, _events) = start_bot(create_test_config(), &exchange, &db);
    assert!(restarted.is_halted());
    assert!(clear_halt(&db).unwrap());
    assert_eq!(BotStatus::load(&db).unwrap().state, OrchestratorState::Running);
}

#[tokio::test]
async fn test_stop_loss_retries_unavailable_exchange_then_halts() {
    let config = create_test_config();
    assert!(config.retry.retryable_status_codes.contains(&503));
    let unavailable = TransportError::Http {
        status: 503,
        body: "Service Unavailable".to_string(),
    };
    assert!(GatewayError::from(unavailable.clone()).is_transient());

    let exchange = funded_exchange();
    let db = Database::new_in_memory().unwrap();
    let (mut bot, _events) = start_bot(config.clone(), &exchange, &db);

    bot.tick().await.unwrap();
    let order_ids: Vec<String> = exchange.open_orders().into_iter().map(|(id, _)| id).collect();
    exchange.fail_cancels_with(unavailable);
    exchange.set_price(0.43);

    let report = bot.tick().await.unwrap();
    assert!(report.halted);
    assert!(bot.is_halted());

    let attempts = config.retry.max_retries as usize + 1;
    for id in &order_ids {
        assert_eq!(exchange.cancel_attempts(id), attempts, "order {} tried {} times", id, attempts);
    }
    assert_eq!(exchange.call_count(Endpoint::CancelOrder), order_ids.len() * attempts);

    let critical = bot
        .errors()
        .recent()
        .into_iter()
        .filter(|r| r.severity == Severity::Critical)
        .count();
    assert_eq!(critical, 1);
    assert_eq!(bot.ledger().live_trades().unwrap().len(), order_ids.len());
}

#[tokio::test]
async fn test_stop_loss_reports_orders_found_filled_while_canceling() {
    let exchange = funded_exchange();
    let db = Database::new_in_memory().unwrap();
    let (mut bot, mut events) = start_bot(create_test_config(), &exchange, &db);

    bot.tick().await.unwrap();
    let (lowest, _) = exchange.open_orders()[0].clone();
    exchange.fill(&lowest);
    drain(&mut events);

    // The sweep runs before reconcile, so the cancel is what finds the fill
    exchange.set_price(0.43);
    let report = bot.tick().await.unwrap();

    assert!(matches!(report.stop_loss, Some(StopLossAction::Trigger { .. })));
    assert_eq!(report.filled.len(), 1);
    assert_eq!(report.filled[0].external_order_id.as_deref(), Some(lowest.as_str()));
    assert_eq!(report.filled[0].status, TradeStatus::Filled);
    assert_eq!(bot.ledger().filled_trades().unwrap().len(), 1);

    let filled_events: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            BotEvent::TradeFilled { trade } => Some(trade),
            _ => None,
        })
        .collect();
    assert_eq!(filled_events.len(), 1);
    assert_eq!(filled_events[0].external_order_id.as_deref(), Some(lowest.as_str()));

    // Reported once only
    let report = bot.tick().await.unwrap();
    assert!(report.filled.is_empty());
}

#[tokio::test]
async fn test_regeneration_moves_the_stop_loss_reference() {
    let mut config = create_test_config();
    config.trading.trend_check_interval_hours = 0.0001;

    let exchange = MockExchange::new(0.56, 10_000.0, 10_000.0);
    let db = Database::new_in_memory().unwrap();
    let (mut bot, _events) = start_bot(config, &exchange, &db);

    bot.tick().await.unwrap();
    exchange.set_price(0.55);
    bot.tick().await.unwrap();

    exchange.set_price(0.53);
    let report = bot.tick().await.unwrap();
    assert_eq!(report.regenerated, Some(2));
    let active = bot.store().active().unwrap().unwrap();
    assert_eq!(active.trigger, RegenerationTrigger::TrendShift);
    assert_eq!(active.trend, Trend::Bearish);
    match bot.stop_loss_state() {
        Some(StopLossState::Armed { reference }) => assert!((reference - active.reference_price).abs() < 1e-9),
        other => panic!("expected an armed stop-loss, got {:?}", other),
    }

    // 7.5% below the new grid, 12.5% below the old peak
    exchange.set_price(0.49);
    let report = bot.tick().await.unwrap();
    assert_eq!(report.stop_loss, Some(StopLossAction::Hold));
    assert!(!report.halted);
    assert_eq!(exchange.open_orders().len(), 4);
}

#[tokio::test]
async fn test_grid_is_rebuilt_after_stop_loss_cooldown() {
    let mut config = create_test_config();
    config.stop_loss.cooldown_minutes = 0;

    let exchange = funded_exchange();
    let db = Database::new_in_memory().unwrap();
    let (mut bot, _events) = start_bot(config, &exchange, &db);

    bot.tick().await.unwrap();
    exchange.set_price(0.43);
    bot.tick().await.unwrap();

    let report = bot.tick().await.unwrap();
    assert_eq!(report.stop_loss, Some(StopLossAction::Rearm { price: 0.43 }));
    assert_eq!(report.regenerated, Some(2));

    let active = bot.store().active().unwrap().unwrap();
    assert_eq!(active.trigger, RegenerationTrigger::StopLossRecovery);
    assert!((active.reference_price - 0.43).abs() < 1e-9);
    assert_eq!(exchange.open_orders().len(), 4);
    assert!(matches!(bot.stop_loss_state(), Some(StopLossState::Armed { .. })));
}

#[tokio::test]
async fn test_fills_are_reconciled_and_margin_is_reinvested() {
    let exchange = funded_exchange();
    let db = Database::new_in_memory().unwrap();
    let (mut bot, mut events) = start_bot(create_test_config(), &exchange, &db);

    bot.tick().await.unwrap();
    let open = exchange.open_orders();
    let (buy_id, buy) = open[1].clone();
    let (sell_id, sell) = open[2].clone();
    assert_eq!(buy.side, TradeSide::Buy);
    assert_eq!(sell.side, TradeSide::Sell);

    exchange.fill(&buy_id);
    exchange.fill(&sell_id);
    drain(&mut events);

    let report = bot.tick().await.unwrap();
    assert_eq!(report.filled.len(), 2);
    assert_eq!(report.reinvested, 1);

    let margins = bot.ledger().margin_report().unwrap();
    assert_eq!(margins.margins.len(), 1);
    let margin = &margins.margins[0];
    assert!((margin.matched_volume - sell.volume).abs() < 1e-9);
    assert!(margin.buy_price < margin.sell_price);
    assert!(margin.gross_margin > 0.0);

    let reinvestment = bot
        .ledger()
        .list()
        .unwrap()
        .into_iter()
        .find(|t| t.generation.is_none())
        .expect("a reinvestment order");
    assert_eq!(reinvestment.side, TradeSide::Buy);
    assert_eq!(reinvestment.status, TradeStatus::Open);
    assert!(reinvestment.requested_price < 0.50);

    let filled_events = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, BotEvent::TradeFilled { .. }))
        .count();
    assert_eq!(filled_events, 2);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_defers_placement_and_restart_resumes_it() {
    let mut config = create_test_config();
    config.trading.tick_deadline_seconds = 10;

    let exchange = funded_exchange();
    exchange.delay_add_order(Duration::from_secs(4));
    let db = Database::new_in_memory().unwrap();

    {
        let (mut bot, _events) = start_bot(config.clone(), &exchange, &db);
        let report = bot.tick().await.unwrap();
        assert!(report.deferred.is_some());
        assert_eq!(report.regenerated, None);
    }
    assert_eq!(exchange.call_count(Endpoint::AddOrder), 3);
    let active = BotStatus::load(&db).unwrap().active_generation.unwrap();
    assert!(!active.placement_done);

    // A fresh process picks up where the last one stopped
    let (mut bot, _events) = start_bot(config, &exchange, &db);
    let report = bot.tick().await.unwrap();
    assert_eq!(report.regenerated, Some(1));
    assert_eq!(exchange.call_count(Endpoint::AddOrder), 4);

    let mut levels: Vec<usize> = bot
        .ledger()
        .trades_for_generation(1)
        .unwrap()
        .iter()
        .filter_map(|t| t.level_index)
        .collect();
    levels.sort();
    assert_eq!(levels, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_trend_shift_cancels_old_generation_before_placing_new_one() {
    let mut config = create_test_config();
    config.trading.trend_check_interval_hours = 0.0001;

    let exchange = funded_exchange();
    let db = Database::new_in_memory().unwrap();
    let (mut bot, _events) = start_bot(config, &exchange, &db);

    bot.tick().await.unwrap();
    exchange.set_price(0.51);
    assert_eq!(bot.tick().await.unwrap().regenerated, None);

    exchange.set_price(0.52);
    let report = bot.tick().await.unwrap();
    assert_eq!(report.regenerated, Some(2));

    let active = bot.store().active().unwrap().unwrap();
    assert_eq!(active.trigger, RegenerationTrigger::TrendShift);
    assert_eq!(active.trend, Trend::Bullish);
    // Trending grids are wider
    assert!((active.range_percent - 6.0).abs() < 1e-9);

    let old = bot.ledger().trades_for_generation(1).unwrap();
    assert!(old.iter().all(|t| t.status == TradeStatus::Canceled));

    let calls = exchange.calls();
    let last_cancel = calls.iter().rposition(|e| *e == Endpoint::CancelOrder).unwrap();
    let first_new_order = calls
        .iter()
        .enumerate()
        .filter(|(_, e)| **e == Endpoint::AddOrder)
        .nth(4)
        .map(|(i, _)| i)
        .unwrap();
    assert!(last_cancel < first_new_order);
    assert_eq!(exchange.open_orders().len(), 4);
}

#[tokio::test]
async fn test_regeneration_cancel_failure_places_nothing() {
    let mut config = create_test_config();
    config.trading.trend_check_interval_hours = 0.0001;

    let exchange = funded_exchange();
    let db = Database::new_in_memory().unwrap();
    let (mut bot, _events) = start_bot(config, &exchange, &db);

    bot.tick().await.unwrap();
    exchange.set_price(0.51);
    bot.tick().await.unwrap();

    exchange.fail_cancels(true);
    exchange.set_price(0.52);
    let report = bot.tick().await.unwrap();

    assert!(report.deferred.unwrap().contains("could not cancel"));
    assert_eq!(exchange.call_count(Endpoint::AddOrder), 4);
    assert_eq!(bot.store().active().unwrap().unwrap().id, 1);
    assert_eq!(bot.store().pending().unwrap().unwrap().id, 2);
    assert!(bot.errors().is_cooling_down(ErrorCategory::OrderPlacementError));

    // Cancels go through next time, but placement waits out the cooldown
    exchange.fail_cancels(false);
    let report = bot.tick().await.unwrap();
    assert!(report.deferred.unwrap().contains("cooling down"));

    let active = bot.store().active().unwrap().unwrap();
    assert_eq!(active.id, 2);
    assert!(!active.placement_done);
    assert!(exchange.open_orders().is_empty());
    assert_eq!(exchange.call_count(Endpoint::AddOrder), 4);
}

#[tokio::test]
async fn test_level_timeout_without_fills_rebuilds_the_grid() {
    let mut config = create_test_config();
    config.trading.order_timeout_hours = 0.0001;

    let exchange = funded_exchange();
    let db = Database::new_in_memory().unwrap();
    let (mut bot, _events) = start_bot(config, &exchange, &db);

    bot.tick().await.unwrap();
    let report = bot.tick().await.unwrap();

    assert_eq!(report.regenerated, Some(2));
    let active = bot.store().active().unwrap().unwrap();
    assert_eq!(active.trigger, RegenerationTrigger::LevelTimeout);
    assert_eq!(exchange.open_orders().len(), 4);
    assert_eq!(exchange.call_count(Endpoint::CancelOrder), 4);
}

#[tokio::test]
async fn test_stale_orders_are_replaced_in_place_after_a_fill() {
    let mut config = create_test_config();
    config.trading.order_timeout_hours = 0.0001;

    let exchange = funded_exchange();
    let db = Database::new_in_memory().unwrap();
    let (mut bot, _events) = start_bot(config, &exchange, &db);

    bot.tick().await.unwrap();
    let (lowest, _) = exchange.open_orders()[0].clone();
    exchange.fill(&lowest);

    let report = bot.tick().await.unwrap();
    assert_eq!(report.regenerated, None);
    assert_eq!(report.stale_replaced, 3);
    assert_eq!(exchange.call_count(Endpoint::CancelOrder), 3);
    assert_eq!(exchange.call_count(Endpoint::AddOrder), 7);

    let generation = bot.store().active().unwrap().unwrap();
    assert_eq!(generation.id, 1);
    assert_eq!(generation.status, GenerationStatus::Active);
    let live = bot.ledger().live_trades().unwrap();
    assert_eq!(live.len(), 3);
    assert!(live.iter().all(|t| t.generation == Some(1)));
}

#[tokio::test]
async fn test_invalid_config_reload_keeps_last_known_good() {
    let exchange = funded_exchange();
    let db = Database::new_in_memory().unwrap();
    let (mut bot, _events) = start_bot(create_test_config(), &exchange, &db);

    let mut bad = create_test_config();
    bad.trading.grid_levels = 1;
    assert!(!bot.apply_config(bad));
    assert_eq!(bot.config().trading.grid_levels, 4);
    assert_eq!(bot.errors().occurrences(ErrorCategory::ConfigurationError), 1);

    let mut good = create_test_config();
    good.stop_loss.enabled = false;
    good.trading.grid_levels = 6;
    assert!(bot.apply_config(good));
    assert_eq!(bot.config().trading.grid_levels, 6);
    assert!(bot.stop_loss_state().is_none());

    bot.tick().await.unwrap();
    assert_eq!(exchange.call_count(Endpoint::AddOrder), 6);
}

#[tokio::test]
async fn test_unreachable_exchange_skips_the_tick() {
    let exchange = funded_exchange();
    exchange.set_price(0.0);
    let db = Database::new_in_memory().unwrap();
    let (mut bot, _events) = start_bot(create_test_config(), &exchange, &db);

    let report = bot.tick().await.unwrap();
    assert!(report.skipped.unwrap().contains("price unavailable"));
    assert_eq!(exchange.call_count(Endpoint::AddOrder), 0);
    assert_eq!(bot.errors().occurrences(ErrorCategory::DataProcessingError), 1);
}
