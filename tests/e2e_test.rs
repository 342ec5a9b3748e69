mod common;

use std::sync::{Arc, Mutex};

use chrono::Utc;
use common::*;
use swapbot::events::{ChannelSink, LogLevel, Notifier};
use swapbot::execution::{
    ExecutionAction, Executor, Phase, PositionManager, PriceCache,
};
use swapbot::*;
use tokio_test::{assert_err, assert_ok};

async fn open_position(h: &Harness) -> Position {
    assert!(h.lifecycle.register_entry_order(entry_order("e1", 100.0)));
    h.exchange.open_long(1.0, 100.0);
    h.lifecycle.on_order_update(&filled("e1", 1.0));

    let lifecycle = h.lifecycle.clone();
    assert!(
        wait_until(|| lifecycle
            .position()
            .map(|p| p.exit_orders.len() == 2)
            .unwrap_or(false))
        .await,
        "position was not committed with both exit orders"
    );
    h.lifecycle.position().unwrap()
}

fn assert_single_phase(h: &Harness) {
    let pending = !h.lifecycle.pending_order_ids().is_empty();
    assert!(!(pending && h.lifecycle.in_position()));
}

#[tokio::test]
async fn test_fill_opens_protected_position() {
    let _ = tracing_subscriber::fmt::try_init();
    let h = Harness::new();

    let position = open_position(&h).await;

    assert_eq!(position.entry_price, 100.0);
    assert_eq!(position.direction, Direction::Long);
    assert_eq!(position.take_profit, 105.0);
    assert_eq!(position.stop_loss, 97.0);
    assert_single_phase(&h);

    let state = h.exchange.state();
    assert_eq!(state.algo_orders.len(), 2);
    let (_, tp) = &state.algo_orders[0];
    let (_, sl) = &state.algo_orders[1];
    assert_eq!(tp.role, ExitRole::Tp);
    assert_eq!(tp.trigger_price, 105.0);
    assert_eq!(tp.side, Side::Sell);
    assert_eq!(sl.role, ExitRole::Sl);
    assert_eq!(sl.trigger_price, 97.0);
    assert_eq!(sl.size, 1.0);
}

#[tokio::test]
async fn test_take_profit_fill_returns_to_idle() {
    let h = Harness::new();
    let position = open_position(&h).await;
    let tp_id = position.exit_order(ExitRole::Tp).unwrap().to_string();
    let sl_id = position.exit_order(ExitRole::Sl).unwrap().to_string();

    // Exchange flattened the position when the TP triggered
    h.exchange.flatten();
    h.lifecycle.on_algo_update(&OrderState {
        order_id: tp_id,
        status: OrderStatus::Filled,
        filled_qty: 1.0,
        avg_price: 105.0,
    });

    let lifecycle = h.lifecycle.clone();
    assert!(wait_until(|| lifecycle.is_idle()).await);
    assert!(h.lifecycle.position().is_none());
    assert!(!h.lifecycle.tp_hit_triggered());
    assert!(!h.lifecycle.sl_hit_triggered());
    assert!(h.exchange.state().cancelled_algos.contains(&sl_id));
    // Nothing left to close, so no market order
    assert!(h.exchange.market_orders().is_empty());
}

#[tokio::test]
async fn test_take_profit_residual_is_market_closed() {
    let h = Harness::new();
    let position = open_position(&h).await;

    // Partial TP: 0.4 still open on the exchange
    h.exchange.open_long(0.4, 100.0);
    assert!(h.lifecycle.handle_tp_hit(position.id).await);

    let closes = h.exchange.market_orders();
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].side, Side::Sell);
    assert_eq!(closes[0].size, 0.4);
    assert!(closes[0].reduce_only);
    assert!(h.lifecycle.is_idle());
}

#[tokio::test]
async fn test_concurrent_stop_loss_runs_once() {
    let h = Harness::new();
    let position = open_position(&h).await;
    h.exchange.flatten();

    let (a, b) = tokio::join!(
        h.lifecycle.handle_sl_hit(position.id),
        h.lifecycle.handle_sl_hit(position.id)
    );

    assert!(a ^ b, "exactly one stop-loss handler should run");
    assert!(h.lifecycle.is_idle());
    assert!(!h.lifecycle.sl_hit_triggered());
    assert_single_phase(&h);
}

#[tokio::test]
async fn test_stale_position_id_is_ignored() {
    let h = Harness::new();
    let first = open_position(&h).await;
    h.exchange.flatten();
    assert!(h.lifecycle.handle_sl_hit(first.id).await);

    let second = open_position(&h).await;
    assert_ne!(first.id, second.id);

    // A late handler for the old position must not close the new one
    assert!(!h.lifecycle.handle_tp_hit(first.id).await);
    assert!(h.lifecycle.in_position());
}

#[tokio::test]
async fn test_closure_detected_without_algo_report() {
    let h = Harness::new();
    open_position(&h).await;
    h.exchange.flatten();

    h.lifecycle.on_position_snapshot(None);

    let lifecycle = h.lifecycle.clone();
    assert!(wait_until(|| lifecycle.is_idle()).await);
    assert!(h.exchange.market_orders().is_empty());
}

#[tokio::test]
async fn test_protection_failure_force_closes() {
    let mut h = Harness::new();
    h.exchange.state().fail_algo_orders = true;

    assert!(h.lifecycle.register_entry_order(entry_order("e1", 100.0)));
    h.exchange.open_long(1.0, 100.0);
    h.lifecycle.on_order_update(&filled("e1", 1.0));

    let lifecycle = h.lifecycle.clone();
    assert!(wait_until(|| lifecycle.is_idle()).await);

    let closes = h.exchange.market_orders();
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].side, Side::Sell);
    assert_eq!(closes[0].size, 1.0);
    assert!(h.exchange.state().positions.is_empty());

    let alerted = h.drain_events().iter().any(|e| {
        matches!(e, EngineEvent::Error { message } if message.contains("closing position immediately"))
    });
    assert!(alerted);
}

#[tokio::test]
async fn test_fill_without_position_resets_pending() {
    let mut h = Harness::new();
    assert!(h.lifecycle.register_entry_order(entry_order("e1", 100.0)));
    assert!(h.lifecycle.register_entry_order(entry_order("e2", 99.5)));

    h.lifecycle.on_order_update(&filled("e1", 1.0));

    let lifecycle = h.lifecycle.clone();
    assert!(wait_until(|| lifecycle.is_idle()).await);

    let cancelled = h.exchange.state().cancelled_orders.clone();
    assert!(cancelled.contains(&"e1".to_string()));
    assert!(cancelled.contains(&"e2".to_string()));

    let critical = h.drain_events().iter().any(|e| {
        matches!(e, EngineEvent::ConsoleLog(log) if log.level == LogLevel::Critical)
    });
    assert!(critical);
}

#[tokio::test]
async fn test_dead_members_empty_the_batch() {
    let h = Harness::new();
    assert!(h.lifecycle.register_entry_order(entry_order("e1", 100.0)));
    assert!(h.lifecycle.register_entry_order(entry_order("e2", 99.5)));

    let canceled = |id: &str| OrderState {
        order_id: id.to_string(),
        status: OrderStatus::Canceled,
        filled_qty: 0.0,
        avg_price: 0.0,
    };

    h.lifecycle.on_order_update(&canceled("e1"));
    assert_eq!(h.lifecycle.pending_order_ids(), vec!["e2".to_string()]);

    h.lifecycle.on_order_update(&canceled("e2"));
    assert!(h.lifecycle.is_idle());
}

#[tokio::test]
async fn test_manual_exit_failure_restores_protection() {
    let h = Harness::new();
    let position = open_position(&h).await;
    h.exchange.state().fail_market_orders = true;

    assert_err!(h.lifecycle.manual_exit("operator").await);

    let current = h.lifecycle.position().unwrap();
    assert_eq!(current.id, position.id);
    assert_eq!(current.exit_orders.len(), 2);
    assert_ne!(current.exit_orders, position.exit_orders);
    assert!(!h.lifecycle.tp_hit_triggered());

    h.exchange.state().fail_market_orders = false;
    assert!(assert_ok!(h.lifecycle.manual_exit("operator").await));
    assert!(h.lifecycle.is_idle());
}

#[tokio::test]
async fn test_modify_tpsl_uses_live_average() {
    let h = Harness::new();
    open_position(&h).await;
    h.exchange.open_long(2.0, 98.0);

    assert_ok!(h.lifecycle.batch_modify_tpsl().await);

    let position = h.lifecycle.position().unwrap();
    assert_eq!(position.entry_price, 98.0);
    assert_eq!(position.quantity, 2.0);
    assert_eq!(position.take_profit, 103.0);
    assert_eq!(position.stop_loss, 95.0);
    assert_eq!(h.exchange.state().algo_orders.len(), 4);
}

#[tokio::test]
async fn test_executor_places_stepped_batch() {
    let h = Harness::new();
    let prices = Arc::new(PriceCache::new());
    prices.update(101.0, Utc::now());

    let account = Arc::new(Mutex::new(AccountSnapshot {
        available_balance: 500.0,
        ..Default::default()
    }));
    let manager = PositionManager::new(
        h.lifecycle.clone(),
        h.exchange.clone(),
        h.config.clone(),
        prices.clone(),
        h.shutdown.clone(),
    );
    let (sink, _events) = ChannelSink::new();
    let executor = Executor::new(
        h.lifecycle.clone(),
        h.exchange.clone(),
        h.config.clone(),
        prices,
        account,
        manager.clone(),
        Notifier::new(Arc::new(sink)),
    )
    .unwrap();

    let decision = assert_ok!(executor.run_cycle().await);
    match decision.action {
        ExecutionAction::Enter {
            direction,
            ref limit_prices,
            quantity,
        } => {
            assert_eq!(direction, Direction::Long);
            assert_eq!(limit_prices, &vec![100.0, 99.5, 99.0]);
            assert_eq!(quantity, 0.1);
        }
        other => panic!("expected entry, got {:?}", other),
    }

    let limits: Vec<f64> = h
        .exchange
        .state()
        .orders
        .iter()
        .filter_map(|o| o.price)
        .collect();
    assert_eq!(limits, vec![100.0, 99.5, 99.0]);
    assert_eq!(h.lifecycle.pending_order_ids().len(), 3);
    assert!(matches!(h.lifecycle.phase(), Phase::EntryPending(_)));
    assert!(manager.is_running());

    // One pending batch at a time
    let second = executor.run_cycle().await.unwrap();
    assert_eq!(second.action, ExecutionAction::Skip);

    h.shutdown.trigger();
}

#[tokio::test]
async fn test_startup_fails_without_stream() {
    let exchange = FakeExchange::new();
    let mut config = test_config();
    config.ws_url = "ws://127.0.0.1:9".to_string();
    config.timings.subscription_wait_ms = 300;
    config.timings.reconnect_delay_ms = 50;

    let (sink, mut events) = ChannelSink::new();
    let result = Engine::start(config, exchange, Arc::new(sink)).await;

    assert!(matches!(result, Err(EngineError::Startup(_))));

    let mut stopped = false;
    while let Ok(event) = events.try_recv() {
        if event == (EngineEvent::BotStatus { running: false }) {
            stopped = true;
        }
    }
    assert!(stopped);
}

#[tokio::test]
async fn test_startup_fails_on_unknown_instrument() {
    let exchange = FakeExchange::new();
    exchange.state().fail_product_info = true;
    let (sink, _events) = ChannelSink::new();

    let result = Engine::start(test_config(), exchange, Arc::new(sink)).await;

    assert!(matches!(result, Err(EngineError::Startup(msg)) if msg.contains("product info")));
}

#[tokio::test]
async fn test_startup_closes_leftover_position() {
    let exchange = FakeExchange::new();
    exchange.open_long(3.0, 95.0);
    let (url, server) = spawn_stream_server(0).await;

    let mut config = test_config();
    config.ws_url = url;
    let (sink, _events) = ChannelSink::new();

    let engine = assert_ok!(Engine::start(config, exchange.clone(), Arc::new(sink)).await);

    let closes = exchange.market_orders();
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].size, 3.0);

    let report = engine.status();
    assert!(report.running);
    assert!(report.feed_live);

    engine.stop().await;
    assert!(!engine.is_running());
    server.abort();
}

#[tokio::test]
async fn test_startup_with_private_stream() {
    let exchange = FakeExchange::new();
    let (url, server) = spawn_stream_server(0).await;

    let mut config = test_config();
    config.ws_url = url.clone();
    config.private_ws_url = Some(url);
    let (sink, _events) = ChannelSink::new();

    let engine = assert_ok!(Engine::start(config, exchange, Arc::new(sink)).await);

    let report = engine.status();
    assert!(report.feed_live);
    assert_eq!(report.private_feed_live, Some(true));

    engine.stop().await;
    server.abort();
}

// ----------------------------------------------------------------------------
// Protection coverage
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_member_filled_during_commit_is_protected() {
    let h = Harness::new();
    assert!(h.lifecycle.register_entry_order(entry_order("e1", 100.0)));
    assert!(h.lifecycle.register_entry_order(entry_order("e2", 99.5)));
    h.exchange.open_long(1.0, 100.0);
    // e2 fills just before its cancel lands
    h.exchange
        .state()
        .fill_on_cancel
        .insert("e2".to_string(), 2.0);

    h.lifecycle.on_order_update(&filled("e1", 1.0));

    let lifecycle = h.lifecycle.clone();
    assert!(
        wait_until(|| lifecycle
            .position()
            .map(|p| p.exit_orders.len() == 2)
            .unwrap_or(false))
        .await
    );
    let position = h.lifecycle.position().unwrap();
    assert_eq!(position.quantity, 2.0);
    assert!(h
        .exchange
        .state()
        .algo_orders
        .iter()
        .all(|(_, request)| request.size == 2.0));
    assert!(h.exchange.state().cancelled_orders.contains(&"e2".to_string()));
}

#[tokio::test]
async fn test_stop_loss_closes_leftover_position() {
    let h = Harness::new();
    let position = open_position(&h).await;

    // SL covered less than the exchange holds
    assert_eq!(h.exchange.position_size(), 1.0);
    assert!(h.lifecycle.handle_sl_hit(position.id).await);

    let closes = h.exchange.market_orders();
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].side, Side::Sell);
    assert_eq!(closes[0].size, 1.0);
    assert!(closes[0].reduce_only);
    assert_eq!(h.exchange.position_size(), 0.0);
    assert!(h.lifecycle.is_idle());
}

#[tokio::test]
async fn test_late_batch_fill_resizes_protection() {
    let h = Harness::new();
    assert!(h.lifecycle.register_entry_order(entry_order("e1", 100.0)));
    assert!(h.lifecycle.register_entry_order(entry_order("e2", 99.5)));
    h.exchange.state().stuck_orders.push("e2".to_string());
    h.exchange.open_long(1.0, 100.0);
    h.lifecycle.on_order_update(&filled("e1", 1.0));

    let lifecycle = h.lifecycle.clone();
    assert!(
        wait_until(|| lifecycle
            .position()
            .map(|p| p.exit_orders.len() == 2)
            .unwrap_or(false))
        .await
    );
    let first = h.lifecycle.position().unwrap();
    assert_eq!(first.quantity, 1.0);

    // The uncancellable member fills afterwards
    h.exchange.open_long(2.0, 99.75);
    h.lifecycle.on_order_update(&filled("e2", 1.0));

    let lifecycle = h.lifecycle.clone();
    assert!(
        wait_until(|| lifecycle
            .position()
            .map(|p| p.quantity == 2.0 && p.exit_orders.len() == 2)
            .unwrap_or(false))
        .await
    );
    let resized = h.lifecycle.position().unwrap();
    assert_eq!(resized.id, first.id);
    assert_eq!(resized.entry_price, 99.75);
    assert_eq!(resized.take_profit, 104.75);
    assert_eq!(resized.stop_loss, 96.75);

    let state = h.exchange.state();
    for id in first.exit_orders.values() {
        assert!(state.cancelled_algos.contains(id));
    }
    for id in resized.exit_orders.values() {
        let (_, request) = state.algo_orders.iter().find(|(algo, _)| algo == id).unwrap();
        assert_eq!(request.size, 2.0);
    }
}

#[tokio::test]
async fn test_position_growth_found_by_poll() {
    let h = Harness::new();
    open_position(&h).await;
    h.exchange.open_long(1.5, 100.0);

    assert!(h.manager().tick().await);

    let lifecycle = h.lifecycle.clone();
    assert!(
        wait_until(|| lifecycle
            .position()
            .map(|p| p.quantity == 1.5 && p.exit_orders.len() == 2)
            .unwrap_or(false))
        .await
    );
}

#[tokio::test]
async fn test_unprotected_position_reprotected_on_tick() {
    let h = Harness::new();
    {
        let mut state = h.exchange.state();
        state.fail_algo_orders = true;
        state.fail_market_orders = true;
    }
    assert!(h.lifecycle.register_entry_order(entry_order("e1", 100.0)));
    h.exchange.open_long(1.0, 100.0);

    h.lifecycle.confirm_entry().await;

    // Neither TP/SL nor the fail-closed market order went through
    let stranded = h.lifecycle.position().unwrap();
    assert!(stranded.exit_orders.is_empty());
    assert!(!h.lifecycle.tp_hit_triggered() && !h.lifecycle.sl_hit_triggered());

    {
        let mut state = h.exchange.state();
        state.fail_algo_orders = false;
        state.fail_market_orders = false;
    }
    assert!(h.manager().tick().await);

    let position = h.lifecycle.position().unwrap();
    assert_eq!(position.id, stranded.id);
    assert_eq!(position.exit_orders.len(), 2);
    assert_eq!(h.exchange.position_size(), 1.0);
    assert_eq!(h.exchange.state().algo_orders.len(), 2);
}

#[tokio::test]
async fn test_reprotect_failure_closes_position() {
    let h = Harness::new();
    {
        let mut state = h.exchange.state();
        state.fail_algo_orders = true;
        state.fail_market_orders = true;
    }
    assert!(h.lifecycle.register_entry_order(entry_order("e1", 100.0)));
    h.exchange.open_long(1.0, 100.0);
    h.lifecycle.confirm_entry().await;
    assert!(h.lifecycle.in_position());

    // Market orders recover, exit orders still rejected
    h.exchange.state().fail_market_orders = false;
    h.manager().tick().await;

    assert!(h.lifecycle.is_idle());
    assert_eq!(h.exchange.market_orders().len(), 1);
    assert_eq!(h.exchange.position_size(), 0.0);
}

// ----------------------------------------------------------------------------
// REST reconciliation
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_poll_detects_entry_fill() {
    let h = Harness::new();
    assert!(h.lifecycle.register_entry_order(entry_order("e1", 100.0)));
    h.exchange.open_long(1.0, 100.0);
    h.exchange.set_order_state("e1", OrderStatus::Filled, 1.0);

    assert!(h.manager().tick().await);

    let lifecycle = h.lifecycle.clone();
    assert!(
        wait_until(|| lifecycle
            .position()
            .map(|p| p.exit_orders.len() == 2)
            .unwrap_or(false))
        .await
    );
    assert!(h.lifecycle.pending_order_ids().is_empty());
}

#[tokio::test]
async fn test_poll_detects_stop_loss_fill() {
    let h = Harness::new();
    let position = open_position(&h).await;
    let tp_id = position.exit_order(ExitRole::Tp).unwrap().to_string();
    let sl_id = position.exit_order(ExitRole::Sl).unwrap().to_string();

    h.exchange.flatten();
    h.exchange.set_algo_status(&sl_id, OrderStatus::Filled);
    assert!(h.manager().tick().await);

    let lifecycle = h.lifecycle.clone();
    assert!(wait_until(|| lifecycle.is_idle()).await);
    assert!(!h.lifecycle.sl_hit_triggered());
    assert!(h.exchange.state().cancelled_algos.contains(&tp_id));
    assert!(h.exchange.market_orders().is_empty());
}

#[tokio::test]
async fn test_poll_cancels_stale_entry() {
    let h = Harness::new();
    let mut order = entry_order("e1", 100.0);
    order.placed_at = Utc::now() - chrono::Duration::seconds(700);
    assert!(h.lifecycle.register_entry_order(order));

    assert!(h.manager().tick().await);

    assert!(h.lifecycle.is_idle());
    assert!(h.exchange.state().cancelled_orders.contains(&"e1".to_string()));
}

#[tokio::test]
async fn test_poll_cancels_adverse_entry() {
    let h = Harness::new();
    // Long limit at 100 with the market already at 98
    h.exchange.state().ticker = 98.0;
    assert!(h.lifecycle.register_entry_order(entry_order("e1", 100.0)));

    assert!(h.manager().tick().await);

    assert!(h.lifecycle.is_idle());
    assert_eq!(h.exchange.state().cancelled_orders, vec!["e1".to_string()]);
}

#[tokio::test]
async fn test_entry_filled_before_cancel_is_committed() {
    let mut h = Harness::new();
    let mut order = entry_order("e1", 100.0);
    order.placed_at = Utc::now() - chrono::Duration::seconds(700);
    assert!(h.lifecycle.register_entry_order(order));
    // Filled on the exchange, not yet reported
    h.exchange.open_long(1.0, 100.0);

    assert!(h.manager().tick().await);

    let position = h.lifecycle.position().unwrap();
    assert_eq!(position.exit_orders.len(), 2);
    assert_eq!(position.quantity, 1.0);
    let warned = h.drain_events().iter().any(|e| {
        matches!(e, EngineEvent::Warning { message } if message.contains("filled before cancel"))
    });
    assert!(warned);
}
