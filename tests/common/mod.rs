#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use swapbot::config::Timings;
use swapbot::events::{ChannelSink, Notifier};
use swapbot::execution::{Lifecycle, PositionManager, PriceCache, Scheduler, ShutdownSignal};
use swapbot::*;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::tungstenite::Message;

pub const SYMBOL: &str = "ETH-USDT-SWAP";

pub fn test_config() -> EngineConfig {
    let json = json!({
        "symbol": SYMBOL,
        "leverage": 10,
        "use_testnet": true,
        "okx_api_key": "key",
        "okx_api_secret": "secret",
        "okx_passphrase": "pass",
        "entry_price_offset": 1.0,
        "tp_price_offset": 5.0,
        "sl_price_offset": 3.0,
        "batch_size_per_loop": 3,
        "batch_offset": 0.5,
        "loop_time_seconds": 60,
        "cancel_unfilled_seconds": 600,
        "min_order_amount": 10.0,
        "target_order_amount": 0.1,
        "rate_divisor": 2.0,
        "long_safety_line_price": 100.0,
        "short_safety_line_price": 90.0
    });
    let mut config = EngineConfig::from_json_str(&json.to_string()).unwrap();
    config.timings = Timings::immediate();
    config
}

pub fn product() -> ProductInfo {
    ProductInfo {
        symbol: SYMBOL.to_string(),
        tick_size: 0.01,
        lot_size: 0.1,
        min_order_qty: 0.1,
        contract_value: 0.1,
    }
}

// ============================================================================
// In-memory exchange
// ============================================================================

#[derive(Default)]
pub struct FakeState {
    pub positions: Vec<PositionSnapshot>,
    pub orders: Vec<OrderRequest>,
    pub algo_orders: Vec<(String, AlgoOrderRequest)>,
    pub pending: Vec<PendingOrder>,
    pub cancelled_orders: Vec<String>,
    pub cancelled_algos: Vec<String>,
    pub next_id: u64,
    pub fail_algo_orders: bool,
    pub fail_market_orders: bool,
    pub fail_product_info: bool,
    pub ticker: f64,
    pub available: f64,
    /// Polled entry order states; unknown ids report `live`
    pub order_states: HashMap<String, OrderState>,
    /// Polled algo order states; unknown ids report `live`
    pub algo_states: HashMap<String, OrderStatus>,
    /// Cancelling one of these ids reports success but the order had filled:
    /// the position grows to the given size
    pub fill_on_cancel: HashMap<String, f64>,
    /// Cancels of these ids fail
    pub stuck_orders: Vec<String>,
}

#[derive(Default)]
pub struct FakeExchange {
    state: Mutex<FakeState>,
}

impl FakeExchange {
    pub fn new() -> Arc<Self> {
        let fake = Self::default();
        {
            let mut state = fake.state();
            state.ticker = 101.0;
            state.available = 1_000.0;
        }
        Arc::new(fake)
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn open_long(&self, size: f64, avg_price: f64) {
        self.state().positions = vec![PositionSnapshot {
            symbol: SYMBOL.to_string(),
            size,
            avg_price,
            direction: Some(Direction::Long),
        }];
    }

    pub fn flatten(&self) {
        self.state().positions.clear();
    }

    pub fn set_order_state(&self, order_id: &str, status: OrderStatus, filled_qty: f64) {
        self.state().order_states.insert(
            order_id.to_string(),
            OrderState {
                order_id: order_id.to_string(),
                status,
                filled_qty,
                avg_price: 100.0,
            },
        );
    }

    pub fn set_algo_status(&self, algo_id: &str, status: OrderStatus) {
        self.state().algo_states.insert(algo_id.to_string(), status);
    }

    pub fn position_size(&self) -> f64 {
        self.state().positions.iter().map(|p| p.size).sum()
    }

    pub fn market_orders(&self) -> Vec<OrderRequest> {
        self.state()
            .orders
            .iter()
            .filter(|o| o.order_type == OrderType::Market)
            .cloned()
            .collect()
    }

    fn next_id(state: &mut FakeState, prefix: &str) -> String {
        state.next_id += 1;
        format!("{}-{}", prefix, state.next_id)
    }
}

#[async_trait]
impl Exchange for FakeExchange {
    async fn sync_clock(&self) -> swapbot::Result<i64> {
        Ok(0)
    }

    async fn product_info(&self, _symbol: &str) -> swapbot::Result<ProductInfo> {
        if self.state().fail_product_info {
            return Err(EngineError::exchange("51001", "Instrument ID does not exist"));
        }
        Ok(product())
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: u32, _margin_mode: &str) -> swapbot::Result<()> {
        Ok(())
    }

    async fn ticker_price(&self, _symbol: &str) -> swapbot::Result<f64> {
        Ok(self.state().ticker)
    }

    async fn place_order(&self, request: &OrderRequest) -> swapbot::Result<String> {
        let mut state = self.state();
        if request.order_type == OrderType::Market {
            if state.fail_market_orders {
                return Err(EngineError::exchange("51008", "Insufficient margin"));
            }
            if request.reduce_only {
                state.positions.clear();
            }
        }
        let id = Self::next_id(&mut state, "ord");
        if request.order_type == OrderType::Limit {
            state.pending.push(PendingOrder {
                order_id: id.clone(),
                side: request.side,
                price: request.price.unwrap_or_default(),
                size: request.size,
            });
        }
        state.orders.push(request.clone());
        Ok(id)
    }

    async fn place_algo_order(&self, request: &AlgoOrderRequest) -> swapbot::Result<String> {
        let mut state = self.state();
        if state.fail_algo_orders {
            return Err(EngineError::exchange("51277", "TP trigger price cannot be lower than the last price"));
        }
        let id = Self::next_id(&mut state, "algo");
        state.algo_orders.push((id.clone(), request.clone()));
        Ok(id)
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> swapbot::Result<()> {
        let mut state = self.state();
        if state.stuck_orders.iter().any(|id| id == order_id) {
            return Err(EngineError::Transport("cancel timed out".into()));
        }
        if let Some(size) = state.fill_on_cancel.remove(order_id) {
            if let Some(position) = state.positions.first_mut() {
                position.size = size;
            }
        }
        state.pending.retain(|o| o.order_id != order_id);
        state.cancelled_orders.push(order_id.to_string());
        Ok(())
    }

    async fn cancel_algo_orders(&self, _symbol: &str, algo_ids: &[String]) -> swapbot::Result<()> {
        self.state().cancelled_algos.extend(algo_ids.iter().cloned());
        Ok(())
    }

    async fn pending_orders(&self, _symbol: &str) -> swapbot::Result<Vec<PendingOrder>> {
        Ok(self.state().pending.clone())
    }

    async fn order_state(&self, _symbol: &str, order_id: &str) -> swapbot::Result<OrderState> {
        let scripted = self.state().order_states.get(order_id).cloned();
        Ok(scripted.unwrap_or_else(|| OrderState {
            order_id: order_id.to_string(),
            status: OrderStatus::Live,
            filled_qty: 0.0,
            avg_price: 0.0,
        }))
    }

    async fn algo_order_state(&self, algo_id: &str) -> swapbot::Result<OrderState> {
        let status = self
            .state()
            .algo_states
            .get(algo_id)
            .cloned()
            .unwrap_or(OrderStatus::Live);
        let filled_qty = if status.is_fill() { 1.0 } else { 0.0 };
        Ok(OrderState {
            order_id: algo_id.to_string(),
            status,
            filled_qty,
            avg_price: 0.0,
        })
    }

    async fn positions(&self, _symbol: &str) -> swapbot::Result<Vec<PositionSnapshot>> {
        Ok(self.state().positions.clone())
    }

    async fn balance(&self, _currency: &str) -> swapbot::Result<BalanceSnapshot> {
        let available = self.state().available;
        Ok(BalanceSnapshot {
            total_equity: available,
            available_equity: available,
        })
    }

    async fn fills(&self, _symbol: &str, _since: DateTime<Utc>) -> swapbot::Result<Vec<Fill>> {
        Ok(Vec::new())
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub exchange: Arc<FakeExchange>,
    pub lifecycle: Arc<Lifecycle>,
    pub shutdown: ShutdownSignal,
    pub events: UnboundedReceiver<EngineEvent>,
    pub config: Arc<EngineConfig>,
}

impl Harness {
    pub fn new() -> Self {
        let exchange = FakeExchange::new();
        let config = Arc::new(test_config());
        let (sink, events) = ChannelSink::new();
        let shutdown = ShutdownSignal::new();
        let lifecycle = Lifecycle::new(
            exchange.clone(),
            config.clone(),
            product(),
            Notifier::new(Arc::new(sink)),
            Scheduler::new(shutdown.clone()),
        );
        Self {
            exchange,
            lifecycle,
            shutdown,
            events,
            config,
        }
    }

    pub fn manager(&self) -> Arc<PositionManager> {
        PositionManager::new(
            self.lifecycle.clone(),
            self.exchange.clone(),
            self.config.clone(),
            Arc::new(PriceCache::new()),
            self.shutdown.clone(),
        )
    }

    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

pub fn entry_order(order_id: &str, limit_price: f64) -> PendingEntryOrder {
    PendingEntryOrder {
        order_id: order_id.to_string(),
        side: Side::Buy,
        quantity: 1.0,
        limit_price,
        direction: Direction::Long,
        placed_at: Utc::now(),
        status: OrderStatus::Live,
        filled_qty: 0.0,
    }
}

pub fn filled(order_id: &str, qty: f64) -> OrderState {
    OrderState {
        order_id: order_id.to_string(),
        status: OrderStatus::Filled,
        filled_qty: qty,
        avg_price: 100.0,
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn wait_until<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

// ============================================================================
// Market stream server
// ============================================================================

/// Local websocket server that accepts any login, confirms every
/// subscription and pushes one ticker. The first `drops` connections are
/// closed right after that.
pub async fn spawn_stream_server(drops: usize) -> (String, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let handle = tokio::spawn(async move {
        let mut served = 0usize;
        while let Ok((tcp, _)) = listener.accept().await {
            let close_after = served < drops;
            served += 1;
            tokio::spawn(async move {
                let mut ws = match tokio_tungstenite::accept_async(tcp).await {
                    Ok(ws) => ws,
                    Err(_) => return,
                };
                while let Some(Ok(msg)) = ws.next().await {
                    let text = match msg {
                        Message::Text(text) => text,
                        Message::Close(_) => return,
                        _ => continue,
                    };
                    if text == "ping" {
                        let _ = ws.send(Message::Text("pong".to_string())).await;
                        continue;
                    }
                    let request: Value = match serde_json::from_str(&text) {
                        Ok(v) => v,
                        Err(_) => continue,
                    };
                    if request["op"] == "login" {
                        let ack = json!({ "event": "login", "code": "0", "msg": "" });
                        let _ = ws.send(Message::Text(ack.to_string())).await;
                        continue;
                    }
                    let args = request["args"].as_array().cloned().unwrap_or_default();
                    for arg in args {
                        let ack = json!({ "event": "subscribe", "arg": arg });
                        let _ = ws.send(Message::Text(ack.to_string())).await;
                    }
                    let ticker = json!({
                        "arg": { "channel": "tickers", "instId": SYMBOL },
                        "data": [{ "instId": SYMBOL, "last": "101.5", "ts": Utc::now().timestamp_millis().to_string() }]
                    });
                    let _ = ws.send(Message::Text(ticker.to_string())).await;
                    if close_after {
                        let _ = ws.close(None).await;
                        return;
                    }
                }
            });
        }
    });

    (url, handle)
}
