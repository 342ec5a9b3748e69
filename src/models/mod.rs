use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order side as the exchange spells it
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// Trading signal / position direction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Side that opens a position in this direction
    pub fn entry_side(&self) -> Side {
        match self {
            Direction::Long => Side::Buy,
            Direction::Short => Side::Sell,
        }
    }

    /// Side that reduces a position in this direction
    pub fn exit_side(&self) -> Side {
        self.entry_side().opposite()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }

    /// Take-profit and stop-loss trigger prices for an entry at `entry_price`
    pub fn exit_targets(&self, entry_price: f64, tp_offset: f64, sl_offset: f64) -> (f64, f64) {
        match self {
            Direction::Long => (entry_price + tp_offset, entry_price - sl_offset),
            Direction::Short => (entry_price - tp_offset, entry_price + sl_offset),
        }
    }
}

/// Instrument metadata, loaded once at startup
#[derive(Debug, Clone, PartialEq)]
pub struct ProductInfo {
    pub symbol: String,
    pub tick_size: f64,
    pub lot_size: f64,
    pub min_order_qty: f64,
    pub contract_value: f64,
}

impl ProductInfo {
    /// Round a price to the nearest tick
    pub fn round_price(&self, price: f64) -> f64 {
        round_to_step(price, self.tick_size)
    }

    /// Round a quantity down to the lot step
    pub fn round_qty(&self, qty: f64) -> f64 {
        if self.lot_size <= 0.0 {
            return qty;
        }
        let steps = (qty / self.lot_size + 1e-9).floor();
        normalize(steps * self.lot_size, self.lot_size)
    }

    /// Decimal places implied by the tick size
    pub fn price_precision(&self) -> usize {
        decimals_of(self.tick_size)
    }

    pub fn qty_precision(&self) -> usize {
        decimals_of(self.lot_size)
    }
}

fn round_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    normalize((value / step).round() * step, step)
}

fn normalize(value: f64, step: f64) -> f64 {
    let factor = 10f64.powi(decimals_of(step) as i32);
    (value * factor).round() / factor
}

fn decimals_of(step: f64) -> usize {
    if step <= 0.0 || step >= 1.0 {
        return 0;
    }
    let text = format!("{}", step);
    text.split('.').nth(1).map(|d| d.len()).unwrap_or(0)
}

/// Format a number the way the exchange expects it in request bodies
pub fn format_decimal(value: f64, precision: usize) -> String {
    let text = format!("{:.*}", precision, value);
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        text
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
        }
    }
}

/// Regular (entry or market-close) order
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub size: f64,
    pub price: Option<f64>,
    pub reduce_only: bool,
    /// Set only in hedge (long/short) position mode
    pub pos_side: Option<Direction>,
    pub margin_mode: String,
    pub client_order_id: String,
}

impl OrderRequest {
    pub fn limit(symbol: &str, side: Side, size: f64, price: f64, margin_mode: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Limit,
            size,
            price: Some(price),
            reduce_only: false,
            pos_side: None,
            margin_mode: margin_mode.to_string(),
            client_order_id: new_client_order_id(),
        }
    }

    pub fn market_close(symbol: &str, side: Side, size: f64, margin_mode: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            size,
            price: None,
            reduce_only: true,
            pos_side: None,
            margin_mode: margin_mode.to_string(),
            client_order_id: new_client_order_id(),
        }
    }

    pub fn with_pos_side(mut self, pos_side: Option<Direction>) -> Self {
        self.pos_side = pos_side;
        self
    }
}

/// Client order ids must be alphanumeric, at most 32 chars
pub fn new_client_order_id() -> String {
    format!("sb{}", &Uuid::new_v4().simple().to_string()[..30])
}

/// Role of a protective exit order
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExitRole {
    Tp,
    Sl,
}

impl ExitRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitRole::Tp => "tp",
            ExitRole::Sl => "sl",
        }
    }
}

/// Conditional (algo) exit order: triggers at `trigger_price`, executes at market
#[derive(Debug, Clone, PartialEq)]
pub struct AlgoOrderRequest {
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub role: ExitRole,
    pub trigger_price: f64,
    pub pos_side: Option<Direction>,
    pub margin_mode: String,
}

/// Order status as reported by the exchange, for regular and algo orders
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderStatus {
    Live,
    PartiallyFilled,
    Filled,
    Canceled,
    Failed,
    Other(String),
}

impl OrderStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "live" | "pause" => OrderStatus::Live,
            "partially_filled" | "partially_effective" => OrderStatus::PartiallyFilled,
            "filled" | "effective" => OrderStatus::Filled,
            "canceled" | "cancelled" | "mmp_canceled" => OrderStatus::Canceled,
            "order_failed" | "failed" | "rejected" => OrderStatus::Failed,
            other => OrderStatus::Other(other.to_string()),
        }
    }

    /// Terminal without producing a fill
    pub fn is_dead(&self) -> bool {
        matches!(self, OrderStatus::Canceled | OrderStatus::Failed)
    }

    pub fn is_fill(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::PartiallyFilled)
    }
}

/// Snapshot of one order's state
#[derive(Debug, Clone, PartialEq)]
pub struct OrderState {
    pub order_id: String,
    pub status: OrderStatus,
    pub filled_qty: f64,
    pub avg_price: f64,
}

/// Open order resting on the book
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOrder {
    pub order_id: String,
    pub side: Side,
    pub price: f64,
    pub size: f64,
}

/// Live position as reported by the exchange
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSnapshot {
    pub symbol: String,
    /// Absolute size in contracts
    pub size: f64,
    pub avg_price: f64,
    pub direction: Option<Direction>,
}

impl PositionSnapshot {
    pub fn is_open(&self) -> bool {
        self.size > 0.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BalanceSnapshot {
    pub total_equity: f64,
    pub available_equity: f64,
}

/// One trade fill
#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub trade_id: String,
    pub order_id: String,
    pub fill_pnl: f64,
    pub fee: f64,
    pub timestamp: DateTime<Utc>,
}

/// One member of a pending entry batch
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntryOrder {
    pub order_id: String,
    pub side: Side,
    pub quantity: f64,
    pub limit_price: f64,
    pub direction: Direction,
    pub placed_at: DateTime<Utc>,
    pub status: OrderStatus,
    pub filled_qty: f64,
}

/// Open, protected position
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    /// Position lifetime id
    pub id: Uuid,
    pub symbol: String,
    pub entry_price: f64,
    pub quantity: f64,
    pub direction: Direction,
    pub take_profit: f64,
    pub stop_loss: f64,
    pub exit_orders: HashMap<ExitRole, String>,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    pub fn exit_order(&self, role: ExitRole) -> Option<&str> {
        self.exit_orders.get(&role).map(String::as_str)
    }

    /// Which exit role, if any, an algo order id belongs to
    pub fn role_of(&self, algo_id: &str) -> Option<ExitRole> {
        self.exit_orders
            .iter()
            .find(|(_, id)| id.as_str() == algo_id)
            .map(|(role, _)| *role)
    }
}

/// Account telemetry published on every refresh
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AccountSnapshot {
    pub total_capital: f64,
    pub max_allowed_used_display: f64,
    pub max_amount_display: f64,
    pub used_amount: f64,
    pub remaining_amount: f64,
    pub total_balance: f64,
    pub available_balance: f64,
    pub net_profit: f64,
    pub total_trades: u64,
}
