use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    AlgoOrderRequest, BalanceSnapshot, Fill, OrderRequest, OrderState, PendingOrder,
    PositionSnapshot, ProductInfo,
};
use crate::Result;

/// Everything the engine needs from the exchange's REST surface.
///
/// `Err(Transport)` means no state change is known to have happened;
/// `Err(Exchange)` carries the exchange's own code.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Synchronize the signing clock; returns the offset in ms
    async fn sync_clock(&self) -> Result<i64>;

    async fn product_info(&self, symbol: &str) -> Result<ProductInfo>;

    async fn set_leverage(&self, symbol: &str, leverage: u32, margin_mode: &str) -> Result<()>;

    /// Last traded price from the REST ticker
    async fn ticker_price(&self, symbol: &str) -> Result<f64>;

    /// Returns the exchange order id
    async fn place_order(&self, request: &OrderRequest) -> Result<String>;

    /// Returns the algo order id
    async fn place_algo_order(&self, request: &AlgoOrderRequest) -> Result<String>;

    /// Already filled or already cancelled counts as success
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()>;

    async fn cancel_algo_orders(&self, symbol: &str, algo_ids: &[String]) -> Result<()>;

    async fn pending_orders(&self, symbol: &str) -> Result<Vec<PendingOrder>>;

    async fn order_state(&self, symbol: &str, order_id: &str) -> Result<OrderState>;

    async fn algo_order_state(&self, algo_id: &str) -> Result<OrderState>;

    async fn positions(&self, symbol: &str) -> Result<Vec<PositionSnapshot>>;

    async fn balance(&self, currency: &str) -> Result<BalanceSnapshot>;

    async fn fills(&self, symbol: &str, since: DateTime<Utc>) -> Result<Vec<Fill>>;
}

/// First open position in a snapshot list
pub fn open_position(positions: &[PositionSnapshot]) -> Option<&PositionSnapshot> {
    positions.iter().find(|p| p.is_open() && p.avg_price > 0.0)
}
