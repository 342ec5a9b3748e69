use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use tokio::time::{interval, MissedTickBehavior};

use super::lifecycle::Lifecycle;
use super::position_manager::PositionManager;
use super::price_feed::PriceCache;
use super::shutdown::ShutdownSignal;
use crate::api::exchange::Exchange;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::Notifier;
use crate::models::{AccountSnapshot, Direction, OrderRequest, OrderStatus, PendingEntryOrder, ProductInfo};
use crate::Result;

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionAction {
    Enter {
        direction: Direction,
        limit_prices: Vec<f64>,
        quantity: f64,
    },
    Skip,
    ExitEndOfDay,
}

#[derive(Debug, Clone)]
pub struct ExecutionDecision {
    pub action: ExecutionAction,
    pub reason: String,
}

impl ExecutionDecision {
    fn skip(reason: impl Into<String>) -> Self {
        Self {
            action: ExecutionAction::Skip,
            reason: reason.into(),
        }
    }
}

/// Price beyond a safety line gives the entry direction
pub fn evaluate_signal(price: f64, config: &EngineConfig) -> Option<Direction> {
    if price > config.long_safety_line_price {
        Some(Direction::Long)
    } else if price < config.short_safety_line_price {
        Some(Direction::Short)
    } else {
        None
    }
}

/// Limit prices for one batch, stepped away from market by `batch_offset`.
///
/// Non-positive prices are dropped.
pub fn batch_limit_prices(
    direction: Direction,
    price: f64,
    config: &EngineConfig,
    product: &ProductInfo,
) -> Vec<f64> {
    let first = match direction {
        Direction::Long => price - config.entry_price_offset,
        Direction::Short => price + config.entry_price_offset,
    };

    (0..config.batch_size_per_loop)
        .map(|i| {
            let step = config.batch_offset * i as f64;
            match direction {
                Direction::Long => first - step,
                Direction::Short => first + step,
            }
        })
        .filter(|limit| {
            if *limit <= 0.0 {
                tracing::error!("Skipping batch order with invalid limit price {}", limit);
                false
            } else {
                true
            }
        })
        .map(|limit| product.round_price(limit))
        .collect()
}

/// Main Trading Loop: signal evaluation, batched entry, end-of-day exit
pub struct Executor {
    lifecycle: Arc<Lifecycle>,
    exchange: Arc<dyn Exchange>,
    config: Arc<EngineConfig>,
    prices: Arc<PriceCache>,
    account: Arc<Mutex<AccountSnapshot>>,
    manager: Arc<PositionManager>,
    notifier: Notifier,
    eod_time: Option<NaiveTime>,
    last_eod: Mutex<Option<NaiveDate>>,
}

impl Executor {
    pub fn new(
        lifecycle: Arc<Lifecycle>,
        exchange: Arc<dyn Exchange>,
        config: Arc<EngineConfig>,
        prices: Arc<PriceCache>,
        account: Arc<Mutex<AccountSnapshot>>,
        manager: Arc<PositionManager>,
        notifier: Notifier,
    ) -> Result<Self> {
        let eod_time = config.eod_exit_time()?;
        Ok(Self {
            lifecycle,
            exchange,
            config,
            prices,
            account,
            manager,
            notifier,
            eod_time,
            last_eod: Mutex::new(None),
        })
    }

    fn eod_due(&self, now: DateTime<Utc>) -> Option<bool> {
        let eod = self.eod_time?;
        if now.time() < eod {
            return None;
        }
        let last = *self.last_eod.lock().unwrap_or_else(|e| e.into_inner());
        Some(last != Some(now.date_naive()))
    }

    /// Decide what this cycle should do at `price`
    pub fn decide(&self, price: f64, now: DateTime<Utc>) -> ExecutionDecision {
        match self.eod_due(now) {
            Some(true) => {
                return ExecutionDecision {
                    action: ExecutionAction::ExitEndOfDay,
                    reason: "End-of-day exit time reached".to_string(),
                }
            }
            Some(false) => return ExecutionDecision::skip("After end-of-day cutoff"),
            None => {}
        }

        // Check 1: one position or pending entry at a time
        if !self.lifecycle.is_idle() {
            return ExecutionDecision::skip("Already in position or pending order exists");
        }

        // Check 2: safety lines
        let direction = match evaluate_signal(price, &self.config) {
            Some(d) => d,
            None => {
                return ExecutionDecision::skip(format!(
                    "Price {:.4} not past safety lines",
                    price
                ))
            }
        };

        // Check 3: balance
        let available = self
            .account
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .available_balance;
        if available < self.config.min_order_amount {
            return ExecutionDecision::skip(format!(
                "Available balance {:.2} below min_order_amount {:.2}",
                available, self.config.min_order_amount
            ));
        }

        // Check 4: size
        let product = self.lifecycle.product();
        let quantity = product.round_qty(self.config.target_order_amount);
        if quantity < product.min_order_qty || quantity <= 0.0 {
            return ExecutionDecision::skip(format!(
                "Quantity {} below exchange minimum {}",
                quantity, product.min_order_qty
            ));
        }

        let limit_prices = batch_limit_prices(direction, price, &self.config, product);
        if limit_prices.is_empty() {
            return ExecutionDecision::skip("No valid limit prices");
        }

        ExecutionDecision {
            reason: format!(
                "{} signal at {:.4}, {} orders from {:.4}",
                direction.as_str(),
                price,
                limit_prices.len(),
                limit_prices[0]
            ),
            action: ExecutionAction::Enter {
                direction,
                limit_prices,
                quantity,
            },
        }
    }

    async fn current_price(&self) -> Result<f64> {
        let max_age = self.config.loop_interval().max(Duration::from_secs(5)) * 2;
        match self.prices.fresh(max_age) {
            Some(price) => Ok(price),
            None => self.exchange.ticker_price(&self.config.symbol).await,
        }
    }

    /// One trading cycle
    pub async fn run_cycle(&self) -> Result<ExecutionDecision> {
        let price = self.current_price().await?;
        let decision = self.decide(price, Utc::now());

        match &decision.action {
            ExecutionAction::Skip => {
                tracing::info!("Cycle skipped: {}", decision.reason);
            }
            ExecutionAction::Enter {
                direction,
                limit_prices,
                quantity,
            } => {
                self.notifier
                    .info(format!(">>> ENTRY SIGNAL <<< {}", decision.reason));
                let placed = self.submit_batch(*direction, limit_prices, *quantity).await;
                if placed == 0 {
                    return Err(EngineError::Transport("no batch order was placed".into()));
                }
            }
            ExecutionAction::ExitEndOfDay => {
                *self.last_eod.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(Utc::now().date_naive());
                self.lifecycle.end_of_day_exit().await?;
            }
        }

        Ok(decision)
    }

    /// Place the batch; returns how many orders are now tracked
    async fn submit_batch(&self, direction: Direction, limit_prices: &[f64], quantity: f64) -> usize {
        let total = limit_prices.len();
        let mut placed = 0;

        for (i, limit) in limit_prices.iter().enumerate() {
            let request = OrderRequest::limit(
                &self.config.symbol,
                direction.entry_side(),
                quantity,
                *limit,
                &self.config.margin_mode,
            )
            .with_pos_side(self.config.hedge_mode.then_some(direction));

            let order_id = match self.exchange.place_order(&request).await {
                Ok(id) => id,
                Err(e) => {
                    self.notifier.error(format!(
                        "Batch entry order {}/{} at {:.4} failed: {}",
                        i + 1,
                        total,
                        limit,
                        e
                    ));
                    continue;
                }
            };

            let tracked = self.lifecycle.register_entry_order(PendingEntryOrder {
                order_id: order_id.clone(),
                side: request.side,
                quantity,
                limit_price: *limit,
                direction,
                placed_at: Utc::now(),
                status: OrderStatus::Live,
                filled_qty: 0.0,
            });

            if !tracked {
                self.notifier.warn(format!(
                    "Position opened during batch placement; cancelling order {}",
                    order_id
                ));
                if let Err(e) = self.exchange.cancel_order(&self.config.symbol, &order_id).await {
                    tracing::warn!("Cancel of untracked entry failed: {}", e);
                }
                break;
            }

            placed += 1;
            self.notifier.info(format!(
                "Batch entry order {}/{} placed: {} {} @ {:.4} (id {})",
                i + 1,
                total,
                direction.entry_side().as_str(),
                quantity,
                limit,
                order_id
            ));
            self.manager.ensure_running();
        }

        placed
    }

    /// Loop until shutdown
    pub async fn run(&self, shutdown: ShutdownSignal) {
        tracing::info!("Main trading loop started");
        let mut ticker = interval(self.config.loop_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        self.notifier.error(format!("Trading cycle failed: {}", e));
                    }
                }
            }
        }
        tracing::info!("Main trading loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EngineConfig {
        EngineConfig::from_json_str(crate::config::tests::SAMPLE).unwrap()
    }

    fn product() -> ProductInfo {
        ProductInfo {
            symbol: "ETH-USDT-SWAP".to_string(),
            tick_size: 0.01,
            lot_size: 0.1,
            min_order_qty: 0.1,
            contract_value: 0.1,
        }
    }

    #[test]
    fn test_signal_from_safety_lines() {
        let config = config();
        assert_eq!(evaluate_signal(101.0, &config), Some(Direction::Long));
        assert_eq!(evaluate_signal(89.0, &config), Some(Direction::Short));
        assert_eq!(evaluate_signal(95.0, &config), None);
        // Exactly on the line is not past it
        assert_eq!(evaluate_signal(100.0, &config), None);
    }

    #[test]
    fn test_long_batch_steps_down() {
        let limits = batch_limit_prices(Direction::Long, 101.0, &config(), &product());
        assert_eq!(limits, vec![100.0, 99.5, 99.0]);
    }

    #[test]
    fn test_short_batch_steps_up() {
        let limits = batch_limit_prices(Direction::Short, 89.0, &config(), &product());
        assert_eq!(limits, vec![90.0, 90.5, 91.0]);
    }

    #[test]
    fn test_non_positive_limits_skipped() {
        let limits = batch_limit_prices(Direction::Long, 1.6, &config(), &product());
        assert_eq!(limits, vec![0.6, 0.1]);
    }
}
