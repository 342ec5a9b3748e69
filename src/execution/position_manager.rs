use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use super::lifecycle::{Lifecycle, PendingEntry, Phase};
use super::price_feed::PriceCache;
use super::shutdown::ShutdownSignal;
use crate::api::exchange::{open_position, Exchange};
use crate::config::EngineConfig;
use crate::models::Direction;

/// Why a pending entry should (or should not) be cancelled
#[derive(Debug, Clone, PartialEq)]
pub enum PendingVerdict {
    Keep,
    Stale { age_secs: i64 },
    AdverseTakeProfit { take_profit: f64, current: f64 },
    AdverseEntry { limit: f64, current: f64 },
}

impl PendingVerdict {
    pub fn reason(&self) -> String {
        match self {
            PendingVerdict::Keep => "keep".to_string(),
            PendingVerdict::Stale { age_secs } => {
                format!("not filled after {}s", age_secs)
            }
            PendingVerdict::AdverseTakeProfit {
                take_profit,
                current,
            } => format!(
                "TP {:.4} no longer favorable at market {:.4}",
                take_profit, current
            ),
            PendingVerdict::AdverseEntry { limit, current } => format!(
                "entry {:.4} no longer favorable at market {:.4}",
                limit, current
            ),
        }
    }
}

/// Decide whether a pending entry should be cancelled.
///
/// Checked in order: timeout, adverse TP, adverse entry price. Prices are
/// judged on the most recently placed batch member.
pub fn evaluate_pending(
    entry: &PendingEntry,
    current_price: Option<f64>,
    now: DateTime<Utc>,
    config: &EngineConfig,
) -> PendingVerdict {
    if let Some(placed_at) = entry.placed_at() {
        let age_secs = now.signed_duration_since(placed_at).num_seconds();
        if age_secs > config.cancel_unfilled_seconds as i64 {
            return PendingVerdict::Stale { age_secs };
        }
    }

    let (current, limit) = match (current_price, entry.last_limit()) {
        (Some(current), Some(limit)) => (current, limit),
        _ => return PendingVerdict::Keep,
    };

    if config.cancel_on_tp_price_below_market {
        let (take_profit, _) = entry.direction.exit_targets(
            limit,
            config.tp_price_offset,
            config.sl_price_offset,
        );
        let adverse = match entry.direction {
            Direction::Long => current >= take_profit,
            Direction::Short => current <= take_profit,
        };
        if adverse {
            return PendingVerdict::AdverseTakeProfit {
                take_profit,
                current,
            };
        }
    }

    if config.cancel_on_entry_price_below_market {
        let adverse = match entry.direction {
            Direction::Long => limit > current,
            Direction::Short => limit < current,
        };
        if adverse {
            return PendingVerdict::AdverseEntry { limit, current };
        }
    }

    PendingVerdict::Keep
}

/// Position Manager Loop.
///
/// Runs only while an entry is pending or a position is open; reconciles
/// order and position state from REST every tick.
pub struct PositionManager {
    lifecycle: Arc<Lifecycle>,
    exchange: Arc<dyn Exchange>,
    config: Arc<EngineConfig>,
    prices: Arc<PriceCache>,
    shutdown: ShutdownSignal,
    running: AtomicBool,
}

impl PositionManager {
    pub fn new(
        lifecycle: Arc<Lifecycle>,
        exchange: Arc<dyn Exchange>,
        config: Arc<EngineConfig>,
        prices: Arc<PriceCache>,
        shutdown: ShutdownSignal,
    ) -> Arc<Self> {
        Arc::new(Self {
            lifecycle,
            exchange,
            config,
            prices,
            shutdown,
            running: AtomicBool::new(false),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the loop unless it is already running
    pub fn ensure_running(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return None;
        }
        let manager = Arc::clone(self);
        Some(tokio::spawn(async move { manager.run().await }))
    }

    async fn run(&self) {
        tracing::info!("Position manager started");
        loop {
            while self.shutdown.sleep(self.config.loop_interval()).await {
                if !self.tick().await {
                    break;
                }
            }
            self.running.store(false, Ordering::SeqCst);

            // An entry may have been registered while we were winding down
            if self.shutdown.is_triggered()
                || self.lifecycle.is_idle()
                || self.running.swap(true, Ordering::SeqCst)
            {
                break;
            }
        }
        tracing::info!("Position manager exiting (no active position/order)");
    }

    /// One reconciliation pass. Returns false once there is nothing to manage.
    pub async fn tick(&self) -> bool {
        match self.lifecycle.phase() {
            Phase::Idle => false,
            Phase::EntryPending(entry) => {
                self.manage_pending(entry).await;
                true
            }
            Phase::PositionOpen(position) => {
                if position.exit_orders.len() < 2 && self.lifecycle.ensure_protected().await {
                    return true;
                }

                for (role, algo_id) in &position.exit_orders {
                    match self.exchange.algo_order_state(algo_id).await {
                        Ok(state) => self.lifecycle.on_algo_update(&state),
                        Err(e) => tracing::debug!(
                            role = role.as_str(),
                            %algo_id,
                            "Exit order poll failed: {}",
                            e
                        ),
                    }
                }

                match self.exchange.positions(&self.config.symbol).await {
                    Ok(positions) => self
                        .lifecycle
                        .on_position_snapshot(open_position(&positions)),
                    Err(e) => tracing::warn!("Position poll failed: {}", e),
                }
                true
            }
        }
    }

    async fn manage_pending(&self, entry: PendingEntry) {
        for order_id in entry.order_ids() {
            match self
                .exchange
                .order_state(&self.config.symbol, &order_id)
                .await
            {
                Ok(state) => self.lifecycle.on_order_update(&state),
                Err(e) => tracing::debug!(%order_id, "Entry order poll failed: {}", e),
            }
        }

        // Re-read: the polls above may have moved the phase on
        let entry = match self.lifecycle.phase() {
            Phase::EntryPending(entry) if !entry.confirming => entry,
            _ => return,
        };

        let current = self.current_price().await;
        if current.is_none() {
            tracing::warn!("No market price for pending entry checks");
        }

        let verdict = evaluate_pending(&entry, current, Utc::now(), &self.config);
        if verdict != PendingVerdict::Keep {
            tracing::warn!(?verdict, "Cancelling pending entry");
            self.lifecycle.cancel_pending_entry(&verdict.reason()).await;
        }
    }

    /// Stream price if fresh, REST ticker otherwise
    async fn current_price(&self) -> Option<f64> {
        let max_age = self.config.loop_interval().max(Duration::from_secs(5)) * 2;
        if let Some(price) = self.prices.fresh(max_age) {
            return Some(price);
        }
        match self.exchange.ticker_price(&self.config.symbol).await {
            Ok(price) => Some(price),
            Err(e) => {
                tracing::warn!("Ticker fallback failed: {}", e);
                None
            }
        }
    }
}
