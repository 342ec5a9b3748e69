use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::time::{interval, MissedTickBehavior};

use super::lifecycle::{Lifecycle, Phase};
use super::shutdown::ShutdownSignal;
use crate::api::exchange::Exchange;
use crate::config::EngineConfig;
use crate::events::Notifier;
use crate::models::{AccountSnapshot, BalanceSnapshot, Fill};
use crate::Result;

const SETTLEMENT_CCY: &str = "USDT";

/// Realized P&L from fills seen since engine start, deduplicated by trade id
#[derive(Debug, Default)]
pub struct ProfitLedger {
    seen: HashSet<String>,
    net_profit: f64,
}

impl ProfitLedger {
    pub fn record(&mut self, fills: &[Fill]) {
        for fill in fills {
            let key = if fill.trade_id.is_empty() {
                format!("{}:{}", fill.order_id, fill.timestamp.timestamp_millis())
            } else {
                fill.trade_id.clone()
            };
            if self.seen.insert(key) {
                // fee is negative when paid
                self.net_profit += fill.fill_pnl + fill.fee;
            }
        }
    }

    pub fn net_profit(&self) -> f64 {
        self.net_profit
    }

    pub fn total_trades(&self) -> u64 {
        self.seen.len() as u64
    }
}

/// Budget usage: one `target_order_amount` per open position or pending member
pub fn used_amount(phase: &Phase, config: &EngineConfig) -> f64 {
    match phase {
        Phase::Idle => 0.0,
        Phase::EntryPending(entry) => config.target_order_amount * entry.orders.len() as f64,
        Phase::PositionOpen(_) => config.target_order_amount,
    }
}

pub fn build_snapshot(
    balance: BalanceSnapshot,
    phase: &Phase,
    ledger: &ProfitLedger,
    config: &EngineConfig,
) -> AccountSnapshot {
    let used = used_amount(phase, config);
    AccountSnapshot {
        total_capital: balance.total_equity,
        max_allowed_used_display: config.max_allowed_used,
        max_amount_display: config.max_amount(),
        used_amount: used,
        remaining_amount: config.max_allowed_used - used,
        total_balance: balance.total_equity,
        available_balance: balance.available_equity,
        net_profit: ledger.net_profit(),
        total_trades: ledger.total_trades(),
    }
}

/// Account/Telemetry updater
pub struct AccountUpdater {
    exchange: Arc<dyn Exchange>,
    lifecycle: Arc<Lifecycle>,
    config: Arc<EngineConfig>,
    snapshot: Arc<Mutex<AccountSnapshot>>,
    ledger: Mutex<ProfitLedger>,
    notifier: Notifier,
    started_at: DateTime<Utc>,
}

impl AccountUpdater {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        lifecycle: Arc<Lifecycle>,
        config: Arc<EngineConfig>,
        snapshot: Arc<Mutex<AccountSnapshot>>,
        notifier: Notifier,
    ) -> Self {
        Self {
            exchange,
            lifecycle,
            config,
            snapshot,
            ledger: Mutex::new(ProfitLedger::default()),
            notifier,
            started_at: Utc::now(),
        }
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> AccountSnapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Fetch balance and fills, publish a new snapshot
    pub async fn refresh(&self) -> Result<AccountSnapshot> {
        let balance = self.exchange.balance(SETTLEMENT_CCY).await?;

        match self
            .exchange
            .fills(&self.config.symbol, self.started_at)
            .await
        {
            Ok(fills) => self
                .ledger
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .record(&fills),
            // P&L just lags a cycle
            Err(e) => tracing::warn!("Fills query failed: {}", e),
        }

        let phase = self.lifecycle.phase();
        let snapshot = {
            let ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
            build_snapshot(balance, &phase, &ledger, &self.config)
        };

        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = snapshot.clone();

        tracing::info!(
            total = snapshot.total_balance,
            available = snapshot.available_balance,
            used = snapshot.used_amount,
            remaining = snapshot.remaining_amount,
            net_profit = snapshot.net_profit,
            trades = snapshot.total_trades,
            "Account info updated"
        );
        self.notifier.account(snapshot.clone());
        Ok(snapshot)
    }

    pub async fn run(&self, shutdown: ShutdownSignal) {
        let mut ticker = interval(self.config.account_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick fires immediately; startup already refreshed once
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        self.notifier.warn(format!("Account update failed: {}", e));
                    }
                }
            }
        }
        tracing::info!("Account updater stopped");
    }
}
