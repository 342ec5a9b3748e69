use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::price_feed::{StreamListener, StreamUpdate};
use super::scheduler::Scheduler;
use crate::api::exchange::{open_position, Exchange};
use crate::config::{EngineConfig, Timings};
use crate::error::EngineError;
use crate::events::{Notifier, PositionUpdate};
use crate::models::{
    AlgoOrderRequest, Direction, ExitRole, OrderRequest, OrderState, OrderStatus,
    PendingEntryOrder, Position, PositionSnapshot, ProductInfo,
};
use crate::Result;

/// Entry batch waiting for a fill
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub direction: Direction,
    /// Batch members in placement order
    pub orders: Vec<PendingEntryOrder>,
    /// A confirmation is scheduled or running
    pub confirming: bool,
}

impl PendingEntry {
    pub fn order_ids(&self) -> Vec<String> {
        self.orders.iter().map(|o| o.order_id.clone()).collect()
    }

    pub fn contains(&self, order_id: &str) -> bool {
        self.orders.iter().any(|o| o.order_id == order_id)
    }

    /// Placement time of the oldest member
    pub fn placed_at(&self) -> Option<DateTime<Utc>> {
        self.orders.first().map(|o| o.placed_at)
    }

    /// Limit price of the most recently placed member, the furthest from market
    pub fn last_limit(&self) -> Option<f64> {
        self.orders.last().map(|o| o.limit_price)
    }
}

/// Where the single tracked position is in its lifecycle.
///
/// A pending entry and an open position can never coexist.
#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    Idle,
    EntryPending(PendingEntry),
    PositionOpen(Position),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    TakeProfit,
    StopLoss,
    /// Position vanished without a streamed exit fill
    ClosureDetected,
    Manual,
}

impl ExitKind {
    pub fn reason(&self) -> &'static str {
        match self {
            ExitKind::TakeProfit => "take profit hit",
            ExitKind::StopLoss => "stop loss hit",
            ExitKind::ClosureDetected => "position closed externally",
            ExitKind::Manual => "manual exit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ExitClaim {
    kind: ExitKind,
    position_id: Uuid,
}

#[derive(Debug)]
struct LifecycleState {
    phase: Phase,
    claim: Option<ExitClaim>,
    /// TP/SL are being placed or replaced for the open position
    protecting: bool,
    /// Entry orders of the batch that opened the current position
    batch_ids: Vec<String>,
}

/// Order/position lifecycle state machine.
///
/// All mutable state lives in one mutex; the lock is never held across an
/// exchange call.
pub struct Lifecycle {
    exchange: Arc<dyn Exchange>,
    config: Arc<EngineConfig>,
    product: ProductInfo,
    notifier: Notifier,
    scheduler: Scheduler,
    state: Mutex<LifecycleState>,
    self_ref: Weak<Lifecycle>,
}

impl Lifecycle {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        config: Arc<EngineConfig>,
        product: ProductInfo,
        notifier: Notifier,
        scheduler: Scheduler,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            exchange,
            config,
            product,
            notifier,
            scheduler,
            state: Mutex::new(LifecycleState {
                phase: Phase::Idle,
                claim: None,
                protecting: false,
                batch_ids: Vec::new(),
            }),
            self_ref: self_ref.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, LifecycleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn timings(&self) -> &Timings {
        &self.config.timings
    }

    fn symbol(&self) -> &str {
        &self.config.symbol
    }

    fn pos_side(&self, direction: Direction) -> Option<Direction> {
        self.config.hedge_mode.then_some(direction)
    }

    pub fn product(&self) -> &ProductInfo {
        &self.product
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase.clone()
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.lock().phase, Phase::Idle)
    }

    pub fn in_position(&self) -> bool {
        matches!(self.lock().phase, Phase::PositionOpen(_))
    }

    pub fn pending_order_ids(&self) -> Vec<String> {
        match &self.lock().phase {
            Phase::EntryPending(entry) => entry.order_ids(),
            _ => Vec::new(),
        }
    }

    pub fn position(&self) -> Option<Position> {
        match &self.lock().phase {
            Phase::PositionOpen(position) => Some(position.clone()),
            _ => None,
        }
    }

    pub fn tp_hit_triggered(&self) -> bool {
        matches!(self.lock().claim, Some(c) if c.kind == ExitKind::TakeProfit)
    }

    pub fn sl_hit_triggered(&self) -> bool {
        matches!(
            self.lock().claim,
            Some(c) if matches!(c.kind, ExitKind::StopLoss | ExitKind::ClosureDetected)
        )
    }

    fn schedule<F, Fut>(&self, name: &'static str, delay: Duration, f: F)
    where
        F: FnOnce(Arc<Lifecycle>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        if let Some(this) = self.self_ref.upgrade() {
            self.scheduler.schedule(name, delay, f(this));
        }
    }

    // ----- Idle -> EntryPending -----

    /// Track a freshly placed entry order.
    ///
    /// Returns false if a position opened meanwhile; the caller should cancel
    /// the order.
    pub fn register_entry_order(&self, order: PendingEntryOrder) -> bool {
        let mut state = self.lock();
        match &mut state.phase {
            Phase::Idle => {
                tracing::info!(order_id = %order.order_id, "Entry pending");
                state.phase = Phase::EntryPending(PendingEntry {
                    direction: order.direction,
                    orders: vec![order],
                    confirming: false,
                });
                true
            }
            Phase::EntryPending(entry) if entry.direction == order.direction => {
                entry.orders.push(order);
                true
            }
            _ => false,
        }
    }

    // ----- order updates -----

    /// Apply an entry order status report (stream or REST poll)
    pub fn on_order_update(&self, update: &OrderState) {
        let mut confirm_delay = None;
        let mut emptied = false;
        {
            let mut state = self.lock();
            let late_fill = matches!(state.phase, Phase::PositionOpen(_))
                && update.status.is_fill()
                && state.batch_ids.contains(&update.order_id);
            if late_fill {
                drop(state);
                tracing::warn!(order_id = %update.order_id, "Batch member filled after commit");
                self.schedule("late_entry_fill", Duration::ZERO, |this| async move {
                    this.resync_position().await;
                });
                return;
            }
            let entry = match &mut state.phase {
                Phase::EntryPending(entry) if entry.contains(&update.order_id) => entry,
                _ => return,
            };

            if update.status.is_fill() && update.filled_qty > 0.0 {
                if let Some(member) = entry
                    .orders
                    .iter_mut()
                    .find(|o| o.order_id == update.order_id)
                {
                    member.status = update.status.clone();
                    member.filled_qty = update.filled_qty;
                }
                if !entry.confirming {
                    entry.confirming = true;
                    confirm_delay = Some(if update.status == OrderStatus::Filled {
                        self.timings().confirm_after_fill_ms
                    } else {
                        self.timings().confirm_after_partial_ms
                    });
                }
            } else if update.status.is_dead() {
                entry.orders.retain(|o| o.order_id != update.order_id);
                tracing::info!(
                    order_id = %update.order_id,
                    status = ?update.status,
                    remaining = entry.orders.len(),
                    "Entry order ended without fill"
                );
                if entry.orders.is_empty() && !entry.confirming {
                    state.phase = Phase::Idle;
                    emptied = true;
                }
            }
        }

        if emptied {
            self.notifier
                .info("All entry orders cancelled or rejected; back to idle");
            self.notifier.position(PositionUpdate::flat());
        }

        if let Some(delay_ms) = confirm_delay {
            self.notifier.info(format!(
                "Entry order {} {:?}, confirming position in {} ms",
                update.order_id, update.status, delay_ms
            ));
            self.schedule("confirm_entry", Timings::ms(delay_ms), |this| async move {
                this.confirm_entry().await;
            });
        }
    }

    /// Apply a TP/SL algo order status report
    pub fn on_algo_update(&self, update: &OrderState) {
        let (position_id, role) = {
            let state = self.lock();
            match &state.phase {
                Phase::PositionOpen(position) => match position.role_of(&update.order_id) {
                    Some(role) => (position.id, role),
                    None => return,
                },
                _ => return,
            }
        };

        if update.status.is_fill() {
            match role {
                ExitRole::Tp => {
                    self.schedule(
                        "tp_hit",
                        Timings::ms(self.timings().tp_protocol_delay_ms),
                        move |this| async move {
                            this.handle_tp_hit(position_id).await;
                        },
                    );
                }
                ExitRole::Sl => {
                    self.schedule(
                        "sl_hit",
                        Timings::ms(self.timings().sl_protocol_delay_ms),
                        move |this| async move {
                            this.handle_sl_hit(position_id).await;
                        },
                    );
                }
            }
        } else if update.status.is_dead() {
            self.notifier.warn(format!(
                "{} order {} ended as {:?} while position is open",
                role.as_str().to_uppercase(),
                update.order_id,
                update.status
            ));
        }
    }

    /// Closure-detected fallback: the exchange shows no position but we think
    /// one is open
    pub fn on_position_snapshot(&self, snapshot: Option<&PositionSnapshot>) {
        let (position_id, quantity) = match &self.lock().phase {
            Phase::PositionOpen(position) => (position.id, position.quantity),
            _ => return,
        };
        if let Some(live) = snapshot.filter(|s| s.is_open()) {
            // More entry fills landed than TP/SL cover
            if live.size > quantity + self.product.lot_size / 2.0 {
                tracing::warn!(%position_id, live = live.size, protected = quantity, "Position grew; resizing TP/SL");
                self.schedule("resize_protection", Duration::ZERO, move |this| async move {
                    this.resize_protection(position_id).await;
                });
            }
            return;
        }

        tracing::warn!(%position_id, "Position size is zero on exchange; running closure fallback");
        self.schedule(
            "closure_detected",
            Timings::ms(self.timings().closure_fallback_delay_ms),
            move |this| async move {
                this.handle_closure_detected(position_id).await;
            },
        );
    }

    // ----- EntryPending -> PositionOpen -----

    /// Re-query the exchange and commit the position if it exists
    pub async fn confirm_entry(&self) {
        if !matches!(self.lock().phase, Phase::EntryPending(_)) {
            return;
        }

        let positions = match self.exchange.positions(self.symbol()).await {
            Ok(positions) => positions,
            Err(e) => {
                // No state change known; let the next fill report retry
                self.notifier
                    .error(format!("Position confirmation query failed: {}", e));
                if let Phase::EntryPending(entry) = &mut self.lock().phase {
                    entry.confirming = false;
                }
                return;
            }
        };

        match open_position(&positions) {
            Some(snapshot) => {
                let snapshot = snapshot.clone();
                if let Err(e) = self.commit(&snapshot).await {
                    self.notifier
                        .critical(format!("Failed to protect new position: {}", e));
                }
            }
            None => {
                let err = EngineError::StateInconsistency(
                    "fill signaled but no open position found".to_string(),
                );
                self.notifier.critical(err.to_string());
                let ids = match &self.lock().phase {
                    Phase::EntryPending(entry) => entry.order_ids(),
                    _ => return,
                };
                self.cancel_orders_best_effort(&ids).await;
                self.reset_pending("position confirmation failed");
            }
        }
    }

    /// Stop the rest of the batch, re-read the position and protect all of it
    async fn commit(&self, first: &PositionSnapshot) -> Result<()> {
        let entry = match &self.lock().phase {
            Phase::EntryPending(entry) => entry.clone(),
            _ => return Ok(()),
        };
        let leftover: Vec<String> = entry
            .orders
            .iter()
            .filter(|o| o.status != OrderStatus::Filled)
            .map(|o| o.order_id.clone())
            .collect();
        self.cancel_orders_best_effort(&leftover).await;

        // Members can fill right up to their cancel
        let snapshot = match self.exchange.positions(self.symbol()).await {
            Ok(positions) => open_position(&positions).cloned().unwrap_or_else(|| first.clone()),
            Err(e) => {
                tracing::warn!("Position re-read before protection failed: {}", e);
                first.clone()
            }
        };

        let position = {
            let mut state = self.lock();
            if !matches!(state.phase, Phase::EntryPending(_)) {
                return Ok(());
            }

            let direction = snapshot.direction.unwrap_or(entry.direction);
            let (take_profit, stop_loss) = direction.exit_targets(
                snapshot.avg_price,
                self.config.tp_price_offset,
                self.config.sl_price_offset,
            );
            let position = Position {
                id: Uuid::new_v4(),
                symbol: self.symbol().to_string(),
                entry_price: snapshot.avg_price,
                quantity: snapshot.size,
                direction,
                take_profit: self.product.round_price(take_profit),
                stop_loss: self.product.round_price(stop_loss),
                exit_orders: HashMap::new(),
                opened_at: Utc::now(),
            };

            state.phase = Phase::PositionOpen(position.clone());
            state.claim = None;
            state.protecting = true;
            state.batch_ids = entry.order_ids();
            position
        };

        self.notifier.success(format!(
            "Position opened: {} {} @ {:.4} (TP {:.4}, SL {:.4})",
            position.direction.as_str(),
            position.quantity,
            position.entry_price,
            position.take_profit,
            position.stop_loss
        ));
        self.notifier.position(PositionUpdate::from_position(&position));

        match self.place_protection(&position).await {
            Ok(exit_orders) => {
                let stale = {
                    let mut state = self.lock();
                    state.protecting = false;
                    match &mut state.phase {
                        Phase::PositionOpen(open) if open.id == position.id => {
                            open.exit_orders = exit_orders;
                            self.notifier.position(PositionUpdate::from_position(open));
                            None
                        }
                        _ => Some(exit_orders),
                    }
                };
                if let Some(orphaned) = stale {
                    let ids: Vec<String> = orphaned.into_values().collect();
                    self.cancel_algos_best_effort(&ids).await;
                }
                Ok(())
            }
            Err(e) => {
                self.end_protection();
                self.notifier.alert(format!(
                    "Protective orders failed ({}); closing position immediately",
                    e
                ));
                self.force_exit(&position, "protective order placement failed")
                    .await;
                Err(e)
            }
        }
    }

    /// Place TP then SL. On SL failure the TP is cancelled before returning.
    async fn place_protection(&self, position: &Position) -> Result<HashMap<ExitRole, String>> {
        let mut exit_orders = HashMap::new();
        for (role, trigger_price) in [
            (ExitRole::Tp, position.take_profit),
            (ExitRole::Sl, position.stop_loss),
        ] {
            let request = AlgoOrderRequest {
                symbol: position.symbol.clone(),
                side: position.direction.exit_side(),
                size: position.quantity,
                role,
                trigger_price,
                pos_side: self.pos_side(position.direction),
                margin_mode: self.config.margin_mode.clone(),
            };
            match self.exchange.place_algo_order(&request).await {
                Ok(algo_id) => {
                    tracing::info!(role = role.as_str(), %algo_id, trigger_price, "Exit order placed");
                    exit_orders.insert(role, algo_id);
                }
                Err(e) => {
                    let placed: Vec<String> = exit_orders.into_values().collect();
                    self.cancel_algos_best_effort(&placed).await;
                    return Err(e);
                }
            }
        }
        Ok(exit_orders)
    }

    // ----- PositionOpen -> Idle -----

    fn claim_exit(&self, kind: ExitKind, position_id: Uuid) -> Option<Position> {
        let mut state = self.lock();
        if state.claim.is_some() {
            return None;
        }
        match &state.phase {
            Phase::PositionOpen(position) if position.id == position_id => {
                let position = position.clone();
                state.claim = Some(ExitClaim { kind, position_id });
                Some(position)
            }
            _ => None,
        }
    }

    fn release_exit(&self, position_id: Uuid) {
        let mut state = self.lock();
        if matches!(state.claim, Some(c) if c.position_id == position_id) {
            state.claim = None;
        }
    }

    /// TP protocol. Returns false if another exit already claimed this position.
    pub async fn handle_tp_hit(&self, position_id: Uuid) -> bool {
        let position = match self.claim_exit(ExitKind::TakeProfit, position_id) {
            Some(p) => p,
            None => return false,
        };
        self.notifier.success(format!(
            "Take profit hit at {:.4}; closing out",
            position.take_profit
        ));

        self.close_entry_orders().await;
        self.sleep_ms(self.timings().cancel_settle_ms).await;
        self.close_residual(&position, "TP", self.timings().tp_residual_wait_ms)
            .await;

        self.reset(ExitKind::TakeProfit, position_id).await;
        true
    }

    /// Market close whatever the exchange still holds after an exit fill
    async fn close_residual(&self, position: &Position, label: &str, wait_ms: u64) {
        match self.exchange.positions(self.symbol()).await {
            Ok(positions) => {
                if let Some(residual) = open_position(&positions) {
                    let size = residual.size;
                    let direction = residual.direction.unwrap_or(position.direction);
                    self.notifier.warning(format!(
                        "Residual position {} after {}; market closing",
                        size, label
                    ));
                    self.sleep_ms(wait_ms).await;
                    if let Err(e) = self.market_close(direction, size).await {
                        self.notifier
                            .error(format!("Residual close after {} failed: {}", label, e));
                    }
                    self.sleep_ms(self.timings().exit_settle_ms).await;
                }
            }
            Err(e) => self
                .notifier
                .warn(format!("Could not verify position after {}: {}", label, e)),
        }
    }

    /// SL protocol: the exchange already flattened the position
    pub async fn handle_sl_hit(&self, position_id: Uuid) -> bool {
        self.run_flat_exit(ExitKind::StopLoss, position_id).await
    }

    /// Same cleanup as SL, for closures noticed only through snapshots
    pub async fn handle_closure_detected(&self, position_id: Uuid) -> bool {
        self.run_flat_exit(ExitKind::ClosureDetected, position_id).await
    }

    async fn run_flat_exit(&self, kind: ExitKind, position_id: Uuid) -> bool {
        let position = match self.claim_exit(kind, position_id) {
            Some(p) => p,
            None => return false,
        };
        self.notifier.warn(format!(
            "{} (SL {:.4}); cleaning up",
            kind.reason(),
            position.stop_loss
        ));

        self.close_entry_orders().await;
        self.sleep_ms(self.timings().sl_settle_ms).await;
        self.close_residual(&position, "SL", 0).await;
        self.reset(kind, position_id).await;
        true
    }

    /// Operator or end-of-day exit. `Ok(false)` when there is nothing to close.
    pub async fn manual_exit(&self, reason: &str) -> Result<bool> {
        let position_id = match &self.lock().phase {
            Phase::PositionOpen(position) => position.id,
            _ => return Ok(false),
        };
        let position = match self.claim_exit(ExitKind::Manual, position_id) {
            Some(p) => p,
            None => {
                self.notifier.info("Exit already in progress");
                return Ok(false);
            }
        };
        self.notifier.info(format!("Manual exit requested: {}", reason));

        let algo_ids: Vec<String> = position.exit_orders.values().cloned().collect();
        self.cancel_algos_best_effort(&algo_ids).await;

        let live = self
            .exchange
            .positions(self.symbol())
            .await
            .ok()
            .and_then(|p| open_position(&p).cloned());
        let (direction, size) = match &live {
            Some(snapshot) => (
                snapshot.direction.unwrap_or(position.direction),
                snapshot.size,
            ),
            None => (position.direction, position.quantity),
        };

        if let Err(e) = self.market_close(direction, size).await {
            self.notifier
                .alert(format!("Manual exit market order failed: {}", e));
            // Exit orders are gone; put protection back
            match self.place_protection(&position).await {
                Ok(exit_orders) => {
                    if let Phase::PositionOpen(open) = &mut self.lock().phase {
                        if open.id == position_id {
                            open.exit_orders = exit_orders;
                        }
                    }
                }
                Err(e) => self
                    .notifier
                    .critical(format!("Position left without protection: {}", e)),
            }
            self.release_exit(position_id);
            return Err(e);
        }

        self.sleep_ms(self.timings().exit_settle_ms).await;
        self.reset(ExitKind::Manual, position_id).await;
        Ok(true)
    }

    /// Fail-closed exit for a position that could not be protected
    async fn force_exit(&self, position: &Position, reason: &str) {
        if self.claim_exit(ExitKind::Manual, position.id).is_none() {
            return;
        }
        tracing::error!(position_id = %position.id, reason, "Force-closing position");

        if let Err(e) = self.market_close(position.direction, position.quantity).await {
            self.notifier
                .critical(format!("Force close failed, position unprotected: {}", e));
            self.release_exit(position.id);
            return;
        }
        self.sleep_ms(self.timings().exit_settle_ms).await;
        self.reset(ExitKind::Manual, position.id).await;
    }

    /// Terminal step shared by every exit path
    async fn reset(&self, kind: ExitKind, position_id: Uuid) {
        let leftover = {
            let mut state = self.lock();
            let leftover = match &state.phase {
                Phase::PositionOpen(position) if position.id == position_id => position
                    .exit_orders
                    .values()
                    .cloned()
                    .collect::<Vec<_>>(),
                _ => Vec::new(),
            };
            if matches!(&state.phase, Phase::PositionOpen(p) if p.id == position_id) {
                state.phase = Phase::Idle;
                state.batch_ids.clear();
            }
            if matches!(state.claim, Some(c) if c.position_id == position_id) {
                state.claim = None;
            }
            leftover
        };

        self.notifier.info(format!("Position closed: {}", kind.reason()));
        self.notifier.position(PositionUpdate::flat());

        self.cancel_algos_best_effort(&leftover).await;
    }

    // ----- EntryPending -> Idle -----

    /// Drop a tracked pending entry without touching the exchange
    fn reset_pending(&self, reason: &str) -> bool {
        let reset = {
            let mut state = self.lock();
            if matches!(state.phase, Phase::EntryPending(_)) {
                state.phase = Phase::Idle;
                true
            } else {
                false
            }
        };
        if reset {
            self.notifier.info(format!("Pending entry reset: {}", reason));
            self.notifier.position(PositionUpdate::flat());
        }
        reset
    }

    /// Cancel every member of the pending entry and go back to idle.
    ///
    /// If a member filled before the cancel landed, the position is committed
    /// instead.
    pub async fn cancel_pending_entry(&self, reason: &str) -> bool {
        let ids = match &self.lock().phase {
            Phase::EntryPending(entry) if !entry.confirming => entry.order_ids(),
            _ => return false,
        };
        self.notifier
            .info(format!("Cancelling pending entry ({})", reason));
        self.cancel_orders_best_effort(&ids).await;

        if let Ok(positions) = self.exchange.positions(self.symbol()).await {
            if let Some(snapshot) = open_position(&positions).cloned() {
                self.notifier
                    .warning("Entry filled before cancel; protecting position");
                if let Err(e) = self.commit(&snapshot).await {
                    self.notifier
                        .critical(format!("Failed to protect new position: {}", e));
                }
                return false;
            }
        }

        self.reset_pending(reason)
    }

    // ----- operator commands -----

    /// Recompute TP/SL from the live average entry price and replace both
    /// exit orders
    pub async fn batch_modify_tpsl(&self) -> Result<()> {
        let position = self.begin_protection()?;
        let result = self.reprotect(&position).await;
        self.end_protection();
        result
    }

    /// Re-place TP/SL when the open position has none (a failed placement
    /// whose fail-closed exit also failed). Returns true once protected.
    pub async fn ensure_protected(&self) -> bool {
        let position = {
            let mut state = self.lock();
            if state.claim.is_some() || state.protecting {
                return false;
            }
            let position = match &state.phase {
                Phase::PositionOpen(p) if p.exit_orders.len() < 2 => p.clone(),
                _ => return false,
            };
            state.protecting = true;
            position
        };

        self.notifier
            .warning("Open position has no protective orders; placing TP/SL again");
        let result = self.reprotect(&position).await;
        self.end_protection();
        result.is_ok()
    }

    async fn resize_protection(&self, position_id: Uuid) {
        let position = match self.begin_protection() {
            Ok(p) if p.id == position_id => p,
            Ok(_) => {
                self.end_protection();
                return;
            }
            Err(e) => {
                tracing::debug!("TP/SL resize skipped: {}", e);
                return;
            }
        };
        if let Err(e) = self.reprotect(&position).await {
            self.notifier.error(format!("TP/SL resize failed: {}", e));
        }
        self.end_protection();
    }

    /// Re-read the position after a late batch fill report
    async fn resync_position(&self) {
        match self.exchange.positions(self.symbol()).await {
            Ok(positions) => self.on_position_snapshot(open_position(&positions)),
            Err(e) => tracing::warn!("Position re-read after late fill failed: {}", e),
        }
    }

    fn begin_protection(&self) -> Result<Position> {
        let mut state = self.lock();
        if state.claim.is_some() {
            return Err(EngineError::StateInconsistency("exit in progress".into()));
        }
        if state.protecting {
            return Err(EngineError::StateInconsistency(
                "protective orders are being updated".into(),
            ));
        }
        let position = match &state.phase {
            Phase::PositionOpen(p) => p.clone(),
            _ => return Err(EngineError::StateInconsistency("no open position".into())),
        };
        state.protecting = true;
        Ok(position)
    }

    fn end_protection(&self) {
        self.lock().protecting = false;
    }

    /// Size TP/SL to the live position and swap them in. If placement fails
    /// the position is force-closed.
    async fn reprotect(&self, position: &Position) -> Result<()> {
        let positions = self.exchange.positions(self.symbol()).await?;
        let live = open_position(&positions).cloned().ok_or_else(|| {
            EngineError::StateInconsistency("exchange reports no open position".into())
        })?;

        let (take_profit, stop_loss) = position.direction.exit_targets(
            live.avg_price,
            self.config.tp_price_offset,
            self.config.sl_price_offset,
        );
        let mut updated = position.clone();
        updated.entry_price = live.avg_price;
        updated.quantity = live.size;
        updated.take_profit = self.product.round_price(take_profit);
        updated.stop_loss = self.product.round_price(stop_loss);

        let old: Vec<String> = position.exit_orders.values().cloned().collect();
        self.cancel_algos_best_effort(&old).await;

        match self.place_protection(&updated).await {
            Ok(exit_orders) => {
                updated.exit_orders = exit_orders;
                let installed = {
                    let mut state = self.lock();
                    match &mut state.phase {
                        Phase::PositionOpen(open) if open.id == position.id => {
                            *open = updated.clone();
                            true
                        }
                        _ => false,
                    }
                };
                if !installed {
                    let ids: Vec<String> = updated.exit_orders.values().cloned().collect();
                    self.cancel_algos_best_effort(&ids).await;
                    return Err(EngineError::StateInconsistency(
                        "position closed during TP/SL update".into(),
                    ));
                }
                self.notifier.success(format!(
                    "TP/SL updated: {} @ {:.4}, TP {:.4}, SL {:.4}",
                    updated.quantity, updated.entry_price, updated.take_profit, updated.stop_loss
                ));
                self.notifier.position(PositionUpdate::from_position(&updated));
                Ok(())
            }
            Err(e) => {
                // Old exit orders are gone; record that before the fail-closed exit
                if let Phase::PositionOpen(open) = &mut self.lock().phase {
                    if open.id == position.id {
                        open.exit_orders.clear();
                    }
                }
                self.notifier.alert(format!(
                    "TP/SL placement failed ({}); closing position",
                    e
                ));
                self.force_exit(&updated, "TP/SL placement failed").await;
                Err(e)
            }
        }
    }

    /// Cancel every pending order on the symbol; returns how many were cancelled
    pub async fn batch_cancel_orders(&self) -> Result<usize> {
        let pending = self.exchange.pending_orders(self.symbol()).await?;
        let ids: Vec<String> = pending.into_iter().map(|o| o.order_id).collect();
        let cancelled = self.cancel_orders_best_effort(&ids).await;
        self.reset_pending("orders cancelled by operator");
        self.notifier
            .info(format!("Cancelled {}/{} pending orders", cancelled, ids.len()));
        Ok(cancelled)
    }

    /// Scheduled daily flattening: close the position, cancel entries, reset
    pub async fn end_of_day_exit(&self) -> Result<()> {
        self.notifier.info("End-of-day exit triggered");

        if self.in_position() {
            self.manual_exit("end of day").await?;
        } else {
            // Nothing tracked; flatten anything the exchange still holds
            self.close_existing_position().await?;
        }

        let cancelled = self.close_entry_orders().await;
        self.reset_pending("end of day");
        self.notifier
            .info(format!("End-of-day exit complete ({} entry orders cancelled)", cancelled));
        Ok(())
    }

    /// Close a position left over from a previous run
    pub async fn close_existing_position(&self) -> Result<bool> {
        let positions = self.exchange.positions(self.symbol()).await?;
        let snapshot = match open_position(&positions) {
            Some(s) => s.clone(),
            None => return Ok(false),
        };
        let direction = snapshot.direction.ok_or_else(|| {
            EngineError::StateInconsistency("open position without direction".into())
        })?;

        self.notifier.warn(format!(
            "Closing existing {} position of {} before trading",
            direction.as_str(),
            snapshot.size
        ));
        self.close_entry_orders().await;
        self.market_close(direction, snapshot.size).await?;
        Ok(true)
    }

    /// Cancel resting entry orders on the symbol (best effort)
    pub async fn close_entry_orders(&self) -> usize {
        match self.exchange.pending_orders(self.symbol()).await {
            Ok(pending) => {
                let ids: Vec<String> = pending.into_iter().map(|o| o.order_id).collect();
                self.cancel_orders_best_effort(&ids).await
            }
            Err(e) => {
                tracing::warn!("Could not list pending orders: {}", e);
                0
            }
        }
    }

    // ----- exchange helpers -----

    async fn market_close(&self, direction: Direction, size: f64) -> Result<String> {
        let request = OrderRequest::market_close(
            self.symbol(),
            direction.exit_side(),
            size,
            &self.config.margin_mode,
        )
        .with_pos_side(self.pos_side(direction));
        let order_id = self.exchange.place_order(&request).await?;
        tracing::info!(%order_id, size, "Market close placed");
        Ok(order_id)
    }

    async fn cancel_orders_best_effort(&self, ids: &[String]) -> usize {
        let mut cancelled = 0;
        for id in ids {
            match self.exchange.cancel_order(self.symbol(), id).await {
                Ok(()) => cancelled += 1,
                Err(e) => tracing::warn!(order_id = %id, "Cancel failed (ignored): {}", e),
            }
        }
        cancelled
    }

    async fn cancel_algos_best_effort(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        if let Err(e) = self.exchange.cancel_algo_orders(self.symbol(), ids).await {
            tracing::warn!(?ids, "Exit order cancel failed (ignored): {}", e);
        }
    }

    async fn sleep_ms(&self, ms: u64) {
        if ms > 0 {
            tokio::time::sleep(Timings::ms(ms)).await;
        }
    }
}

#[async_trait]
impl StreamListener for Lifecycle {
    async fn on_stream_update(&self, update: StreamUpdate) {
        match update {
            StreamUpdate::Order(state) => self.on_order_update(&state),
            StreamUpdate::AlgoOrder(state) => self.on_algo_update(&state),
            StreamUpdate::Position(snapshot) => {
                if snapshot.symbol.is_empty() || snapshot.symbol == self.config.symbol {
                    self.on_position_snapshot(Some(&snapshot));
                }
            }
        }
    }
}
