use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::api::exchange::Exchange;
use crate::api::signing::Credentials;
use crate::config::{EngineConfig, Timings};
use crate::error::EngineError;
use crate::events::{EventSink, Notifier, PositionUpdate};
use crate::execution::{
    AccountUpdater, Executor, FeedState, Lifecycle, Phase, PositionManager, PriceCache, PriceFeed,
    Scheduler, ShutdownSignal,
};
use crate::models::AccountSnapshot;
use crate::Result;

const STOP_GRACE: Duration = Duration::from_secs(5);

/// Point-in-time view for the `status` operator command
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub running: bool,
    pub phase: &'static str,
    pub feed_live: bool,
    /// `None` when no private stream is configured
    pub private_feed_live: Option<bool>,
    pub last_price: Option<f64>,
    pub pending_orders: usize,
    pub position: PositionUpdate,
    pub account: AccountSnapshot,
}

/// A started trading engine.
///
/// Owns every background task; `stop()` signals them and waits.
pub struct Engine {
    config: Arc<EngineConfig>,
    notifier: Notifier,
    shutdown: ShutdownSignal,
    scheduler: Scheduler,
    lifecycle: Arc<Lifecycle>,
    feed: Arc<PriceFeed>,
    private_feed: Option<Arc<PriceFeed>>,
    account: Arc<Mutex<AccountSnapshot>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Engine {
    /// Run the startup sequence and spawn the loops.
    ///
    /// Clock sync, instrument metadata, leverage, flatten leftovers, stream
    /// up and subscribed, first account refresh, then trading.
    pub async fn start(
        config: EngineConfig,
        exchange: Arc<dyn Exchange>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let notifier = Notifier::new(sink);

        if let Err(e) = config.validate() {
            notifier.alert(format!("Invalid configuration: {}", e));
            notifier.status(false);
            return Err(e);
        }
        let config = Arc::new(config);

        notifier.info(format!(
            "Engine starting for {} ({})",
            config.symbol,
            if config.use_testnet { "demo" } else { "live" }
        ));

        if let Err(e) = exchange.sync_clock().await {
            notifier.warning(format!("Server time sync failed, using local clock: {}", e));
        }

        let product = match exchange.product_info(&config.symbol).await {
            Ok(p) => p,
            Err(e) => return Err(Self::startup_failed(&notifier, "product info", e)),
        };

        if let Err(e) = exchange
            .set_leverage(&config.symbol, config.leverage, &config.margin_mode)
            .await
        {
            return Err(Self::startup_failed(&notifier, "set leverage", e));
        }
        notifier.info(format!("Leverage set to {}x", config.leverage));

        let shutdown = ShutdownSignal::new();
        let scheduler = Scheduler::new(shutdown.clone());
        let lifecycle = Lifecycle::new(
            exchange.clone(),
            config.clone(),
            product,
            notifier.clone(),
            scheduler.clone(),
        );

        if let Err(e) = lifecycle.close_existing_position().await {
            notifier.warn(format!("Could not check for existing position: {}", e));
        }

        // ----- market stream -----
        let prices = Arc::new(PriceCache::new());
        let feed = Arc::new(PriceFeed::new(
            config.ws_url.clone(),
            config.symbol.clone(),
            prices.clone(),
            shutdown.clone(),
            scheduler.clone(),
            Timings::ms(config.timings.reconnect_delay_ms),
        ));
        let mut tasks = vec![feed.spawn()];

        let wait = Timings::ms(config.timings.subscription_wait_ms);
        if !feed.wait_ready(wait).await {
            shutdown.trigger();
            scheduler.shutdown();
            for task in tasks {
                task.abort();
            }
            let err = EngineError::Startup(format!(
                "market subscriptions not confirmed within {:?}",
                wait
            ));
            notifier.alert(err.to_string());
            notifier.status(false);
            return Err(err);
        }
        notifier.info("Market stream live");

        let private_feed = match &config.private_ws_url {
            Some(url) => {
                let private = Arc::new(
                    PriceFeed::new(
                        url.clone(),
                        config.symbol.clone(),
                        prices.clone(),
                        shutdown.clone(),
                        scheduler.clone(),
                        Timings::ms(config.timings.reconnect_delay_ms),
                    )
                    .private(Credentials::new(
                        config.okx_api_key.clone(),
                        config.okx_api_secret.clone(),
                        config.okx_passphrase.clone(),
                    )),
                );
                private.set_listener(lifecycle.clone());
                tasks.push(private.spawn());
                if private.wait_ready(wait).await {
                    notifier.info("Private stream live");
                } else {
                    notifier.warning("Private stream not confirmed; relying on REST polling");
                }
                Some(private)
            }
            None => None,
        };

        // ----- account + trading loops -----
        let account = Arc::new(Mutex::new(AccountSnapshot::default()));
        let updater = Arc::new(AccountUpdater::new(
            exchange.clone(),
            lifecycle.clone(),
            config.clone(),
            account.clone(),
            notifier.clone(),
        ));
        if let Err(e) = updater.refresh().await {
            notifier.warn(format!("Initial account refresh failed: {}", e));
        }
        tasks.push({
            let updater = updater.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { updater.run(shutdown).await })
        });

        let manager = PositionManager::new(
            lifecycle.clone(),
            exchange.clone(),
            config.clone(),
            prices.clone(),
            shutdown.clone(),
        );
        let executor = Arc::new(Executor::new(
            lifecycle.clone(),
            exchange.clone(),
            config.clone(),
            prices,
            account.clone(),
            manager,
            notifier.clone(),
        )?);
        tasks.push({
            let shutdown = shutdown.clone();
            tokio::spawn(async move { executor.run(shutdown).await })
        });

        notifier.success("Bot startup sequence complete");
        notifier.status(true);

        Ok(Self {
            config,
            notifier,
            shutdown,
            scheduler,
            lifecycle,
            feed,
            private_feed,
            account,
            tasks: Mutex::new(tasks),
            running: AtomicBool::new(true),
        })
    }

    fn startup_failed(notifier: &Notifier, step: &str, err: EngineError) -> EngineError {
        let err = EngineError::Startup(format!("{}: {}", step, err));
        notifier.alert(err.to_string());
        notifier.status(false);
        err
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Signal every loop to stop and wait for them to wind down
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.notifier.info("Stopping engine");
        self.shutdown.trigger();
        self.scheduler.shutdown();

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(STOP_GRACE, task).await.is_err() {
                tracing::warn!("Task did not stop in time; aborting");
                abort.abort();
            }
        }

        self.notifier.status(false);
        self.notifier.info("Engine stopped");
    }

    // ----- operator commands -----

    pub async fn manual_exit(&self) -> Result<bool> {
        self.lifecycle.manual_exit("operator request").await
    }

    pub async fn batch_modify_tpsl(&self) -> Result<()> {
        self.lifecycle.batch_modify_tpsl().await
    }

    pub async fn batch_cancel_orders(&self) -> Result<usize> {
        self.lifecycle.batch_cancel_orders().await
    }

    /// Publish and return the current state
    pub fn status(&self) -> StatusReport {
        let phase = self.lifecycle.phase();
        let (phase_name, pending_orders, position) = match &phase {
            Phase::Idle => ("idle", 0, PositionUpdate::flat()),
            Phase::EntryPending(entry) => ("entry_pending", entry.orders.len(), PositionUpdate::flat()),
            Phase::PositionOpen(p) => ("position_open", 0, PositionUpdate::from_position(p)),
        };
        let account = self
            .account
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        self.notifier.status(self.is_running());
        self.notifier.position(position.clone());
        self.notifier.account(account.clone());

        StatusReport {
            running: self.is_running(),
            phase: phase_name,
            feed_live: self.feed.state() == FeedState::Live,
            private_feed_live: self
                .private_feed
                .as_ref()
                .map(|feed| feed.state() == FeedState::Live),
            last_price: self.feed.cache().latest().map(|t| t.price),
            pending_orders,
            position,
            account,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.config.symbol
    }
}
