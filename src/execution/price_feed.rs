use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::scheduler::Scheduler;
use super::shutdown::ShutdownSignal;
use crate::api::okx::{num, parse_ms, parse_position, text, INST_TYPE};
use crate::api::signing::{prehash, sign, Credentials};
use crate::models::{OrderState, OrderStatus, PositionSnapshot};
use crate::Result;

const PING_INTERVAL: Duration = Duration::from_secs(25);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PRICE_CHANNELS: [&str; 2] = ["trades", "tickers"];
const PRIVATE_CHANNELS: [&str; 3] = ["orders", "orders-algo", "positions"];
const LOGIN_PATH: &str = "/users/self/verify";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Disconnected,
    Connecting,
    SubscriptionPending,
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceTick {
    pub price: f64,
    pub at: DateTime<Utc>,
}

/// Last traded price shared between the feed and the trading loops
#[derive(Debug, Default)]
pub struct PriceCache {
    latest: Mutex<Option<PriceTick>>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, price: f64, at: DateTime<Utc>) {
        if price <= 0.0 {
            return;
        }
        *self.latest.lock().unwrap_or_else(|e| e.into_inner()) = Some(PriceTick { price, at });
    }

    pub fn latest(&self) -> Option<PriceTick> {
        *self.latest.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Latest price if it is younger than `max_age`
    pub fn fresh(&self, max_age: Duration) -> Option<f64> {
        let tick = self.latest()?;
        let age = Utc::now().signed_duration_since(tick.at);
        let max_age = chrono::Duration::from_std(max_age).ok()?;
        (age <= max_age).then_some(tick.price)
    }
}

/// Private-channel update routed to the lifecycle
#[derive(Debug, Clone, PartialEq)]
pub enum StreamUpdate {
    Order(OrderState),
    AlgoOrder(OrderState),
    Position(PositionSnapshot),
}

#[async_trait]
pub trait StreamListener: Send + Sync {
    async fn on_stream_update(&self, update: StreamUpdate);
}

/// Which stream a feed connects to
#[derive(Debug, Clone)]
pub enum FeedKind {
    /// Trades and tickers into the price cache
    Public,
    /// Order, algo order and position channels, after a signed login
    Private(Credentials),
}

/// Control frames the session loop has to act on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn,
    LoginRejected,
}

/// Signed `login` request for the private stream
pub fn login_request(credentials: &Credentials, unix_secs: i64) -> Result<Value> {
    let timestamp = unix_secs.to_string();
    let signature = sign(
        &credentials.secret,
        &prehash(&timestamp, "GET", LOGIN_PATH, ""),
    )?;
    Ok(json!({
        "op": "login",
        "args": [{
            "apiKey": credentials.api_key,
            "passphrase": credentials.passphrase,
            "timestamp": timestamp,
            "sign": signature,
        }]
    }))
}

#[derive(Debug, Default)]
struct Subscriptions {
    expected: HashSet<String>,
    confirmed: HashSet<String>,
}

fn channel_key(channel: &str, inst_id: &str) -> String {
    format!("{}:{}", channel, inst_id)
}

/// Streaming market client.
///
/// Keeps one connection alive while the engine runs: subscribes to trades and
/// tickers, feeds the price cache and reconnects after a fixed delay whenever
/// the socket closes. A private feed logs in first and routes order and
/// position channels to the listener instead.
pub struct PriceFeed {
    url: String,
    symbol: String,
    kind: FeedKind,
    logged_in: AtomicBool,
    cache: Arc<PriceCache>,
    state: Mutex<FeedState>,
    subscriptions: Mutex<Subscriptions>,
    ready: watch::Sender<bool>,
    shutdown: ShutdownSignal,
    scheduler: Scheduler,
    reconnect_delay: Duration,
    listener: Mutex<Option<Arc<dyn StreamListener>>>,
    connection_attempts: AtomicUsize,
}

impl PriceFeed {
    pub fn new(
        url: impl Into<String>,
        symbol: impl Into<String>,
        cache: Arc<PriceCache>,
        shutdown: ShutdownSignal,
        scheduler: Scheduler,
        reconnect_delay: Duration,
    ) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            url: url.into(),
            symbol: symbol.into(),
            kind: FeedKind::Public,
            logged_in: AtomicBool::new(false),
            cache,
            state: Mutex::new(FeedState::Disconnected),
            subscriptions: Mutex::new(Subscriptions::default()),
            ready,
            shutdown,
            scheduler,
            reconnect_delay,
            listener: Mutex::new(None),
            connection_attempts: AtomicUsize::new(0),
        }
    }

    /// Turn this feed into an authenticated private-channel feed
    pub fn private(mut self, credentials: Credentials) -> Self {
        self.kind = FeedKind::Private(credentials);
        self
    }

    pub fn is_private(&self) -> bool {
        matches!(self.kind, FeedKind::Private(_))
    }

    pub fn set_listener(&self, listener: Arc<dyn StreamListener>) {
        *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(listener);
    }

    pub fn cache(&self) -> &Arc<PriceCache> {
        &self.cache
    }

    pub fn state(&self) -> FeedState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn connection_attempts(&self) -> usize {
        self.connection_attempts.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: FeedState) {
        let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *current != state {
            tracing::debug!(from = ?*current, to = ?state, "Feed state change");
            *current = state;
        }
    }

    pub fn is_live(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until every expected subscription is confirmed
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.ready.subscribe();
        let ready = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|ready| *ready)).await,
            Ok(Ok(_))
        );
        ready
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let feed = Arc::clone(self);
        tokio::spawn(async move { feed.run().await })
    }

    /// Connect/reconnect loop; returns once shutdown fires
    pub async fn run(&self) {
        loop {
            if self.shutdown.is_triggered() {
                break;
            }

            self.set_state(FeedState::Connecting);
            let attempt = self.connection_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::info!(url = %self.url, attempt, private = self.is_private(), "Connecting to stream");

            match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(self.url.as_str())).await {
                Ok(Ok((stream, _))) => self.session(stream).await,
                Ok(Err(e)) => tracing::warn!("Market stream connect failed: {}", e),
                Err(_) => tracing::warn!("Market stream connect timed out"),
            }

            self.mark_disconnected();

            if self.shutdown.is_triggered() {
                tracing::info!("Market stream closed, engine stopped");
                break;
            }

            tracing::warn!(
                "Market stream closed, reconnecting in {:?}",
                self.reconnect_delay
            );
            if !self.shutdown.sleep(self.reconnect_delay).await {
                break;
            }
        }
        self.mark_disconnected();
    }

    fn mark_disconnected(&self) {
        self.set_state(FeedState::Disconnected);
        self.logged_in.store(false, Ordering::SeqCst);
        self.ready.send_replace(false);
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .confirmed
            .clear();
    }

    fn subscribe_request(&self) -> Value {
        let args: Vec<Value> = match self.kind {
            FeedKind::Public => PRICE_CHANNELS
                .iter()
                .map(|channel| json!({ "channel": channel, "instId": self.symbol }))
                .collect(),
            FeedKind::Private(_) => PRIVATE_CHANNELS
                .iter()
                .map(|channel| {
                    json!({ "channel": channel, "instType": INST_TYPE, "instId": self.symbol })
                })
                .collect(),
        };
        let channels: &[&str] = match self.kind {
            FeedKind::Public => &PRICE_CHANNELS,
            FeedKind::Private(_) => &PRIVATE_CHANNELS,
        };

        let mut subs = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        subs.expected = channels
            .iter()
            .map(|channel| channel_key(channel, &self.symbol))
            .collect();
        subs.confirmed.clear();

        json!({ "op": "subscribe", "args": args })
    }

    /// First frame of a session: login for private feeds, subscribe otherwise
    fn opening_request(&self) -> Result<Value> {
        match &self.kind {
            FeedKind::Public => Ok(self.subscribe_request()),
            FeedKind::Private(credentials) => login_request(credentials, Utc::now().timestamp()),
        }
    }

    async fn session<S>(&self, stream: tokio_tungstenite::WebSocketStream<S>)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut write, mut read) = stream.split();

        let request = match self.opening_request() {
            Ok(request) => request,
            Err(e) => {
                tracing::error!("Cannot build stream login: {}", e);
                return;
            }
        };
        self.set_state(FeedState::SubscriptionPending);
        if let Err(e) = write.send(Message::Text(request.to_string())).await {
            tracing::warn!("Failed to send {} request: {}", text(&request, "op"), e);
            return;
        }

        let mut ping = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.wait() => {
                    let _ = write.send(Message::Close(None)).await;
                    return;
                }
                _ = ping.tick() => {
                    if let Err(e) = write.send(Message::Text("ping".to_string())).await {
                        tracing::warn!("Ping failed: {}", e);
                        return;
                    }
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => match self.handle_message(&text) {
                        Some(SessionEvent::LoggedIn) => {
                            let request = self.subscribe_request();
                            if let Err(e) = write.send(Message::Text(request.to_string())).await {
                                tracing::warn!("Failed to send subscribe request: {}", e);
                                return;
                            }
                        }
                        Some(SessionEvent::LoginRejected) => return,
                        None => {}
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(?frame, "Market stream closed by server");
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("Market stream error: {}", e);
                        return;
                    }
                    None => return,
                }
            }
        }
    }

    /// Apply one text frame
    pub fn handle_message(&self, raw: &str) -> Option<SessionEvent> {
        if raw == "pong" {
            return None;
        }

        let message: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!("Ignoring non-JSON frame: {}", e);
                return None;
            }
        };

        if let Some(event) = message.get("event").and_then(Value::as_str) {
            return self.handle_event(event, &message);
        }

        let channel = message
            .get("arg")
            .map(|arg| text(arg, "channel"))
            .unwrap_or("");
        let items = message.get("data").and_then(Value::as_array)?;

        match channel {
            "tickers" => {
                for item in items {
                    self.cache.update(num(item, "last"), parse_ms(item, "ts"));
                }
            }
            "trades" => {
                for item in items {
                    self.cache.update(num(item, "px"), parse_ms(item, "ts"));
                }
            }
            "orders" => {
                for item in items {
                    self.route(StreamUpdate::Order(OrderState {
                        order_id: text(item, "ordId").to_string(),
                        status: OrderStatus::parse(text(item, "state")),
                        filled_qty: num(item, "accFillSz"),
                        avg_price: num(item, "avgPx"),
                    }));
                }
            }
            "orders-algo" => {
                for item in items {
                    self.route(StreamUpdate::AlgoOrder(OrderState {
                        order_id: text(item, "algoId").to_string(),
                        status: OrderStatus::parse(text(item, "state")),
                        filled_qty: num(item, "actualSz"),
                        avg_price: num(item, "actualPx"),
                    }));
                }
            }
            "positions" => {
                for item in items {
                    self.route(StreamUpdate::Position(parse_position(item)));
                }
            }
            other => tracing::debug!(channel = other, "Unhandled stream channel"),
        }
        None
    }

    fn handle_event(&self, event: &str, message: &Value) -> Option<SessionEvent> {
        match event {
            "login" if text(message, "code") == "0" => {
                self.logged_in.store(true, Ordering::SeqCst);
                tracing::info!("Private stream login accepted");
                return Some(SessionEvent::LoggedIn);
            }
            "login" => {
                tracing::error!(code = text(message, "code"), "Private stream login rejected: {}", text(message, "msg"));
                return Some(SessionEvent::LoginRejected);
            }
            "subscribe" => {
                let arg = message.get("arg").cloned().unwrap_or(Value::Null);
                let key = channel_key(text(&arg, "channel"), text(&arg, "instId"));
                let live = {
                    let mut subs = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
                    subs.confirmed.insert(key.clone());
                    !subs.expected.is_empty() && subs.expected.is_subset(&subs.confirmed)
                };
                tracing::info!(subscription = %key, "Subscription confirmed");
                if live {
                    self.set_state(FeedState::Live);
                    self.ready.send_replace(true);
                    tracing::info!("All market subscriptions confirmed");
                }
            }
            "error" => {
                tracing::error!(
                    code = text(message, "code"),
                    "Stream subscription error: {}",
                    text(message, "msg")
                );
                // Login failures arrive as plain errors
                if self.is_private() && !self.logged_in.load(Ordering::SeqCst) {
                    return Some(SessionEvent::LoginRejected);
                }
            }
            other => tracing::debug!(event = other, "Stream event"),
        }
        None
    }

    fn route(&self, update: StreamUpdate) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match listener {
            Some(listener) => {
                self.scheduler
                    .schedule("stream_update", Duration::ZERO, async move {
                        listener.on_stream_update(update).await;
                    });
            }
            None => tracing::debug!(?update, "Stream update without listener"),
        }
    }
}
