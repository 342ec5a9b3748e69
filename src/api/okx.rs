use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use governor::{Quota, RateLimiter};
use reqwest::{Client, Method};
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};

use super::exchange::Exchange;
use super::signing::{request_path, Credentials, RequestSigner, ServerClock};
use crate::error::EngineError;
use crate::models::{
    format_decimal, AlgoOrderRequest, BalanceSnapshot, Direction, ExitRole, Fill, OrderRequest,
    OrderState, OrderStatus, PendingOrder, PositionSnapshot, ProductInfo, Side,
};
use crate::Result;

pub(crate) const INST_TYPE: &str = "SWAP";
/// Order already filled or cancelled
const CODE_ALREADY_DONE: &str = "51001";

type OkxRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Connection context passed to the client instead of process-wide globals
#[derive(Debug, Clone)]
pub struct RestContext {
    pub base_url: String,
    pub credentials: Credentials,
    /// Demo trading (`x-simulated-trading: 1`)
    pub simulated: bool,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Delay before retry k is `backoff_unit * 2^k`
    pub backoff_unit: Duration,
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_unit: Duration::from_secs(1),
            request_timeout: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_unit.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Response envelope shared by every v5 endpoint
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ApiResponse {
    #[serde(deserialize_with = "string_or_number")]
    pub code: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub data: Value,
}

impl ApiResponse {
    pub fn is_ok(&self) -> bool {
        self.code == "0"
    }

    pub fn items(&self) -> &[Value] {
        self.data.as_array().map(Vec::as_slice).unwrap_or(&[])
    }
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "unexpected code type: {}",
            other
        ))),
    }
}

/// Numeric string field, empty or missing as zero
pub(crate) fn num(item: &Value, key: &str) -> f64 {
    match item.get(key) {
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

pub(crate) fn text<'a>(item: &'a Value, key: &str) -> &'a str {
    item.get(key).and_then(Value::as_str).unwrap_or("")
}

/// Signed REST client for the OKX v5 API
#[derive(Clone)]
pub struct OkxClient {
    http: Client,
    base_url: String,
    signer: RequestSigner,
    clock: Arc<ServerClock>,
    retry: RetryPolicy,
    rate_limiter: Arc<OkxRateLimiter>,
}

impl OkxClient {
    pub fn new(context: RestContext, retry: RetryPolicy, requests_per_sec: u32) -> Result<Self> {
        let http = Client::builder().timeout(retry.request_timeout).build()?;

        let per_sec = NonZeroU32::new(requests_per_sec)
            .ok_or_else(|| EngineError::Config("rate limit must be at least 1/s".into()))?;
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(per_sec)));

        Ok(Self {
            http,
            base_url: context.base_url.trim_end_matches('/').to_string(),
            signer: RequestSigner::new(context.credentials, context.simulated),
            clock: Arc::new(ServerClock::new()),
            retry,
            rate_limiter,
        })
    }

    pub fn clock(&self) -> &ServerClock {
        &self.clock
    }

    /// Signed request with bounded retry.
    ///
    /// Transport failures, malformed JSON and non-200 replies without a
    /// `code` are retried. Any reply carrying a `code` is returned as is.
    /// `None` after the last attempt.
    pub async fn execute(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Option<ApiResponse> {
        let signed_path = request_path(path, query);
        let url = format!("{}{}", self.base_url, signed_path);
        let body_text = match body {
            Some(value) => match serde_json::to_string(value) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("Failed to encode body for {} {}: {}", method, path, e);
                    return None;
                }
            },
            None => String::new(),
        };

        for attempt in 0..self.retry.max_retries {
            self.rate_limiter.until_ready().await;

            let timestamp = self.clock.timestamp();
            let headers = match self.signer.build_headers(
                &timestamp,
                method.as_str(),
                &signed_path,
                &body_text,
            ) {
                Ok(h) => h,
                Err(e) => {
                    tracing::error!("Cannot sign {} {}: {}", method, path, e);
                    return None;
                }
            };

            tracing::debug!(
                "{} {} (attempt {}/{})",
                method,
                path,
                attempt + 1,
                self.retry.max_retries
            );

            let mut request = self.http.request(method.clone(), &url).headers(headers);
            if body.is_some() {
                request = request.body(body_text.clone());
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    match response.text().await {
                        Ok(raw) => match serde_json::from_str::<ApiResponse>(&raw) {
                            Ok(parsed) => {
                                if !status.is_success() {
                                    tracing::error!(
                                        "API error: status={}, code={}, msg={}",
                                        status,
                                        parsed.code,
                                        parsed.msg
                                    );
                                } else if !parsed.is_ok() {
                                    tracing::warn!(
                                        "Non-zero code {} ({}) for {} {}",
                                        parsed.code,
                                        parsed.msg,
                                        method,
                                        path
                                    );
                                }
                                return Some(parsed);
                            }
                            Err(e) => {
                                let snippet: String = raw.chars().take(200).collect();
                                tracing::warn!(
                                    "Unparseable reply for {} {} (status {}): {} / {}",
                                    method,
                                    path,
                                    status,
                                    e,
                                    snippet
                                );
                            }
                        },
                        Err(e) => {
                            tracing::warn!("Failed reading body for {} {}: {}", method, path, e)
                        }
                    }
                }
                Err(e) if e.is_timeout() => {
                    tracing::warn!(
                        "Request timeout for {} {} (attempt {}/{})",
                        method,
                        path,
                        attempt + 1,
                        self.retry.max_retries
                    );
                }
                Err(e) => {
                    tracing::warn!("Network error for {} {}: {}", method, path, e);
                }
            }

            if attempt + 1 < self.retry.max_retries {
                tokio::time::sleep(self.retry.backoff(attempt)).await;
            }
        }

        tracing::error!(
            "{} {} failed after {} attempts",
            method,
            path,
            self.retry.max_retries
        );
        None
    }

    /// `execute` with `None` mapped to Transport and non-zero codes to Exchange
    async fn call(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Vec<Value>> {
        let response = self
            .execute(method.clone(), path, query, body)
            .await
            .ok_or_else(|| EngineError::Transport(format!("no response for {} {}", method, path)))?;

        if !response.is_ok() {
            // Batch endpoints put the real reason in data[0].sCode
            if let Some(first) = response.items().first() {
                let s_code = text(first, "sCode");
                if !s_code.is_empty() && s_code != "0" {
                    return Err(EngineError::exchange(s_code, text(first, "sMsg")));
                }
            }
            return Err(EngineError::exchange(response.code, response.msg));
        }

        Ok(response.items().to_vec())
    }

    async fn first_item(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value> {
        self.call(method, path, query, body)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::Transport(format!("empty data for {}", path)))
    }

    fn is_already_done(err: &EngineError) -> bool {
        err.exchange_code() == Some(CODE_ALREADY_DONE)
    }
}

fn pos_side_field(body: &mut Value, pos_side: Option<Direction>) {
    if let (Some(dir), Some(map)) = (pos_side, body.as_object_mut()) {
        map.insert("posSide".to_string(), json!(dir.as_str()));
    }
}

fn parse_side(raw: &str) -> Side {
    if raw == "sell" {
        Side::Sell
    } else {
        Side::Buy
    }
}

pub(crate) fn parse_ms(item: &Value, key: &str) -> DateTime<Utc> {
    text(item, key)
        .parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}

pub(crate) fn parse_position(item: &Value) -> PositionSnapshot {
    let signed = num(item, "pos");
    let direction = match text(item, "posSide") {
        "long" => Some(Direction::Long),
        "short" => Some(Direction::Short),
        _ if signed > 0.0 => Some(Direction::Long),
        _ if signed < 0.0 => Some(Direction::Short),
        _ => None,
    };
    PositionSnapshot {
        symbol: text(item, "instId").to_string(),
        size: signed.abs(),
        avg_price: num(item, "avgPx"),
        direction,
    }
}

#[async_trait]
impl Exchange for OkxClient {
    async fn sync_clock(&self) -> Result<i64> {
        let local = Utc::now();
        let item = self
            .first_item(Method::GET, "/api/v5/public/time", &[], None)
            .await?;
        let server_ms: i64 = text(&item, "ts")
            .parse()
            .map_err(|_| EngineError::Transport("server time missing ts".into()))?;
        self.clock.sync(server_ms, local);
        tracing::info!("Server clock offset: {} ms", self.clock.offset_ms());
        Ok(self.clock.offset_ms())
    }

    async fn product_info(&self, symbol: &str) -> Result<ProductInfo> {
        let query = [("instType", INST_TYPE.to_string()), ("instId", symbol.to_string())];
        let items = self
            .call(Method::GET, "/api/v5/public/instruments", &query, None)
            .await?;
        let item = items
            .iter()
            .find(|i| text(i, "instId") == symbol)
            .ok_or_else(|| EngineError::Config(format!("instrument {} not found", symbol)))?;

        let contract_value = num(item, "ctVal");
        let info = ProductInfo {
            symbol: symbol.to_string(),
            tick_size: num(item, "tickSz"),
            lot_size: num(item, "lotSz"),
            min_order_qty: num(item, "minSz"),
            contract_value: if contract_value > 0.0 { contract_value } else { 1.0 },
        };
        tracing::info!(?info, "Product info loaded");
        Ok(info)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32, margin_mode: &str) -> Result<()> {
        let body = json!({
            "instId": symbol,
            "lever": leverage.to_string(),
            "mgnMode": margin_mode,
        });
        self.call(Method::POST, "/api/v5/account/set-leverage", &[], Some(&body))
            .await?;
        Ok(())
    }

    async fn ticker_price(&self, symbol: &str) -> Result<f64> {
        let query = [("instId", symbol.to_string())];
        let item = self
            .first_item(Method::GET, "/api/v5/market/ticker", &query, None)
            .await?;
        let last = num(&item, "last");
        if last <= 0.0 {
            return Err(EngineError::Transport("ticker missing last price".into()));
        }
        Ok(last)
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<String> {
        let mut body = json!({
            "instId": request.symbol,
            "tdMode": request.margin_mode,
            "side": request.side.as_str(),
            "ordType": request.order_type.as_str(),
            "sz": format_decimal(request.size, 8),
            "clOrdId": request.client_order_id,
        });
        if let (Some(price), Some(map)) = (request.price, body.as_object_mut()) {
            map.insert("px".to_string(), json!(format_decimal(price, 8)));
        }
        if request.reduce_only {
            if let Some(map) = body.as_object_mut() {
                map.insert("reduceOnly".to_string(), json!(true));
            }
        }
        pos_side_field(&mut body, request.pos_side);

        let item = self
            .first_item(Method::POST, "/api/v5/trade/order", &[], Some(&body))
            .await?;
        let order_id = text(&item, "ordId");
        if order_id.is_empty() {
            return Err(EngineError::exchange(text(&item, "sCode"), "no ordId in reply"));
        }
        Ok(order_id.to_string())
    }

    async fn place_algo_order(&self, request: &AlgoOrderRequest) -> Result<String> {
        let trigger = format_decimal(request.trigger_price, 8);
        let mut body = json!({
            "instId": request.symbol,
            "tdMode": request.margin_mode,
            "side": request.side.as_str(),
            "ordType": "conditional",
            "sz": format_decimal(request.size, 8),
            "reduceOnly": true,
        });
        if let Some(map) = body.as_object_mut() {
            let (trigger_key, order_key) = match request.role {
                ExitRole::Tp => ("tpTriggerPx", "tpOrdPx"),
                ExitRole::Sl => ("slTriggerPx", "slOrdPx"),
            };
            map.insert(trigger_key.to_string(), json!(trigger));
            // -1: execute at market once triggered
            map.insert(order_key.to_string(), json!("-1"));
        }
        pos_side_field(&mut body, request.pos_side);

        let item = self
            .first_item(Method::POST, "/api/v5/trade/order-algo", &[], Some(&body))
            .await?;
        let algo_id = match text(&item, "algoId") {
            "" => text(&item, "ordId"),
            id => id,
        };
        if algo_id.is_empty() {
            return Err(EngineError::exchange(text(&item, "sCode"), "no algoId in reply"));
        }
        Ok(algo_id.to_string())
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()> {
        let body = json!({ "instId": symbol, "ordId": order_id });
        match self
            .call(Method::POST, "/api/v5/trade/cancel-order", &[], Some(&body))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if Self::is_already_done(&e) => {
                tracing::info!("Order {} already filled/cancelled", order_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn cancel_algo_orders(&self, symbol: &str, algo_ids: &[String]) -> Result<()> {
        if algo_ids.is_empty() {
            return Ok(());
        }
        let body = Value::Array(
            algo_ids
                .iter()
                .map(|id| json!({ "instId": symbol, "algoId": id }))
                .collect(),
        );
        match self
            .call(Method::POST, "/api/v5/trade/cancel-algos", &[], Some(&body))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if Self::is_already_done(&e) => {
                tracing::info!("Algo orders already filled/cancelled");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn pending_orders(&self, symbol: &str) -> Result<Vec<PendingOrder>> {
        let query = [("instType", INST_TYPE.to_string()), ("instId", symbol.to_string())];
        let items = self
            .call(Method::GET, "/api/v5/trade/orders-pending", &query, None)
            .await?;
        Ok(items
            .iter()
            .map(|item| PendingOrder {
                order_id: text(item, "ordId").to_string(),
                side: parse_side(text(item, "side")),
                price: num(item, "px"),
                size: num(item, "sz"),
            })
            .filter(|o| !o.order_id.is_empty())
            .collect())
    }

    async fn order_state(&self, symbol: &str, order_id: &str) -> Result<OrderState> {
        let query = [("instId", symbol.to_string()), ("ordId", order_id.to_string())];
        let item = self
            .first_item(Method::GET, "/api/v5/trade/order", &query, None)
            .await?;
        Ok(OrderState {
            order_id: order_id.to_string(),
            status: OrderStatus::parse(text(&item, "state")),
            filled_qty: num(&item, "accFillSz"),
            avg_price: num(&item, "avgPx"),
        })
    }

    async fn algo_order_state(&self, algo_id: &str) -> Result<OrderState> {
        let query = [("algoId", algo_id.to_string())];
        let item = self
            .first_item(Method::GET, "/api/v5/trade/order-algo", &query, None)
            .await?;
        Ok(OrderState {
            order_id: algo_id.to_string(),
            status: OrderStatus::parse(text(&item, "state")),
            filled_qty: num(&item, "actualSz"),
            avg_price: num(&item, "actualPx"),
        })
    }

    async fn positions(&self, symbol: &str) -> Result<Vec<PositionSnapshot>> {
        let query = [("instType", INST_TYPE.to_string()), ("instId", symbol.to_string())];
        let items = self
            .call(Method::GET, "/api/v5/account/positions", &query, None)
            .await?;
        Ok(items
            .iter()
            .map(parse_position)
            .filter(|p| p.symbol.is_empty() || p.symbol == symbol)
            .collect())
    }

    async fn balance(&self, currency: &str) -> Result<BalanceSnapshot> {
        let query = [("ccy", currency.to_string())];
        let item = self
            .first_item(Method::GET, "/api/v5/account/balance", &query, None)
            .await?;

        let detail = item
            .get("details")
            .and_then(Value::as_array)
            .and_then(|details| details.iter().find(|d| text(d, "ccy") == currency));

        let snapshot = match detail {
            Some(d) => BalanceSnapshot {
                total_equity: num(d, "eq"),
                available_equity: num(d, "availEq"),
            },
            None => BalanceSnapshot {
                total_equity: num(&item, "totalEq"),
                available_equity: num(&item, "totalEq"),
            },
        };
        Ok(snapshot)
    }

    async fn fills(&self, symbol: &str, since: DateTime<Utc>) -> Result<Vec<Fill>> {
        let query = [
            ("instType", INST_TYPE.to_string()),
            ("instId", symbol.to_string()),
            ("begin", since.timestamp_millis().to_string()),
            ("limit", "100".to_string()),
        ];
        let items = self
            .call(Method::GET, "/api/v5/trade/fills", &query, None)
            .await?;
        Ok(items
            .iter()
            .map(|item| Fill {
                trade_id: text(item, "tradeId").to_string(),
                order_id: text(item, "ordId").to_string(),
                fill_pnl: num(item, "fillPnl"),
                fee: num(item, "fee"),
                timestamp: parse_ms(item, "ts"),
            })
            .filter(|f| f.timestamp >= since)
            .collect())
    }
}
