use std::fmt;
use std::path::Path;
use std::time::Duration;

use chrono::NaiveTime;
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

use crate::error::EngineError;
use crate::Result;

pub const DEFAULT_REST_BASE_URL: &str = "https://www.okx.com";
pub const DEFAULT_WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";
const ENV_PREFIX: &str = "SWAPBOT";

/// Engine configuration
///
/// Required keys have no serde default: a missing one fails deserialization
/// and aborts startup.
#[derive(Clone, Deserialize)]
pub struct EngineConfig {
    pub symbol: String,
    pub leverage: u32,
    pub use_testnet: bool,
    pub okx_api_key: String,
    pub okx_api_secret: String,
    pub okx_passphrase: String,

    pub entry_price_offset: f64,
    pub tp_price_offset: f64,
    pub sl_price_offset: f64,
    pub batch_size_per_loop: u32,
    pub batch_offset: f64,

    pub loop_time_seconds: u64,
    pub cancel_unfilled_seconds: u64,

    pub min_order_amount: f64,
    pub target_order_amount: f64,
    pub rate_divisor: f64,

    pub long_safety_line_price: f64,
    pub short_safety_line_price: f64,

    #[serde(default = "default_max_allowed_used")]
    pub max_allowed_used: f64,
    #[serde(default = "default_true")]
    pub cancel_on_tp_price_below_market: bool,
    #[serde(default = "default_true")]
    pub cancel_on_entry_price_below_market: bool,
    #[serde(default = "default_account_interval")]
    pub account_update_interval_seconds: u64,

    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// Private stream (orders, algo orders, positions). REST polling covers
    /// the same events when unset.
    #[serde(default)]
    pub private_ws_url: Option<String>,
    #[serde(default = "default_margin_mode")]
    pub margin_mode: String,
    /// Long/short position mode: exit orders carry `posSide`
    #[serde(default)]
    pub hedge_mode: bool,
    /// UTC time of day ("HH:MM") for the scheduled end-of-day exit
    #[serde(default)]
    pub eod_exit_utc: Option<String>,
    #[serde(default = "default_rate_limit")]
    pub rest_rate_limit_per_sec: u32,

    #[serde(default)]
    pub timings: Timings,
}

/// Fixed protocol delays, in milliseconds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Timings {
    pub confirm_after_fill_ms: u64,
    pub confirm_after_partial_ms: u64,
    pub tp_protocol_delay_ms: u64,
    pub sl_protocol_delay_ms: u64,
    pub closure_fallback_delay_ms: u64,
    pub tp_residual_wait_ms: u64,
    pub cancel_settle_ms: u64,
    pub sl_settle_ms: u64,
    pub exit_settle_ms: u64,
    pub reconnect_delay_ms: u64,
    pub subscription_wait_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            confirm_after_fill_ms: 2_000,
            confirm_after_partial_ms: 5_000,
            tp_protocol_delay_ms: 500,
            sl_protocol_delay_ms: 500,
            closure_fallback_delay_ms: 100,
            tp_residual_wait_ms: 3_000,
            cancel_settle_ms: 1_000,
            sl_settle_ms: 500,
            exit_settle_ms: 1_000,
            reconnect_delay_ms: 5_000,
            subscription_wait_ms: 20_000,
        }
    }
}

impl Timings {
    /// All delays zero, for driving protocols synchronously in tests
    pub fn immediate() -> Self {
        Self {
            confirm_after_fill_ms: 0,
            confirm_after_partial_ms: 0,
            tp_protocol_delay_ms: 0,
            sl_protocol_delay_ms: 0,
            closure_fallback_delay_ms: 0,
            tp_residual_wait_ms: 0,
            cancel_settle_ms: 0,
            sl_settle_ms: 0,
            exit_settle_ms: 0,
            reconnect_delay_ms: 0,
            subscription_wait_ms: 1_000,
        }
    }

    pub fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }
}

fn default_max_allowed_used() -> f64 {
    1000.0
}

fn default_true() -> bool {
    true
}

fn default_account_interval() -> u64 {
    10
}

fn default_rest_base_url() -> String {
    DEFAULT_REST_BASE_URL.to_string()
}

fn default_ws_url() -> String {
    DEFAULT_WS_URL.to_string()
}

fn default_margin_mode() -> String {
    "cross".to_string()
}

fn default_rate_limit() -> u32 {
    10
}

impl EngineConfig {
    /// Load configuration from an optional file, overridden by `SWAPBOT__*`
    /// environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            let format = match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => FileFormat::Toml,
                _ => FileFormat::Json,
            };
            builder = builder.add_source(File::from(path).format(format).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: EngineConfig = builder
            .build()?
            .try_deserialize()
            .map_err(|e| EngineError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON document (no environment overrides)
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig = Config::builder()
            .add_source(File::from_str(json, FileFormat::Json))
            .build()?
            .try_deserialize()
            .map_err(|e| EngineError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(EngineError::Config("symbol must not be empty".into()));
        }
        if self.leverage == 0 {
            return Err(EngineError::Config("leverage must be at least 1".into()));
        }
        if self.okx_api_key.is_empty()
            || self.okx_api_secret.is_empty()
            || self.okx_passphrase.is_empty()
        {
            return Err(EngineError::Config("API credentials must be set".into()));
        }
        if self.batch_size_per_loop == 0 {
            return Err(EngineError::Config(
                "batch_size_per_loop must be at least 1".into(),
            ));
        }
        if self.loop_time_seconds == 0 {
            return Err(EngineError::Config(
                "loop_time_seconds must be at least 1".into(),
            ));
        }
        if self.rate_divisor <= 0.0 {
            return Err(EngineError::Config("rate_divisor must be positive".into()));
        }
        if self.target_order_amount <= 0.0 {
            return Err(EngineError::Config(
                "target_order_amount must be positive".into(),
            ));
        }
        if self.tp_price_offset < 0.0 || self.sl_price_offset < 0.0 {
            return Err(EngineError::Config(
                "tp/sl price offsets must not be negative".into(),
            ));
        }
        if self.rest_rate_limit_per_sec == 0 {
            return Err(EngineError::Config(
                "rest_rate_limit_per_sec must be at least 1".into(),
            ));
        }
        self.eod_exit_time()?;

        if self.long_safety_line_price < self.short_safety_line_price {
            tracing::warn!(
                long = self.long_safety_line_price,
                short = self.short_safety_line_price,
                "Long safety line is below short safety line; long signals take precedence"
            );
        }

        Ok(())
    }

    /// Parsed end-of-day exit time
    pub fn eod_exit_time(&self) -> Result<Option<NaiveTime>> {
        match &self.eod_exit_utc {
            None => Ok(None),
            Some(raw) => NaiveTime::parse_from_str(raw, "%H:%M")
                .map(Some)
                .map_err(|e| EngineError::Config(format!("eod_exit_utc '{}': {}", raw, e))),
        }
    }

    pub fn loop_interval(&self) -> Duration {
        Duration::from_secs(self.loop_time_seconds)
    }

    pub fn account_interval(&self) -> Duration {
        Duration::from_secs(self.account_update_interval_seconds.max(1))
    }

    /// Budget per batch slot: `max_allowed_used / rate_divisor`
    pub fn max_amount(&self) -> f64 {
        self.max_allowed_used / self.rate_divisor
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("symbol", &self.symbol)
            .field("leverage", &self.leverage)
            .field("use_testnet", &self.use_testnet)
            .field("entry_price_offset", &self.entry_price_offset)
            .field("tp_price_offset", &self.tp_price_offset)
            .field("sl_price_offset", &self.sl_price_offset)
            .field("batch_size_per_loop", &self.batch_size_per_loop)
            .field("batch_offset", &self.batch_offset)
            .field("loop_time_seconds", &self.loop_time_seconds)
            .field("long_safety_line_price", &self.long_safety_line_price)
            .field("short_safety_line_price", &self.short_safety_line_price)
            .finish_non_exhaustive()
    }
}
