use thiserror::Error;

/// Error taxonomy for the trading engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Timeout, connection failure or malformed reply after every retry
    #[error("Transport error: {0}")]
    Transport(String),

    /// Structured error code returned by the exchange (never retried)
    #[error("Exchange error {code}: {msg}")]
    Exchange { code: String, msg: String },

    /// Missing or invalid configuration key
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    /// Local bookkeeping disagrees with the exchange
    #[error("State inconsistency: {0}")]
    StateInconsistency(String),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Signature error: {0}")]
    Signature(String),

    #[error("Startup failed: {0}")]
    Startup(String),
}

impl EngineError {
    pub fn exchange(code: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Exchange {
            code: code.into(),
            msg: msg.into(),
        }
    }

    /// Exchange code, if this is a structured exchange error
    pub fn exchange_code(&self) -> Option<&str> {
        match self {
            Self::Exchange { code, .. } => Some(code),
            _ => None,
        }
    }
}
