use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use sha2::Sha256;

use crate::error::EngineError;
use crate::Result;

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_KEY: &str = "OK-ACCESS-KEY";
pub const HEADER_SIGN: &str = "OK-ACCESS-SIGN";
pub const HEADER_TIMESTAMP: &str = "OK-ACCESS-TIMESTAMP";
pub const HEADER_PASSPHRASE: &str = "OK-ACCESS-PASSPHRASE";
pub const HEADER_SIMULATED: &str = "x-simulated-trading";

/// API key triple
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
}

impl Credentials {
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        passphrase: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            passphrase: passphrase.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .finish_non_exhaustive()
    }
}

/// Local clock corrected by the offset to exchange server time
#[derive(Debug, Default)]
pub struct ServerClock {
    offset_ms: AtomicI64,
}

impl ServerClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the offset from a server time reading taken at `local`
    pub fn sync(&self, server_ms: i64, local: DateTime<Utc>) {
        let offset = server_ms - local.timestamp_millis();
        self.offset_ms.store(offset, Ordering::Relaxed);
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc::now() + Duration::milliseconds(self.offset_ms())
    }

    pub fn timestamp(&self) -> String {
        format_timestamp(self.now())
    }
}

/// ISO-8601 UTC with milliseconds, e.g. `2024-01-02T03:04:05.678Z`
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Query string with keys sorted, without the leading `?`
pub fn canonical_query(params: &[(&str, String)]) -> String {
    let mut sorted: Vec<&(&str, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    sorted
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Path plus sorted query, exactly as sent and signed
pub fn request_path(path: &str, params: &[(&str, String)]) -> String {
    if params.is_empty() {
        path.to_string()
    } else {
        format!("{}?{}", path, canonical_query(params))
    }
}

/// The string that gets signed: timestamp + METHOD + request path + body
pub fn prehash(timestamp: &str, method: &str, request_path: &str, body: &str) -> String {
    format!(
        "{}{}{}{}",
        timestamp,
        method.to_uppercase(),
        request_path,
        body
    )
}

/// base64(HMAC-SHA256(secret, message))
pub fn sign(secret: &str, message: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| EngineError::Signature(format!("HMAC init failed: {}", e)))?;
    mac.update(message.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Builds authenticated header sets for REST requests
#[derive(Debug, Clone)]
pub struct RequestSigner {
    credentials: Credentials,
    simulated: bool,
}

impl RequestSigner {
    pub fn new(credentials: Credentials, simulated: bool) -> Self {
        Self {
            credentials,
            simulated,
        }
    }

    pub fn build_headers(
        &self,
        timestamp: &str,
        method: &str,
        request_path: &str,
        body: &str,
    ) -> Result<HeaderMap> {
        let message = prehash(timestamp, method, request_path, body);
        let signature = sign(&self.credentials.secret, &message)?;

        tracing::trace!(method, request_path, timestamp, "Signed request");

        let mut headers = HeaderMap::new();
        headers.insert(HEADER_KEY, header_value(&self.credentials.api_key)?);
        headers.insert(HEADER_SIGN, header_value(&signature)?);
        headers.insert(HEADER_TIMESTAMP, header_value(timestamp)?);
        headers.insert(HEADER_PASSPHRASE, header_value(&self.credentials.passphrase)?);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if self.simulated {
            headers.insert(HEADER_SIMULATED, HeaderValue::from_static("1"));
        }

        Ok(headers)
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| EngineError::Signature(format!("Invalid header value: {}", e)))
}
