use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::models::{AccountSnapshot, Position};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConsoleLog {
    pub timestamp: String,
    pub message: String,
    pub level: LogLevel,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct PositionUpdate {
    pub in_position: bool,
    pub position_entry_price: f64,
    pub position_qty: f64,
    pub current_take_profit: f64,
    pub current_stop_loss: f64,
}

impl PositionUpdate {
    pub fn flat() -> Self {
        Self::default()
    }

    pub fn from_position(position: &Position) -> Self {
        Self {
            in_position: true,
            position_entry_price: position.entry_price,
            position_qty: position.quantity,
            current_take_profit: position.take_profit,
            current_stop_loss: position.stop_loss,
        }
    }
}

/// Named event with its payload, serialized as `{"event": .., "payload": ..}`
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum EngineEvent {
    BotStatus { running: bool },
    ConsoleLog(ConsoleLog),
    PositionUpdate(PositionUpdate),
    AccountUpdate(AccountSnapshot),
    Error { message: String },
    Success { message: String },
    Warning { message: String },
}

/// Destination for engine events. `emit` must never block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// Forwards events into an unbounded channel; a dropped receiver is ignored
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

/// Writes events to the tracing log only
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: EngineEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => tracing::debug!(target: "swapbot::events", "{}", json),
            Err(e) => tracing::warn!("Failed to serialize event: {}", e),
        }
    }
}

/// Logs through tracing and mirrors the line to the sink as `console_log`
#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn EventSink>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    pub fn emit(&self, event: EngineEvent) {
        self.sink.emit(event);
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => tracing::debug!("{}", message),
            LogLevel::Info => tracing::info!("{}", message),
            LogLevel::Warning => tracing::warn!("{}", message),
            LogLevel::Error => tracing::error!("{}", message),
            LogLevel::Critical => tracing::error!(critical = true, "{}", message),
        }
        self.sink.emit(EngineEvent::ConsoleLog(ConsoleLog {
            timestamp: Utc::now().format("%H:%M:%S").to_string(),
            message,
            level,
        }));
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    pub fn critical(&self, message: impl Into<String>) {
        self.log(LogLevel::Critical, message);
    }

    /// Console line plus a top-level `success` event
    pub fn success(&self, message: impl Into<String>) {
        let message = message.into();
        self.log(LogLevel::Info, message.clone());
        self.sink.emit(EngineEvent::Success { message });
    }

    /// Console line plus a top-level `warning` event
    pub fn warning(&self, message: impl Into<String>) {
        let message = message.into();
        self.log(LogLevel::Warning, message.clone());
        self.sink.emit(EngineEvent::Warning { message });
    }

    /// Console line plus a top-level `error` event
    pub fn alert(&self, message: impl Into<String>) {
        let message = message.into();
        self.log(LogLevel::Error, message.clone());
        self.sink.emit(EngineEvent::Error { message });
    }

    pub fn position(&self, update: PositionUpdate) {
        self.sink.emit(EngineEvent::PositionUpdate(update));
    }

    pub fn account(&self, snapshot: AccountSnapshot) {
        self.sink.emit(EngineEvent::AccountUpdate(snapshot));
    }

    pub fn status(&self, running: bool) {
        self.sink.emit(EngineEvent::BotStatus { running });
    }
}
