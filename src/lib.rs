// Core modules
pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod execution;
pub mod models;

// Re-export commonly used types
pub use api::{Exchange, OkxClient};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::EngineError;
pub use events::{EngineEvent, EventSink};
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, EngineError>;
