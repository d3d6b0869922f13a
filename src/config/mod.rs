//! Configuration module for the vigil agent.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Tick interval, collector list and shared queue capacity
//! - Ingestion listener address
//! - Output selection and HTTP delivery settings

mod app;
mod validation;

pub use app::{AgentConfig, HttpConfig, ListenConfig, OutputKind};
pub use validation::{ConfigError, expand_env_vars, parse_duration};

// Re-export constants
pub use app::{
    DEFAULT_BATCH_SIZE, DEFAULT_BATCH_TIMEOUT, DEFAULT_CHANNEL_CAPACITY, DEFAULT_HTTP_URL,
    DEFAULT_INTERVAL, DEFAULT_LISTEN_ADDRESS, DEFAULT_NETWORK_TIMEOUT,
};
