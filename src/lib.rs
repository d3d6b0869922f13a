//! Vigil - Host Metrics Agent
//!
//! This crate provides the measurement pipeline of the vigil agent. It can be
//! used as a library, or run as a standalone binary with the `vigil`
//! executable.
//!
//! # Architecture
//!
//! - **Measurements**: Typed values (counter, gauge, float gauge) with units and computed names
//! - **Collectors**: Polled once per tick, concurrently, by the [`CollectorRegistry`]
//! - **Listener**: A collector fed by third parties over a line protocol socket
//! - **Outputs**: Drain the shared queue to stdout or, batched and retried, to an HTTP API
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vigil::{AgentConfig, CollectorContext, CollectorRegistry, MeasurementSender, Outputter, output};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(AgentConfig::default());
//! let (sender, rx) = MeasurementSender::channel(config.channel_capacity);
//! output::build(&config)?.start(rx);
//!
//! let ctx = CollectorContext::new(sender, config.clone());
//! let registry = CollectorRegistry::from_names(&config.collectors, &ctx, false)?;
//! registry.poll(chrono::Utc::now()).await;
//! # Ok(())
//! # }
//! ```

pub mod collector;
pub mod config;
pub mod measurement;
pub mod output;

pub use collector::{Collector, CollectorContext, CollectorError, CollectorRegistry, MeasurementSender};
pub use config::{AgentConfig, ConfigError, OutputKind};
pub use measurement::{Measurement, MeasurementKind, MeasurementValue, Unit};
pub use output::{OutputError, Outputter};
