//! Collector Layer
//!
//! Collectors produce [`Measurement`](crate::measurement::Measurement)s onto
//! one shared bounded queue. The [`CollectorRegistry`] polls every registered
//! collector once per tick, each in its own Tokio task, and joins them all
//! before the tick completes.
//!
//! # Architecture
//!
//! - [`Collector`]: Core trait for implementing data collectors
//! - [`MeasurementSender`]: Write-only handle to the shared queue
//! - [`CollectorRegistry`]: Name -> collector map and per-tick scheduler
//! - [`listen`]: The ingestion listener, a collector fed by a socket
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vigil::collector::{CollectorContext, CollectorRegistry, MeasurementSender};
//! use vigil::config::AgentConfig;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(AgentConfig::default());
//! let (sender, _rx) = MeasurementSender::channel(config.channel_capacity);
//! let ctx = CollectorContext::new(sender, config.clone());
//! let registry = CollectorRegistry::from_names(&config.collectors, &ctx, false)?;
//! registry.poll(chrono::Utc::now()).await;
//! # Ok(())
//! # }
//! ```

pub mod listen;
pub mod load;
mod registry;
pub mod self_stats;
mod traits;

pub use registry::{CollectorRegistry, SCHEDULER_NAME, known_collectors};
pub use traits::{Collector, CollectorContext, CollectorError, MeasurementSender};
