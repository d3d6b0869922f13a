//! Core collector traits and types.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::AgentConfig;
use crate::measurement::Measurement;

/// Errors that can occur during collection.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// I/O error (socket setup, file access).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The shared measurement queue has no consumer anymore.
    #[error("measurement queue closed")]
    QueueClosed,

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Unknown collector name in configuration (strict mode only).
    #[error("unknown collector: {0}")]
    Unknown(String),
}

/// Write-only handle to the shared measurement queue.
///
/// The queue is bounded: [`MeasurementSender::send`] waits for room when it is
/// full, so a slow consumer slows collectors down instead of growing memory.
#[derive(Clone)]
pub struct MeasurementSender {
    tx: mpsc::Sender<Measurement>,
}

impl std::fmt::Debug for MeasurementSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeasurementSender")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl MeasurementSender {
    /// Create the shared queue, returning the producer handle and the single consumer end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Measurement>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Push a measurement, waiting while the queue is full.
    pub async fn send(&self, measurement: Measurement) -> Result<(), CollectorError> {
        self.tx
            .send(measurement)
            .await
            .map_err(|_| CollectorError::QueueClosed)
    }

    /// Number of measurements currently waiting in the queue.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of queued measurements.
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

/// Everything a collector receives at construction.
#[derive(Debug, Clone)]
pub struct CollectorContext {
    /// Handle to the shared measurement queue.
    pub sender: MeasurementSender,
    /// Read-only configuration snapshot.
    pub config: Arc<AgentConfig>,
    /// Process start, set once by the binary.
    pub started_at: Instant,
}

impl CollectorContext {
    pub fn new(sender: MeasurementSender, config: Arc<AgentConfig>) -> Self {
        Self {
            sender,
            config,
            started_at: Instant::now(),
        }
    }

    /// Override the process start instant.
    pub fn with_started_at(mut self, started_at: Instant) -> Self {
        self.started_at = started_at;
        self
    }
}

/// Core collector trait.
///
/// Collectors are created once at startup and owned by the
/// [`CollectorRegistry`](crate::collector::CollectorRegistry), which calls
/// [`Collector::poll`] once per tick.
///
/// # Error Handling Philosophy
///
/// - **Transient failures** (unreadable `/proc` file, unreachable target) are
///   logged and result in fewer or no measurements; `poll()` returns `Ok(())`.
/// - **Collector errors** (the measurement queue is gone) mean the collector
///   cannot function at all; `poll()` returns `Err(CollectorError)` and the
///   registry logs it as an error.
#[async_trait::async_trait]
pub trait Collector: Send + Sync + 'static {
    /// Unique name, also the first segment of every emitted metric name.
    fn name(&self) -> &str;

    /// Emit this tick's measurements onto the shared queue.
    async fn poll(&self, tick: DateTime<Utc>) -> Result<(), CollectorError>;

    /// Release resources (sockets, files). Must be idempotent.
    fn shutdown(&self) {}
}
