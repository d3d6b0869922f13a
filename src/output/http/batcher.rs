//! Batching stage: shared queue -> bounded backlog.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, sleep};

use crate::measurement::Measurement;

/// Maximum number of ready batches waiting for delivery.
pub const BACKLOG_CAPACITY: usize = 8;

/// An ordered, non-empty group of measurements, immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch(Vec<Measurement>);

impl Batch {
    /// Wrap a list of measurements; `None` when it is empty.
    pub fn new(measurements: Vec<Measurement>) -> Option<Self> {
        (!measurements.is_empty()).then_some(Self(measurements))
    }

    pub fn measurements(&self) -> &[Measurement] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Create the backlog queue between the batching and delivery stages.
pub fn backlog() -> (mpsc::Sender<Batch>, mpsc::Receiver<Batch>) {
    mpsc::channel(BACKLOG_CAPACITY)
}

/// Groups measurements into batches of at most `batch_size`.
///
/// A batch is ready when it is full, or `batch_timeout` after its first
/// measurement arrived. Ready batches are offered to the backlog without
/// waiting; when the backlog is full the batch is dropped.
#[derive(Debug)]
pub struct Batcher {
    batch_size: usize,
    batch_timeout: Duration,
    dropped: Arc<AtomicU64>,
}

impl Batcher {
    pub fn new(batch_size: usize, batch_timeout: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            batch_timeout,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared count of batches dropped because the backlog was full.
    pub fn dropped(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }

    /// Run until the measurement queue closes; a final partial batch is offered before returning.
    pub async fn run(self, mut rx: mpsc::Receiver<Measurement>, backlog: mpsc::Sender<Batch>) {
        let mut pending = Vec::with_capacity(self.batch_size);
        let deadline = sleep(self.batch_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                received = rx.recv() => {
                    let Some(measurement) = received else {
                        break;
                    };
                    if pending.is_empty() {
                        deadline.as_mut().reset(Instant::now() + self.batch_timeout);
                    }
                    pending.push(measurement);
                    if pending.len() >= self.batch_size {
                        self.hand_off(&mut pending, &backlog);
                    }
                }
                () = &mut deadline, if !pending.is_empty() => {
                    self.hand_off(&mut pending, &backlog);
                }
            }
        }

        if !pending.is_empty() {
            self.hand_off(&mut pending, &backlog);
        }
        tracing::debug!(output = "http", "Batcher stopped, measurement queue closed");
    }

    fn hand_off(&self, pending: &mut Vec<Measurement>, backlog: &mpsc::Sender<Batch>) {
        let batch = Batch(std::mem::replace(
            pending,
            Vec::with_capacity(self.batch_size),
        ));
        let size = batch.len();

        match backlog.try_send(batch) {
            Ok(()) => tracing::trace!(output = "http", size, "Batch queued"),
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::error!(output = "http", size, dropped, "Batches backlogged, dropping");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::warn!(output = "http", size, "Delivery stopped, dropping batch");
            }
        }
    }
}
