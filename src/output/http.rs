//! Resilient HTTP outputter.
//!
//! Two tasks joined by a backlog of at most [`BACKLOG_CAPACITY`] batches:
//!
//! ```text
//! shared queue -> Batcher -> backlog (8) -> Delivery -> metrics API
//! ```
//!
//! The shared queue applies backpressure to collectors; the backlog never
//! does. When delivery falls behind, new batches are dropped instead.

mod batcher;
mod delivery;
mod payload;

use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use batcher::{BACKLOG_CAPACITY, Batch, Batcher, backlog};
pub use delivery::{Delivery, DeliveryError, INITIAL_BACKOFF, MAX_ATTEMPTS};
pub use payload::{Payload, PayloadEntry, PayloadOptions, UnitAttributes};

use super::{OutputError, Outputter};
use crate::config::AgentConfig;
use crate::measurement::Measurement;

/// Batching stage plus delivery stage.
#[derive(Debug)]
pub struct HttpOutputter {
    batcher: Batcher,
    delivery: Delivery,
}

impl HttpOutputter {
    pub fn new(batcher: Batcher, delivery: Delivery) -> Self {
        Self { batcher, delivery }
    }

    /// Build from `http.*`, `prefix`, `source` and, for rounding, `interval`.
    pub fn from_config(config: &AgentConfig) -> Result<Self, OutputError> {
        let http = &config.http;
        let options = PayloadOptions {
            prefix: config.prefix.clone(),
            source: config.source.clone(),
            round: http.round.then_some(config.interval),
            meta: http.meta,
        };
        Ok(Self::new(
            Batcher::new(http.batch_size, http.batch_timeout),
            Delivery::new(http, options)?,
        ))
    }

    /// Count of batches dropped on a full backlog.
    pub fn dropped(&self) -> Arc<AtomicU64> {
        self.batcher.dropped()
    }
}

impl Outputter for HttpOutputter {
    fn name(&self) -> &'static str {
        "http"
    }

    fn start(self: Box<Self>, rx: mpsc::Receiver<Measurement>) -> Vec<JoinHandle<()>> {
        let Self { batcher, delivery } = *self;
        let (backlog_tx, backlog_rx) = backlog();
        vec![
            tokio::spawn(delivery.run(backlog_rx)),
            tokio::spawn(batcher.run(rx, backlog_tx)),
        ]
    }
}
