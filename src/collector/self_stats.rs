//! `self` collector: the agent's own vital signs.

use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::collector::{Collector, CollectorContext, CollectorError, MeasurementSender};
use crate::measurement::{Measurement, Unit};

/// Reports shared queue occupancy and process uptime.
#[derive(Debug)]
pub struct SelfCollector {
    sender: MeasurementSender,
    started_at: Instant,
}

impl SelfCollector {
    pub fn new(ctx: &CollectorContext) -> Self {
        Self {
            sender: ctx.sender.clone(),
            started_at: ctx.started_at,
        }
    }
}

#[async_trait::async_trait]
impl Collector for SelfCollector {
    fn name(&self) -> &str {
        "self"
    }

    async fn poll(&self, tick: DateTime<Utc>) -> Result<(), CollectorError> {
        // Sample before sending so our own writes are not counted.
        let length = self.sender.len() as u64;
        let capacity = self.sender.capacity() as u64;
        let uptime = self.started_at.elapsed().as_secs_f64();

        let name = self.name();
        self.sender
            .send(Measurement::gauge(tick, name, ["queue", "length"], length, Unit::METRICS))
            .await?;
        self.sender
            .send(Measurement::gauge(tick, name, ["queue", "capacity"], capacity, Unit::METRICS))
            .await?;
        self.sender
            .send(Measurement::float_gauge(tick, name, ["uptime", "seconds"], uptime, Unit::SECONDS))
            .await
    }
}
