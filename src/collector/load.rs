//! `load` collector: system load averages from `/proc/loadavg`.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::collector::{Collector, CollectorError, MeasurementSender};
use crate::measurement::{Measurement, Unit};

const LOADAVG_PATH: &str = "/proc/loadavg";

/// One parsed `/proc/loadavg` line, e.g. `0.20 0.18 0.12 1/80 11206`.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
    pub executing: u64,
    pub total: u64,
    pub last_pid: u64,
}

impl LoadAverage {
    /// Parse the content of `/proc/loadavg`. Returns `None` on any malformed field.
    pub fn parse(content: &str) -> Option<Self> {
        let mut fields = content.split_whitespace();
        let one = fields.next()?.parse().ok()?;
        let five = fields.next()?.parse().ok()?;
        let fifteen = fields.next()?.parse().ok()?;
        let (executing, total) = fields.next()?.split_once('/')?;
        let last_pid = fields.next()?.parse().ok()?;

        Some(Self {
            one,
            five,
            fifteen,
            executing: executing.parse().ok()?,
            total: total.parse().ok()?,
            last_pid,
        })
    }
}

/// Emits `load.1m`, `load.5m`, `load.15m`, scheduling entity counts and the last pid.
#[derive(Debug)]
pub struct LoadCollector {
    sender: MeasurementSender,
    path: PathBuf,
}

impl LoadCollector {
    pub fn new(sender: MeasurementSender) -> Self {
        Self {
            sender,
            path: PathBuf::from(LOADAVG_PATH),
        }
    }

    /// Read from another file instead of `/proc/loadavg`.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }
}

#[async_trait::async_trait]
impl Collector for LoadCollector {
    fn name(&self) -> &str {
        "load"
    }

    async fn poll(&self, tick: DateTime<Utc>) -> Result<(), CollectorError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(collector = "load", path = %self.path.display(), error = %e, "Failed to read load averages");
                return Ok(());
            }
        };
        let Some(load) = LoadAverage::parse(&content) else {
            tracing::warn!(collector = "load", path = %self.path.display(), "Malformed load averages");
            return Ok(());
        };

        let name = self.name();
        let measurements = [
            Measurement::float_gauge(tick, name, ["1m"], load.one, Unit::EMPTY),
            Measurement::float_gauge(tick, name, ["5m"], load.five, Unit::EMPTY),
            Measurement::float_gauge(tick, name, ["15m"], load.fifteen, Unit::EMPTY),
            Measurement::gauge(
                tick,
                name,
                ["scheduling", "entities", "executing"],
                load.executing,
                Unit::PROCESSES,
            ),
            Measurement::gauge(
                tick,
                name,
                ["scheduling", "entities", "total"],
                load.total,
                Unit::PROCESSES,
            ),
            Measurement::gauge(tick, name, ["pid", "last"], load.last_pid, Unit::EMPTY),
        ];
        for m in measurements {
            self.sender.send(m).await?;
        }
        Ok(())
    }
}
