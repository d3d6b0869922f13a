//! JSON request body for the metrics API.

use std::time::Duration;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::Serialize;
use serde_json::Number;

use super::batcher::Batch;
use crate::measurement::{Measurement, MeasurementValue, Unit};

/// Unit display metadata attached to an entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitAttributes {
    pub display_units_long: String,
    pub display_units_short: String,
}

/// One gauge or counter in the request body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayloadEntry {
    pub name: String,
    pub value: Number,
    pub measure_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<UnitAttributes>,
}

/// `{"gauges": [...], "counters": [...]}`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Payload {
    pub gauges: Vec<PayloadEntry>,
    pub counters: Vec<PayloadEntry>,
}

/// How measurements are rendered into entries.
#[derive(Debug, Clone, Default)]
pub struct PayloadOptions {
    pub prefix: Option<String>,
    pub source: Option<String>,
    /// Round measure times to the nearest multiple of this interval.
    pub round: Option<Duration>,
    /// Append the batch's own gauge and counter counts.
    pub meta: bool,
}

impl Payload {
    /// Render a batch. Batch order is kept within each list.
    pub fn from_batch(batch: &Batch, options: &PayloadOptions) -> Self {
        let mut payload = Self {
            gauges: Vec::with_capacity(batch.len()),
            counters: Vec::new(),
        };

        for m in batch.measurements() {
            let Some(entry) = to_entry(m, options) else {
                tracing::warn!(output = "http", metric = %m.name(options.prefix.as_deref()), "Non-finite value, skipping");
                continue;
            };
            match m.value() {
                MeasurementValue::Counter(_) => payload.counters.push(entry),
                MeasurementValue::Gauge(_) | MeasurementValue::FloatGauge(_) => {
                    payload.gauges.push(entry)
                }
            }
        }

        if options.meta {
            let now = Utc::now();
            let counts = [
                ("gauges", payload.gauges.len()),
                ("counters", payload.counters.len()),
            ];
            for (what, count) in counts {
                let m = Measurement::gauge(
                    now,
                    "output",
                    ["http", "batch", what],
                    count as u64,
                    Unit::METRICS,
                );
                if let Some(entry) = to_entry(&m, options) {
                    payload.gauges.push(entry);
                }
            }
        }

        payload
    }

    pub fn len(&self) -> usize {
        self.gauges.len() + self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn to_entry(m: &Measurement, options: &PayloadOptions) -> Option<PayloadEntry> {
    let value = match m.value() {
        MeasurementValue::Counter(v) | MeasurementValue::Gauge(v) => Number::from(v),
        MeasurementValue::FloatGauge(v) => Number::from_f64(v)?,
    };

    let unit = m.unit();
    let attributes = (!unit.is_empty()).then(|| UnitAttributes {
        display_units_long: unit.name().to_string(),
        display_units_short: unit.abbr().to_string(),
    });

    Some(PayloadEntry {
        name: m.name(options.prefix.as_deref()),
        value,
        measure_time: measure_time(m.timestamp(), options.round),
        source: options.source.clone(),
        attributes,
    })
}

fn measure_time(ts: DateTime<Utc>, round: Option<Duration>) -> i64 {
    let rounded = round
        .and_then(|interval| TimeDelta::from_std(interval).ok())
        .and_then(|delta| ts.duration_round(delta).ok());
    rounded.unwrap_or(ts).timestamp()
}
