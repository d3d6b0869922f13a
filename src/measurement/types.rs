//! Core measurement types.

use std::fmt;

use chrono::{DateTime, Utc};
use strum_macros::{AsRefStr, Display, EnumString};

use super::Unit;

/// Measurement kind classification.
///
/// Consumers route on this (e.g. counters vs. gauges in the HTTP payload).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, AsRefStr)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum MeasurementKind {
    /// Monotonically non-decreasing unsigned integer.
    Counter,
    /// Point-in-time unsigned integer.
    Gauge,
    /// Point-in-time floating point value.
    FloatGauge,
}

/// A typed measurement value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MeasurementValue {
    Counter(u64),
    Gauge(u64),
    FloatGauge(f64),
}

impl MeasurementValue {
    /// The discriminator of this value.
    pub fn kind(&self) -> MeasurementKind {
        match self {
            Self::Counter(_) => MeasurementKind::Counter,
            Self::Gauge(_) => MeasurementKind::Gauge,
            Self::FloatGauge(_) => MeasurementKind::FloatGauge,
        }
    }

    /// Numeric value widened to `f64`.
    pub fn as_f64(&self) -> f64 {
        match *self {
            Self::Counter(v) | Self::Gauge(v) => v as f64,
            Self::FloatGauge(v) => v,
        }
    }
}

/// Integers print as decimal, floats with six fixed decimals.
impl fmt::Display for MeasurementValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Counter(v) | Self::Gauge(v) => write!(f, "{v}"),
            Self::FloatGauge(v) => write!(f, "{v:.6}"),
        }
    }
}

/// A single immutable fact produced by a collector.
///
/// The externally visible metric name is computed on demand by
/// [`Measurement::name`]; it is never stored.
///
/// # Example
///
/// ```
/// use chrono::Utc;
/// use vigil::measurement::{Measurement, Unit};
///
/// let m = Measurement::float_gauge(Utc::now(), "load", ["1m"], 0.42, Unit::EMPTY);
/// assert_eq!(m.name(Some("host")), "host.load.1m");
/// assert_eq!(m.as_string(), "0.420000");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    timestamp: DateTime<Utc>,
    collector: String,
    path: Vec<String>,
    value: MeasurementValue,
    unit: Unit,
}

impl Measurement {
    /// Create a measurement from its parts.
    pub fn new<P, S>(
        timestamp: DateTime<Utc>,
        collector: impl Into<String>,
        path: P,
        value: MeasurementValue,
        unit: Unit,
    ) -> Self
    where
        P: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            timestamp,
            collector: collector.into(),
            path: path.into_iter().map(Into::into).collect(),
            value,
            unit,
        }
    }

    /// Create a counter measurement.
    pub fn counter<P, S>(
        timestamp: DateTime<Utc>,
        collector: impl Into<String>,
        path: P,
        value: u64,
        unit: Unit,
    ) -> Self
    where
        P: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(timestamp, collector, path, MeasurementValue::Counter(value), unit)
    }

    /// Create an integer gauge measurement.
    pub fn gauge<P, S>(
        timestamp: DateTime<Utc>,
        collector: impl Into<String>,
        path: P,
        value: u64,
        unit: Unit,
    ) -> Self
    where
        P: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(timestamp, collector, path, MeasurementValue::Gauge(value), unit)
    }

    /// Create a floating point gauge measurement.
    pub fn float_gauge<P, S>(
        timestamp: DateTime<Utc>,
        collector: impl Into<String>,
        path: P,
        value: f64,
        unit: Unit,
    ) -> Self
    where
        P: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(timestamp, collector, path, MeasurementValue::FloatGauge(value), unit)
    }

    /// Externally visible metric name: `prefix.collector.path...`, normalized.
    pub fn name(&self, prefix: Option<&str>) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(self.path.len() + 2);
        if let Some(p) = prefix
            && !p.is_empty()
        {
            parts.push(p);
        }
        parts.push(&self.collector);
        parts.extend(self.path.iter().map(String::as_str));
        normalize_name(&parts.join("."))
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn collector(&self) -> &str {
        &self.collector
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn value(&self) -> MeasurementValue {
        self.value
    }

    pub fn kind(&self) -> MeasurementKind {
        self.value.kind()
    }

    pub fn unit(&self) -> &Unit {
        &self.unit
    }

    /// Value formatted per kind (integers decimal, floats with 6 decimals).
    pub fn as_string(&self) -> String {
        self.value.to_string()
    }

    /// Difference between this counter reading and a previous one.
    ///
    /// Returns `None` unless both measurements are counters. A decrease is
    /// read as a counter reset, see [`counter_difference`].
    pub fn difference(&self, previous: &Measurement) -> Option<u64> {
        match (self.value, previous.value) {
            (MeasurementValue::Counter(current), MeasurementValue::Counter(last)) => {
                Some(counter_difference(current, last))
            }
            _ => None,
        }
    }
}

/// `current - previous`, or `current` itself when the counter went backwards.
///
/// We cannot know the counter width (32, 64 or 128 bit) so wraparound
/// arithmetic is not attempted. The reading after a reset is taken as the
/// absolute amount since the reset, which loses whatever accumulated between
/// the last read and the reset.
pub fn counter_difference(current: u64, previous: u64) -> u64 {
    if current < previous {
        current
    } else {
        current - previous
    }
}

/// Replace `#`, `_` and `-` with `.`.
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '#' | '_' | '-' => '.',
            other => other,
        })
        .collect()
}
