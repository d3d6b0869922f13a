//! Line parser for the ingestion protocol.
//!
//! One line, whitespace separated:
//!
//! ```text
//! <timestamp> <metric-name> <value> [<type>] [<unit>]
//! ```
//!
//! - `timestamp`: RFC3339, or unix seconds
//! - `metric-name`: `[a-zA-Z0-9][a-zA-Z0-9.-]*`
//! - `value`: unsigned integer (counter) or float (gauge)
//! - `type`: `c` / `counter` / `g` / `gauge`
//! - `unit`: `name[,abbr]`

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use thiserror::Error;

use crate::measurement::{Measurement, MeasurementValue, Unit};

/// Reasons a submitted line is rejected.
#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("expected 3, 4 or 5 fields, found {0}")]
    FieldCount(usize),

    #[error("invalid timestamp: {0:?}")]
    Timestamp(String),

    #[error("{0:?} is an improper metric name")]
    MetricName(String),

    #[error("couldn't parse {0:?} as a value")]
    Value(String),

    #[error("value {0:?} is incompatible with the counter type")]
    CounterValue(String),

    #[error("type {0:?} is neither counter nor gauge")]
    Type(String),

    #[error("invalid unit {0:?}")]
    Unit(String),
}

fn metric_name_regex() -> &'static Regex {
    static METRIC_NAME_REGEX: OnceLock<Regex> = OnceLock::new();
    METRIC_NAME_REGEX.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9.-]*$").expect("failed to compile metric name regex")
    })
}

fn unit_regex() -> &'static Regex {
    static UNIT_REGEX: OnceLock<Regex> = OnceLock::new();
    UNIT_REGEX.get_or_init(|| {
        Regex::new(r"^([a-zA-Z$%#]+)(,([a-zA-Z$%#]+))?$").expect("failed to compile unit regex")
    })
}

enum RawValue {
    Integer(u64),
    Float(f64),
}

/// Parse one submitted line into a measurement attributed to `collector`.
pub fn parse_line(line: &str, collector: &str) -> Result<Measurement, ParseError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if !(3..=5).contains(&fields.len()) {
        return Err(ParseError::FieldCount(fields.len()));
    }

    let timestamp = parse_timestamp(fields[0])?;

    let name = fields[1];
    if !metric_name_regex().is_match(name) {
        return Err(ParseError::MetricName(name.to_string()));
    }

    let raw = parse_value(fields[2])?;
    let mut counter = matches!(raw, RawValue::Integer(_));

    if let Some(&kind) = fields.get(3) {
        match kind {
            "c" | "counter" => {
                if !matches!(raw, RawValue::Integer(_)) {
                    return Err(ParseError::CounterValue(fields[2].to_string()));
                }
                counter = true;
            }
            "g" | "gauge" => counter = false,
            other => return Err(ParseError::Type(other.to_string())),
        }
    }

    let unit = match fields.get(4) {
        Some(&unit) => parse_unit(unit)?,
        None => Unit::EMPTY,
    };

    let value = match raw {
        RawValue::Integer(v) if counter => MeasurementValue::Counter(v),
        RawValue::Integer(v) => MeasurementValue::Gauge(v),
        RawValue::Float(v) => MeasurementValue::FloatGauge(v),
    };

    Ok(Measurement::new(timestamp, collector, name.split('.'), value, unit))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, ParseError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }

    parse_unsigned(s)
        .and_then(|secs| i64::try_from(secs).ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .ok_or_else(|| ParseError::Timestamp(s.to_string()))
}

/// Plain decimal digits only; `u64::from_str` would also take a leading `+`.
fn parse_unsigned(s: &str) -> Option<u64> {
    if s.starts_with('+') {
        return None;
    }
    s.parse().ok()
}

fn parse_value(s: &str) -> Result<RawValue, ParseError> {
    if let Some(v) = parse_unsigned(s) {
        return Ok(RawValue::Integer(v));
    }
    match s.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(RawValue::Float(v)),
        _ => Err(ParseError::Value(s.to_string())),
    }
}

fn parse_unit(s: &str) -> Result<Unit, ParseError> {
    let caps = unit_regex()
        .captures(s)
        .ok_or_else(|| ParseError::Unit(s.to_string()))?;
    let name = caps.get(1).map_or("", |m| m.as_str());
    let abbr = caps.get(3).map_or("", |m| m.as_str());
    Ok(Unit::custom(name, abbr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::MeasurementKind;
    use chrono::TimeZone;

    const NAME: &str = "listen";

    #[test]
    fn test_parse_unix_timestamp_counter() {
        let m = parse_line("90210 beverly.hills 10", NAME).unwrap();
        assert_eq!(m.kind(), MeasurementKind::Counter);
        assert_eq!(m.value(), MeasurementValue::Counter(10));
        assert_eq!(m.timestamp(), DateTime::from_timestamp(90210, 0).unwrap());
        assert!(m.unit().is_empty());
        assert_eq!(m.path(), ["beverly".to_string(), "hills".to_string()]);
        assert_eq!(m.name(None), "listen.beverly.hills");
    }

    #[test]
    fn test_parse_rfc3339_timestamp() {
        let m = parse_line("2014-10-13T22:00:16Z beverly.hills 10", NAME).unwrap();
        assert_eq!(
            m.timestamp(),
            Utc.with_ymd_and_hms(2014, 10, 13, 22, 0, 16).unwrap()
        );

        let m = parse_line("2014-10-13T23:00:16+01:00 beverly.hills 10", NAME).unwrap();
        assert_eq!(
            m.timestamp(),
            Utc.with_ymd_and_hms(2014, 10, 13, 22, 0, 16).unwrap()
        );
    }

    #[test]
    fn test_parse_float_is_float_gauge() {
        let m = parse_line("90210 beverly.hills 10.5\n", NAME).unwrap();
        assert_eq!(m.value(), MeasurementValue::FloatGauge(10.5));
    }

    #[test]
    fn test_plus_sign_is_not_an_integer() {
        let m = parse_line("90210 beverly.hills +5", NAME).unwrap();
        assert_eq!(m.value(), MeasurementValue::FloatGauge(5.0));

        assert!(matches!(
            parse_line("90210 beverly.hills +5 c", NAME),
            Err(ParseError::CounterValue(_))
        ));
        assert!(matches!(
            parse_line("+90210 beverly.hills 5", NAME),
            Err(ParseError::Timestamp(_))
        ));
    }

    #[test]
    fn test_type_override() {
        let m = parse_line("90210 beverly.hills 10 g", NAME).unwrap();
        assert_eq!(m.value(), MeasurementValue::Gauge(10));

        let m = parse_line("90210 beverly.hills 10.25 gauge", NAME).unwrap();
        assert_eq!(m.value(), MeasurementValue::FloatGauge(10.25));

        let m = parse_line("90210 beverly.hills 10 c", NAME).unwrap();
        assert_eq!(m.value(), MeasurementValue::Counter(10));

        let m = parse_line("90210 beverly.hills 10 counter", NAME).unwrap();
        assert_eq!(m.kind(), MeasurementKind::Counter);
    }

    #[test]
    fn test_unit_parsing() {
        let m = parse_line("90210 beverly.hills 10 c Millionaires", NAME).unwrap();
        assert_eq!(m.unit().name(), "Millionaires");
        assert_eq!(m.unit().abbr(), "");

        let m = parse_line("90210 beverly.hills 10 c Millionaires,$$", NAME).unwrap();
        assert_eq!(m.unit().name(), "Millionaires");
        assert_eq!(m.unit().abbr(), "$$");
    }

    #[test]
    fn test_rejected_lines() {
        let failure_cases = [
            "timestamp metric",
            "timestamp metric value",
            "2014-10-13 22:00:16 non.compliant.ts 10",
            "2014-10-13T22:00:16Z - 10",
            "2014-10-13T22:00:16Z 10",
            "2014-10-13T22:00:16Z negative.counter -1020 c",
            "2014-10-13T22:00:16Z bad.type 10 q",
            "2014-10-13T22:00:16Z malformed.type 10g",
            "2014-10-13T22:00:16Z bad.unit 10 c Bad Unit",
            "2014-10-13T22:00:16Z bad.abbr 10 c BadAbbr,88888",
            "2014-10-13T22:00:16Z malformed.unit 10 c Malform:m",
            "2014-10-13T22:00:16Z malformed.meta 10 c:Malform,m",
            "2014-10-13T22:00:16Z not.a.number NaN",
            "",
        ];

        for line in failure_cases {
            assert!(
                parse_line(line, NAME).is_err(),
                "{line:?} should have failed, but passed instead"
            );
        }
    }

    #[test]
    fn test_error_variants() {
        assert_eq!(
            parse_line("timestamp metric", NAME),
            Err(ParseError::FieldCount(2))
        );
        assert_eq!(
            parse_line("90210 beverly.hills 10 q", NAME),
            Err(ParseError::Type("q".to_string()))
        );
        assert_eq!(
            parse_line("90210 beverly.hills 1.5 c", NAME),
            Err(ParseError::CounterValue("1.5".to_string()))
        );
        assert_eq!(
            parse_line("90210 .hidden 1", NAME),
            Err(ParseError::MetricName(".hidden".to_string()))
        );
        assert_eq!(
            parse_line("90210 a.b 1 g Malform:m", NAME),
            Err(ParseError::Unit("Malform:m".to_string()))
        );
    }
}
