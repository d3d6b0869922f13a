//! Measurement Model
//!
//! The value type shared by every producer and consumer of metrics.
//!
//! # Components
//!
//! - [`Measurement`]: Immutable typed fact (timestamp, collector, path, value, unit)
//! - [`MeasurementValue`]: Closed set of value kinds (counter, gauge, float gauge)
//! - [`MeasurementKind`]: Discriminator used for routing and display
//! - [`Unit`]: Display name / abbreviation pair from a small catalogue
//!
//! Measurements are created by exactly one collector and moved into the shared
//! queue; nothing mutates them afterwards.

mod types;
mod unit;

pub use types::{Measurement, MeasurementKind, MeasurementValue, counter_difference, normalize_name};
pub use unit::Unit;
