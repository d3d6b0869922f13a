//! Measurement units.

use std::borrow::Cow;
use std::fmt;

/// A unit of measure: long display name plus abbreviation.
///
/// The catalogue below covers what the built-in collectors emit. Units parsed
/// from the ingestion protocol are owned values built with [`Unit::custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Unit {
    name: Cow<'static, str>,
    abbr: Cow<'static, str>,
}

impl Unit {
    pub const EMPTY: Unit = Unit::fixed("", "");
    pub const PERCENT: Unit = Unit::fixed("Percent", "%");
    pub const BYTES: Unit = Unit::fixed("Bytes", "b");
    pub const SECONDS: Unit = Unit::fixed("Seconds", "s");
    pub const MILLISECONDS: Unit = Unit::fixed("MilliSeconds", "ms");
    pub const NANOSECONDS: Unit = Unit::fixed("NanoSeconds", "ns");
    pub const REQUESTS: Unit = Unit::fixed("Requests", "reqs");
    pub const ERRORS: Unit = Unit::fixed("Errors", "errs");
    pub const PACKETS: Unit = Unit::fixed("Packets", "pkts");
    pub const FILES: Unit = Unit::fixed("Files", "files");
    pub const PROCESSES: Unit = Unit::fixed("Processes", "procs");
    pub const CONNECTIONS: Unit = Unit::fixed("Connections", "conns");
    pub const SOCKETS: Unit = Unit::fixed("Sockets", "socks");
    pub const METRICS: Unit = Unit::fixed("Metrics", "metrics");

    const fn fixed(name: &'static str, abbr: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
            abbr: Cow::Borrowed(abbr),
        }
    }

    /// Build a unit that is not part of the catalogue.
    pub fn custom(name: impl Into<String>, abbr: impl Into<String>) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            abbr: Cow::Owned(abbr.into()),
        }
    }

    /// Long display name (e.g. "Bytes").
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Short display name (e.g. "b").
    pub fn abbr(&self) -> &str {
        &self.abbr
    }

    /// True for the unit-less [`Unit::EMPTY`].
    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.abbr.is_empty()
    }
}

impl Default for Unit {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.abbr.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{} ({})", self.name, self.abbr)
        }
    }
}
