//! l2met line writers.
//!
//! ```text
//! when=2014-10-13T22:00:16Z sample#web.load.1m=0.420000 source=web-1
//! ```

use std::collections::HashMap;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::Outputter;
use crate::measurement::{Measurement, MeasurementValue};

/// Distinct counter names remembered in derived mode before the history is reset.
pub const DERIVED_HISTORY_LIMIT: usize = 10_000;

/// Writes one l2met line per measurement.
///
/// In derived mode, counters are replaced by the difference from the previous
/// reading of the same metric, and the first reading of each counter is not
/// written at all. Names are submitted by third parties, so the history is
/// capped at [`DERIVED_HISTORY_LIMIT`]; reaching it starts a fresh history.
#[derive(Debug)]
pub struct StdoutOutputter {
    prefix: Option<String>,
    source: Option<String>,
    derived: bool,
    last: HashMap<String, Measurement>,
    history_limit: usize,
}

impl StdoutOutputter {
    pub fn raw(prefix: Option<String>, source: Option<String>) -> Self {
        Self {
            prefix,
            source,
            derived: false,
            last: HashMap::new(),
            history_limit: DERIVED_HISTORY_LIMIT,
        }
    }

    pub fn derived(prefix: Option<String>, source: Option<String>) -> Self {
        Self {
            derived: true,
            ..Self::raw(prefix, source)
        }
    }

    /// Override the derived-mode history cap.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// Format `m`, or `None` when derived mode suppresses it.
    pub fn line(&mut self, m: &Measurement) -> Option<String> {
        let name = m.name(self.prefix.as_deref());
        let value = match m.value() {
            MeasurementValue::Counter(_) if self.derived => {
                if self.last.len() >= self.history_limit && !self.last.contains_key(&name) {
                    tracing::warn!(
                        output = self.name(),
                        counters = self.last.len(),
                        "Counter history full, starting over"
                    );
                    self.last.clear();
                }
                let previous = self.last.insert(name.clone(), m.clone())?;
                m.difference(&previous)?.to_string()
            }
            _ => m.as_string(),
        };

        let mut line = format!(
            "when={} sample#{}={}",
            m.timestamp().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            name,
            value
        );
        if let Some(source) = &self.source {
            line.push_str(" source=");
            line.push_str(source);
        }
        line.push('\n');
        Some(line)
    }

    /// Drain `rx` into `out` until the queue closes.
    pub async fn run<W>(mut self, mut rx: mpsc::Receiver<Measurement>, mut out: W)
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(m) = rx.recv().await {
            let Some(line) = self.line(&m) else {
                continue;
            };
            if let Err(e) = out.write_all(line.as_bytes()).await {
                tracing::warn!(output = self.name(), error = %e, "Write failed");
            }
        }
        if let Err(e) = out.flush().await {
            tracing::warn!(output = self.name(), error = %e, "Flush failed");
        }
        tracing::debug!(output = self.name(), "Measurement queue closed");
    }
}

impl Outputter for StdoutOutputter {
    fn name(&self) -> &'static str {
        if self.derived {
            "stdout-derived"
        } else {
            "stdout-raw"
        }
    }

    fn start(self: Box<Self>, rx: mpsc::Receiver<Measurement>) -> Vec<JoinHandle<()>> {
        vec![tokio::spawn((*self).run(rx, tokio::io::stdout()))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::Unit;
    use chrono::DateTime;

    fn at(secs: i64) -> chrono::DateTime<chrono::Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_raw_line_format() {
        let mut out = StdoutOutputter::raw(Some("web".to_string()), Some("web-1".to_string()));
        let m = Measurement::float_gauge(at(1413237616), "load", ["1m"], 0.42, Unit::EMPTY);
        assert_eq!(
            out.line(&m).unwrap(),
            "when=2014-10-13T22:00:16Z sample#web.load.1m=0.420000 source=web-1\n"
        );
    }

    #[test]
    fn test_raw_passes_counters_through() {
        let mut out = StdoutOutputter::raw(None, None);
        let m = Measurement::counter(at(0), "listen", ["hits"], 10, Unit::EMPTY);
        assert_eq!(
            out.line(&m).unwrap(),
            "when=1970-01-01T00:00:00Z sample#listen.hits=10\n"
        );
        assert!(out.line(&m).is_some());
    }

    #[test]
    fn test_derived_counters_report_differences() {
        let mut out = StdoutOutputter::derived(None, None);
        let first = Measurement::counter(at(0), "listen", ["hits"], 100, Unit::EMPTY);
        let second = Measurement::counter(at(10), "listen", ["hits"], 150, Unit::EMPTY);
        let reset = Measurement::counter(at(20), "listen", ["hits"], 5, Unit::EMPTY);

        assert!(out.line(&first).is_none(), "first reading is suppressed");
        assert!(out.line(&second).unwrap().ends_with("sample#listen.hits=50\n"));
        assert!(out.line(&reset).unwrap().ends_with("sample#listen.hits=5\n"));

        let gauge = Measurement::gauge(at(0), "self", ["queue", "length"], 3, Unit::METRICS);
        assert!(out.line(&gauge).unwrap().ends_with("sample#self.queue.length=3\n"));
    }

    #[test]
    fn test_derived_history_is_bounded() {
        let mut out = StdoutOutputter::derived(None, None).with_history_limit(2);
        let counter = |name: &str, v| Measurement::counter(at(0), "listen", [name], v, Unit::EMPTY);

        assert!(out.line(&counter("a", 1)).is_none());
        assert!(out.line(&counter("b", 1)).is_none());
        assert!(out.line(&counter("a", 3)).unwrap().ends_with("sample#listen.a=2\n"));

        // A third name does not fit: the history restarts with it alone.
        assert!(out.line(&counter("c", 1)).is_none());
        assert_eq!(out.last.len(), 1);
        assert!(out.line(&counter("a", 5)).is_none(), "a was forgotten");
        assert!(out.last.len() <= 2);
    }

    #[tokio::test]
    async fn test_run_writes_until_queue_closes() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Measurement::gauge(at(0), "a", ["b"], 1, Unit::EMPTY))
            .await
            .unwrap();
        tx.send(Measurement::gauge(at(0), "a", ["c"], 2, Unit::EMPTY))
            .await
            .unwrap();
        drop(tx);

        let mut buf: Vec<u8> = Vec::new();
        StdoutOutputter::raw(None, None).run(rx, &mut buf).await;
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(
            text,
            "when=1970-01-01T00:00:00Z sample#a.b=1\nwhen=1970-01-01T00:00:00Z sample#a.c=2\n"
        );
    }
}
