//! Collector registry: the per-tick multi-collector scheduler.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::collector::listen::ListenCollector;
use crate::collector::load::LoadCollector;
use crate::collector::self_stats::SelfCollector;
use crate::collector::{Collector, CollectorContext, CollectorError, MeasurementSender};
use crate::measurement::{Measurement, Unit};

/// Collector name used for the scheduler's own measurements.
pub const SCHEDULER_NAME: &str = "scheduler";

type Factory = fn(&CollectorContext) -> Result<Arc<dyn Collector>, CollectorError>;

/// Static name -> constructor table.
static FACTORIES: &[(&str, Factory)] = &[
    ("listen", build_listen),
    ("load", build_load),
    ("self", build_self),
];

fn build_listen(ctx: &CollectorContext) -> Result<Arc<dyn Collector>, CollectorError> {
    Ok(Arc::new(ListenCollector::from_context(ctx)?))
}

fn build_load(ctx: &CollectorContext) -> Result<Arc<dyn Collector>, CollectorError> {
    Ok(Arc::new(LoadCollector::new(ctx.sender.clone())))
}

fn build_self(ctx: &CollectorContext) -> Result<Arc<dyn Collector>, CollectorError> {
    Ok(Arc::new(SelfCollector::new(ctx)))
}

/// Names accepted by [`CollectorRegistry::from_names`].
pub fn known_collectors() -> impl Iterator<Item = &'static str> {
    FACTORIES.iter().map(|(name, _)| *name)
}

struct Entry {
    collector: Arc<dyn Collector>,
    ticks: AtomicU64,
}

/// Registry owning every configured collector.
///
/// On each tick [`CollectorRegistry::poll`] runs all collectors concurrently,
/// one Tokio task each, and returns only once every task has finished. The
/// caller therefore never overlaps ticks; a slow collector delays the tick and
/// the interval timer skips the ticks it missed.
pub struct CollectorRegistry {
    collectors: HashMap<String, Entry>,
    sender: MeasurementSender,
}

impl std::fmt::Debug for CollectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorRegistry")
            .field("collectors", &self.names())
            .finish_non_exhaustive()
    }
}

impl CollectorRegistry {
    /// Create an empty registry emitting its own measurements through `sender`.
    pub fn new(sender: MeasurementSender) -> Self {
        Self {
            collectors: HashMap::new(),
            sender,
        }
    }

    /// Build the registry from an ordered list of collector names.
    ///
    /// Unknown names are skipped with a warning, or rejected when `strict` is set.
    /// A repeated name builds only its last entry, so a replaced collector never
    /// holds resources. Construction errors (e.g. the listener cannot bind) are
    /// always fatal.
    pub fn from_names(
        names: &[String],
        ctx: &CollectorContext,
        strict: bool,
    ) -> Result<Self, CollectorError> {
        let mut registry = Self::new(ctx.sender.clone());

        for (i, name) in names.iter().enumerate() {
            if names[i + 1..].contains(name) {
                tracing::debug!(collector = %name, "Duplicate collector name, last entry wins");
                continue;
            }
            let Some((_, factory)) = FACTORIES.iter().find(|(known, _)| *known == name.as_str()) else {
                if strict {
                    return Err(CollectorError::Unknown(name.clone()));
                }
                tracing::warn!(collector = %name, "Unknown collector, skipping");
                continue;
            };
            registry.register(factory(ctx)?);
        }

        Ok(registry)
    }

    /// Register a collector. A second collector with the same name replaces the first.
    pub fn register(&mut self, collector: Arc<dyn Collector>) {
        let name = collector.name().to_string();
        let entry = Entry {
            collector,
            ticks: AtomicU64::new(0),
        };
        if self.collectors.insert(name.clone(), entry).is_some() {
            tracing::debug!(collector = %name, "Collector re-registered, previous instance replaced");
        }
        tracing::info!(collector = %name, "Collector registered");
    }

    /// Registered collector names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collectors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }

    /// Run one tick: poll every collector concurrently and wait for all of them.
    ///
    /// Emits `scheduler.ticks.<name>.count` before fan-out, then one
    /// `scheduler.duration.<name>.seconds` per collector and a final
    /// `scheduler.duration.all.seconds` for the whole tick.
    pub async fn poll(&self, tick: DateTime<Utc>) {
        let start = Instant::now();
        let mut tasks = JoinSet::new();

        for (name, entry) in &self.collectors {
            let ticks = entry.ticks.fetch_add(1, Ordering::Relaxed) + 1;
            self.emit(Measurement::counter(
                tick,
                SCHEDULER_NAME,
                ["ticks", name.as_str(), "count"],
                ticks,
                Unit::EMPTY,
            ))
            .await;

            let collector = Arc::clone(&entry.collector);
            let sender = self.sender.clone();
            tasks.spawn(run_collection(collector, sender, tick));
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                // Collectors must absorb their own failures; reaching this is a bug.
                tracing::error!(error = %e, "Collector task aborted");
            }
        }

        let elapsed = start.elapsed();
        tracing::debug!(
            collectors = self.collectors.len(),
            duration_ms = elapsed.as_millis() as u64,
            "Tick complete"
        );
        self.emit(Measurement::float_gauge(
            tick,
            SCHEDULER_NAME,
            ["duration", "all", "seconds"],
            elapsed.as_secs_f64(),
            Unit::SECONDS,
        ))
        .await;
    }

    /// Poll on every `interval` tick until `shutdown` resolves.
    ///
    /// The first tick fires immediately. A tick is never started while the
    /// previous one is still running; ticks missed meanwhile are skipped, not
    /// replayed, and the schedule stays aligned to the original interval.
    pub async fn run(&self, interval: Duration, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.poll(Utc::now()).await,
                () = &mut shutdown => break,
            }
        }
    }

    /// Shut down every collector. Collectors tolerate repeated calls.
    pub fn shutdown(&self) {
        for (name, entry) in &self.collectors {
            tracing::debug!(collector = %name, "Shutting down collector");
            entry.collector.shutdown();
        }
        tracing::info!(collectors = self.collectors.len(), "Collectors shut down");
    }

    async fn emit(&self, measurement: Measurement) {
        if let Err(e) = self.sender.send(measurement).await {
            tracing::warn!(error = %e, "Failed to enqueue scheduler measurement");
        }
    }
}

/// Execute a single collection and record its duration.
async fn run_collection(
    collector: Arc<dyn Collector>,
    sender: MeasurementSender,
    tick: DateTime<Utc>,
) {
    let name = collector.name().to_string();
    let start = Instant::now();
    tracing::trace!(collector = %name, "Running collection");

    let result = collector.poll(tick).await;
    let elapsed = start.elapsed();

    match &result {
        Ok(()) => {
            tracing::trace!(collector = %name, duration_ms = elapsed.as_millis() as u64, "Collection succeeded")
        }
        Err(e) => tracing::error!(collector = %name, error = %e, "Collection failed"),
    }

    let duration = Measurement::float_gauge(
        tick,
        SCHEDULER_NAME,
        ["duration", name.as_str(), "seconds"],
        elapsed.as_secs_f64(),
        Unit::SECONDS,
    );
    if let Err(e) = sender.send(duration).await {
        tracing::warn!(collector = %name, error = %e, "Failed to enqueue duration measurement");
    }
}
