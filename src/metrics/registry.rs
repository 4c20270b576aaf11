//! Name-indexed metric registration and period snapshotting.

use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::clock::Clock;
use crate::config::Config;
use crate::error::ConfigurationError;
use crate::metrics::instruments::Instrument;
use crate::metrics::{
    Counter, Gauge, Histogram, InstrumentSnapshot, MetricKind, MetricSettings, MetricSnapshot,
    PeriodSnapshot, RangeSampler, Timer,
};
use crate::scheduler::{ScheduleHandle, Scheduler};
use crate::tags::TagSet;

type OnCreateCell<I> = Box<dyn Fn(&MetricSettings, &Arc<I>) -> Option<ScheduleHandle> + Send + Sync>;

/// A registered metric: a name, frozen settings and one instrument cell
/// per tag set.
///
/// Repeated lookups with an equal tag set return the same cell, so call
/// sites may freely re-resolve instead of caching.
pub struct Metric<I: Instrument> {
    name: String,
    kind: MetricKind,
    settings: MetricSettings,
    cells: DashMap<TagSet, Arc<I>>,
    on_create_cell: Option<OnCreateCell<I>>,
    refresh_handles: Mutex<Vec<ScheduleHandle>>,
}

impl<I: Instrument> Metric<I> {
    fn new(
        name: String,
        kind: MetricKind,
        settings: MetricSettings,
        on_create_cell: Option<OnCreateCell<I>>,
    ) -> Metric<I> {
        Metric {
            name,
            kind,
            settings,
            cells: DashMap::new(),
            on_create_cell,
            refresh_handles: Mutex::new(Vec::new()),
        }
    }

    /// The metric name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The instrument kind the name is bound to.
    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// The settings frozen at first registration.
    pub fn settings(&self) -> &MetricSettings {
        &self.settings
    }

    /// The instrument cell for `tags`, created on first use.
    pub fn with_tags(&self, tags: TagSet) -> Arc<I> {
        if let Some(existing) = self.cells.get(&tags) {
            return existing.clone();
        }
        match self.cells.entry(tags) {
            Entry::Occupied(occupied) => occupied.get().clone(),
            Entry::Vacant(vacant) => {
                let cell = Arc::new(I::create(&self.settings));
                vacant.insert(cell.clone());
                if let Some(on_create) = &self.on_create_cell {
                    if let Some(handle) = on_create(&self.settings, &cell) {
                        self.refresh_handles
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .push(handle);
                    }
                }
                cell
            }
        }
    }

    /// The untagged instrument cell.
    pub fn without_tags(&self) -> Arc<I> {
        self.with_tags(TagSet::empty())
    }

    fn snapshot_cells<T>(&self, read: impl Fn(&I) -> T) -> MetricSnapshot<T> {
        MetricSnapshot {
            name: self.name.clone(),
            settings: self.settings.clone(),
            instruments: self
                .cells
                .iter()
                .map(|entry| InstrumentSnapshot {
                    tags: entry.key().clone(),
                    value: read(entry.value()),
                })
                .collect(),
        }
    }
}

impl<I: Instrument> Drop for Metric<I> {
    fn drop(&mut self) {
        for handle in self
            .refresh_handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
        {
            handle.cancel();
        }
    }
}

impl<I: Instrument> std::fmt::Debug for Metric<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metric")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("instruments", &self.cells.len())
            .finish()
    }
}

enum RegisteredMetric {
    Counter(Arc<Metric<Counter>>),
    Gauge(Arc<Metric<Gauge>>),
    Histogram(Arc<Metric<Histogram>>),
    Timer(Arc<Metric<Timer>>),
    RangeSampler(Arc<Metric<RangeSampler>>),
}

impl RegisteredMetric {
    fn kind(&self) -> MetricKind {
        match self {
            RegisteredMetric::Counter(_) => MetricKind::Counter,
            RegisteredMetric::Gauge(_) => MetricKind::Gauge,
            RegisteredMetric::Histogram(_) => MetricKind::Histogram,
            RegisteredMetric::Timer(_) => MetricKind::Timer,
            RegisteredMetric::RangeSampler(_) => MetricKind::RangeSampler,
        }
    }
}

struct SnapshotState {
    since: SystemTime,
}

/// Registers metrics by name and produces registry-wide period snapshots.
///
/// Registration is idempotent with first-write-wins settings. The
/// measurement paths through the returned cells are lock-free with
/// respect to this registry; registration and snapshotting serialize on
/// one internal mutex.
pub struct MetricRegistry {
    clock: Clock,
    scheduler: Arc<dyn Scheduler>,
    config: RwLock<Arc<Config>>,
    metrics: DashMap<String, RegisteredMetric>,
    snapshot_state: Mutex<SnapshotState>,
}

impl MetricRegistry {
    /// Creates a registry. The first snapshot period starts now.
    pub fn new(clock: Clock, scheduler: Arc<dyn Scheduler>, config: Arc<Config>) -> MetricRegistry {
        let since = clock.now();
        MetricRegistry {
            clock,
            scheduler,
            config: RwLock::new(config),
            metrics: DashMap::new(),
            snapshot_state: Mutex::new(SnapshotState { since }),
        }
    }

    /// Swaps in a new configuration tree. Settings of already-published
    /// metrics are frozen and unaffected; only metrics registered after
    /// this call see the new factory settings.
    pub fn reconfigure(&self, config: Arc<Config>) {
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config;
    }

    /// Registers (or looks up) a counter.
    pub fn counter(
        &self,
        name: &str,
        settings: MetricSettings,
    ) -> Result<Arc<Metric<Counter>>, ConfigurationError> {
        self.register(
            name,
            MetricKind::Counter,
            settings,
            |registered| match registered {
                RegisteredMetric::Counter(metric) => Some(metric.clone()),
                _ => None,
            },
            RegisteredMetric::Counter,
            None,
        )
    }

    /// Registers (or looks up) a gauge.
    pub fn gauge(
        &self,
        name: &str,
        settings: MetricSettings,
    ) -> Result<Arc<Metric<Gauge>>, ConfigurationError> {
        self.register(
            name,
            MetricKind::Gauge,
            settings,
            |registered| match registered {
                RegisteredMetric::Gauge(metric) => Some(metric.clone()),
                _ => None,
            },
            RegisteredMetric::Gauge,
            None,
        )
    }

    /// Registers (or looks up) a histogram.
    pub fn histogram(
        &self,
        name: &str,
        settings: MetricSettings,
    ) -> Result<Arc<Metric<Histogram>>, ConfigurationError> {
        self.register(
            name,
            MetricKind::Histogram,
            settings,
            |registered| match registered {
                RegisteredMetric::Histogram(metric) => Some(metric.clone()),
                _ => None,
            },
            RegisteredMetric::Histogram,
            None,
        )
    }

    /// Registers (or looks up) a timer. Timers are histograms of
    /// nanoseconds.
    pub fn timer(
        &self,
        name: &str,
        settings: MetricSettings,
    ) -> Result<Arc<Metric<Timer>>, ConfigurationError> {
        let mut settings = settings;
        if settings.unit.is_none() {
            settings.unit = Some("ns".to_owned());
        }
        self.register(
            name,
            MetricKind::Timer,
            settings,
            |registered| match registered {
                RegisteredMetric::Timer(metric) => Some(metric.clone()),
                _ => None,
            },
            RegisteredMetric::Timer,
            None,
        )
    }

    /// Registers (or looks up) a range sampler. Each of its instrument
    /// cells is refreshed by the scheduler at the metric's
    /// `auto_update_interval`.
    pub fn range_sampler(
        &self,
        name: &str,
        settings: MetricSettings,
    ) -> Result<Arc<Metric<RangeSampler>>, ConfigurationError> {
        let scheduler = self.scheduler.clone();
        let on_create: OnCreateCell<RangeSampler> = Box::new(move |settings, cell| {
            let interval = settings
                .auto_update_interval
                .unwrap_or(Duration::from_millis(200));
            if interval.is_zero() {
                return None;
            }
            let cell = cell.clone();
            Some(scheduler.schedule_repeated(interval, Box::new(move || cell.sample())))
        });
        self.register(
            name,
            MetricKind::RangeSampler,
            settings,
            |registered| match registered {
                RegisteredMetric::RangeSampler(metric) => Some(metric.clone()),
                _ => None,
            },
            RegisteredMetric::RangeSampler,
            Some(on_create),
        )
    }

    /// Schedules a periodic `action`, for callback-updated gauges and
    /// counters. The returned handle stops the updates.
    pub fn auto_update(
        &self,
        interval: Duration,
        action: impl Fn() + Send + Sync + 'static,
    ) -> ScheduleHandle {
        self.scheduler.schedule_repeated(interval, Box::new(action))
    }

    fn register<I: Instrument>(
        &self,
        name: &str,
        kind: MetricKind,
        programmatic: MetricSettings,
        extract: impl Fn(&RegisteredMetric) -> Option<Arc<Metric<I>>>,
        wrap: impl Fn(Arc<Metric<I>>) -> RegisteredMetric,
        on_create_cell: Option<OnCreateCell<I>>,
    ) -> Result<Arc<Metric<I>>, ConfigurationError> {
        let _serialize = self.snapshot_state.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = self.metrics.get(name) {
            return match extract(existing.value()) {
                Some(metric) => {
                    let requested = self.effective_settings(kind, name, programmatic);
                    if requested != *metric.settings() {
                        tracing::warn!(
                            metric = name,
                            "metric already registered with different settings, keeping the original"
                        );
                    }
                    Ok(metric)
                }
                None => Err(ConfigurationError::MetricKindMismatch {
                    name: name.to_owned(),
                    existing: existing.kind().as_str(),
                    requested: kind.as_str(),
                }),
            };
        }

        let settings = self.effective_settings(kind, name, programmatic);
        let metric = Arc::new(Metric::new(name.to_owned(), kind, settings, on_create_cell));
        self.metrics.insert(name.to_owned(), wrap(metric.clone()));
        Ok(metric)
    }

    /// Resolves effective settings with per-name custom settings on top
    /// of the programmatic arguments, on top of the kind's defaults.
    fn effective_settings(
        &self,
        kind: MetricKind,
        name: &str,
        programmatic: MetricSettings,
    ) -> MetricSettings {
        let config = self
            .config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut settings = MetricSettings::default();
        if let Some(defaults) = config.subtree(&format!(
            "metric.factory.default-settings.{}",
            kind.config_key()
        )) {
            overlay_from_config(&mut settings, &defaults);
        }

        if !programmatic.description.is_empty() {
            settings.description = programmatic.description;
        }
        if programmatic.unit.is_some() {
            settings.unit = programmatic.unit;
        }
        if programmatic.auto_update_interval.is_some() {
            settings.auto_update_interval = programmatic.auto_update_interval;
        }
        if programmatic.dynamic_range.is_some() {
            settings.dynamic_range = programmatic.dynamic_range;
        }

        if let Some(custom) = config
            .subtree("metric.factory.custom-settings")
            .and_then(|table| table.child_exact(name))
        {
            overlay_from_config(&mut settings, &custom);
        }

        settings
    }

    /// Takes a registry-wide snapshot of every metric.
    ///
    /// With `reset` the period advances: resettable instruments start
    /// over and the next snapshot's `from` equals this snapshot's `to`.
    /// Without `reset` the current period is observed without ending it.
    /// Snapshotting is serialized; concurrent recordings proceed
    /// unblocked.
    pub fn snapshot(&self, reset: bool) -> PeriodSnapshot {
        let mut state = self.snapshot_state.lock().unwrap_or_else(|e| e.into_inner());
        let to = self.clock.now();
        let from = state.since;
        if reset {
            state.since = to;
        }

        let mut snapshot = PeriodSnapshot {
            from,
            to,
            counters: Vec::new(),
            gauges: Vec::new(),
            histograms: Vec::new(),
            timers: Vec::new(),
            range_samplers: Vec::new(),
        };

        for entry in self.metrics.iter() {
            match entry.value() {
                RegisteredMetric::Counter(metric) => snapshot
                    .counters
                    .push(metric.snapshot_cells(|cell| cell.snapshot(reset))),
                RegisteredMetric::Gauge(metric) => snapshot
                    .gauges
                    .push(metric.snapshot_cells(|cell| cell.value())),
                RegisteredMetric::Histogram(metric) => snapshot
                    .histograms
                    .push(metric.snapshot_cells(|cell| cell.snapshot(reset))),
                RegisteredMetric::Timer(metric) => snapshot
                    .timers
                    .push(metric.snapshot_cells(|cell| cell.snapshot(reset))),
                RegisteredMetric::RangeSampler(metric) => snapshot
                    .range_samplers
                    .push(metric.snapshot_cells(|cell| cell.snapshot(reset))),
            }
        }

        tracing::debug!(
            metrics = self.metrics.len(),
            reset,
            "metric registry snapshot taken"
        );
        snapshot
    }
}

impl std::fmt::Debug for MetricRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricRegistry")
            .field("metrics", &self.metrics.len())
            .finish()
    }
}

fn overlay_from_config(settings: &mut MetricSettings, branch: &Config) {
    if let Some(description) = branch.get_str("description") {
        settings.description = description.to_owned();
    }
    if let Some(unit) = branch.get_str("unit") {
        settings.unit = Some(unit.to_owned());
    }
    if let Some(interval) = branch.get_duration("auto-update-interval") {
        settings.auto_update_interval = Some(interval);
    }

    let lowest = branch.get_i64("lowest-discernible-value");
    let highest = branch.get_i64("highest-trackable-value");
    let digits = branch.get_i64("significant-value-digits");
    if lowest.is_some() || highest.is_some() || digits.is_some() {
        let mut range = settings.dynamic_range.clone().unwrap_or_default();
        if let Some(lowest) = lowest {
            range.lowest_discernible_value = lowest.max(1) as u64;
        }
        if let Some(highest) = highest {
            range.highest_trackable_value = highest.max(2) as u64;
        }
        if let Some(digits) = digits {
            range.significant_value_digits = digits.clamp(0, 5) as u8;
        }
        settings.dynamic_range = Some(range);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::DynamicRange;
    use crate::scheduler::ThreadPoolScheduler;

    fn registry() -> MetricRegistry {
        registry_with(Config::default_config())
    }

    fn registry_with(config: Config) -> MetricRegistry {
        MetricRegistry::new(
            Clock::new(),
            Arc::new(ThreadPoolScheduler::new("test-metrics", 1)),
            Arc::new(config),
        )
    }

    #[test]
    fn registration_is_idempotent_per_name() {
        let registry = registry();
        let first = registry
            .counter("requests", MetricSettings::describe("requests seen"))
            .unwrap();
        let second = registry.counter("requests", MetricSettings::default()).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.settings().description, "requests seen");
    }

    #[test]
    fn same_tags_resolve_to_the_same_instrument() {
        let registry = registry();
        let metric = registry.counter("hits", MetricSettings::default()).unwrap();

        let a = metric.with_tags(TagSet::of("route", "/users"));
        let b = metric.with_tags(TagSet::of("route", "/users"));
        let c = metric.with_tags(TagSet::of("route", "/orders"));

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn kind_conflict_is_fatal() {
        let registry = registry();
        registry
            .histogram(
                "lat",
                MetricSettings {
                    dynamic_range: Some(DynamicRange {
                        lowest_discernible_value: 1,
                        highest_trackable_value: 1_000_000_000,
                        significant_value_digits: 2,
                    }),
                    ..MetricSettings::default()
                },
            )
            .unwrap();

        let err = registry.counter("lat", MetricSettings::default()).unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::MetricKindMismatch { .. }
        ));
    }

    #[test]
    fn settings_conflict_keeps_the_original() {
        let registry = registry();
        let original_range = DynamicRange {
            lowest_discernible_value: 1,
            highest_trackable_value: 1_000_000_000,
            significant_value_digits: 2,
        };
        registry
            .histogram(
                "lat",
                MetricSettings {
                    dynamic_range: Some(original_range.clone()),
                    ..MetricSettings::default()
                },
            )
            .unwrap();

        let second = registry
            .histogram(
                "lat",
                MetricSettings {
                    dynamic_range: Some(DynamicRange {
                        lowest_discernible_value: 1,
                        highest_trackable_value: 1_000_000,
                        significant_value_digits: 3,
                    }),
                    ..MetricSettings::default()
                },
            )
            .unwrap();

        assert_eq!(second.settings().dynamic_range, Some(original_range));
    }

    #[test]
    fn snapshot_periods_tile() {
        let registry = registry();
        registry.counter("c", MetricSettings::default()).unwrap();

        let first = registry.snapshot(true);
        let second = registry.snapshot(true);

        assert!(first.from <= first.to);
        assert_eq!(second.from, first.to);
        assert!(second.to >= second.from);
    }

    #[test]
    fn counter_snapshot_resets_when_asked() {
        let registry = registry();
        let counter = registry
            .counter("requests", MetricSettings::default())
            .unwrap()
            .without_tags();
        counter.increment_by(5);
        counter.increment_by(3);
        counter.increment_by(2);

        let first = registry.snapshot(true);
        assert_eq!(first.counter("requests").unwrap().value(), Some(&10));

        let second = registry.snapshot(true);
        assert_eq!(second.counter("requests").unwrap().value(), Some(&0));
    }

    #[test]
    fn custom_settings_override_programmatic_arguments() {
        let config = Config::from_json(
            r#"{"metric": {"factory": {"custom-settings": {
                "storage.queue-depth": { "unit": "items", "significant-value-digits": 3 }
            }}}}"#,
        )
        .unwrap();
        let registry = registry_with(config);

        let metric = registry
            .histogram(
                "storage.queue-depth",
                MetricSettings {
                    unit: Some("entries".to_owned()),
                    ..MetricSettings::default()
                },
            )
            .unwrap();

        assert_eq!(metric.settings().unit.as_deref(), Some("items"));
        assert_eq!(
            metric
                .settings()
                .dynamic_range
                .as_ref()
                .unwrap()
                .significant_value_digits,
            3
        );
    }

    #[test]
    fn range_sampler_cells_are_refreshed_by_the_scheduler() {
        let registry = registry();
        let sampler = registry
            .range_sampler(
                "pool.in-use",
                MetricSettings {
                    auto_update_interval: Some(Duration::from_millis(10)),
                    ..MetricSettings::default()
                },
            )
            .unwrap()
            .without_tags();

        sampler.increment_by(4);
        std::thread::sleep(Duration::from_millis(80));

        let snapshot = registry.snapshot(true);
        let range = snapshot.range_sampler("pool.in-use").unwrap().value().unwrap();
        assert!(range.distribution.count >= 2, "no scheduled refreshes ran");
        assert_eq!(range.last, 4);
    }

    #[test]
    fn timer_defaults_to_nanoseconds() {
        let registry = registry();
        let timer = registry.timer("span.processing-time", MetricSettings::default()).unwrap();
        assert_eq!(timer.settings().unit.as_deref(), Some("ns"));
    }
}
