//! The composition root owning every collaborator.

use std::sync::{Arc, RwLock};

use crate::clock::Clock;
use crate::config::{Config, ConfigHub};
use crate::error::ConfigurationError;
use crate::metrics::MetricRegistry;
use crate::propagation::{Propagation, PropagationExtensions};
use crate::scheduler::{Scheduler, ThreadPoolScheduler};
use crate::tags::TagSet;
use crate::trace::tracer::TraceExtensions;
use crate::trace::Tracer;

/// Identity of the process this runtime instruments.
#[derive(Clone, Debug)]
pub struct Environment {
    /// Logical service name.
    pub service: String,
    /// Host the process runs on.
    pub host: String,
    /// Instance name distinguishing processes of one service on one
    /// host.
    pub instance: String,
    /// Tags applied to everything this process emits.
    pub tags: TagSet,
}

/// One fully wired observability runtime: clock, configuration hub,
/// scheduler, metric registry, tracer and propagation channels.
///
/// Hosts typically create a single `Runtime` at startup and share it.
/// There are no global singletons here; embedding several isolated
/// runtimes in one process is supported.
pub struct Runtime {
    clock: Clock,
    hub: ConfigHub,
    scheduler: Arc<ThreadPoolScheduler>,
    refresh_scheduler: Arc<ThreadPoolScheduler>,
    trace_extensions: Arc<TraceExtensions>,
    propagation_extensions: PropagationExtensions,
    metrics: Arc<MetricRegistry>,
    tracer: Tracer,
    propagation: Propagation,
    environment: RwLock<Arc<Environment>>,
}

impl Runtime {
    /// Builds a runtime from the given configuration tree.
    pub fn new(config: Config) -> Result<Runtime, ConfigurationError> {
        let clock = Clock::new();
        let pool_size = config.get_i64("scheduler-pool-size").unwrap_or(2).max(1) as usize;
        let scheduler = Arc::new(ThreadPoolScheduler::new("vantage-scheduler", pool_size));
        let scheduler_handle: Arc<dyn Scheduler> = scheduler.clone();

        // Instrument refreshes run on their own pool so a slow host
        // callback cannot delay the adaptive sampler tick (or vice
        // versa).
        let refresh_pool_size = config
            .get_i64("metric.refresh-scheduler-pool-size")
            .unwrap_or(2)
            .max(1) as usize;
        let refresh_scheduler = Arc::new(ThreadPoolScheduler::new(
            "vantage-metric-refresh",
            refresh_pool_size,
        ));

        let refresh_handle: Arc<dyn Scheduler> = refresh_scheduler.clone();
        let metrics = Arc::new(MetricRegistry::new(
            clock.clone(),
            refresh_handle,
            Arc::new(config.clone()),
        ));

        let trace_extensions = Arc::new(TraceExtensions::with_builtins());
        let tracer = Tracer::new(
            clock.clone(),
            metrics.clone(),
            scheduler_handle,
            trace_extensions.clone(),
            &config,
        );

        let propagation_extensions = PropagationExtensions::with_builtins();
        let propagation = Propagation::from_config(&config, &propagation_extensions)?;

        let environment = RwLock::new(Arc::new(environment_from(&config)));
        let hub = ConfigHub::new(config);

        Ok(Runtime {
            clock,
            hub,
            scheduler,
            refresh_scheduler,
            trace_extensions,
            propagation_extensions,
            metrics,
            tracer,
            propagation,
            environment,
        })
    }

    /// Builds a runtime from the compiled-in default configuration.
    pub fn with_defaults() -> Runtime {
        Runtime::new(Config::default_config()).expect("default configuration is valid")
    }

    /// Applies a new configuration tree to every subsystem.
    ///
    /// Measurement and span paths keep running throughout; the
    /// propagation channels are validated first, so on error nothing has
    /// changed.
    pub fn reconfigure(&self, config: Config) -> Result<(), ConfigurationError> {
        self.propagation
            .reconfigure(&config, &self.propagation_extensions)?;
        self.metrics.reconfigure(Arc::new(config.clone()));
        self.tracer.reconfigure(&config);
        *self
            .environment
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Arc::new(environment_from(&config));
        self.hub.swap(config);
        Ok(())
    }

    /// The runtime's clock.
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// The configuration hub; subscribe here to observe reconfigures.
    pub fn config_hub(&self) -> &ConfigHub {
        &self.hub
    }

    /// The metric registry.
    pub fn metrics(&self) -> &Arc<MetricRegistry> {
        &self.metrics
    }

    /// The tracer.
    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    /// The propagation channels.
    pub fn propagation(&self) -> &Propagation {
        &self.propagation
    }

    /// The tracer's extension registries; register custom samplers,
    /// identifier schemes and hooks here before reconfiguring.
    pub fn trace_extensions(&self) -> &TraceExtensions {
        &self.trace_extensions
    }

    /// The propagation extension registries; register custom entries
    /// here before reconfiguring.
    pub fn propagation_extensions(&self) -> &PropagationExtensions {
        &self.propagation_extensions
    }

    /// The process identity derived from `environment.*`.
    pub fn environment(&self) -> Arc<Environment> {
        self.environment
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Stops the scheduler worker threads. Measurements remain safe to
    /// record afterwards; periodic refreshes stop.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        self.refresh_scheduler.shutdown();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("environment", &self.environment())
            .finish_non_exhaustive()
    }
}

fn environment_from(config: &Config) -> Environment {
    let service = config
        .get_str("environment.service")
        .unwrap_or("unknown-service")
        .to_owned();
    let host = match config.get_str("environment.host") {
        Some("auto") | None => std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned()),
        Some(host) => host.to_owned(),
    };
    let instance = match config.get_str("environment.instance") {
        Some("auto") | None => format!("{service}@{host}"),
        Some(instance) => instance.to_owned(),
    };
    let tags = TagSet::from_pairs(config.string_table("environment.tags"));

    Environment {
        service,
        host,
        instance,
        tags,
    }
}
