//! An in-process observability runtime: metrics, distributed tracing and
//! context propagation for host applications.
//!
//! Three subsystems share one [`Context`] and one live configuration:
//!
//! * the [metric registry](crate::metrics::MetricRegistry): counters,
//!   gauges, histograms, timers and range samplers, registered by name
//!   and snapshotted over tiling wall-clock periods;
//! * the [tracer](crate::trace::Tracer): spans stitched into traces,
//!   sampling strategies, and a lock-free buffer reporters drain;
//! * [propagation](crate::propagation::Propagation): named channels
//!   that write a context onto HTTP-style or binary carriers and read it
//!   back on the receiving side.
//!
//! A [`Runtime`] owns one of everything; hosts create it at startup and
//! hand the relevant pieces to their instrumentation.
//!
//! # Examples
//!
//! ```
//! use vantage::metrics::MetricSettings;
//! use vantage::Runtime;
//!
//! let runtime = Runtime::with_defaults();
//!
//! let requests = runtime
//!     .metrics()
//!     .counter("http.requests", MetricSettings::describe("Requests received"))
//!     .unwrap()
//!     .without_tags();
//! requests.increment();
//!
//! let span = runtime.tracer().span_builder("GET /users").start();
//! // ... handle the request ...
//! span.finish();
//!
//! let snapshot = runtime.metrics().snapshot(true);
//! assert_eq!(snapshot.counter("http.requests").unwrap().value(), Some(&1));
//! # runtime.shutdown();
//! ```

#![warn(missing_docs)]

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod extension;
pub mod metrics;
pub mod propagation;
pub mod runtime;
pub mod scheduler;
pub mod tags;
pub mod trace;

pub use clock::Clock;
pub use config::{Config, ConfigHub};
pub use context::{Context, ContextGuard, Key};
pub use runtime::{Environment, Runtime};
pub use tags::{TagSet, TagSetBuilder, TagValue};
