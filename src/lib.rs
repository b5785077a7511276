//! Telemetry emission harness for OpenTelemetry collectors.
//!
//! Configures a resource, builds tracer, meter and logger providers with OTLP
//! exporters, emits a small fixed set of spans, counter increments and log
//! records, then shuts the providers down in reverse order. Point it at a
//! collector to check that all three signals arrive with the expected shape.
//!
//! # Example
//!
//! ```no_run
//! use telemetry_harness::{HarnessBuilder, HarnessError};
//!
//! fn main() -> Result<(), HarnessError> {
//!     let harness = HarnessBuilder::new()
//!         .with_standard_env()
//!         .service_name("collector-smoke")
//!         .build()?;
//!
//!     harness.run()
//! }
//! ```
//!
//! The pieces are also usable on their own: [`configure_resource`], the
//! `build_*_provider` functions and [`emit_sample`] compose into the same
//! pipeline with any exporter.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod builder;
mod config;
mod error;
mod guard;
mod harness;
mod health;
mod providers;
mod resource;
mod sample;

pub use builder::HarnessBuilder;
pub use config::{
    BatchConfig, CounterIncrement, EndpointConfig, ExportMode, HarnessConfig, HealthCheckConfig,
    Protocol, ResourceConfig, SampleConfig, SignalConfig, validate_endpoint,
};
pub use error::{HarnessError, Signal};
pub use guard::TelemetryGuard;
pub use harness::TelemetryHarness;
pub use health::{HealthStatus, probe_collector};
pub use providers::{
    build_logging_provider, build_metrics_provider, build_tracing_provider,
    logger_provider_with_exporter, meter_provider_with_exporter, tracer_provider_with_exporter,
};
pub use resource::configure_resource;
pub use sample::{SampleFailure, emit_sample};

/// Re-exported for version compatibility with this crate's dependencies.
pub use opentelemetry;
/// Re-exported for version compatibility with this crate's dependencies.
pub use opentelemetry_sdk;
/// Re-exported for version compatibility with this crate's dependencies.
pub use tracing;

/// Re-exported for users who want to construct custom configuration providers.
pub use figment;
