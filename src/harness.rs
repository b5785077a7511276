//! The emit-and-teardown run.

use crate::config::HarnessConfig;
use crate::error::HarnessError;
use crate::guard::TelemetryGuard;
use crate::health::probe_collector;
use crate::sample::emit_sample;

/// Owns a configured set of providers and drives sample emission through them.
///
/// Built by [`HarnessBuilder::build`](crate::HarnessBuilder::build) or
/// [`TelemetryHarness::new`]. Dropping the harness tears the providers down,
/// so an early return or panic between construction and
/// [`shutdown()`](Self::shutdown) still releases them.
#[derive(Debug)]
pub struct TelemetryHarness {
    config: HarnessConfig,
    guard: TelemetryGuard,
}

impl TelemetryHarness {
    /// Validates the configuration and builds every enabled provider.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if validation or any provider
    /// construction fails. Providers already built are shut down first.
    pub fn new(config: HarnessConfig) -> Result<Self, HarnessError> {
        config.validate()?;
        let guard = TelemetryGuard::from_config(&config)?;

        tracing::info!(
            target: "harness_lifecycle",
            service = %config.resource.service_name,
            endpoint = %config.effective_endpoint(),
            protocol = ?config.endpoint.protocol,
            "Telemetry harness initialised"
        );

        Ok(Self { config, guard })
    }

    /// Returns the configuration the harness was built with.
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Returns the provider guard.
    pub fn guard(&self) -> &TelemetryGuard {
        &self.guard
    }

    /// Emits the configured number of sample rounds.
    ///
    /// Never fails: an unreachable collector only shows up as exporter
    /// diagnostics. Without a global subscriber, log records are bridged
    /// straight into the guard's logger provider. When metrics use immediate export, the meter provider is
    /// flushed once the rounds are done.
    pub fn emit(&self) {
        let sample = &self.config.sample;
        let tracer = self.guard.tracer(sample.tracer_name.clone());
        let meter = self.guard.meter(sample.meter_name.clone());
        let logger = self.guard.scoped_logger();

        for round in 0..sample.iterations {
            tracing::debug!(target: "harness_lifecycle", round, "Emitting sample telemetry");
            emit_sample(&tracer, &meter, logger, sample);
        }

        self.guard.flush_immediate_metrics();
    }

    /// Probes the collector if asked to, emits, waits out the flush delay and
    /// shuts down.
    ///
    /// # Errors
    ///
    /// Returns the first shutdown failure. Every provider is still attempted.
    pub fn run(mut self) -> Result<(), HarnessError> {
        probe_collector(&self.config.health_check);

        self.emit();

        let delay = self.config.sample.flush_delay;
        if !delay.is_zero() {
            tracing::info!(target: "harness_lifecycle", delay = ?delay, "Waiting for exporters");
            std::thread::sleep(delay);
        }

        self.shutdown()
    }

    /// Shuts every provider down in reverse acquisition order.
    ///
    /// Calling this more than once is a no-op.
    pub fn shutdown(&mut self) -> Result<(), HarnessError> {
        if !self.guard.is_shut_down() {
            tracing::info!(target: "harness_lifecycle", "Shutting down telemetry harness");
        }
        self.guard.shutdown()
    }
}
