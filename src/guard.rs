//! Provider lifecycle management.
//!
//! [`TelemetryGuard`] owns the tracer, meter and logger providers. Providers
//! are acquired in that order and released in the reverse order, either by an
//! explicit [`shutdown()`](TelemetryGuard::shutdown) or when the guard is
//! dropped, so an error or panic during emission still tears everything down.

use crate::config::{ExportMode, HarnessConfig};
use crate::error::{HarnessError, Signal};
use crate::providers::{build_logging_provider, build_metrics_provider, build_tracing_provider};
use crate::resource::resource_from_config;
use opentelemetry::InstrumentationScope;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::error::{OTelSdkError, OTelSdkResult};
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Guard that manages provider lifecycle.
///
/// On drop, flushes pending telemetry and shuts providers down in reverse
/// acquisition order. Use [`shutdown()`](Self::shutdown) for explicit error
/// handling; calling it more than once is a no-op.
pub struct TelemetryGuard {
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
    logger_provider: Option<SdkLoggerProvider>,
    shutdown_timeout: Duration,
    flush_metrics_after_emit: bool,
    global_bridge: bool,
}

impl TelemetryGuard {
    /// Builds every enabled provider from configuration.
    ///
    /// If a provider fails to build, the ones already built are shut down
    /// before the error is returned.
    pub(crate) fn from_config(config: &HarnessConfig) -> Result<Self, HarnessError> {
        let resource = resource_from_config(&config.resource)?;

        let mut guard = Self::from_providers(None, None, None, config.shutdown_timeout);
        guard.flush_metrics_after_emit = config.metrics.export_mode == ExportMode::Immediate;

        let built = guard
            .acquire(config, resource)
            .and_then(|()| guard.install_globals(config));
        if let Err(err) = built {
            guard.release_partial();
            return Err(err);
        }

        tracing::debug!(
            target: "harness_lifecycle",
            traces = guard.tracer_provider.is_some(),
            metrics = guard.meter_provider.is_some(),
            logs = guard.logger_provider.is_some(),
            "Providers initialised"
        );

        Ok(guard)
    }

    /// Builds the enabled providers in order traces, metrics, logs, stopping
    /// at the first failure. Providers built so far stay in the guard.
    fn acquire(&mut self, config: &HarnessConfig, resource: Resource) -> Result<(), HarnessError> {
        if config.traces.enabled {
            self.tracer_provider = Some(build_tracing_provider(resource.clone(), config)?);
        }
        if config.metrics.enabled {
            self.meter_provider = Some(build_metrics_provider(resource.clone(), config)?);
        }
        if config.logs.enabled {
            self.logger_provider = Some(build_logging_provider(resource, config)?);
        }
        Ok(())
    }

    fn install_globals(&mut self, config: &HarnessConfig) -> Result<(), HarnessError> {
        if !config.init_tracing_subscriber {
            return Ok(());
        }

        if let Some(provider) = &self.tracer_provider {
            opentelemetry::global::set_tracer_provider(provider.clone());
        }
        if let Some(provider) = &self.meter_provider {
            opentelemetry::global::set_meter_provider(provider.clone());
        }

        let scope_name = config.sample.tracer_name.clone();
        init_subscriber(&self.tracer_provider, &self.logger_provider, scope_name)?;
        self.global_bridge = self.logger_provider.is_some();
        Ok(())
    }

    /// Shuts down whatever a failed build left behind.
    fn release_partial(&mut self) {
        tracing::debug!(target: "harness_lifecycle", "Releasing providers built before the failure");
        // failures are already logged by shutdown
        let _ = self.shutdown();
    }

    /// Takes ownership of already built providers.
    ///
    /// Useful when providers are wired to custom exporters.
    pub fn from_providers(
        tracer_provider: Option<SdkTracerProvider>,
        meter_provider: Option<SdkMeterProvider>,
        logger_provider: Option<SdkLoggerProvider>,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            tracer_provider,
            meter_provider,
            logger_provider,
            shutdown_timeout,
            flush_metrics_after_emit: false,
            global_bridge: false,
        }
    }

    /// Returns the tracer provider if configured.
    pub fn tracer_provider(&self) -> Option<&SdkTracerProvider> {
        self.tracer_provider.as_ref()
    }

    /// Returns the meter provider if configured.
    pub fn meter_provider(&self) -> Option<&SdkMeterProvider> {
        self.meter_provider.as_ref()
    }

    /// Returns the logger provider if configured.
    pub fn logger_provider(&self) -> Option<&SdkLoggerProvider> {
        self.logger_provider.as_ref()
    }

    /// Returns a tracer for the given instrumentation scope.
    ///
    /// Falls back to a provider without processors when traces are disabled,
    /// so spans are still well formed but go nowhere.
    pub fn tracer(&self, scope: impl Into<String>) -> opentelemetry_sdk::trace::SdkTracer {
        let scope = InstrumentationScope::builder(scope.into()).build();
        match &self.tracer_provider {
            Some(provider) => provider.tracer_with_scope(scope),
            None => SdkTracerProvider::default().tracer_with_scope(scope),
        }
    }

    /// Returns a meter for the given instrumentation scope.
    ///
    /// Falls back to a provider without readers when metrics are disabled.
    pub fn meter(&self, scope: impl Into<String>) -> opentelemetry::metrics::Meter {
        use opentelemetry::metrics::MeterProvider as _;

        let scope = InstrumentationScope::builder(scope.into()).build();
        match &self.meter_provider {
            Some(provider) => provider.meter_with_scope(scope),
            None => SdkMeterProvider::default().meter_with_scope(scope),
        }
    }

    /// Returns the logger provider when no global subscriber feeds it.
    ///
    /// Log records written through `tracing` only reach the logger provider
    /// if a bridge layer is listening. When this guard did not install the
    /// global one, emission has to scope its own bridge to this provider.
    pub fn scoped_logger(&self) -> Option<&SdkLoggerProvider> {
        if self.global_bridge {
            None
        } else {
            self.logger_provider.as_ref()
        }
    }

    /// Flushes all configured providers. Errors are logged but not returned.
    pub fn flush(&self) {
        if let Some(provider) = &self.tracer_provider
            && let Err(e) = provider.force_flush()
        {
            tracing::warn!(target: "harness_lifecycle", error = %e, "Failed to flush tracer provider");
        }

        if let Some(provider) = &self.meter_provider
            && let Err(e) = provider.force_flush()
        {
            tracing::warn!(target: "harness_lifecycle", error = %e, "Failed to flush meter provider");
        }

        if let Some(provider) = &self.logger_provider
            && let Err(e) = provider.force_flush()
        {
            tracing::warn!(target: "harness_lifecycle", error = %e, "Failed to flush logger provider");
        }
    }

    /// Flushes the meter provider if metrics are exported immediately.
    pub(crate) fn flush_immediate_metrics(&self) {
        if !self.flush_metrics_after_emit {
            return;
        }
        if let Some(provider) = &self.meter_provider
            && let Err(e) = provider.force_flush()
        {
            tracing::warn!(target: "harness_lifecycle", error = %e, "Failed to flush meter provider");
        }
    }

    /// Shuts down all providers in reverse acquisition order (logs, metrics,
    /// traces).
    ///
    /// Every provider is attempted even if an earlier one fails; the first
    /// failure is returned. A provider that was already shut down counts as
    /// success, and a second call to this method does nothing.
    pub fn shutdown(&mut self) -> Result<(), HarnessError> {
        let timeout = self.shutdown_timeout;
        let mut first_error = None;

        let results = [
            self.logger_provider
                .take()
                .map(|p| (Signal::Logs, p.shutdown_with_timeout(timeout))),
            self.meter_provider
                .take()
                .map(|p| (Signal::Metrics, p.shutdown_with_timeout(timeout))),
            self.tracer_provider
                .take()
                .map(|p| (Signal::Traces, p.shutdown_with_timeout(timeout))),
        ];

        for (signal, result) in results.into_iter().flatten() {
            if let Err(e) = interpret_shutdown(signal, timeout, result) {
                tracing::error!(target: "harness_lifecycle", signal = %signal, error = %e, "Provider shutdown failed");
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Returns true once every provider has been released.
    pub fn is_shut_down(&self) -> bool {
        self.tracer_provider.is_none()
            && self.meter_provider.is_none()
            && self.logger_provider.is_none()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self.is_shut_down() {
            return;
        }
        // failures are already logged by shutdown
        let _ = self.shutdown();
    }
}

impl std::fmt::Debug for TelemetryGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryGuard")
            .field("traces", &self.tracer_provider.is_some())
            .field("metrics", &self.meter_provider.is_some())
            .field("logs", &self.logger_provider.is_some())
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("global_bridge", &self.global_bridge)
            .finish()
    }
}

fn interpret_shutdown(
    signal: Signal,
    timeout: Duration,
    result: OTelSdkResult,
) -> Result<(), HarnessError> {
    match result {
        Ok(()) => {
            tracing::debug!(target: "harness_lifecycle", signal = %signal, "Provider shut down");
            Ok(())
        }
        Err(OTelSdkError::AlreadyShutdown) => {
            tracing::debug!(target: "harness_lifecycle", signal = %signal, "Provider was already shut down");
            Ok(())
        }
        Err(OTelSdkError::Timeout(_)) => Err(HarnessError::ShutdownTimeout { signal, timeout }),
        Err(source) => Err(HarnessError::Shutdown { signal, source }),
    }
}

/// Keeps exporter transports from feeding their own diagnostics back into
/// the log pipeline. Lifecycle events stay console-only: some are written
/// while or after the logger provider shuts down.
pub(crate) fn bridge_filter() -> EnvFilter {
    [
        "hyper=off",
        "h2=off",
        "tonic=off",
        "reqwest=off",
        "opentelemetry=off",
        "harness_lifecycle=off",
    ]
    .into_iter()
    .filter_map(|directive| directive.parse().ok())
    .fold(EnvFilter::new("info"), EnvFilter::add_directive)
}

fn init_subscriber(
    tracer_provider: &Option<SdkTracerProvider>,
    logger_provider: &Option<SdkLoggerProvider>,
    scope_name: String,
) -> Result<(), HarnessError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .without_time();

    let telemetry_layer = tracer_provider.as_ref().map(|tp| {
        let tracer = tp.tracer(scope_name);
        tracing_opentelemetry::layer().with_tracer(tracer)
    });

    let log_layer = logger_provider
        .as_ref()
        .map(|lp| OpenTelemetryTracingBridge::new(lp).with_filter(bridge_filter()));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(telemetry_layer)
        .with(log_layer)
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::Tracer;
    use opentelemetry_sdk::trace::InMemorySpanExporter;

    fn guard_with_in_memory_tracer() -> (TelemetryGuard, InMemorySpanExporter) {
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        let guard = TelemetryGuard::from_providers(
            Some(provider),
            Some(SdkMeterProvider::default()),
            Some(SdkLoggerProvider::builder().build()),
            Duration::from_secs(1),
        );
        (guard, exporter)
    }

    #[test]
    fn shutdown_releases_every_provider() {
        let (mut guard, _) = guard_with_in_memory_tracer();
        assert!(!guard.is_shut_down());

        let _ = guard.shutdown();

        assert!(guard.is_shut_down());
        assert!(guard.tracer_provider().is_none());
        assert!(guard.meter_provider().is_none());
        assert!(guard.logger_provider().is_none());
    }

    #[test]
    fn second_shutdown_is_a_no_op() {
        let (mut guard, _) = guard_with_in_memory_tracer();
        let _ = guard.shutdown();
        assert!(guard.shutdown().is_ok());
    }

    #[test]
    fn provider_shut_down_elsewhere_counts_as_success() {
        let provider = SdkTracerProvider::builder().build();
        provider.shutdown().unwrap();

        let mut guard =
            TelemetryGuard::from_providers(Some(provider), None, None, Duration::from_secs(1));
        assert!(guard.shutdown().is_ok());
    }

    #[test]
    fn drop_flushes_spans() {
        let (guard, exporter) = guard_with_in_memory_tracer();
        guard.tracer("drop-test").in_span("dropped", |_| {});
        drop(guard);

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 1);
    }

    #[test]
    fn tracer_without_provider_still_works() {
        let guard = TelemetryGuard::from_providers(None, None, None, Duration::from_secs(1));
        guard.tracer("noop").in_span("ignored", |_| {});
        guard.meter("noop").u64_counter("ignored").build().add(1, &[]);
        assert!(guard.is_shut_down());
    }

    #[test]
    fn interpret_shutdown_maps_timeout() {
        let err = interpret_shutdown(
            Signal::Metrics,
            Duration::from_secs(2),
            Err(OTelSdkError::Timeout(Duration::from_secs(2))),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            HarnessError::ShutdownTimeout {
                signal: Signal::Metrics,
                ..
            }
        ));
    }

    #[test]
    fn interpret_shutdown_maps_internal_failure() {
        let err = interpret_shutdown(
            Signal::Logs,
            Duration::from_secs(2),
            Err(OTelSdkError::InternalFailure("boom".to_string())),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Shutdown {
                signal: Signal::Logs,
                ..
            }
        ));
    }

    #[test]
    fn interpret_shutdown_accepts_already_shutdown() {
        assert!(
            interpret_shutdown(
                Signal::Traces,
                Duration::from_secs(1),
                Err(OTelSdkError::AlreadyShutdown)
            )
            .is_ok()
        );
    }

    #[test]
    fn from_config_rejects_malformed_endpoint() {
        let mut config = HarnessConfig::default();
        config.init_tracing_subscriber = false;
        config.logs.endpoint = Some("::".to_string());

        let err = TelemetryGuard::from_config(&config).unwrap_err();
        assert!(matches!(err, HarnessError::InvalidEndpoint { .. }));
    }

    #[test]
    fn failed_build_releases_providers_built_before_it() {
        let mut config = HarnessConfig::default();
        config.init_tracing_subscriber = false;
        config.endpoint.url = Some("http://127.0.0.1:9".to_string());
        config.endpoint.timeout = Duration::from_millis(500);
        config.logs.endpoint = Some("::".to_string());

        let mut guard = TelemetryGuard::from_providers(None, None, None, Duration::from_secs(2));
        let resource = resource_from_config(&config.resource).unwrap();

        let err = guard.acquire(&config, resource).unwrap_err();
        assert!(matches!(err, HarnessError::InvalidEndpoint { ref url } if url == "::"));
        assert!(guard.logger_provider().is_none());

        let tracer_provider = guard.tracer_provider().cloned().unwrap();
        let meter_provider = guard.meter_provider().cloned().unwrap();

        guard.release_partial();

        assert!(guard.is_shut_down());
        assert!(matches!(
            tracer_provider.shutdown(),
            Err(OTelSdkError::AlreadyShutdown)
        ));
        assert!(matches!(
            meter_provider.shutdown(),
            Err(OTelSdkError::AlreadyShutdown)
        ));
    }

    #[derive(Debug)]
    struct RefusingLogProcessor;

    impl opentelemetry_sdk::logs::LogProcessor for RefusingLogProcessor {
        fn emit(
            &self,
            _data: &mut opentelemetry_sdk::logs::SdkLogRecord,
            _instrumentation: &InstrumentationScope,
        ) {
        }

        fn force_flush(&self) -> OTelSdkResult {
            Ok(())
        }

        fn shutdown_with_timeout(&self, _timeout: Duration) -> OTelSdkResult {
            Err(OTelSdkError::InternalFailure("refused".to_string()))
        }

        fn shutdown(&self) -> OTelSdkResult {
            Err(OTelSdkError::InternalFailure("refused".to_string()))
        }
    }

    #[test]
    fn failing_provider_does_not_stop_the_others() {
        let tracer_provider = SdkTracerProvider::builder()
            .with_simple_exporter(InMemorySpanExporter::default())
            .build();
        let meter_provider = SdkMeterProvider::default();
        let logger_provider = SdkLoggerProvider::builder()
            .with_log_processor(RefusingLogProcessor)
            .build();

        let mut guard = TelemetryGuard::from_providers(
            Some(tracer_provider.clone()),
            Some(meter_provider.clone()),
            Some(logger_provider),
            Duration::from_secs(1),
        );

        // logs go first and fail; metrics and traces are still released
        let err = guard.shutdown().unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Shutdown {
                signal: Signal::Logs,
                ..
            }
        ));
        assert!(guard.is_shut_down());
        assert!(matches!(
            meter_provider.shutdown(),
            Err(OTelSdkError::AlreadyShutdown)
        ));
        assert!(matches!(
            tracer_provider.shutdown(),
            Err(OTelSdkError::AlreadyShutdown)
        ));
    }

    #[test]
    fn bridge_filter_keeps_lifecycle_events_out_of_logs() {
        use opentelemetry_sdk::logs::InMemoryLogExporter;

        let exporter = InMemoryLogExporter::default();
        let provider = SdkLoggerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        let subscriber = tracing_subscriber::registry()
            .with(OpenTelemetryTracingBridge::new(&provider).with_filter(bridge_filter()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "harness_lifecycle", "Telemetry harness shut down");
            tracing::info!(target: "reqwest::connect", "connecting");
            tracing::info!("kept");
        });

        let logs = exporter.get_emitted_logs().unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(
            logs[0].record.body(),
            Some(&opentelemetry::logs::AnyValue::from("kept"))
        );
    }

    #[test]
    fn scoped_logger_is_offered_without_global_bridge() {
        let guard = TelemetryGuard::from_providers(
            None,
            None,
            Some(SdkLoggerProvider::builder().build()),
            Duration::from_secs(1),
        );
        assert!(guard.scoped_logger().is_some());

        let mut guard = guard;
        guard.global_bridge = true;
        assert!(guard.scoped_logger().is_none());
    }
}
