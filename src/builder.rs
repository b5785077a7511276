//! Builder for harness configuration.
//!
//! The builder supports layered configuration from multiple sources:
//! 1. Compiled defaults (the `LGTM` smoke-test plan)
//! 2. Configuration files (TOML)
//! 3. Environment variables, harness-prefixed or standard `OTEL_*`
//! 4. Programmatic overrides
//!
//! Sources are merged in order, with later sources taking precedence.

use crate::config::{ExportMode, HarnessConfig, Protocol, SampleConfig};
use crate::error::{HarnessError, Signal};
use crate::harness::TelemetryHarness;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Builder for configuring a [`TelemetryHarness`].
///
/// # Example
///
/// ```no_run
/// use telemetry_harness::{HarnessBuilder, HarnessError};
///
/// fn main() -> Result<(), HarnessError> {
///     // Defaults: service LGTM, HTTP/protobuf to localhost:4318
///     HarnessBuilder::new().build()?.run()?;
///
///     // Full configuration
///     let harness = HarnessBuilder::new()
///         .with_file("telemetry-harness.toml")
///         .with_env("HARNESS_")
///         .with_standard_env()
///         .endpoint("http://collector:4318")
///         .service_name("checkout-smoke")
///         .build()?;
///     harness.run()
/// }
/// ```
#[must_use = "builders do nothing unless .build() is called"]
pub struct HarnessBuilder {
    figment: Figment,
    resource_attributes: HashMap<String, String>,
    unsupported_protocol: Option<String>,
}

impl HarnessBuilder {
    /// Creates a new builder with default configuration.
    ///
    /// Defaults include:
    /// - Protocol: HTTP with protobuf encoding
    /// - Endpoint: `http://localhost:4318` (or 4317 for gRPC)
    /// - All signals enabled and batched
    /// - Tracing subscriber initialisation enabled
    pub fn new() -> Self {
        Self::from_figment(Figment::from(Serialized::defaults(HarnessConfig::default())))
    }

    /// Creates a builder from an existing figment.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use figment::{Figment, providers::{Format, Serialized, Toml}};
    /// use telemetry_harness::{HarnessBuilder, HarnessConfig, HarnessError};
    ///
    /// let figment = Figment::from(Serialized::defaults(HarnessConfig::default()))
    ///     .merge(Toml::file("/etc/harness/defaults.toml"));
    ///
    /// let harness = HarnessBuilder::from_figment(figment)
    ///     .service_name("nightly-smoke")
    ///     .build()?;
    /// # Ok::<(), HarnessError>(())
    /// ```
    pub fn from_figment(figment: Figment) -> Self {
        Self {
            figment,
            resource_attributes: HashMap::new(),
            unsupported_protocol: None,
        }
    }

    /// Merges configuration from a TOML file.
    ///
    /// If the file doesn't exist, it's silently skipped.
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            self.figment = self.figment.merge(Toml::file(path));
        }
        self
    }

    /// Merges configuration from environment variables with the given prefix.
    ///
    /// Nesting is separated by a double underscore, so field names keep their
    /// own underscores. With prefix `HARNESS_`:
    /// - `HARNESS_ENDPOINT__URL` → `endpoint.url`
    /// - `HARNESS_RESOURCE__SERVICE_NAME` → `resource.service_name`
    /// - `HARNESS_TRACES__EXPORT_MODE` → `traces.export_mode`
    /// - `HARNESS_SAMPLE__ITERATIONS` → `sample.iterations`
    pub fn with_env(mut self, prefix: &str) -> Self {
        self.figment = self.figment.merge(Env::prefixed(prefix).split("__"));
        self
    }

    /// Merges configuration from standard OpenTelemetry environment variables.
    ///
    /// - `OTEL_EXPORTER_OTLP_ENDPOINT` → endpoint URL
    /// - `OTEL_EXPORTER_OTLP_{TRACES,METRICS,LOGS}_ENDPOINT` → per-signal URL
    /// - `OTEL_EXPORTER_OTLP_PROTOCOL` → protocol (grpc, http/protobuf, http/json)
    /// - `OTEL_EXPORTER_OTLP_HEADERS` → `key=value` pairs, comma separated
    /// - `OTEL_EXPORTER_OTLP_TIMEOUT` → request timeout in milliseconds
    /// - `OTEL_SERVICE_NAME` → service name
    /// - `OTEL_RESOURCE_ATTRIBUTES` → `key=value` pairs, comma separated
    /// - `OTEL_{TRACES,METRICS,LOGS}_EXPORTER` → `none` disables the signal
    ///
    /// An unrecognised protocol is reported by [`build()`](Self::build) as
    /// [`HarnessError::UnsupportedProtocol`].
    pub fn with_standard_env(mut self) -> Self {
        if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            self.figment = self
                .figment
                .merge(Serialized::default("endpoint.url", endpoint));
        }

        for signal in [Signal::Traces, Signal::Metrics, Signal::Logs] {
            let name = signal.as_str();
            let var = format!("OTEL_EXPORTER_OTLP_{}_ENDPOINT", name.to_ascii_uppercase());
            if let Ok(endpoint) = std::env::var(&var) {
                self.figment = self
                    .figment
                    .merge(Serialized::default(&format!("{name}.endpoint"), endpoint));
            }

            let var = format!("OTEL_{}_EXPORTER", name.to_ascii_uppercase());
            if let Ok(exporter) = std::env::var(&var) {
                let enabled = exporter.trim() != "none";
                self.figment = self
                    .figment
                    .merge(Serialized::default(&format!("{name}.enabled"), enabled));
            }
        }

        if let Ok(protocol) = std::env::var("OTEL_EXPORTER_OTLP_PROTOCOL") {
            match Protocol::from_str(&protocol) {
                Ok(protocol) => self = self.protocol(protocol),
                Err(_) => self.unsupported_protocol = Some(protocol),
            }
        }

        if let Ok(headers) = std::env::var("OTEL_EXPORTER_OTLP_HEADERS") {
            for (key, value) in parse_key_value_list(&headers) {
                self = self.header(key, value);
            }
        }

        if let Ok(timeout) = std::env::var("OTEL_EXPORTER_OTLP_TIMEOUT") {
            match timeout.trim().parse::<u64>() {
                Ok(millis) => {
                    self.figment = self.figment.merge(Serialized::default(
                        "endpoint.timeout",
                        humantime_serde::Serde::from(Duration::from_millis(millis)),
                    ));
                }
                Err(_) => {
                    tracing::warn!(target: "harness_lifecycle", value = %timeout, "Ignoring non-numeric OTEL_EXPORTER_OTLP_TIMEOUT");
                }
            }
        }

        if let Ok(service_name) = std::env::var("OTEL_SERVICE_NAME") {
            self.figment = self
                .figment
                .merge(Serialized::default("resource.service_name", service_name));
        }

        if let Ok(attributes) = std::env::var("OTEL_RESOURCE_ATTRIBUTES") {
            self.resource_attributes
                .extend(parse_key_value_list(&attributes));
        }

        self
    }

    /// Sets the OTLP base endpoint URL.
    ///
    /// For HTTP protocols, signal-specific paths (`/v1/traces`, `/v1/metrics`,
    /// `/v1/logs`) are appended automatically.
    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("endpoint.url", url.into()));
        self
    }

    /// Sets a full endpoint URL for one signal, used verbatim.
    pub fn signal_endpoint(mut self, signal: Signal, url: impl Into<String>) -> Self {
        let key = format!("{}.endpoint", signal.as_str());
        self.figment = self.figment.merge(Serialized::default(&key, url.into()));
        self
    }

    /// Sets the export protocol.
    ///
    /// An explicit protocol also clears any unsupported value picked up from
    /// `OTEL_EXPORTER_OTLP_PROTOCOL`.
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.unsupported_protocol = None;
        self.figment = self
            .figment
            .merge(Serialized::default("endpoint.protocol", protocol.config_key()));
        self
    }

    /// Sets the export request timeout.
    pub fn export_timeout(mut self, timeout: Duration) -> Self {
        self.figment = self.figment.merge(Serialized::default(
            "endpoint.timeout",
            humantime_serde::Serde::from(timeout),
        ));
        self
    }

    /// Sets the service name resource attribute.
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("resource.service_name", name.into()));
        self
    }

    /// Sets the service version resource attribute.
    pub fn service_version(mut self, version: impl Into<String>) -> Self {
        self.figment = self.figment.merge(Serialized::default(
            "resource.service_version",
            version.into(),
        ));
        self
    }

    /// Sets the service instance id. Defaults to the machine host name.
    pub fn service_instance_id(mut self, id: impl Into<String>) -> Self {
        self.figment = self.figment.merge(Serialized::default(
            "resource.service_instance_id",
            id.into(),
        ));
        self
    }

    /// Adds a resource attribute.
    ///
    /// Kept outside figment so dotted keys such as `deployment.environment`
    /// are not split into nested tables.
    pub fn resource_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.resource_attributes.insert(key.into(), value.into());
        self
    }

    /// Runs the host, OS and process resource detectors.
    pub fn detect_resource(mut self, detect: bool) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("resource.detect", detect));
        self
    }

    /// Enables or disables trace collection.
    ///
    /// Default: enabled
    pub fn traces(mut self, enabled: bool) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("traces.enabled", enabled));
        self
    }

    /// Enables or disables metrics collection.
    ///
    /// Default: enabled
    pub fn metrics(mut self, enabled: bool) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("metrics.enabled", enabled));
        self
    }

    /// Enables or disables log collection.
    ///
    /// Default: enabled
    pub fn logs(mut self, enabled: bool) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("logs.enabled", enabled));
        self
    }

    /// Sets the export mode of one signal.
    pub fn export_mode(mut self, signal: Signal, mode: ExportMode) -> Self {
        let key = format!("{}.export_mode", signal.as_str());
        self.figment = self.figment.merge(Serialized::default(&key, mode));
        self
    }

    /// Sets the export mode of every signal.
    pub fn export_mode_all(self, mode: ExportMode) -> Self {
        [Signal::Traces, Signal::Metrics, Signal::Logs]
            .into_iter()
            .fold(self, |builder, signal| builder.export_mode(signal, mode))
    }

    /// Adds an HTTP header (or gRPC metadata entry) to all export requests.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let header_key = format!("endpoint.headers.{}", key.into());
        self.figment = self
            .figment
            .merge(Serialized::default(&header_key, value.into()));
        self
    }

    /// Mirrors every log record to stdout as well as the collector.
    pub fn console_mirror(mut self, enabled: bool) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("console_mirror", enabled));
        self
    }

    /// Disables automatic tracing subscriber initialisation.
    ///
    /// By default the harness installs a `tracing-subscriber` with
    /// `tracing-opentelemetry` and `opentelemetry-appender-tracing` layers and
    /// registers the providers globally. Disable this when the process
    /// configures its own subscriber, or runs several harnesses.
    pub fn without_tracing_subscriber(mut self) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("init_tracing_subscriber", false));
        self
    }

    /// Sets the upper bound for each provider's flush-and-shutdown.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.figment = self.figment.merge(Serialized::default(
            "shutdown_timeout",
            humantime_serde::Serde::from(timeout),
        ));
        self
    }

    /// Replaces the emission plan.
    pub fn sample(mut self, sample: SampleConfig) -> Self {
        self.figment = self.figment.merge(Serialized::default("sample", sample));
        self
    }

    /// Sets the number of emission rounds.
    pub fn iterations(mut self, iterations: u32) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("sample.iterations", iterations));
        self
    }

    /// Makes the nested unit of work fail on every round.
    pub fn simulate_failure(mut self, fail: bool) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("sample.simulate_failure", fail));
        self
    }

    /// Sets the pause between emitting and shutting down.
    pub fn flush_delay(mut self, delay: Duration) -> Self {
        self.figment = self.figment.merge(Serialized::default(
            "sample.flush_delay",
            humantime_serde::Serde::from(delay),
        ));
        self
    }

    /// Probes the collector health endpoint before emitting.
    pub fn health_check(mut self, url: impl Into<String>) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("health_check.enabled", true))
            .merge(Serialized::default("health_check.url", url.into()));
        self
    }

    /// Extracts the configuration for inspection or debugging.
    ///
    /// # Errors
    ///
    /// Returns an error if extraction fails, the protocol is unsupported, or
    /// validation rejects the result.
    pub fn extract_config(&self) -> Result<HarnessConfig, HarnessError> {
        if let Some(protocol) = &self.unsupported_protocol {
            return Err(HarnessError::UnsupportedProtocol {
                protocol: protocol.clone(),
            });
        }

        let mut config: HarnessConfig = self
            .figment
            .extract()
            .map_err(|e| HarnessError::Config(Box::new(e)))?;

        // Merge resource attributes that couldn't go through figment
        config
            .resource
            .attributes
            .extend(self.resource_attributes.clone());

        config.validate()?;
        Ok(config)
    }

    /// Builds the harness: resource first, then traces, metrics and logs
    /// providers in that order.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration extraction or validation fails
    /// - An exporter cannot be created
    /// - Tracing subscriber initialisation fails
    ///
    /// Providers built before the failure are shut down.
    ///
    /// The global subscriber can be installed once per process. A second
    /// harness built with the default settings fails with
    /// [`HarnessError::TracingSubscriber`], which
    /// [`is_configuration_error`](HarnessError::is_configuration_error)
    /// does not count as a configuration error. Build every harness after
    /// the first with [`without_tracing_subscriber`](Self::without_tracing_subscriber).
    pub fn build(self) -> Result<TelemetryHarness, HarnessError> {
        let config = self.extract_config()?;
        TelemetryHarness::new(config)
    }
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses `key=value,key2=value2`, skipping malformed entries.
fn parse_key_value_list(input: &str) -> impl Iterator<Item = (String, String)> + '_ {
    input.split(',').filter_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        let key = key.trim();
        if key.is_empty() {
            return None;
        }
        Some((key.to_string(), value.trim().to_string()))
    })
}
