//! Configuration types for the telemetry harness.
//!
//! These types are deserialised with figment, so every field has a default and
//! a file or environment layer only needs to name what it changes. The
//! defaults reproduce the collector smoke test the harness was written for:
//! service `LGTM` exporting HTTP/protobuf to `http://localhost:4318`.

use crate::error::{HarnessError, Signal};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::time::Duration;

/// OTLP export protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// gRPC protocol (default port 4317).
    Grpc,
    /// HTTP with Protocol Buffers encoding (default port 4318).
    #[default]
    #[serde(alias = "http_binary", alias = "http-binary", alias = "http/protobuf")]
    HttpBinary,
    /// HTTP with JSON encoding (default port 4318).
    #[serde(alias = "http_json", alias = "http-json", alias = "http/json")]
    HttpJson,
}

impl Protocol {
    /// Returns the default endpoint for this protocol.
    #[must_use]
    pub fn default_endpoint(&self) -> &'static str {
        match self {
            Protocol::Grpc => "http://localhost:4317",
            Protocol::HttpBinary | Protocol::HttpJson => "http://localhost:4318",
        }
    }

    /// Returns the key figment stores this protocol under.
    #[must_use]
    pub(crate) fn config_key(&self) -> &'static str {
        match self {
            Protocol::Grpc => "grpc",
            Protocol::HttpBinary => "httpbinary",
            Protocol::HttpJson => "httpjson",
        }
    }
}

impl FromStr for Protocol {
    type Err = HarnessError;

    /// Accepts both the `OTEL_EXPORTER_OTLP_PROTOCOL` spellings and the
    /// config-file spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grpc" => Ok(Protocol::Grpc),
            "http/protobuf" | "httpbinary" | "http_binary" | "http-binary" => {
                Ok(Protocol::HttpBinary)
            }
            "http/json" | "httpjson" | "http_json" | "http-json" => Ok(Protocol::HttpJson),
            _ => Err(HarnessError::UnsupportedProtocol {
                protocol: s.to_string(),
            }),
        }
    }
}

/// When telemetry leaves the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportMode {
    /// Buffer in a background processor and export in batches.
    #[default]
    Batched,
    /// Export as soon as the item is complete.
    ///
    /// Metrics have no per-measurement export; for them this means the meter
    /// provider is flushed once, right after the last emission round.
    Immediate,
}

/// Complete harness configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Collector endpoint shared by all signals.
    pub endpoint: EndpointConfig,

    /// Resource attributes attached to every provider.
    pub resource: ResourceConfig,

    /// Traces configuration.
    pub traces: SignalConfig,

    /// Metrics configuration.
    pub metrics: SignalConfig,

    /// Logs configuration.
    pub logs: SignalConfig,

    /// Mirror log records to stdout in addition to the OTLP exporter.
    pub console_mirror: bool,

    /// Whether to install the global tracing subscriber.
    pub init_tracing_subscriber: bool,

    /// Upper bound for each provider's flush-and-shutdown.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// What to emit.
    pub sample: SampleConfig,

    /// Optional collector health probe run before emitting.
    pub health_check: HealthCheckConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            resource: ResourceConfig::default(),
            traces: SignalConfig::default(),
            metrics: SignalConfig::default(),
            logs: SignalConfig::default(),
            console_mirror: false,
            init_tracing_subscriber: true,
            shutdown_timeout: Duration::from_secs(5),
            sample: SampleConfig::default(),
            health_check: HealthCheckConfig::default(),
        }
    }
}

impl HarnessConfig {
    /// Returns the effective base endpoint, using the protocol default if unset.
    #[must_use]
    pub fn effective_endpoint(&self) -> String {
        self.endpoint
            .url
            .clone()
            .unwrap_or_else(|| self.endpoint.protocol.default_endpoint().to_string())
    }

    /// Returns the per-signal configuration.
    #[must_use]
    pub fn signal(&self, signal: Signal) -> &SignalConfig {
        match signal {
            Signal::Traces => &self.traces,
            Signal::Metrics => &self.metrics,
            Signal::Logs => &self.logs,
        }
    }

    /// Returns the endpoint URL a signal exports to.
    ///
    /// A per-signal override is used verbatim. Otherwise HTTP protocols get the
    /// signal path appended to the base URL and gRPC uses the base URL as is.
    #[must_use]
    pub fn signal_endpoint(&self, signal: Signal) -> String {
        if let Some(url) = &self.signal(signal).endpoint {
            return url.clone();
        }

        let base = self.effective_endpoint();
        let base = base.trim_end_matches('/');

        match self.endpoint.protocol {
            Protocol::Grpc => base.to_string(),
            Protocol::HttpBinary | Protocol::HttpJson => {
                format!("{base}{}", signal.otlp_path())
            }
        }
    }

    /// Checks everything that must hold before a provider is built.
    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.resource.service_name.trim().is_empty() {
            return Err(HarnessError::EmptyServiceName);
        }

        if let Some(url) = &self.endpoint.url {
            validate_endpoint(url)?;
        }

        for signal in [Signal::Traces, Signal::Metrics, Signal::Logs] {
            if let Some(url) = &self.signal(signal).endpoint {
                validate_endpoint(url)?;
            }
        }

        Ok(())
    }
}

/// Rejects anything that is not an absolute http(s) URL with a host.
pub fn validate_endpoint(url: &str) -> Result<(), HarnessError> {
    let invalid = || HarnessError::InvalidEndpoint {
        url: url.to_string(),
    };

    let parsed = url::Url::parse(url.trim()).map_err(|_| invalid())?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid());
    }
    match parsed.host_str() {
        Some(host) if !host.is_empty() => Ok(()),
        _ => Err(invalid()),
    }
}

/// Endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// OTLP base URL.
    ///
    /// If not specified, uses the protocol's default:
    /// - gRPC: `http://localhost:4317`
    /// - HTTP: `http://localhost:4318`
    pub url: Option<String>,

    /// Export protocol.
    pub protocol: Protocol,

    /// Request timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Headers sent with every export request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: None,
            protocol: Protocol::default(),
            timeout: Duration::from_secs(10),
            headers: HashMap::new(),
        }
    }
}

/// Resource configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// `service.name`.
    pub service_name: String,

    /// `service.version`.
    pub service_version: Option<String>,

    /// `service.instance.id`. Falls back to the machine host name.
    pub service_instance_id: Option<String>,

    /// Additional resource attributes.
    pub attributes: HashMap<String, String>,

    /// Run the host, OS and process resource detectors.
    pub detect: bool,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            service_name: "LGTM".to_string(),
            service_version: Some("0.1.0".to_string()),
            service_instance_id: None,
            attributes: HashMap::from([("environment".to_string(), "development".to_string())]),
            detect: false,
        }
    }
}

/// Configuration for an individual signal type (traces, metrics, logs).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Whether this signal is enabled.
    pub enabled: bool,

    /// Batched or immediate export.
    pub export_mode: ExportMode,

    /// Full endpoint URL for this signal, overriding the shared base URL.
    pub endpoint: Option<String>,

    /// Batch export configuration.
    pub batch: BatchConfig,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            export_mode: ExportMode::default(),
            endpoint: None,
            batch: BatchConfig::default(),
        }
    }
}

/// Batch exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Maximum queue size.
    pub max_queue_size: usize,

    /// Maximum batch size for export.
    pub max_export_batch_size: usize,

    /// Scheduled delay between exports. Also the metric reader interval.
    #[serde(with = "humantime_serde")]
    pub scheduled_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 2048,
            max_export_batch_size: 512,
            scheduled_delay: Duration::from_secs(5),
        }
    }
}

/// One `counter.add` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterIncrement {
    /// Amount added.
    pub value: u64,

    /// Label set partitioning the running total.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl CounterIncrement {
    /// Creates an increment from `(key, value)` label pairs.
    pub fn new<'a>(value: u64, labels: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            value,
            labels: labels
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

/// What [`emit_sample`](crate::emit_sample) produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleConfig {
    /// Instrumentation scope of the tracer.
    pub tracer_name: String,

    /// Name of the root span.
    pub span_name: String,

    /// Name of the span nested under the root span.
    pub child_span_name: String,

    /// Instrumentation scope of the meter.
    pub meter_name: String,

    /// Name of the monotonic counter.
    pub counter_name: String,

    /// Counter adds, in order.
    pub counter_increments: Vec<CounterIncrement>,

    /// Name of the duration histogram.
    pub histogram_name: String,

    /// Durations in seconds recorded on the histogram.
    pub histogram_values: Vec<f64>,

    /// Plain informational log message.
    pub log_message: String,

    /// Value of the `operation` argument in the structured log record.
    pub operation: String,

    /// Make the nested unit of work fail, closing its span with error status.
    pub simulate_failure: bool,

    /// Number of emission rounds.
    pub iterations: u32,

    /// Pause after emitting so batch processors can export before shutdown.
    #[serde(with = "humantime_serde")]
    pub flush_delay: Duration,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            tracer_name: "TestingSource".to_string(),
            span_name: "SayHello".to_string(),
            child_span_name: "ComposeGreeting".to_string(),
            meter_name: "TestMeter".to_string(),
            counter_name: "TestCounter".to_string(),
            counter_increments: vec![
                CounterIncrement::new(1, [("name", "apple"), ("color", "red")]),
                CounterIncrement::new(2, [("name", "lemon"), ("color", "yellow")]),
                CounterIncrement::new(1, [("name", "lemon"), ("color", "yellow")]),
            ],
            histogram_name: "http_request_duration_seconds".to_string(),
            histogram_values: vec![0.05, 0.3, 1.2],
            log_message: "Hello, World! This is a test log message.".to_string(),
            operation: "TestOperation".to_string(),
            simulate_failure: false,
            iterations: 1,
            flush_delay: Duration::ZERO,
        }
    }
}

/// Collector health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Probe the collector before emitting.
    pub enabled: bool,

    /// Health endpoint of the collector's health_check extension.
    pub url: String,

    /// Request timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "http://localhost:13133".to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}
