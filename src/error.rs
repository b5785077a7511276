//! Error types for harness configuration, provider construction and shutdown.

use figment::Error as FigmentError;
use std::time::Duration;

/// Telemetry signal a provider handles. Used to label lifecycle errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Spans.
    Traces,
    /// Counters and histograms.
    Metrics,
    /// Log records.
    Logs,
}

impl Signal {
    /// Returns the signal name as used in OTLP paths and log fields.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Traces => "traces",
            Signal::Metrics => "metrics",
            Signal::Logs => "logs",
        }
    }

    /// Returns the OTLP/HTTP path for this signal.
    #[must_use]
    pub fn otlp_path(&self) -> &'static str {
        match self {
            Signal::Traces => "/v1/traces",
            Signal::Metrics => "/v1/metrics",
            Signal::Logs => "/v1/logs",
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from harness setup and teardown.
///
/// Emission never produces an error: export failures stay inside the
/// exporters. Only construction and shutdown are reportable.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum HarnessError {
    /// Failed to extract configuration from sources.
    #[error("configuration error: {0}")]
    Config(#[source] Box<FigmentError>),

    /// Endpoint URL is empty, unparsable, or not http(s).
    #[error("invalid endpoint URL: {url:?} (must be an absolute http:// or https:// URL)")]
    InvalidEndpoint {
        /// The invalid URL that was provided.
        url: String,
    },

    /// Protocol selector is not one the exporters understand.
    #[error("unsupported export protocol: {protocol:?}")]
    UnsupportedProtocol {
        /// The protocol string that was provided.
        protocol: String,
    },

    /// Service name is empty.
    #[error("service name must not be empty")]
    EmptyServiceName,

    /// Failed to create trace exporter.
    #[error("failed to create trace exporter")]
    TraceExporter(#[source] opentelemetry_otlp::ExporterBuildError),

    /// Failed to create metric exporter.
    #[error("failed to create metric exporter")]
    MetricExporter(#[source] opentelemetry_otlp::ExporterBuildError),

    /// Failed to create log exporter.
    #[error("failed to create log exporter")]
    LogExporter(#[source] opentelemetry_otlp::ExporterBuildError),

    /// Failed to start the async runtime the gRPC transport runs on.
    #[error("failed to start async runtime")]
    Runtime(#[source] std::io::Error),

    /// Failed to initialise tracing subscriber.
    ///
    /// A process holds one global subscriber, so this is what a second
    /// subscriber-installing harness gets.
    #[error("failed to initialise tracing subscriber")]
    TracingSubscriber(#[from] tracing_subscriber::util::TryInitError),

    /// A provider did not finish flushing within the shutdown timeout.
    #[error("{signal} provider shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Signal whose provider timed out.
        signal: Signal,
        /// The bound that was exceeded.
        timeout: Duration,
    },

    /// A provider failed to shut down.
    #[error("failed to shut down {signal} provider")]
    Shutdown {
        /// Signal whose provider failed.
        signal: Signal,
        /// Underlying SDK error.
        #[source]
        source: opentelemetry_sdk::error::OTelSdkError,
    },
}

impl HarnessError {
    /// Returns true for errors caused by the configuration itself.
    ///
    /// Shutdown failures and an already installed global subscriber are
    /// not: the same configuration succeeds in a fresh process.
    #[must_use]
    pub fn is_configuration_error(&self) -> bool {
        !matches!(
            self,
            HarnessError::ShutdownTimeout { .. }
                | HarnessError::Shutdown { .. }
                | HarnessError::TracingSubscriber(_)
        )
    }
}
