//! Provider construction.
//!
//! Each `build_*_provider` function creates the OTLP exporter for its signal
//! and wires it into a provider carrying the shared resource. The
//! `*_with_exporter` variants take any SDK exporter, which is how custom sinks
//! (and the in-memory exporters used in tests) plug into the same pipeline.

use crate::config::{ExportMode, HarnessConfig, Protocol, SignalConfig, validate_endpoint};
use crate::error::{HarnessError, Signal};
use opentelemetry_otlp::{WithExportConfig, WithHttpConfig, WithTonicConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::{
    BatchConfigBuilder as LogBatchConfigBuilder, BatchLogProcessor, LogExporter,
    SdkLoggerProvider,
};
use opentelemetry_sdk::metrics::exporter::PushMetricExporter;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::{
    BatchConfigBuilder as TraceBatchConfigBuilder, BatchSpanProcessor, SdkTracerProvider,
    SpanExporter,
};
use std::collections::HashMap;
use tonic::metadata::{MetadataKey, MetadataMap, MetadataValue};

fn build_tonic_metadata(headers: &HashMap<String, String>) -> MetadataMap {
    let mut metadata = MetadataMap::new();
    for (key, value) in headers {
        if let (Ok(k), Ok(v)) = (
            key.parse::<MetadataKey<_>>(),
            value.parse::<MetadataValue<_>>(),
        ) {
            metadata.insert(k, v);
        }
    }
    metadata
}

fn otlp_http_protocol(protocol: Protocol) -> opentelemetry_otlp::Protocol {
    match protocol {
        Protocol::HttpJson => opentelemetry_otlp::Protocol::HttpJson,
        Protocol::HttpBinary | Protocol::Grpc => opentelemetry_otlp::Protocol::HttpBinary,
    }
}

macro_rules! build_exporter {
    ($config:expr, $exporter_type:ident, $signal:expr, $error_variant:ident) => {{
        let endpoint = $config.signal_endpoint($signal);
        validate_endpoint(&endpoint)?;

        match $config.endpoint.protocol {
            Protocol::Grpc => {
                let mut builder = opentelemetry_otlp::$exporter_type::builder()
                    .with_tonic()
                    .with_endpoint(&endpoint)
                    .with_timeout($config.endpoint.timeout);

                if !$config.endpoint.headers.is_empty() {
                    builder =
                        builder.with_metadata(build_tonic_metadata(&$config.endpoint.headers));
                }

                builder.build().map_err(HarnessError::$error_variant)?
            }
            protocol @ (Protocol::HttpBinary | Protocol::HttpJson) => {
                let mut builder = opentelemetry_otlp::$exporter_type::builder()
                    .with_http()
                    .with_endpoint(&endpoint)
                    .with_timeout($config.endpoint.timeout)
                    .with_protocol(otlp_http_protocol(protocol));

                if !$config.endpoint.headers.is_empty() {
                    builder = builder.with_headers($config.endpoint.headers.clone());
                }

                builder.build().map_err(HarnessError::$error_variant)?
            }
        }
    }};
}

/// Builds a tracer provider exporting spans over OTLP.
///
/// # Errors
///
/// Returns [`HarnessError::InvalidEndpoint`] for a malformed traces endpoint
/// and [`HarnessError::TraceExporter`] if the exporter cannot be created.
/// Nothing is left running on error.
pub fn build_tracing_provider(
    resource: Resource,
    config: &HarnessConfig,
) -> Result<SdkTracerProvider, HarnessError> {
    let exporter = build_exporter!(config, SpanExporter, Signal::Traces, TraceExporter);
    Ok(tracer_provider_with_exporter(
        exporter,
        &config.traces,
        resource,
    ))
}

/// Builds a meter provider exporting metrics over OTLP.
///
/// # Errors
///
/// Returns [`HarnessError::InvalidEndpoint`] for a malformed metrics endpoint
/// and [`HarnessError::MetricExporter`] if the exporter cannot be created.
pub fn build_metrics_provider(
    resource: Resource,
    config: &HarnessConfig,
) -> Result<SdkMeterProvider, HarnessError> {
    let exporter = build_exporter!(config, MetricExporter, Signal::Metrics, MetricExporter);
    Ok(meter_provider_with_exporter(
        exporter,
        &config.metrics,
        resource,
    ))
}

/// Builds a logger provider exporting log records over OTLP, optionally
/// mirroring every record to stdout.
///
/// # Errors
///
/// Returns [`HarnessError::InvalidEndpoint`] for a malformed logs endpoint
/// and [`HarnessError::LogExporter`] if the exporter cannot be created.
pub fn build_logging_provider(
    resource: Resource,
    config: &HarnessConfig,
) -> Result<SdkLoggerProvider, HarnessError> {
    let exporter = build_exporter!(config, LogExporter, Signal::Logs, LogExporter);
    Ok(logger_provider_with_exporter(
        exporter,
        &config.logs,
        config.console_mirror,
        resource,
    ))
}

/// Wires a span exporter into a tracer provider according to the signal's
/// export mode.
pub fn tracer_provider_with_exporter<E>(
    exporter: E,
    signal: &SignalConfig,
    resource: Resource,
) -> SdkTracerProvider
where
    E: SpanExporter + 'static,
{
    let builder = SdkTracerProvider::builder().with_resource(resource);

    match signal.export_mode {
        ExportMode::Batched => {
            let batch_config = TraceBatchConfigBuilder::default()
                .with_max_queue_size(signal.batch.max_queue_size)
                .with_max_export_batch_size(signal.batch.max_export_batch_size)
                .with_scheduled_delay(signal.batch.scheduled_delay)
                .build();

            let span_processor = BatchSpanProcessor::builder(exporter)
                .with_batch_config(batch_config)
                .build();

            builder.with_span_processor(span_processor).build()
        }
        ExportMode::Immediate => builder.with_simple_exporter(exporter).build(),
    }
}

/// Wires a metric exporter into a meter provider through a periodic reader.
///
/// The reader interval is the signal's scheduled delay in both export modes;
/// immediate mode is completed by flushing after each emission round.
pub fn meter_provider_with_exporter<E>(
    exporter: E,
    signal: &SignalConfig,
    resource: Resource,
) -> SdkMeterProvider
where
    E: PushMetricExporter,
{
    let reader = PeriodicReader::builder(exporter)
        .with_interval(signal.batch.scheduled_delay)
        .build();

    SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build()
}

/// Wires a log exporter into a logger provider according to the signal's
/// export mode.
pub fn logger_provider_with_exporter<E>(
    exporter: E,
    signal: &SignalConfig,
    console_mirror: bool,
    resource: Resource,
) -> SdkLoggerProvider
where
    E: LogExporter + 'static,
{
    let mut builder = SdkLoggerProvider::builder().with_resource(resource);

    builder = match signal.export_mode {
        ExportMode::Batched => {
            let batch_config = LogBatchConfigBuilder::default()
                .with_max_queue_size(signal.batch.max_queue_size)
                .with_max_export_batch_size(signal.batch.max_export_batch_size)
                .with_scheduled_delay(signal.batch.scheduled_delay)
                .build();

            let log_processor = BatchLogProcessor::builder(exporter)
                .with_batch_config(batch_config)
                .build();

            builder.with_log_processor(log_processor)
        }
        ExportMode::Immediate => builder.with_simple_exporter(exporter),
    };

    if console_mirror {
        builder = builder.with_simple_exporter(opentelemetry_stdout::LogExporter::default());
    }

    builder.build()
}
