//! Sample telemetry emission.
//!
//! [`emit_sample`] produces one round of spans, metric measurements and log
//! records. Spans use the OpenTelemetry tracer API so that nesting, tags and
//! status are explicit; log records go through `tracing` and reach the logger
//! provider via an appender bridge, either the global one or one scoped to
//! the call.

use crate::config::SampleConfig;
use crate::guard::bridge_filter;
use opentelemetry::metrics::Meter;
use opentelemetry::trace::{Status, TraceContextExt, Tracer};
use opentelemetry::{Array, KeyValue, Value};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;

const SLOW_REQUEST_SECONDS: f64 = 1.0;

/// Error raised by the nested unit of work when a failure is simulated.
#[derive(Debug, thiserror::Error)]
#[error("greeting composition failed for {operation}")]
pub struct SampleFailure {
    operation: String,
}

/// Emits one round of sample telemetry.
///
/// - a root span with a nested child span, tagged and closed with a status;
/// - one counter add per configured increment, and histogram records;
/// - log records at several severities, one carrying a structured argument;
///   durations above one second are logged as warnings.
///
/// With `logger` set, log records are bridged into that provider for the
/// duration of the call, replacing the thread's subscriber. With `None` they
/// go to whatever subscriber is current, normally the global one installed
/// by [`TelemetryGuard`](crate::TelemetryGuard).
///
/// Spans are scoped: each one ends when its closure returns, including when
/// the nested work fails or panics. Nothing here blocks on export or returns
/// an error; an unreachable collector only affects what the exporters do in
/// the background.
pub fn emit_sample<T>(
    tracer: &T,
    meter: &Meter,
    logger: Option<&SdkLoggerProvider>,
    sample: &SampleConfig,
) where
    T: Tracer,
    T::Span: Send + Sync + 'static,
{
    match logger {
        Some(provider) => {
            let subscriber = tracing_subscriber::registry()
                .with(OpenTelemetryTracingBridge::new(provider).with_filter(bridge_filter()));
            tracing::subscriber::with_default(subscriber, || emit_round(tracer, meter, sample));
        }
        None => emit_round(tracer, meter, sample),
    }
}

fn emit_round<T>(tracer: &T, meter: &Meter, sample: &SampleConfig)
where
    T: Tracer,
    T::Span: Send + Sync + 'static,
{
    let counter = meter
        .u64_counter(sample.counter_name.clone())
        .with_description("Sample counter partitioned by fruit and colour")
        .build();
    let histogram = meter
        .f64_histogram(sample.histogram_name.clone())
        .with_description("Sample request durations")
        .with_unit("s")
        .build();

    tracer.in_span(sample.span_name.clone(), |cx| {
        let span = cx.span();
        span.set_attribute(KeyValue::new("foo", 1_i64));
        span.set_attribute(KeyValue::new("bar", "Hello, World!"));
        span.set_attribute(KeyValue::new(
            "baz",
            Value::Array(Array::I64(vec![1, 2, 3])),
        ));

        tracing::info!("{}", sample.log_message);
        tracing::info!(operation = %sample.operation, "context: {}", sample.operation);

        let outcome = tracer.in_span(sample.child_span_name.clone(), |cx| {
            let child = cx.span();
            child.set_attribute(KeyValue::new("operation", sample.operation.clone()));

            match compose_greeting(&sample.operation, sample.simulate_failure) {
                Ok(greeting) => {
                    tracing::debug!(greeting = %greeting, "Composed greeting");
                    child.set_status(Status::Ok);
                    Ok(())
                }
                Err(err) => {
                    child.record_error(&err);
                    child.set_status(Status::error(err.to_string()));
                    tracing::error!(error = %err, "Nested unit of work failed");
                    Err(err)
                }
            }
        });

        match outcome {
            Ok(()) => span.set_status(Status::Ok),
            Err(err) => span.set_status(Status::error(err.to_string())),
        }
    });

    for increment in &sample.counter_increments {
        let labels: Vec<KeyValue> = increment
            .labels
            .iter()
            .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
            .collect();
        counter.add(increment.value, &labels);
    }

    let method = [KeyValue::new("method", "GET")];
    for &seconds in &sample.histogram_values {
        histogram.record(seconds, &method);
        if seconds > SLOW_REQUEST_SECONDS {
            tracing::warn!(seconds, "Slow request recorded");
        }
    }

    tracing::info!(
        counter = %sample.counter_name,
        increments = sample.counter_increments.len(),
        histogram_records = sample.histogram_values.len(),
        "Sample metrics recorded"
    );
}

fn compose_greeting(operation: &str, fail: bool) -> Result<String, SampleFailure> {
    if fail {
        return Err(SampleFailure {
            operation: operation.to_string(),
        });
    }
    Ok(format!("Hello from {operation}"))
}
