//! Integration tests driving the harness through its public API.
//!
//! Note: Since the tracing subscriber can only be initialised once per process,
//! only `full_lifecycle_with_global_subscriber` installs it; every other test
//! opts out.

use opentelemetry::logs::AnyValue;
use opentelemetry_sdk::logs::InMemoryLogExporter;
use opentelemetry_sdk::metrics::InMemoryMetricExporter;
use opentelemetry_sdk::metrics::data::{AggregatedMetrics, MetricData};
use opentelemetry_sdk::trace::InMemorySpanExporter;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use telemetry_harness::{
    ExportMode, HarnessBuilder, HarnessError, Protocol, SampleConfig, Signal, SignalConfig,
    TelemetryGuard, configure_resource, emit_sample, logger_provider_with_exporter,
    meter_provider_with_exporter, tracer_provider_with_exporter,
};

/// Nothing listens on the discard port in the test environment.
const UNREACHABLE: &str = "http://127.0.0.1:9";

/// Minimal OTLP/HTTP receiver recording the path and content type of every
/// request it answers.
struct LocalCollector {
    endpoint: String,
    requests: Arc<Mutex<Vec<(String, String)>>>,
}

impl LocalCollector {
    fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&requests);
        std::thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let recorded = Arc::clone(&recorded);
                std::thread::spawn(move || serve_connection(stream, &recorded));
            }
        });

        Self { endpoint, requests }
    }

    /// Content types seen on `path`, lowercased.
    fn content_types(&self, path: &str) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, content_type)| content_type.clone())
            .collect()
    }

    fn assert_received_protobuf(&self, signal: Signal) {
        let content_types = self.content_types(signal.otlp_path());
        assert!(
            !content_types.is_empty(),
            "no {signal} export reached {}",
            signal.otlp_path()
        );
        assert!(
            content_types
                .iter()
                .all(|ct| ct.starts_with("application/x-protobuf")),
            "unexpected content types for {signal}: {content_types:?}"
        );
    }
}

/// Answers keep-alive requests on one connection until the client hangs up.
fn serve_connection(stream: TcpStream, recorded: &Mutex<Vec<(String, String)>>) {
    let mut writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(_) => return,
    };
    let mut reader = BufReader::new(stream);

    loop {
        let mut request_line = String::new();
        match reader.read_line(&mut request_line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let path = request_line
            .split_whitespace()
            .nth(1)
            .unwrap_or_default()
            .to_string();

        let mut content_type = String::new();
        let mut content_length = 0_usize;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).unwrap_or(0) == 0 {
                return;
            }
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                let value = value.trim();
                match name.to_ascii_lowercase().as_str() {
                    "content-type" => content_type = value.to_ascii_lowercase(),
                    "content-length" => content_length = value.parse().unwrap_or(0),
                    _ => {}
                }
            }
        }

        let mut body = vec![0_u8; content_length];
        if reader.read_exact(&mut body).is_err() {
            return;
        }
        recorded.lock().unwrap().push((path, content_type));

        if writer
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
            .is_err()
        {
            return;
        }
    }
}

#[test]
fn full_lifecycle_with_global_subscriber() -> Result<(), HarnessError> {
    let collector = LocalCollector::start();
    let mut harness = HarnessBuilder::new()
        .service_name("integration-test-service")
        .endpoint(&collector.endpoint)
        .export_timeout(Duration::from_secs(2))
        .shutdown_timeout(Duration::from_secs(5))
        .iterations(2)
        .build()?;

    assert!(harness.guard().tracer_provider().is_some());
    assert!(harness.guard().meter_provider().is_some());
    assert!(harness.guard().logger_provider().is_some());

    harness.emit();

    // Shutdown flushes every batch before returning.
    harness.shutdown()?;
    assert!(harness.guard().is_shut_down());

    // Second shutdown is a no-op.
    harness.shutdown()?;

    collector.assert_received_protobuf(Signal::Traces);
    collector.assert_received_protobuf(Signal::Metrics);
    collector.assert_received_protobuf(Signal::Logs);

    Ok(())
}

#[test]
fn all_signals_reach_collector_without_global_subscriber() -> Result<(), HarnessError> {
    let collector = LocalCollector::start();
    let harness = HarnessBuilder::new()
        .service_name("integration-test-scoped")
        .endpoint(&collector.endpoint)
        .export_timeout(Duration::from_secs(2))
        .shutdown_timeout(Duration::from_secs(5))
        .without_tracing_subscriber()
        .build()?;

    assert!(harness.guard().scoped_logger().is_some());
    harness.run()?;

    collector.assert_received_protobuf(Signal::Traces);
    collector.assert_received_protobuf(Signal::Metrics);
    collector.assert_received_protobuf(Signal::Logs);

    Ok(())
}

#[test]
fn malformed_base_endpoint_fails_before_emission() {
    let err = HarnessBuilder::new()
        .endpoint("localhost:4318")
        .without_tracing_subscriber()
        .build()
        .unwrap_err();

    assert!(matches!(err, HarnessError::InvalidEndpoint { ref url } if url == "localhost:4318"));
    assert!(err.is_configuration_error());
}

#[test]
fn malformed_signal_endpoint_fails_before_emission() {
    let err = HarnessBuilder::new()
        .endpoint(UNREACHABLE)
        .signal_endpoint(Signal::Metrics, "ftp://collector/v1/metrics")
        .without_tracing_subscriber()
        .build()
        .unwrap_err();

    assert!(matches!(err, HarnessError::InvalidEndpoint { .. }));
}

#[test]
fn immediate_mode_run_completes_against_unreachable_collector() {
    let harness = HarnessBuilder::new()
        .endpoint(UNREACHABLE)
        .protocol(Protocol::HttpJson)
        .export_mode_all(ExportMode::Immediate)
        .export_timeout(Duration::from_millis(500))
        .shutdown_timeout(Duration::from_secs(2))
        .simulate_failure(true)
        .without_tracing_subscriber()
        .build()
        .unwrap();

    // outcome depends on how the exporters report refused connections
    let _ = harness.run();
}

#[tokio::test(flavor = "multi_thread")]
async fn grpc_pipeline_runs_inside_a_runtime() {
    let mut harness = HarnessBuilder::new()
        .endpoint(UNREACHABLE)
        .protocol(Protocol::Grpc)
        .export_timeout(Duration::from_millis(500))
        .shutdown_timeout(Duration::from_secs(2))
        .without_tracing_subscriber()
        .build()
        .unwrap();

    // Use block_in_place to allow blocking without starving the tokio runtime.
    tokio::task::block_in_place(|| harness.emit());
    let _ = tokio::task::block_in_place(|| harness.shutdown());

    assert!(harness.guard().is_shut_down());
}

#[test]
fn custom_exporters_receive_the_fruit_plan() {
    let spans = InMemorySpanExporter::default();
    let metrics = InMemoryMetricExporter::default();
    let logs = InMemoryLogExporter::default();

    let resource = configure_resource(
        "LGTM",
        Some("0.1.0"),
        None,
        [("environment", "development")],
    )
    .unwrap();
    let immediate = SignalConfig {
        export_mode: ExportMode::Immediate,
        ..Default::default()
    };

    let tracer_provider = tracer_provider_with_exporter(spans.clone(), &immediate, resource.clone());
    let meter_provider =
        meter_provider_with_exporter(metrics.clone(), &SignalConfig::default(), resource.clone());
    let logger_provider = logger_provider_with_exporter(logs.clone(), &immediate, false, resource);

    let mut guard = TelemetryGuard::from_providers(
        Some(tracer_provider),
        Some(meter_provider),
        Some(logger_provider),
        Duration::from_secs(2),
    );

    let sample = SampleConfig::default();
    emit_sample(
        &guard.tracer(sample.tracer_name.clone()),
        &guard.meter(sample.meter_name.clone()),
        guard.scoped_logger(),
        &sample,
    );

    guard.flush();

    let finished = spans.get_finished_spans().unwrap();
    let names: Vec<_> = finished.iter().map(|s| s.name.to_string()).collect();
    assert!(names.contains(&"SayHello".to_string()));
    assert!(names.contains(&"ComposeGreeting".to_string()));
    assert!(
        finished
            .iter()
            .all(|s| s.instrumentation_scope.name() == "TestingSource")
    );

    let exported = metrics.get_finished_metrics().unwrap();
    let latest = exported.last().unwrap();
    assert!(
        latest
            .resource()
            .iter()
            .any(|(k, v)| k.as_str() == "service.name" && v.as_str() == "LGTM")
    );

    let mut series = Vec::new();
    for metric in latest
        .scope_metrics()
        .flat_map(|sm| sm.metrics())
        .filter(|m| m.name() == "TestCounter")
    {
        if let AggregatedMetrics::U64(MetricData::Sum(sum)) = metric.data() {
            for dp in sum.data_points() {
                let name = dp
                    .attributes()
                    .find(|kv| kv.key.as_str() == "name")
                    .map(|kv| kv.value.to_string())
                    .unwrap_or_default();
                series.push((name, dp.value()));
            }
        }
    }
    series.sort();
    assert_eq!(
        series,
        vec![("apple".to_string(), 1), ("lemon".to_string(), 3)]
    );

    let emitted = logs.get_emitted_logs().unwrap();
    assert!(emitted.iter().any(|log| {
        log.record.body() == Some(&AnyValue::from("context: TestOperation"))
            && log
                .resource
                .iter()
                .any(|(k, v)| k.as_str() == "environment" && v.as_str() == "development")
    }));

    guard.shutdown().unwrap();
    assert!(guard.is_shut_down());
}
