use std::sync::Once;
use std::time::Duration;

use agent_telemetry::{
    HealthCheck, HealthStatus, LogLevel, MetricValue, Observability, ObservabilityOptions,
    TelemetryError, TraceContext,
};

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("agent_telemetry=debug")
            .with_test_writer()
            .try_init();
    });
}

fn observability(service: &str) -> Observability {
    init_tracing();
    Observability::new(&ObservabilityOptions::new(service)).unwrap()
}

#[tokio::test]
async fn request_flow_shows_up_in_full_status() {
    let obs = observability("checkout");
    let metrics = obs.metrics().unwrap();
    let tracer = obs.tracer().unwrap();
    let perf = obs.performance().unwrap();
    let health = obs.health().unwrap();

    let requests = metrics
        .get_or_create_counter("requests_total", "Handled requests", &[("route", "/pay")])
        .unwrap();
    let latency = metrics
        .get_or_create_histogram("request_seconds", "Request latency", &[])
        .unwrap();

    health.register(
        HealthCheck::new("db", Duration::from_millis(200), || async { anyhow::Ok(true) })
            .unwrap(),
    );

    let token = perf.start_operation("handle").unwrap();
    let root = tracer.enter("handle_request").unwrap();
    root.add_tag("route", "/pay").unwrap();
    {
        let child = tracer.enter("charge_card").unwrap();
        assert_eq!(
            child.snapshot().unwrap().parent_span_id,
            Some(root.span_id())
        );
        child.add_log("charged", LogLevel::Info).unwrap();
    }
    requests.inc();
    let trace_id = root.trace_id();
    root.finish().unwrap();
    let elapsed = perf.end_operation(token).unwrap();
    latency.observe(elapsed.as_secs_f64()).unwrap();
    perf.record_throughput("handle", 1).unwrap();

    let report = health.run_all().await;
    assert_eq!(report.status, HealthStatus::Healthy);

    let spans = tracer.get_spans_by_trace_id(trace_id);
    assert_eq!(spans.len(), 2);
    assert!(spans.iter().all(|span| span.is_finished()));

    let status = obs.get_full_status();
    assert_eq!(status.service_name, "checkout");
    let tracing = status.tracing.as_ref().unwrap();
    assert_eq!(tracing.summary.total_spans, 2);
    assert_eq!(tracing.summary.total_traces, 1);
    assert_eq!(tracing.summary.active_spans, 0);

    let metrics = status.metrics.as_ref().unwrap();
    let counter = metrics
        .iter()
        .find(|metric| metric.name == "requests_total")
        .unwrap();
    assert_eq!(counter.value, MetricValue::Counter(1.0));

    let json = status.to_json().unwrap();
    assert_eq!(json["tracing"]["total_spans"], 2);
    assert_eq!(json["performance"]["latency"]["handle"]["count"], 1);
    assert_eq!(json["performance"]["throughput"]["handle"]["total"], 1);
    assert_eq!(
        json["health"]["checks"]["db"]["last_result"]["status"],
        "healthy"
    );
}

#[tokio::test]
async fn everything_disabled_serializes_as_null() {
    init_tracing();
    let options = ObservabilityOptions::new("quiet")
        .with_metrics(false)
        .with_tracing(false)
        .with_performance_monitoring(false)
        .with_health_checks(false);
    let obs = Observability::new(&options).unwrap();

    let json = obs.get_full_status().to_json().unwrap();
    for key in ["metrics", "tracing", "performance", "health"] {
        assert!(json[key].is_null(), "{key} should be null");
    }
    assert_eq!(json["service_name"], "quiet");
}

#[tokio::test]
async fn concurrent_tasks_keep_separate_span_stacks() {
    let obs = observability("workers");
    let tracer = obs.tracer().unwrap().clone();

    let mut handles = Vec::new();
    for worker in 0..4 {
        let tracer = tracer.clone();
        handles.push(tokio::spawn(TraceContext::instrument(async move {
            let outer = tracer.enter(&format!("job-{worker}")).unwrap();
            tokio::task::yield_now().await;
            let inner = tracer.enter("step").unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert_eq!(
                tracer.get_active_span().unwrap().span_id(),
                inner.span_id()
            );
            let parent = inner.snapshot().unwrap().parent_span_id;
            inner.finish().unwrap();
            assert_eq!(parent, Some(outer.span_id()));
            outer.finish().unwrap();
        })));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let summary = tracer.summary();
    assert_eq!(summary.total_spans, 8);
    assert_eq!(summary.total_traces, 4);
    assert_eq!(summary.finished_spans, 8);
}

#[tokio::test]
async fn slow_probe_does_not_hold_up_the_report() {
    let obs = observability("probes");
    let health = obs.health().unwrap();
    health.register(
        HealthCheck::new("cache", Duration::from_millis(50), || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            anyhow::Ok(true)
        })
        .unwrap(),
    );
    health.register(
        HealthCheck::new("db", Duration::from_millis(500), || async { anyhow::Ok(true) }).unwrap(),
    );

    let report = tokio::time::timeout(Duration::from_secs(2), health.run_all())
        .await
        .unwrap();
    assert_eq!(report.status, HealthStatus::Unhealthy);
    assert!(report.checks["db"].is_healthy());
    assert!(report.checks["cache"].error.as_deref().unwrap().contains("timeout"));
}

#[test]
fn lookups_of_unknown_names_fail() {
    let obs = observability("lookups");
    assert!(matches!(
        obs.metrics().unwrap().get_metric("missing", &[]),
        Err(TelemetryError::NotFound { .. })
    ));
    assert!(matches!(
        obs.performance().unwrap().get_latency_stats("missing"),
        Err(TelemetryError::NotFound { .. })
    ));
    assert!(matches!(
        obs.health().unwrap().unregister("missing"),
        Err(TelemetryError::NotFound { .. })
    ));
}
