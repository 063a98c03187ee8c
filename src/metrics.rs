use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

const PREFIX: &str = "backup_orchestrator";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref OPERATIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_operations_total"), "Operations that reached a terminal status"),
        &["kind", "status"]
    ).expect("Failed to create operations_total metric");

    pub static ref OPERATION_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_operation_duration_seconds"),
            "Wall time of executed operations in seconds"
        )
        .buckets(vec![1.0, 10.0, 60.0, 300.0, 900.0, 3600.0, 4.0 * 3600.0, 12.0 * 3600.0]),
        &["kind"]
    ).expect("Failed to create operation_duration_seconds metric");

    pub static ref TASKS_QUEUED: Gauge = Gauge::new(
        format!("{PREFIX}_tasks_queued"),
        "Tasks waiting in the scheduler queue"
    ).expect("Failed to create tasks_queued metric");

    pub static ref TASKS_RUNNING: Gauge = Gauge::new(
        format!("{PREFIX}_tasks_running"),
        "Tasks currently executing"
    ).expect("Failed to create tasks_running metric");

    pub static ref TOOL_INVOCATIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_tool_invocations_total"), "restic invocations by verb and outcome"),
        &["verb", "outcome"]
    ).expect("Failed to create tool_invocations_total metric");
}

pub fn init_metrics() {
    // Ignore errors if already registered (tests)
    let _ = REGISTRY.register(Box::new(OPERATIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(OPERATION_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(TASKS_QUEUED.clone()));
    let _ = REGISTRY.register(Box::new(TASKS_RUNNING.clone()));
    let _ = REGISTRY.register(Box::new(TOOL_INVOCATIONS_TOTAL.clone()));

    tracing::info!("Metrics system initialized");
}

pub fn record_operation_finished(kind: &str, status: &str, duration: Duration) {
    OPERATIONS_TOTAL.with_label_values(&[kind, status]).inc();
    OPERATION_DURATION_SECONDS
        .with_label_values(&[kind])
        .observe(duration.as_secs_f64());
}

pub fn record_tool_invocation(verb: &str, outcome: &str) {
    TOOL_INVOCATIONS_TOTAL
        .with_label_values(&[verb, outcome])
        .inc();
}

pub fn set_queue_depth(depth: usize) {
    TASKS_QUEUED.set(depth as f64);
}

pub fn task_started() {
    TASKS_RUNNING.inc();
}

pub fn task_finished() {
    TASKS_RUNNING.dec();
}

pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            String::from_utf8(buffer).unwrap_or_default(),
        ),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorded_operations_are_exported() {
        init_metrics();
        record_operation_finished("backup", "SUCCESS", Duration::from_secs(3));
        record_tool_invocation("backup", "ok");

        let families = REGISTRY.gather();
        let names: Vec<_> = families.iter().map(|f| f.get_name().to_string()).collect();
        assert!(names.contains(&format!("{PREFIX}_operations_total")));
        assert!(names.contains(&format!("{PREFIX}_tool_invocations_total")));
    }

    #[tokio::test]
    async fn test_metrics_handler_returns_ok() {
        init_metrics();
        let response = metrics_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
