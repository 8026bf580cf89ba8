//! Prometheus metrics handler

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Initialize the Prometheus metrics exporter
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("call_duration_seconds".to_string()),
            &[1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0],
        )?
        .install_recorder()?;

    describe_metrics();
    Ok(handle)
}

/// Describe metrics
pub fn describe_metrics() {
    describe_counter!("calls_started_total", "Total number of calls started, by role");
    describe_counter!("calls_ended_total", "Total number of calls ended, by reason");
    describe_gauge!("calls_active", "Whether a call is currently active");
    describe_histogram!(
        "call_duration_seconds",
        "Talk time of answered calls in seconds"
    );
    describe_counter!(
        "signaling_messages_total",
        "Signaling events sent, received or relayed"
    );
    describe_gauge!(
        "signaling_clients",
        "Number of users connected to the signaling relay"
    );
}

/// HTTP metrics handler
pub async fn metrics_handler(
    axum::extract::State(prometheus_handle): axum::extract::State<PrometheusHandle>,
) -> Response {
    let metrics = prometheus_handle.render();
    (StatusCode::OK, metrics).into_response()
}
