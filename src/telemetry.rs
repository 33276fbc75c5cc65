//! Prometheus recorders for run and node outcomes.

use metrics::{counter, histogram, increment_counter};

pub fn record_run_success(mode: &str, duration_seconds: f64) {
    counter!("execdesk_runs_total", 1, "mode" => mode.to_string(), "outcome" => "success");
    histogram!("execdesk_run_duration_seconds", duration_seconds, "mode" => mode.to_string());
}

pub fn record_run_failure(mode: &str, reason: &str) {
    counter!("execdesk_runs_total", 1, "mode" => mode.to_string(), "outcome" => "failure");
    counter!("execdesk_run_failures_total", 1, "reason" => reason.to_string());
}

pub fn record_node_latency(node: &str, duration_seconds: f64) {
    histogram!("execdesk_node_duration_seconds", duration_seconds, "node" => node.to_string());
}

pub fn record_node_failure(node: &str, error_class: &str) {
    counter!(
        "execdesk_node_failures_total",
        1,
        "node" => node.to_string(),
        "error_class" => error_class.to_string()
    );
}

pub fn record_sse_connection_rejected() {
    increment_counter!("execdesk_sse_rejections_total");
}
