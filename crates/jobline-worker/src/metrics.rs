//! Prometheus metrics for the worker runtime.

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::error::{WorkerError, WorkerResult};

/// Install the Prometheus recorder with its scrape endpoint on `port`.
pub fn init_metrics(port: u16) -> WorkerResult<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| WorkerError::metrics(format!("failed to install Prometheus exporter: {}", e)))
}

/// Metric names as constants for consistency.
pub mod names {
    pub const JOBS_ACTIVE: &str = "jobline_jobs_active";
    pub const JOBS_COMPLETED_TOTAL: &str = "jobline_jobs_completed_total";
    pub const JOBS_FAILED_TOTAL: &str = "jobline_jobs_failed_total";
    pub const JOBS_RETRIED_TOTAL: &str = "jobline_jobs_retried_total";
    pub const JOB_DURATION_SECONDS: &str = "jobline_job_duration_seconds";
    pub const JOBS_STALLED_TOTAL: &str = "jobline_jobs_stalled_total";
    pub const CONSUMER_ERRORS_TOTAL: &str = "jobline_consumer_errors_total";
    pub const WORKER_EVENTS_TOTAL: &str = "jobline_worker_events_total";
}

pub fn record_job_started(queue: &str) {
    gauge!(names::JOBS_ACTIVE, "queue" => queue.to_string()).increment(1.0);
}

pub fn record_job_finished(queue: &str) {
    gauge!(names::JOBS_ACTIVE, "queue" => queue.to_string()).decrement(1.0);
}

pub fn record_job_completed(queue: &str, job: &str, duration: Duration) {
    let labels = [("queue", queue.to_string()), ("job", job.to_string())];
    counter!(names::JOBS_COMPLETED_TOTAL, &labels).increment(1);
    histogram!(names::JOB_DURATION_SECONDS, &labels).record(duration.as_secs_f64());
}

/// A failed attempt; `will_retry` separates retries from final failures.
pub fn record_job_failed(queue: &str, job: &str, will_retry: bool) {
    let labels = [("queue", queue.to_string()), ("job", job.to_string())];
    if will_retry {
        counter!(names::JOBS_RETRIED_TOTAL, &labels).increment(1);
    } else {
        counter!(names::JOBS_FAILED_TOTAL, &labels).increment(1);
    }
}

pub fn record_stalled(queue: &str, recovered: usize, failed: usize) {
    let recovered_labels = [("queue", queue.to_string()), ("outcome", "recovered".to_string())];
    counter!(names::JOBS_STALLED_TOTAL, &recovered_labels).increment(recovered as u64);
    let failed_labels = [("queue", queue.to_string()), ("outcome", "failed".to_string())];
    counter!(names::JOBS_STALLED_TOTAL, &failed_labels).increment(failed as u64);
}

pub fn record_consumer_error(queue: &str) {
    counter!(names::CONSUMER_ERRORS_TOTAL, "queue" => queue.to_string()).increment(1);
}

pub fn record_event(queue: &str, kind: &'static str) {
    let labels = [("queue", queue.to_string()), ("event", kind.to_string())];
    counter!(names::WORKER_EVENTS_TOTAL, &labels).increment(1);
}
