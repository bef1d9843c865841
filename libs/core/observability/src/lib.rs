//! Observability utilities for the workflow execution plane.
//!
//! This crate provides:
//! - Prometheus metrics recording and export
//! - Metric descriptions for the queue, worker, and websocket families
//! - Axum middleware for automatic request metrics
//!
//! # Example
//!
//! ```rust,ignore
//! use observability::{init_metrics, metrics_handler};
//!
//! // Initialize metrics recorder once at startup
//! init_metrics();
//!
//! // Add metrics endpoint to router
//! let app = Router::new()
//!     .route("/metrics", get(metrics_handler));
//! ```

pub mod middleware;

// Re-export metrics macros for convenience
pub use metrics::{counter, gauge, histogram};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use tracing::info;

static METRICS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize the Prometheus metrics recorder.
///
/// This should be called once at application startup.
/// Returns the PrometheusHandle for rendering metrics.
pub fn init_metrics() -> &'static PrometheusHandle {
    METRICS_HANDLE.get_or_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("Failed to install Prometheus recorder");

        info!("Prometheus metrics recorder initialized");

        register_metric_descriptions();

        handle
    })
}

/// Get the metrics handle (must call init_metrics first)
pub fn get_metrics_handle() -> Option<&'static PrometheusHandle> {
    METRICS_HANDLE.get()
}

/// Axum handler for /metrics endpoint
pub async fn metrics_handler() -> String {
    match get_metrics_handle() {
        Some(handle) => handle.render(),
        None => "# Metrics not initialized\n".to_string(),
    }
}

/// Register metric descriptions for documentation
fn register_metric_descriptions() {
    use metrics::describe_counter;
    use metrics::describe_gauge;
    use metrics::describe_histogram;

    // HTTP metrics
    describe_counter!("http_requests_total", "Total number of HTTP requests");
    describe_histogram!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds"
    );
    describe_counter!(
        "http_requests_errors_total",
        "Total number of HTTP request errors"
    );

    // Queue metrics
    describe_counter!(
        "queue_jobs_enqueued_total",
        "Jobs accepted into the queue, by priority"
    );
    describe_counter!(
        "queue_jobs_processed_total",
        "Jobs that reached a terminal state, by outcome"
    );
    describe_counter!(
        "queue_jobs_retried_total",
        "Retry re-enqueues performed by the queue"
    );
    describe_gauge!("queue_depth", "Live jobs per priority segment");
    describe_gauge!("queue_dead_letter_depth", "Jobs parked in the dead letter segment");

    // Worker metrics
    describe_gauge!("worker_pool_size", "Workers currently alive in the pool");
    describe_counter!(
        "worker_jobs_completed_total",
        "Jobs completed successfully across all workers"
    );
    describe_counter!(
        "worker_jobs_failed_total",
        "Jobs that failed across all workers"
    );
    describe_histogram!(
        "job_execution_duration_seconds",
        "Wall-clock duration of job execution"
    );

    // WebSocket metrics
    describe_gauge!(
        "websocket_connections",
        "Currently registered progress subscribers"
    );
    describe_counter!(
        "websocket_events_sent_total",
        "Progress events fanned out to subscribers"
    );
}
