//! Prometheus metric recording for queue operations.

use crate::job::JobPriority;
use metrics::{counter, gauge};

pub fn record_enqueued(priority: JobPriority) {
    counter!("queue_jobs_enqueued_total", "priority" => priority.to_string()).increment(1);
}

pub fn record_processed(outcome: &'static str) {
    counter!("queue_jobs_processed_total", "outcome" => outcome).increment(1);
}

pub fn record_retry() {
    counter!("queue_jobs_retried_total").increment(1);
}

pub fn set_depth(priority: JobPriority, depth: usize) {
    gauge!("queue_depth", "priority" => priority.to_string()).set(depth as f64);
}

pub fn set_dead_letter_depth(depth: usize) {
    gauge!("queue_dead_letter_depth").set(depth as f64);
}
