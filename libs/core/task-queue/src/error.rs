//! Error types for queue operations.

use crate::job::JobState;
use thiserror::Error;

/// Errors that can occur during queue operations.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Segment log I/O error.
    #[error("Queue I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Total depth across segments would exceed the configured maximum.
    #[error("Queue full: capacity {capacity} reached")]
    Full { capacity: usize },

    /// No job with the given id is tracked.
    #[error("Job not found: {0}")]
    NotFound(String),

    /// The requested transition is not allowed from the job's current state.
    #[error("Job {job_id} cannot {attempted} from state {from}")]
    InvalidTransition {
        job_id: String,
        from: JobState,
        attempted: &'static str,
    },
}

impl QueueError {
    /// Whether the error reflects a capacity condition (the caller should
    /// surface backpressure, not an internal failure).
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::Full { .. })
    }
}
