//! Error types for job execution and pool management.

use domain_containers::SupervisorError;
use domain_generation::GenerationError;
use thiserror::Error;

/// Failure of one workflow run against the inference plane.
#[derive(Error, Debug)]
pub enum RunError {
    /// No image has ever been built for this workflow. Deterministic
    /// until an operator builds one.
    #[error("No runtime image built for workflow {0}")]
    BuildRequired(String),

    /// The runtime container could not be brought up or reached.
    #[error("Runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// The runtime executed the workflow and reported failure.
    /// Deterministic: the same graph will fail the same way.
    #[error("Inference runtime error: {0}")]
    Runtime(String),

    /// Transport-level failure mid-run.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The runner's own completion budget elapsed.
    #[error("Execution timed out after {0} seconds")]
    Timeout(u64),
}

impl RunError {
    /// Transient errors are retried by the queue; deterministic ones are
    /// dead-lettered immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RuntimeUnavailable(_) | Self::Connection(_) | Self::Timeout(_)
        )
    }
}

impl From<GenerationError> for RunError {
    fn from(e: GenerationError) -> Self {
        match e {
            GenerationError::Connection(m) => RunError::Connection(m),
            GenerationError::Timeout(secs) => RunError::Timeout(secs),
            other => RunError::Runtime(other.to_string()),
        }
    }
}

impl From<SupervisorError> for RunError {
    fn from(e: SupervisorError) -> Self {
        match e {
            SupervisorError::BuildRequired(workflow_id) => RunError::BuildRequired(workflow_id),
            other => RunError::RuntimeUnavailable(other.to_string()),
        }
    }
}

/// Failure of the executor around a run.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Resource check failed: {0}")]
    AdmissionDenied(String),

    #[error("Job execution exceeded {0}s timeout")]
    DeadlineExceeded(u64),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Queue(#[from] task_queue::QueueError),
}

/// Pool management errors.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Cannot add worker: max workers ({0}) reached")]
    AtMax(usize),

    #[error("Cannot remove worker: min workers ({0}) reached")]
    AtMin(usize),

    #[error("Worker already exists: {0}")]
    Duplicate(String),

    #[error("Worker not found: {0}")]
    NotFound(String),

    #[error("Target {target} outside worker bounds {min}..={max}")]
    OutOfBounds {
        target: usize,
        min: usize,
        max: usize,
    },
}
