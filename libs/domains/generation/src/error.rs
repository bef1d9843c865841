use thiserror::Error;

/// Errors from the generation domain.
#[derive(Error, Debug)]
pub enum GenerationError {
    /// Request failed validation; carries the offending field path.
    #[error("Validation failed for '{field}': {message}")]
    Validation { field: String, message: String },

    /// The runtime answered but reported a failure. Deterministic: the
    /// same workflow will fail again, so these are not retried.
    #[error("Inference runtime error: {0}")]
    Runtime(String),

    /// The runtime could not be reached (refused, reset, timed out at the
    /// transport). Transient.
    #[error("Inference runtime unreachable: {0}")]
    Connection(String),

    /// The submit response had no prompt id.
    #[error("No prompt_id returned by inference runtime")]
    MissingPromptId,

    /// `wait_for_completion` exhausted its budget.
    #[error("Workflow execution timeout after {0} seconds")]
    Timeout(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GenerationError {
    /// Transient failures are retried by the queue; deterministic ones go
    /// straight to the dead letter tier.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }
}

impl From<reqwest::Error> for GenerationError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() || e.is_request() {
            GenerationError::Connection(e.to_string())
        } else if let Some(status) = e.status() {
            if status.is_server_error() {
                GenerationError::Connection(e.to_string())
            } else {
                GenerationError::Runtime(e.to_string())
            }
        } else {
            GenerationError::Connection(e.to_string())
        }
    }
}
