use database::DatabaseError;
use thiserror::Error;

/// Errors from container supervision.
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// No image has been built for the workflow; the caller should point
    /// the operator at the build pipeline.
    #[error("No successful container build found for workflow {0}. Build the container first.")]
    BuildRequired(String),

    /// The container runtime CLI failed or returned garbage.
    #[error("Container runtime error: {0}")]
    Runtime(String),

    /// The container exited while we were waiting for it to become ready.
    /// Carries the recent log tail for diagnosis.
    #[error("Runtime container exited during startup.\n{logs}")]
    StartupFailed { logs: String },

    /// The container never exposed its port within the readiness budget.
    #[error("Runtime container failed to expose port {port} on host within {timeout_secs}s")]
    NotReady { port: u16, timeout_secs: u64 },

    #[error(transparent)]
    Store(#[from] DatabaseError),

    #[error("Container runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
}
