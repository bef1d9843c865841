//! Job execution: per-job orchestration and the autoscaled worker pool.
//!
//! This crate provides:
//! - `JobExecutor` - admission control, timeout-bounded execution,
//!   resource monitoring, and result recording for one job at a time
//! - `WorkflowRunner` - the seam between the executor and the inference
//!   plane (container supervision + runtime client)
//! - `Worker` / `WorkerPool` - the cooperative worker loop and the pool
//!   that scales it between `min_workers` and `max_workers`
//!
//! The dependency cycle worker <-> executor <-> queue from the design is
//! broken by injection: the pool constructs the executor and holds the
//! queue; the executor holds queue and bus references; neither references
//! the pool.

pub mod error;
pub mod executor;
pub mod pool;
pub mod runner;
pub mod worker;

pub use error::{ExecutionError, PoolError, RunError};
pub use executor::{ExecutorConfig, JobExecutor};
pub use pool::{PoolConfig, PoolStatus, WorkerPool};
pub use runner::{RunOutput, RuntimeWorkflowRunner, WorkflowRunner};
pub use worker::{Worker, WorkerInfo, WorkerState};
