//! Job data model and lifecycle states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Scheduling priority. Segments are drained strictly high before normal
/// before low; there is no aging.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobPriority {
    High,
    Normal,
    Low,
}

impl JobPriority {
    /// Priorities in dequeue order.
    pub const fn in_dequeue_order() -> [JobPriority; 3] {
        [JobPriority::High, JobPriority::Normal, JobPriority::Low]
    }
}

impl Default for JobPriority {
    fn default() -> Self {
        JobPriority::Normal
    }
}

/// Job lifecycle state.
///
/// ```text
/// Pending ─enqueue─► Queued ─dequeue─► Processing ─complete─► Completed
///                      │                   │
///                   cancel           fail(retry under cap)
///                      ▼                   ▼
///                  Cancelled           Retrying ─re-enqueue─► Queued
///                                          │(else)
///                                          ▼
///                                       Failed (→ dead letter)
/// ```
///
/// A timeout is treated as a failure; `TimedOut` only shows up as the
/// recorded state when the deadline itself was the terminal cause.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Pending,
    Queued,
    Processing,
    Retrying,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled | JobState::TimedOut
        )
    }

    /// States from which a cancel request is honored.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, JobState::Pending | JobState::Queued)
    }
}

/// Terminal result of a successful job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    /// URLs under the local image-serving endpoint.
    pub images: Vec<String>,
    /// Wall-clock execution time in seconds.
    pub elapsed_seconds: f64,
}

/// The atomic unit of scheduling: one workflow invocation with one
/// parameter binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Stable scheduler-side identity.
    pub job_id: String,
    /// Identity used by the inference runtime and all client-facing
    /// endpoints. Assigned up front so subscribers can attach before the
    /// runtime ever sees the job.
    pub prompt_id: String,
    /// Opaque workflow graph: node id -> { class_type, inputs }.
    pub workflow: serde_json::Value,
    /// User-supplied parameter overrides, already validated and normalized.
    pub parameters: serde_json::Value,
    /// Which runtime container serves this job.
    pub workflow_id: String,
    pub priority: JobPriority,
    pub state: JobState,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Option<JobResult>,
}

pub const DEFAULT_MAX_RETRIES: u32 = 3;

impl Job {
    pub fn new(
        workflow_id: impl Into<String>,
        workflow: serde_json::Value,
        parameters: serde_json::Value,
        priority: JobPriority,
    ) -> Self {
        let prompt_id = Uuid::new_v4().to_string();
        Self {
            job_id: format!("task-{prompt_id}"),
            prompt_id,
            workflow,
            parameters,
            workflow_id: workflow_id.into(),
            priority,
            state: JobState::Pending,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            result: None,
        }
    }

    /// Number of steps in the job parameters, for progress totals.
    pub fn steps(&self) -> u32 {
        self.parameters
            .get("steps")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
            .unwrap_or(20)
    }

    /// Remaining retry budget check.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Re-dispatch delay contract for a retried job: the queue itself never
    /// sleeps, the scheduler delays re-dispatch by this much.
    pub fn retry_backoff(&self) -> std::time::Duration {
        std::time::Duration::from_secs(2u64.saturating_pow(self.retry_count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job() -> Job {
        Job::new("wf-1", json!({}), json!({"steps": 8}), JobPriority::Normal)
    }

    #[test]
    fn test_new_job_is_pending() {
        let job = job();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(job.job_id, format!("task-{}", job.prompt_id));
    }

    #[test]
    fn test_steps_from_parameters() {
        assert_eq!(job().steps(), 8);
        let bare = Job::new("wf-1", json!({}), json!({}), JobPriority::Low);
        assert_eq!(bare.steps(), 20);
    }

    #[test]
    fn test_state_terminality() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Processing.is_terminal());
        assert!(!JobState::Retrying.is_terminal());
    }

    #[test]
    fn test_cancellable_states() {
        assert!(JobState::Pending.is_cancellable());
        assert!(JobState::Queued.is_cancellable());
        assert!(!JobState::Processing.is_cancellable());
        assert!(!JobState::Completed.is_cancellable());
    }

    #[test]
    fn test_retry_backoff_doubles() {
        let mut job = job();
        assert_eq!(job.retry_backoff().as_secs(), 1);
        job.retry_count = 1;
        assert_eq!(job.retry_backoff().as_secs(), 2);
        job.retry_count = 3;
        assert_eq!(job.retry_backoff().as_secs(), 8);
    }

    #[test]
    fn test_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(JobState::TimedOut).unwrap(),
            json!("timed_out")
        );
        assert_eq!(JobState::TimedOut.to_string(), "timed_out");
        assert_eq!(JobPriority::High.to_string(), "high");
    }

    #[test]
    fn test_job_round_trips_through_json() {
        let job = job();
        let encoded = serde_json::to_string(&job).unwrap();
        let decoded: Job = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.job_id, job.job_id);
        assert_eq!(decoded.priority, job.priority);
        assert_eq!(decoded.state, job.state);
    }
}
