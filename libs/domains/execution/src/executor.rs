//! Per-job orchestration: admission, execution under deadline, resource
//! monitoring, result recording.

use crate::error::{ExecutionError, RunError};
use crate::runner::WorkflowRunner;
use chrono::Utc;
use database::{ExecutionRecord, ExecutionStore};
use metrics::{counter, histogram};
use progress_bus::{ProgressBus, ProgressEvent, ProgressTracker};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use sysmon::{ResourceEstimate, ResourceSensor, ResourceSnapshot, WorkloadProfile};
use task_queue::{DurableQueue, Job, JobResult};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_concurrent_jobs: usize,
    pub default_timeout: Duration,
    /// Resource monitor sampling cadence while a job runs.
    pub check_interval: Duration,
    /// Soft limits gating `can_accept`; stricter than the sensor's
    /// critical thresholds.
    pub max_cpu_percent: f64,
    pub max_memory_percent: f64,
    pub max_disk_percent: f64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            default_timeout: Duration::from_secs(300),
            check_interval: Duration::from_secs(2),
            max_cpu_percent: 90.0,
            max_memory_percent: 85.0,
            max_disk_percent: 99.0,
        }
    }
}

struct ActiveJob {
    prompt_id: String,
    started: tokio::time::Instant,
    start_usage: ResourceSnapshot,
    estimate: ResourceEstimate,
}

/// Point-in-time view of one running job, for the workers endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveJobStatus {
    pub job_id: String,
    pub prompt_id: String,
    pub elapsed_seconds: f64,
    pub estimated_memory_mb: f64,
    /// Memory pressure when the job was admitted.
    pub memory_percent_at_start: f64,
}

/// Executes jobs one at a time (bounded by `max_concurrent_jobs` across
/// workers sharing this executor), with admission control and a resource
/// monitor broadcasting usage while jobs run.
pub struct JobExecutor {
    queue: Arc<DurableQueue>,
    runner: Arc<dyn WorkflowRunner>,
    bus: Arc<ProgressBus>,
    tracker: Arc<ProgressTracker>,
    sensor: Arc<ResourceSensor>,
    executions: Arc<dyn ExecutionStore>,
    config: ExecutorConfig,
    active: Mutex<HashMap<String, ActiveJob>>,
}

impl JobExecutor {
    pub fn new(
        queue: Arc<DurableQueue>,
        runner: Arc<dyn WorkflowRunner>,
        bus: Arc<ProgressBus>,
        sensor: Arc<ResourceSensor>,
        executions: Arc<dyn ExecutionStore>,
        config: ExecutorConfig,
    ) -> Self {
        let tracker = Arc::new(ProgressTracker::new(Arc::clone(&bus)));
        Self {
            queue,
            runner,
            bus,
            tracker,
            sensor,
            executions,
            config,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn tracker(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.tracker)
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute one dequeued job end to end. The queue record is always
    /// updated before this returns; the error is for the worker's own
    /// failure counter.
    pub async fn execute(self: &Arc<Self>, job: Job) -> Result<(), ExecutionError> {
        info!(job_id = %job.job_id, "Starting execution");

        let estimate = match self.admit(&job).await {
            Ok(estimate) => estimate,
            Err(reason) => {
                warn!(job_id = %job.job_id, %reason, "Admission denied");
                // Resource pressure is transient: give the job back to the
                // queue to retry once pressure clears.
                self.queue.fail(&job.job_id, &reason, true).await?;
                self.tracker
                    .complete_execution(&job.prompt_id, None, Some(reason.clone()))
                    .await;
                return Err(ExecutionError::AdmissionDenied(reason));
            }
        };

        let started = tokio::time::Instant::now();
        {
            let mut active = self.active.lock().await;
            active.insert(
                job.job_id.clone(),
                ActiveJob {
                    prompt_id: job.prompt_id.clone(),
                    started,
                    start_usage: self.sensor.sample(),
                    estimate,
                },
            );
        }
        self.record_execution(&job, "processing", &[], None).await;
        self.tracker
            .start_execution(&job.prompt_id, job.steps())
            .await;

        let monitor = self.spawn_monitor(job.job_id.clone(), job.prompt_id.clone());

        let outcome = tokio::time::timeout(
            self.config.default_timeout,
            self.runner.run(&job, self.tracker()),
        )
        .await;

        let result = match outcome {
            Ok(Ok(output)) => {
                let elapsed = started.elapsed().as_secs_f64();
                let completed = self
                    .queue
                    .complete(
                        &job.job_id,
                        JobResult {
                            images: output.images.clone(),
                            elapsed_seconds: elapsed,
                        },
                    )
                    .await;
                match completed {
                    Ok(()) => {
                        self.tracker
                            .complete_execution(&job.prompt_id, Some(output.images.clone()), None)
                            .await;
                        self.record_execution(&job, "completed", &output.images, None)
                            .await;

                        counter!("worker_jobs_completed_total").increment(1);
                        histogram!("job_execution_duration_seconds").record(elapsed);
                        info!(job_id = %job.job_id, elapsed_secs = elapsed, "Execution completed");
                        Ok(())
                    }
                    Err(e) => {
                        // A cancel can land while the run is in flight; the
                        // queue record wins.
                        self.handle_terminal_race(&job, e).await;
                        Ok(())
                    }
                }
            }
            Ok(Err(run_error)) => {
                let retry = run_error.is_transient();
                let message = run_error.to_string();
                error!(job_id = %job.job_id, error = %message, retry, "Execution failed");

                if let Err(e) = self.queue.fail(&job.job_id, &message, retry).await {
                    self.handle_terminal_race(&job, e).await;
                } else {
                    self.tracker
                        .complete_execution(&job.prompt_id, None, Some(message.clone()))
                        .await;
                    self.record_execution(&job, "failed", &[], Some(&message)).await;
                }

                counter!("worker_jobs_failed_total").increment(1);
                Err(ExecutionError::Run(run_error))
            }
            Err(_elapsed) => {
                let budget = self.config.default_timeout.as_secs();
                let message = format!("Job execution exceeded {budget}s timeout");
                error!(job_id = %job.job_id, "Execution timed out");

                if let Err(e) = self.queue.time_out(&job.job_id, &message, true).await {
                    self.handle_terminal_race(&job, e).await;
                } else {
                    self.tracker
                        .complete_execution(&job.prompt_id, None, Some(message.clone()))
                        .await;
                    self.record_execution(&job, "timed_out", &[], Some(&message))
                        .await;
                }

                counter!("worker_jobs_failed_total").increment(1);
                Err(ExecutionError::DeadlineExceeded(budget))
            }
        };

        self.active.lock().await.remove(&job.job_id);
        monitor.abort();
        result
    }

    /// The run finished but the queue record already went terminal (a
    /// cancel accepted mid-flight). Honor the record and tell subscribers.
    async fn handle_terminal_race(&self, job: &Job, error: task_queue::QueueError) {
        warn!(job_id = %job.job_id, "Terminal update lost to queue record: {error}");
        if let Some(current) = self.queue.get(&job.job_id).await {
            if current.state == task_queue::JobState::Cancelled {
                self.tracker.cancel_execution(&job.prompt_id).await;
                self.record_execution(job, "cancelled", &[], None).await;
            }
        }
    }

    /// Admission check: executor concurrency cap, then the sensor against
    /// the estimated cost of this workload.
    async fn admit(&self, job: &Job) -> Result<ResourceEstimate, String> {
        {
            let active = self.active.lock().await;
            if active.len() >= self.config.max_concurrent_jobs {
                return Err(format!(
                    "Max concurrent jobs ({}) reached",
                    self.config.max_concurrent_jobs
                ));
            }
        }

        let estimate = self.sensor.estimate(&workload_profile(job));
        let admission = self.sensor.admit(estimate.memory_mb, estimate.disk_mb);
        if !admission.ok {
            return Err(admission.reason);
        }
        Ok(estimate)
    }

    /// True when a worker may pull more work: below the concurrency cap
    /// and the host is within the executor's soft limits.
    pub async fn can_accept(&self) -> bool {
        if self.active.lock().await.len() >= self.config.max_concurrent_jobs {
            return false;
        }
        self.sensor.sample().is_within_limits(
            self.config.max_cpu_percent,
            self.config.max_memory_percent,
            self.config.max_disk_percent,
        )
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    pub async fn active_jobs(&self) -> Vec<ActiveJobStatus> {
        let active = self.active.lock().await;
        active
            .iter()
            .map(|(job_id, state)| ActiveJobStatus {
                job_id: job_id.clone(),
                prompt_id: state.prompt_id.clone(),
                elapsed_seconds: state.started.elapsed().as_secs_f64(),
                estimated_memory_mb: state.estimate.memory_mb,
                memory_percent_at_start: state.start_usage.memory_percent,
            })
            .collect()
    }

    /// Fail whatever is still active (shutdown path) and sweep old output
    /// artifacts.
    pub async fn cleanup_resources(&self) {
        let job_ids: Vec<String> = {
            let mut active = self.active.lock().await;
            let ids = active.keys().cloned().collect();
            active.clear();
            ids
        };
        for job_id in job_ids {
            if let Err(e) = self.queue.fail(&job_id, "Executor shutdown", false).await {
                warn!(job_id = %job_id, "Failed to record shutdown failure: {e}");
            }
        }
        self.sensor.cleanup_old_outputs(24);
        info!("Executor resources cleaned up");
    }

    /// Broadcast resource usage for a job until it leaves the active set.
    fn spawn_monitor(
        self: &Arc<Self>,
        job_id: String,
        prompt_id: String,
    ) -> tokio::task::JoinHandle<()> {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if !executor.active.lock().await.contains_key(&job_id) {
                    break;
                }
                let usage = executor.sensor.sample();
                executor
                    .bus
                    .broadcast_to_prompt(
                        &prompt_id,
                        ProgressEvent::ResourceUpdate {
                            prompt_id: prompt_id.clone(),
                            cpu_percent: usage.cpu_percent,
                            memory_percent: usage.memory_percent,
                            gpu_percent: usage.gpu_memory_percent(),
                        },
                    )
                    .await;
                tokio::time::sleep(executor.config.check_interval).await;
            }
        })
    }

    async fn record_execution(
        &self,
        job: &Job,
        status: &str,
        images: &[String],
        error_message: Option<&str>,
    ) {
        let record = ExecutionRecord {
            id: job.job_id.clone(),
            workflow_id: job.workflow_id.clone(),
            prompt_id: job.prompt_id.clone(),
            status: status.to_string(),
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: matches!(status, "completed" | "failed" | "timed_out" | "cancelled")
                .then(Utc::now),
            image_urls: images.to_vec(),
            error: error_message.map(str::to_string),
        };
        if let Err(e) = self.executions.record(&record).await {
            warn!(job_id = %job.job_id, "Failed to write execution record: {e}");
        }
    }
}

/// Shape of a job's workload for cost estimation.
fn workload_profile(job: &Job) -> WorkloadProfile {
    let nodes = job
        .workflow
        .as_object()
        .map_or(10, |workflow| workflow.len());
    let param = |key: &str, default: u32| {
        job.parameters
            .get(key)
            .and_then(|v| v.as_u64())
            .map_or(default, |v| v as u32)
    };
    WorkloadProfile {
        nodes,
        width: param("width", 512),
        height: param("height", 512),
        batch_size: param("batch_size", 1),
        steps: param("steps", 20),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{RunOutput, WorkflowRunner};
    use async_trait::async_trait;
    use database::SqliteExecutionStore;
    use serde_json::json;
    use std::collections::VecDeque;
    use task_queue::{JobPriority, JobState};

    /// Scripted runner: pops one outcome per call, optionally emitting
    /// progress first.
    struct StubRunner {
        script: Mutex<VecDeque<Result<RunOutput, RunError>>>,
        emit_progress: bool,
        delay: Duration,
    }

    impl StubRunner {
        fn new(script: Vec<Result<RunOutput, RunError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                emit_progress: false,
                delay: Duration::ZERO,
            }
        }

        fn with_progress(mut self) -> Self {
            self.emit_progress = true;
            self
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn ok(images: Vec<&str>) -> Result<RunOutput, RunError> {
            Ok(RunOutput {
                images: images.into_iter().map(String::from).collect(),
            })
        }
    }

    #[async_trait]
    impl WorkflowRunner for StubRunner {
        async fn run(
            &self,
            job: &Job,
            tracker: Arc<ProgressTracker>,
        ) -> Result<RunOutput, RunError> {
            if self.delay > Duration::ZERO {
                tokio::time::sleep(self.delay).await;
            }
            if self.emit_progress {
                tracker.update_progress(&job.prompt_id, 1, None, None).await;
            }
            self.script
                .lock()
                .await
                .pop_front()
                .expect("runner called more times than scripted")
        }
    }

    struct Harness {
        queue: Arc<DurableQueue>,
        bus: Arc<ProgressBus>,
        executor: Arc<JobExecutor>,
        _dir: tempfile::TempDir,
    }

    async fn harness(runner: StubRunner, config: ExecutorConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(
            DurableQueue::open(dir.path().join("queue"), 100)
                .await
                .unwrap(),
        );
        let bus = Arc::new(ProgressBus::new(16));
        let sensor = Arc::new(ResourceSensor::new(dir.path().join("outputs")));
        let executions = Arc::new(SqliteExecutionStore::new(
            database::connect_in_memory().await.unwrap(),
        ));
        let executor = Arc::new(JobExecutor::new(
            Arc::clone(&queue),
            Arc::new(runner),
            Arc::clone(&bus),
            sensor,
            executions,
            config,
        ));
        Harness {
            queue,
            bus,
            executor,
            _dir: dir,
        }
    }

    fn job() -> Job {
        Job::new(
            "wf-1",
            json!({"17": {"class_type": "KSampler", "inputs": {}}}),
            json!({"steps": 4, "width": 512, "height": 512}),
            JobPriority::Normal,
        )
    }

    #[tokio::test]
    async fn test_successful_execution_completes_job() {
        let h = harness(
            StubRunner::new(vec![StubRunner::ok(vec!["/api/images/p_out.png"])]),
            ExecutorConfig::default(),
        )
        .await;

        h.queue.enqueue(job()).await.unwrap();
        let running = h.queue.dequeue().await.unwrap().unwrap();
        h.executor.execute(running.clone()).await.unwrap();

        let done = h.queue.get(&running.job_id).await.unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.result.unwrap().images, vec!["/api/images/p_out.png"]);
        assert_eq!(h.executor.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_transient_failure_then_success_retries_once() {
        let h = harness(
            StubRunner::new(vec![
                Err(RunError::Connection("connection refused".into())),
                StubRunner::ok(vec!["/api/images/p_out.png"]),
            ]),
            ExecutorConfig::default(),
        )
        .await;

        h.queue.enqueue(job()).await.unwrap();

        let first = h.queue.dequeue().await.unwrap().unwrap();
        assert!(h.executor.execute(first.clone()).await.is_err());
        assert_eq!(
            h.queue.get(&first.job_id).await.unwrap().state,
            JobState::Retrying
        );

        let second = h.queue.dequeue().await.unwrap().unwrap();
        assert_eq!(second.job_id, first.job_id);
        h.executor.execute(second.clone()).await.unwrap();

        let done = h.queue.get(&second.job_id).await.unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.retry_count, 1);
    }

    #[tokio::test]
    async fn test_persistent_transient_failure_exhausts_retries() {
        let script = (0..4)
            .map(|_| Err(RunError::Connection("connection refused".into())))
            .collect();
        let h = harness(StubRunner::new(script), ExecutorConfig::default()).await;

        h.queue.enqueue(job()).await.unwrap();

        // max_retries (3) + 1 attempts in total.
        for _ in 0..4 {
            let running = h.queue.dequeue().await.unwrap().unwrap();
            let _ = h.executor.execute(running).await;
        }

        let stats = h.queue.stats().await;
        assert_eq!(stats.depths.dead_letter, 1);
        assert!(h.queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deterministic_failure_is_not_retried() {
        let h = harness(
            StubRunner::new(vec![Err(RunError::Runtime("missing custom node".into()))]),
            ExecutorConfig::default(),
        )
        .await;

        h.queue.enqueue(job()).await.unwrap();
        let running = h.queue.dequeue().await.unwrap().unwrap();
        let _ = h.executor.execute(running.clone()).await;

        let done = h.queue.get(&running.job_id).await.unwrap();
        assert_eq!(done.state, JobState::Failed);
        assert_eq!(done.retry_count, 0);
        assert_eq!(h.queue.stats().await.depths.dead_letter, 1);
    }

    #[tokio::test]
    async fn test_timeout_interrupts_execution() {
        let config = ExecutorConfig {
            default_timeout: Duration::from_millis(50),
            ..ExecutorConfig::default()
        };
        let h = harness(
            StubRunner::new(vec![StubRunner::ok(vec![])])
                .with_delay(Duration::from_secs(30)),
            config,
        )
        .await;

        h.queue.enqueue(job()).await.unwrap();
        let running = h.queue.dequeue().await.unwrap().unwrap();
        let err = h.executor.execute(running.clone()).await.unwrap_err();
        assert!(matches!(err, ExecutionError::DeadlineExceeded(_)));

        // Timeouts are transient: the job goes back for another attempt.
        let after = h.queue.get(&running.job_id).await.unwrap();
        assert_eq!(after.state, JobState::Retrying);
        assert_eq!(after.retry_count, 1);
    }

    #[tokio::test]
    async fn test_admission_denied_at_concurrency_cap() {
        let config = ExecutorConfig {
            max_concurrent_jobs: 0,
            ..ExecutorConfig::default()
        };
        let h = harness(StubRunner::new(vec![]), config).await;

        h.queue.enqueue(job()).await.unwrap();
        let running = h.queue.dequeue().await.unwrap().unwrap();
        let err = h.executor.execute(running.clone()).await.unwrap_err();
        assert!(matches!(err, ExecutionError::AdmissionDenied(_)));

        assert_eq!(
            h.queue.get(&running.job_id).await.unwrap().state,
            JobState::Retrying
        );
        assert!(!h.executor.can_accept().await);
    }

    #[tokio::test]
    async fn test_subscriber_sees_lifecycle_events() {
        let h = harness(
            StubRunner::new(vec![StubRunner::ok(vec!["/api/images/p_out.png"])])
                .with_progress(),
            ExecutorConfig::default(),
        )
        .await;

        h.queue.enqueue(job()).await.unwrap();
        let running = h.queue.dequeue().await.unwrap().unwrap();

        let mut rx = h
            .bus
            .subscribe("client-1", Some(running.prompt_id.clone()), None)
            .await
            .unwrap();

        h.executor.execute(running).await.unwrap();

        let mut saw_started = false;
        let mut saw_progress = false;
        let mut completion = None;
        while let Ok(event) = rx.try_recv() {
            match event {
                ProgressEvent::ExecutionStarted { .. } => saw_started = true,
                ProgressEvent::ProgressUpdate { .. } => saw_progress = true,
                ProgressEvent::ExecutionComplete { status, images, .. } => {
                    completion = Some((status, images));
                }
                _ => {}
            }
        }
        assert!(saw_started);
        assert!(saw_progress);
        let (status, images) = completion.expect("missing completion event");
        assert_eq!(status, "completed");
        assert_eq!(images.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_flight_emits_cancelled_event() {
        let h = harness(
            StubRunner::new(vec![StubRunner::ok(vec![])]).with_delay(Duration::from_millis(200)),
            ExecutorConfig::default(),
        )
        .await;

        h.queue.enqueue(job()).await.unwrap();
        let running = h.queue.dequeue().await.unwrap().unwrap();
        let mut rx = h
            .bus
            .subscribe("client-1", Some(running.prompt_id.clone()), None)
            .await
            .unwrap();

        let executor = Arc::clone(&h.executor);
        let job_id = running.job_id.clone();
        let handle = tokio::spawn(async move { executor.execute(running).await });

        // Cancel while the run is in flight; the run itself keeps going.
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.queue.request_cancel(&job_id).await.unwrap();

        handle.await.unwrap().unwrap();

        let record = h.queue.get(&job_id).await.unwrap();
        assert_eq!(record.state, JobState::Cancelled);
        assert_eq!(h.executor.active_count().await, 0);

        let mut cancelled_seen = false;
        while let Ok(event) = rx.try_recv() {
            if let ProgressEvent::ExecutionComplete { status, .. } = event {
                cancelled_seen = status == "cancelled";
            }
        }
        assert!(cancelled_seen, "no cancelled completion event observed");
    }

    #[tokio::test]
    async fn test_cleanup_fails_active_jobs() {
        let h = harness(
            StubRunner::new(vec![StubRunner::ok(vec![])]).with_delay(Duration::from_secs(30)),
            ExecutorConfig::default(),
        )
        .await;

        h.queue.enqueue(job()).await.unwrap();
        let running = h.queue.dequeue().await.unwrap().unwrap();

        let executor = Arc::clone(&h.executor);
        let handle = tokio::spawn(async move { executor.execute(running).await });

        // Give the execution a moment to register.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.executor.active_count().await, 1);

        h.executor.cleanup_resources().await;
        assert_eq!(h.executor.active_count().await, 0);
        handle.abort();
    }
}
