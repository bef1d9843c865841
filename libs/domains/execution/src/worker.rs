//! The cooperative worker loop.

use crate::executor::JobExecutor;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use task_queue::{DurableQueue, Job};
use tokio::sync::Mutex;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Processing,
    Paused,
    Stopping,
    Stopped,
    Error,
}

/// Introspectable worker record.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub state: WorkerState,
    pub current_job: Option<String>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub started_at: DateTime<Utc>,
    pub last_job_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// One worker: pulls jobs from the queue and hands them to the shared
/// executor, sleeping `poll_interval` whenever there is nothing to do.
pub struct Worker {
    worker_id: String,
    queue: Arc<DurableQueue>,
    executor: Arc<JobExecutor>,
    poll_interval: Duration,
    running: AtomicBool,
    paused: AtomicBool,
    info: Mutex<WorkerInfo>,
}

impl Worker {
    pub fn new(
        worker_id: impl Into<String>,
        queue: Arc<DurableQueue>,
        executor: Arc<JobExecutor>,
        poll_interval: Duration,
    ) -> Self {
        let worker_id = worker_id.into();
        info!(worker_id = %worker_id, "Worker initialized");
        Self {
            info: Mutex::new(WorkerInfo {
                worker_id: worker_id.clone(),
                state: WorkerState::Idle,
                current_job: None,
                tasks_completed: 0,
                tasks_failed: 0,
                started_at: Utc::now(),
                last_job_at: None,
                error_message: None,
            }),
            worker_id,
            queue,
            executor,
            poll_interval,
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// The worker loop. Returns once `stop` is called.
    pub async fn run(self: Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        self.set_state(WorkerState::Idle).await;
        info!(worker_id = %self.worker_id, "Worker started");

        while self.running.load(Ordering::SeqCst) {
            if self.paused.load(Ordering::SeqCst) {
                self.set_state(WorkerState::Paused).await;
                tokio::time::sleep(self.poll_interval).await;
                continue;
            }

            if !self.executor.can_accept().await {
                tokio::time::sleep(self.poll_interval).await;
                continue;
            }

            match self.queue.dequeue().await {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => {
                    {
                        let mut info = self.info.lock().await;
                        info.state = WorkerState::Idle;
                        info.current_job = None;
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(e) => {
                    error!(worker_id = %self.worker_id, "Dequeue failed: {e}");
                    {
                        let mut info = self.info.lock().await;
                        info.state = WorkerState::Error;
                        info.error_message = Some(e.to_string());
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        self.set_state(WorkerState::Stopped).await;
        info!(worker_id = %self.worker_id, "Worker stopped");
    }

    async fn process(&self, job: Job) {
        info!(worker_id = %self.worker_id, job_id = %job.job_id, "Processing job");
        {
            let mut info = self.info.lock().await;
            info.state = WorkerState::Processing;
            info.current_job = Some(job.job_id.clone());
        }

        let result = {
            // The executor updates the queue record; the worker only keeps
            // its own counters.
            let executor = Arc::clone(&self.executor);
            executor.execute(job).await
        };

        let mut info = self.info.lock().await;
        info.last_job_at = Some(Utc::now());
        info.current_job = None;
        match result {
            Ok(()) => info.tasks_completed += 1,
            Err(e) => {
                info.tasks_failed += 1;
                info.error_message = Some(e.to_string());
            }
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!(worker_id = %self.worker_id, "Worker paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!(worker_id = %self.worker_id, "Worker resumed");
    }

    /// Signal the loop to exit after the current iteration.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.set_state(WorkerState::Stopping).await;
        info!(worker_id = %self.worker_id, "Worker stopping");
    }

    pub async fn info(&self) -> WorkerInfo {
        self.info.lock().await.clone()
    }

    pub async fn is_idle(&self) -> bool {
        matches!(
            self.info.lock().await.state,
            WorkerState::Idle | WorkerState::Paused
        )
    }

    async fn set_state(&self, state: WorkerState) {
        self.info.lock().await.state = state;
    }
}
