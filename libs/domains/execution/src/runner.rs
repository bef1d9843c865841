//! The runner seam: one job against one runtime container.

use crate::error::RunError;
use async_trait::async_trait;
use domain_containers::ContainerSupervisor;
use domain_generation::{InferenceClient, RuntimeState, RuntimeStatus};
use progress_bus::ProgressTracker;
use std::sync::Arc;
use std::time::Duration;
use task_queue::Job;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Artifacts of a successful run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// URLs under the local image-serving endpoint.
    pub images: Vec<String>,
}

/// Executes one job against the inference plane, reporting progress
/// through the tracker as it goes.
#[async_trait]
pub trait WorkflowRunner: Send + Sync {
    async fn run(&self, job: &Job, tracker: Arc<ProgressTracker>) -> Result<RunOutput, RunError>;
}

/// Production runner: resolve the runtime container for the job's
/// workflow, submit, then wait the prompt to completion through the
/// inference client, forwarding its poll reports to the tracker.
pub struct RuntimeWorkflowRunner {
    supervisor: Arc<ContainerSupervisor>,
    client: InferenceClient,
    /// When set, all jobs run against this fixed runtime URL and the
    /// supervisor is bypassed (the COMFYUI_URL escape hatch).
    runtime_url_override: Option<String>,
    wait_timeout: Duration,
}

impl RuntimeWorkflowRunner {
    pub fn new(
        supervisor: Arc<ContainerSupervisor>,
        client: InferenceClient,
        runtime_url_override: Option<String>,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            supervisor,
            client,
            runtime_url_override,
            wait_timeout,
        }
    }
}

#[async_trait]
impl WorkflowRunner for RuntimeWorkflowRunner {
    async fn run(&self, job: &Job, tracker: Arc<ProgressTracker>) -> Result<RunOutput, RunError> {
        let base_url = match &self.runtime_url_override {
            Some(url) => url.clone(),
            None => self.supervisor.ensure(&job.workflow_id).await?,
        };

        let runtime_prompt_id = self
            .client
            .submit(&base_url, &job.workflow, &job.job_id)
            .await?;
        debug!(job_id = %job.job_id, runtime_prompt_id = %runtime_prompt_id, "Runtime accepted job");

        // The client's poll hook is synchronous; bridge it onto the async
        // tracker through a channel drained by a pump task.
        let (poll_tx, mut poll_rx) = mpsc::unbounded_channel::<RuntimeStatus>();
        let pump = {
            let tracker = Arc::clone(&tracker);
            let prompt_id = job.prompt_id.clone();
            let total_steps = job.steps();
            tokio::spawn(async move {
                let mut polls = 0u32;
                while let Some(status) = poll_rx.recv().await {
                    match status.state {
                        RuntimeState::Running => {
                            // The runtime's status endpoints expose no step
                            // counter; advance one step per poll as a coarse
                            // progress signal.
                            polls += 1;
                            tracker
                                .update_progress(&prompt_id, polls.min(total_steps), None, None)
                                .await;
                        }
                        RuntimeState::Pending => {
                            if let Some(position) = status.queue_position {
                                tracker.send_queue_update(&prompt_id, position as i64).await;
                            }
                        }
                        _ => {}
                    }
                }
            })
        };

        let outcome = self
            .client
            .wait_for_completion(
                &base_url,
                &runtime_prompt_id,
                self.wait_timeout,
                move |status| {
                    let _ = poll_tx.send(status.clone());
                },
            )
            .await;

        // The hook (and its sender) died with the wait; drain queued
        // reports before handing back a terminal result so subscribers see
        // them in order.
        let _ = pump.await;

        let outcome = outcome?;
        info!(job_id = %job.job_id, images = outcome.images.len(), "Run completed");
        Ok(RunOutput {
            images: outcome.images,
        })
    }
}
