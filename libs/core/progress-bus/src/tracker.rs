//! Per-prompt execution progress with ETA estimation.

use crate::bus::ProgressBus;
use crate::events::ProgressEvent;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

struct ProgressState {
    started_at: DateTime<Utc>,
    current_step: u32,
    total_steps: u32,
}

/// Emits the execution lifecycle events for a prompt through the bus,
/// deriving percentage and ETA from step counts.
pub struct ProgressTracker {
    bus: Arc<ProgressBus>,
    states: Mutex<HashMap<String, ProgressState>>,
}

impl ProgressTracker {
    pub fn new(bus: Arc<ProgressBus>) -> Self {
        Self {
            bus,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Mark execution start and notify subscribers.
    pub async fn start_execution(&self, prompt_id: &str, total_steps: u32) {
        let total_steps = total_steps.max(1);
        self.states.lock().await.insert(
            prompt_id.to_string(),
            ProgressState {
                started_at: Utc::now(),
                current_step: 0,
                total_steps,
            },
        );

        self.bus
            .broadcast_to_prompt(
                prompt_id,
                ProgressEvent::ExecutionStarted {
                    prompt_id: prompt_id.to_string(),
                    total_steps,
                },
            )
            .await;
    }

    /// Update progress for a running prompt. Unknown prompts are ignored.
    pub async fn update_progress(
        &self,
        prompt_id: &str,
        current_step: u32,
        current_node: Option<String>,
        preview_image: Option<String>,
    ) {
        let event = {
            let mut states = self.states.lock().await;
            let Some(state) = states.get_mut(prompt_id) else {
                return;
            };
            state.current_step = current_step;

            let percentage =
                f64::from(current_step) / f64::from(state.total_steps) * 100.0;
            let eta_seconds = if current_step > 0 {
                let elapsed = (Utc::now() - state.started_at)
                    .to_std()
                    .unwrap_or_default()
                    .as_secs_f64();
                let per_step = elapsed / f64::from(current_step);
                let remaining = state.total_steps.saturating_sub(current_step);
                Some((per_step * f64::from(remaining)) as u64)
            } else {
                None
            };

            ProgressEvent::ProgressUpdate {
                prompt_id: prompt_id.to_string(),
                current_step,
                total_steps: state.total_steps,
                percentage,
                current_node,
                eta_seconds,
                preview_image,
            }
        };

        self.bus.broadcast_to_prompt(prompt_id, event).await;
    }

    /// Mark execution complete (or failed) and drop the tracked state.
    pub async fn complete_execution(
        &self,
        prompt_id: &str,
        images: Option<Vec<String>>,
        error: Option<String>,
    ) {
        let total_time = {
            let mut states = self.states.lock().await;
            states
                .remove(prompt_id)
                .map(|state| {
                    (Utc::now() - state.started_at)
                        .to_std()
                        .unwrap_or_default()
                        .as_secs_f64()
                })
        };

        let status = if error.is_some() { "failed" } else { "completed" };
        self.bus
            .broadcast_to_prompt(
                prompt_id,
                ProgressEvent::ExecutionComplete {
                    prompt_id: prompt_id.to_string(),
                    status: status.to_string(),
                    images,
                    error,
                    total_time,
                },
            )
            .await;
    }

    /// Notify subscribers that the job was cancelled before completion.
    pub async fn cancel_execution(&self, prompt_id: &str) {
        let total_time = {
            let mut states = self.states.lock().await;
            states.remove(prompt_id).map(|state| {
                (Utc::now() - state.started_at)
                    .to_std()
                    .unwrap_or_default()
                    .as_secs_f64()
            })
        };

        self.bus
            .broadcast_to_prompt(
                prompt_id,
                ProgressEvent::ExecutionComplete {
                    prompt_id: prompt_id.to_string(),
                    status: "cancelled".to_string(),
                    images: None,
                    error: None,
                    total_time,
                },
            )
            .await;
    }

    /// Push a queue position update.
    pub async fn send_queue_update(&self, prompt_id: &str, queue_position: i64) {
        self.bus
            .broadcast_to_prompt(
                prompt_id,
                ProgressEvent::QueueUpdate {
                    prompt_id: prompt_id.to_string(),
                    queue_position,
                },
            )
            .await;
    }
}
