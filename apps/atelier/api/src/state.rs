//! Shared application state handed to the router at construction.

use crate::config::Config;
use database::BuildStore;
use domain_execution::{JobExecutor, WorkerPool};
use progress_bus::{ProgressBus, ProgressTracker};
use serde_json::Value;
use std::sync::Arc;
use sysmon::ResourceSensor;
use task_queue::DurableQueue;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub queue: Arc<DurableQueue>,
    pub bus: Arc<ProgressBus>,
    pub tracker: Arc<ProgressTracker>,
    pub executor: Arc<JobExecutor>,
    pub pool: Arc<WorkerPool>,
    pub sensor: Arc<ResourceSensor>,
    pub builds: Arc<dyn BuildStore>,
    /// Client for staging input images referenced by URL.
    pub http: reqwest::Client,
    /// Workflow template served by `/api/generate`, when configured.
    pub workflow_template: Option<Arc<Value>>,
}
