//! Host resource introspection.

use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

/// GET /api/resources/status
pub async fn status(State(state): State<AppState>) -> Json<Value> {
    let usage = state.sensor.sample();
    let system_info = state.sensor.system_info();
    let limits = state.executor.config();

    Json(json!({
        "current_usage": usage,
        "system_info": system_info,
        "resource_limits": {
            "max_cpu_percent": limits.max_cpu_percent,
            "max_memory_percent": limits.max_memory_percent,
            "max_disk_percent": limits.max_disk_percent,
            "max_concurrent_jobs": limits.max_concurrent_jobs,
            "task_timeout_seconds": limits.default_timeout.as_secs(),
        },
    }))
}
