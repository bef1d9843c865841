//! Queue introspection endpoints.

use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};

/// GET /api/queue/status
pub async fn queue_status(State(state): State<AppState>) -> Json<Value> {
    let stats = state.queue.stats().await;

    Json(json!({
        "status": "active",
        "statistics": stats,
        "queue_sizes": {
            "high_priority": stats.depths.high,
            "normal_priority": stats.depths.normal,
            "low_priority": stats.depths.low,
            "total": stats.depths.total(),
        },
        "dead_letter_queue_size": stats.depths.dead_letter,
    }))
}

/// GET /api/queue/{task_id}: the full job record.
pub async fn task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let job = state
        .queue
        .get(&task_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Task not found: {task_id}")))?;

    Ok(Json(json!({
        "task_id": job.job_id,
        "prompt_id": job.prompt_id,
        "status": job.state.to_string(),
        "priority": job.priority.to_string(),
        "workflow_id": job.workflow_id,
        "created_at": job.created_at.to_rfc3339(),
        "started_at": job.started_at.map(|t| t.to_rfc3339()),
        "completed_at": job.completed_at.map(|t| t.to_rfc3339()),
        "retry_count": job.retry_count,
        "max_retries": job.max_retries,
        "queue_position": state.queue.position(&job.job_id).await,
        "error_message": job.error,
        "result": job.result,
    })))
}
