//! Worker pool introspection and control.

use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::Json;
use domain_execution::PoolError;
use serde::Deserialize;
use serde_json::{json, Value};

/// GET /api/workers/status
pub async fn status(State(state): State<AppState>) -> Json<Value> {
    let pool_status = state.pool.status().await;
    let queue_stats = state.queue.stats().await;
    let usage = state.sensor.sample();
    let active_jobs = state.executor.active_jobs().await;

    Json(json!({
        "running": pool_status.worker_count > 0,
        "pool_status": {
            "workers": pool_status.workers,
            "worker_count": pool_status.worker_count,
            "min_workers": pool_status.min_workers,
            "max_workers": pool_status.max_workers,
            "queue_size": pool_status.queue_depth,
            "queue_stats": queue_stats,
            "resources": {
                "cpu_percent": usage.cpu_percent,
                "memory_percent": usage.memory_percent,
                "memory_available_mb": usage.memory_available_mb,
            },
        },
        "active_jobs": active_jobs,
    }))
}

/// POST /api/workers/pause
pub async fn pause(State(state): State<AppState>) -> Json<Value> {
    state.pool.pause_all().await;
    Json(json!({
        "status": "paused",
        "message": "All workers have been paused",
    }))
}

/// POST /api/workers/resume
pub async fn resume(State(state): State<AppState>) -> Json<Value> {
    state.pool.resume_all().await;
    Json(json!({
        "status": "resumed",
        "message": "All workers have been resumed",
    }))
}

#[derive(Debug, Deserialize)]
pub struct ScaleQuery {
    pub target_workers: usize,
}

/// POST /api/workers/scale?target_workers=N
pub async fn scale(
    State(state): State<AppState>,
    Query(query): Query<ScaleQuery>,
) -> Result<Json<Value>, ApiError> {
    let (previous, current) = state
        .pool
        .scale_to(query.target_workers)
        .await
        .map_err(|e| match e {
            PoolError::OutOfBounds { .. } => ApiError::BadRequest(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        })?;

    let status = match current.cmp(&previous) {
        std::cmp::Ordering::Greater => "scaled_up",
        std::cmp::Ordering::Less => "scaled_down",
        std::cmp::Ordering::Equal => "no_change",
    };

    Ok(Json(json!({
        "status": status,
        "previous_workers": previous,
        "current_workers": current,
    })))
}
