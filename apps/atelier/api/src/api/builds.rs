//! Build record endpoints (the image pipeline itself lives elsewhere;
//! the execution plane only registers builds and serves their logs).

use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use database::{BuildRecord, NewBuild};
use serde::Deserialize;
use serde_json::{json, Value};

/// POST /api/builds: register a pending build.
pub async fn create(
    State(state): State<AppState>,
    Json(input): Json<NewBuild>,
) -> Result<(StatusCode, Json<BuildRecord>), ApiError> {
    if input.workflow_id.trim().is_empty() {
        return Err(ApiError::BadRequest("workflow_id must not be empty".to_string()));
    }
    if input.image_name.trim().is_empty() || input.tag.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "image_name and tag must not be empty".to_string(),
        ));
    }

    let record = state.builds.create(input).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

fn default_limit() -> i64 {
    100
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub since: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

/// GET /api/builds/{build_id}/logs?since=seq&limit=N
pub async fn logs(
    State(state): State<AppState>,
    Path(build_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Value>, ApiError> {
    state
        .builds
        .get(&build_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Build not found: {build_id}")))?;

    let limit = query.limit.clamp(1, 1000);
    let lines = state.builds.fetch_logs(&build_id, query.since, limit).await?;
    let next_since = lines.last().map_or(query.since, |line| line.seq);

    Ok(Json(json!({
        "logs": lines,
        "next_since": next_since,
    })))
}
