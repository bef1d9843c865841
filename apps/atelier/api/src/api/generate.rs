//! Generation endpoints: submit, status, cancel, image serving.

use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine;
use domain_generation::{inject_parameters, resolve_seed, GenerateRequest};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;
use std::time::Duration;
use task_queue::{Job, JobPriority, JobState};
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

fn default_wait() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct GenerateQuery {
    #[serde(default = "default_wait")]
    pub wait: bool,
    #[serde(default)]
    pub priority: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct GenerateResponse {
    pub prompt_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images_base64: Option<Vec<String>>,
}

/// POST /api/generate?wait={bool}&priority={high|normal|low}
///
/// Validates and normalizes the parameters, stages any input image,
/// injects everything into the configured workflow template, and enqueues
/// a job. With `wait=true` (the default) the call blocks until the job
/// reaches a terminal state or the task timeout elapses.
pub async fn generate(
    State(state): State<AppState>,
    Query(query): Query<GenerateQuery>,
    Json(request): Json<GenerateRequest>,
) -> Result<Response, ApiError> {
    let mut request = request.validate_and_normalize()?;

    if let Some(raw) = request.input_image.clone() {
        request.input_image = Some(stage_input_image(&state, &raw).await?);
    }

    // Unknown priority strings fall back to normal.
    let priority = query
        .priority
        .as_deref()
        .and_then(|p| JobPriority::from_str(&p.to_lowercase()).ok())
        .unwrap_or_default();

    let template = state
        .workflow_template
        .clone()
        .ok_or_else(|| {
            ApiError::BadRequest(
                "No workflow available. Configure WORKFLOW_PATH or deploy a workflow."
                    .to_string(),
            )
        })?;

    // Resolve the seed before injection so the recorded job carries the
    // value actually used.
    let mut parameters = serde_json::to_value(&request)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    parameters["seed"] = json!(resolve_seed(request.seed));

    let workflow = inject_parameters(&template, &parameters);
    let job = Job::new(
        state.config.workflow_id.clone(),
        workflow,
        parameters,
        priority,
    );
    let prompt_id = job.prompt_id.clone();
    let task_id = job.job_id.clone();

    state.queue.enqueue(job).await?;
    info!(task_id = %task_id, priority = %priority, "Enqueued generation job");

    if !query.wait {
        return Ok((
            StatusCode::ACCEPTED,
            Json(GenerateResponse {
                prompt_id,
                status: "queued".to_string(),
                task_id: Some(task_id),
                images: None,
                images_base64: None,
            }),
        )
            .into_response());
    }

    wait_for_job(&state, &prompt_id, &task_id, request.return_base64).await
}

/// Poll the queue record until the job finishes or the budget elapses.
async fn wait_for_job(
    state: &AppState,
    prompt_id: &str,
    task_id: &str,
    return_base64: bool,
) -> Result<Response, ApiError> {
    let deadline = tokio::time::Instant::now() + state.config.task_timeout;

    loop {
        let Some(job) = state.queue.get(task_id).await else {
            return Err(ApiError::Internal(format!(
                "Job record disappeared: {task_id}"
            )));
        };

        match job.state {
            JobState::Completed => {
                let images = job.result.map(|r| r.images).unwrap_or_default();
                let images_base64 = if return_base64 {
                    Some(encode_images(state, &images).await)
                } else {
                    None
                };
                return Ok((
                    StatusCode::OK,
                    Json(GenerateResponse {
                        prompt_id: prompt_id.to_string(),
                        status: "completed".to_string(),
                        task_id: Some(task_id.to_string()),
                        images: Some(images),
                        images_base64,
                    }),
                )
                    .into_response());
            }
            JobState::Failed | JobState::TimedOut => {
                let message = job.error.unwrap_or_else(|| "unknown error".to_string());
                return Err(ApiError::Internal(format!("Task failed: {message}")));
            }
            JobState::Cancelled => {
                return Err(ApiError::BadRequest("Task was cancelled".to_string()));
            }
            _ => {}
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(ApiError::Timeout("Task execution timeout".to_string()));
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Stage an input image into `INPUT_DIR` and return the filename the
/// workflow should reference.
async fn stage_input_image(state: &AppState, raw: &str) -> Result<String, ApiError> {
    let input_dir = &state.config.input_dir;
    tokio::fs::create_dir_all(input_dir)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    if raw.starts_with("http://") || raw.starts_with("https://") {
        let response = state
            .http
            .get(raw)
            .send()
            .await
            .map_err(|e| ApiError::BadRequest(format!("Failed to download image: {e}")))?;
        if !response.status().is_success() {
            return Err(ApiError::BadRequest(format!(
                "Failed to download image from {raw}"
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("Failed to download image: {e}")))?;

        let filename = format!("url_{}.png", short_id());
        tokio::fs::write(input_dir.join(&filename), &bytes)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        info!(filename = %filename, "Staged input image from URL");
        return Ok(filename);
    }

    if raw.starts_with("data:image") {
        let encoded = raw
            .split_once(',')
            .map(|(_, data)| data)
            .ok_or_else(|| ApiError::BadRequest("Malformed data URI".to_string()))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| ApiError::BadRequest(format!("Invalid base64 image data: {e}")))?;

        let filename = format!("input_{}.png", short_id());
        tokio::fs::write(input_dir.join(&filename), &bytes)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        info!(filename = %filename, "Staged inline input image");
        return Ok(filename);
    }

    // A path: keep only the basename, the runtime mounts the input dir.
    if raw.contains('/') || raw.contains('\\') {
        let basename = std::path::Path::new(raw)
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| ApiError::BadRequest("Invalid input image path".to_string()))?;
        return Ok(basename.to_string());
    }

    Ok(raw.to_string())
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Read produced images back as data URIs. Per-file failures are skipped.
async fn encode_images(state: &AppState, urls: &[String]) -> Vec<String> {
    let mut encoded = Vec::with_capacity(urls.len());
    for url in urls {
        let Some(filename) = url.rsplit('/').next() else {
            continue;
        };
        let path = state.config.output_dir.join(filename);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let data = base64::engine::general_purpose::STANDARD.encode(bytes);
                encoded.push(format!("data:image/png;base64,{data}"));
            }
            Err(e) => warn!(path = %path.display(), "Failed to encode image: {e}"),
        }
    }
    encoded
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StatusResponse {
    pub prompt_id: String,
    pub task_id: String,
    pub status: String,
    pub created_at: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub retry_count: u32,
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

/// GET /api/status/{prompt_id}
pub async fn status(
    State(state): State<AppState>,
    Path(prompt_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let job = state
        .queue
        .find_by_prompt(&prompt_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Unknown prompt: {prompt_id}")))?;

    let images = (job.state == JobState::Completed)
        .then(|| job.result.as_ref().map(|r| r.images.clone()))
        .flatten();

    Ok(Json(StatusResponse {
        prompt_id,
        task_id: job.job_id,
        status: job.state.to_string(),
        created_at: Some(job.created_at.to_rfc3339()),
        started_at: job.started_at.map(|t| t.to_rfc3339()),
        completed_at: job.completed_at.map(|t| t.to_rfc3339()),
        retry_count: job.retry_count,
        error_message: job.error,
        images,
    }))
}

/// POST /api/cancel/{prompt_id}
///
/// Queued jobs are cancelled outright. A job already processing is only
/// marked in the queue; the in-flight run is not interrupted, and the
/// cancelled completion event goes out once the executor notices.
pub async fn cancel(
    State(state): State<AppState>,
    Path(prompt_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job = state
        .queue
        .find_by_prompt(&prompt_id)
        .await
        .ok_or_else(|| {
            ApiError::NotFound("Job not found or already completed".to_string())
        })?;

    match job.state {
        JobState::Pending | JobState::Queued => {
            state.queue.cancel(&job.job_id).await?;
        }
        JobState::Processing => {
            state.queue.request_cancel(&job.job_id).await?;
        }
        _ => {
            return Err(ApiError::NotFound(
                "Job not found or already completed".to_string(),
            ));
        }
    }

    info!(task_id = %job.job_id, "Cancellation accepted");
    Ok(Json(json!({
        "status": "cancelled",
        "prompt_id": prompt_id,
        "task_id": job.job_id,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ImageQuery {
    #[serde(default)]
    pub format: Option<String>,
}

/// GET /api/images/{filename}?format={file|base64}
pub async fn image(
    State(state): State<AppState>,
    Path(filename): Path<String>,
    Query(query): Query<ImageQuery>,
) -> Result<Response, ApiError> {
    if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
        return Err(ApiError::BadRequest("Invalid filename".to_string()));
    }

    let path = state.config.output_dir.join(&filename);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| ApiError::NotFound("Image not found".to_string()))?;

    if query.format.as_deref() == Some("base64") {
        let data = base64::engine::general_purpose::STANDARD.encode(&bytes);
        return Ok(Json(json!({
            "filename": filename,
            "base64": format!("data:image/png;base64,{data}"),
        }))
        .into_response());
    }

    Ok(([(header::CONTENT_TYPE, "image/png")], bytes).into_response())
}
