//! API error envelope and status-code mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use database::DatabaseError;
use domain_containers::SupervisorError;
use domain_generation::GenerationError;
use serde::Serialize;
use task_queue::QueueError;

/// Error body shared by all endpoints.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
}

/// Surfaced error kinds, one per status code the API can return.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    NotFound(String),
    Timeout(String),
    BuildRequired(String),
    Validation { field: String, message: String },
    Internal(String),
    RuntimeUnavailable(String),
    Capacity(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Self::BuildRequired(_) => StatusCode::CONFLICT,
            Self::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::RuntimeUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::Capacity(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn body(&self) -> ErrorResponse {
        match self {
            Self::BadRequest(message) => ErrorResponse {
                error: "BadRequest",
                message: message.clone(),
            },
            Self::Unauthorized => ErrorResponse {
                error: "Unauthorized",
                message: "Missing or invalid API key".to_string(),
            },
            Self::NotFound(message) => ErrorResponse {
                error: "NotFound",
                message: message.clone(),
            },
            Self::Timeout(message) => ErrorResponse {
                error: "Timeout",
                message: message.clone(),
            },
            Self::BuildRequired(workflow_id) => ErrorResponse {
                error: "BuildRequired",
                message: format!(
                    "No successful container build found for workflow {workflow_id}. \
                     Build the container first."
                ),
            },
            Self::Validation { field, message } => ErrorResponse {
                error: "ValidationError",
                message: format!("{field}: {message}"),
            },
            Self::Internal(message) => ErrorResponse {
                error: "InternalError",
                message: message.clone(),
            },
            Self::RuntimeUnavailable(message) => ErrorResponse {
                error: "RuntimeUnavailable",
                message: message.clone(),
            },
            Self::Capacity(message) => ErrorResponse {
                error: "Capacity",
                message: message.clone(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = %status, "{:?}", self);
        }
        (status, Json(self.body())).into_response()
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Full { capacity } => {
                ApiError::Capacity(format!("Queue full: capacity {capacity} reached"))
            }
            QueueError::NotFound(id) => ApiError::NotFound(format!("Job not found: {id}")),
            QueueError::InvalidTransition { .. } => ApiError::BadRequest(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<GenerationError> for ApiError {
    fn from(e: GenerationError) -> Self {
        match e {
            GenerationError::Validation { field, message } => {
                ApiError::Validation { field, message }
            }
            GenerationError::Timeout(secs) => {
                ApiError::Timeout(format!("Execution timeout after {secs} seconds"))
            }
            GenerationError::Connection(message) => ApiError::RuntimeUnavailable(message),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<SupervisorError> for ApiError {
    fn from(e: SupervisorError) -> Self {
        match e {
            SupervisorError::BuildRequired(workflow_id) => ApiError::BuildRequired(workflow_id),
            other => ApiError::RuntimeUnavailable(other.to_string()),
        }
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound { entity, id } => {
                ApiError::NotFound(format!("{entity} not found: {id}"))
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}
