//! OpenAPI document assembly.

use axum::Json;
use domain_generation::{GenerateRequest, SamplerName, Scheduler};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Atelier API",
        description = "Queued execution plane for containerized image-generation workflows",
    ),
    components(schemas(
        GenerateRequest,
        SamplerName,
        Scheduler,
        crate::api::generate::GenerateResponse,
        crate::api::generate::StatusResponse,
        crate::error::ErrorResponse,
    ))
)]
pub struct ApiDoc;

/// GET /api/openapi.json
pub async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
