//! Route table.

use crate::state::AppState;
use axum::routing::{get, post};
use axum::Router;

pub mod builds;
pub mod generate;
pub mod health;
pub mod queue;
pub mod resources;
pub mod workers;
pub mod ws;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/generate", post(generate::generate))
        .route("/api/status/{prompt_id}", get(generate::status))
        .route("/api/cancel/{prompt_id}", post(generate::cancel))
        .route("/api/images/{filename}", get(generate::image))
        .route("/api/queue/status", get(queue::queue_status))
        .route("/api/queue/{task_id}", get(queue::task_status))
        .route("/api/workers/status", get(workers::status))
        .route("/api/workers/pause", post(workers::pause))
        .route("/api/workers/resume", post(workers::resume))
        .route("/api/workers/scale", post(workers::scale))
        .route("/api/resources/status", get(resources::status))
        .route("/api/builds", post(builds::create))
        .route("/api/builds/{build_id}/logs", get(builds::logs))
        .route("/ws/{prompt_id}", get(ws::websocket_progress))
        .route("/api/openapi.json", get(crate::openapi::openapi_json))
        .route("/health", get(health::health))
        .route("/metrics", get(observability::metrics_handler))
        .with_state(state)
}
