use axum::Json;
use serde_json::{json, Value};

/// Liveness check. Always 200 while the process is serving.
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "atelier-api",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
