//! Liveness and pipeline health.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use docket_pipeline::PipelineHealth;

use crate::AppState;

/// Liveness check. Never touches external capabilities; on Postgres it
/// reports pool occupancy.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "store": state.store,
    });
    if let Some(db) = &state.database {
        body["pool"] = serde_json::json!(db.pool_status());
    }
    Json(body)
}

/// Parser and executor reachability, worker status and queue depth.
pub async fn pipeline_health(State(state): State<AppState>) -> Json<PipelineHealth> {
    Json(state.pipeline.health().await)
}
