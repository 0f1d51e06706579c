//! Schema registry handlers.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use uuid::Uuid;

use docket_pipeline::{PublishSchemaRequest, PublishedSchema, Schema, SchemaKey};

use crate::{ApiError, AppState, Caller};

/// Publish a schema definition.
///
/// # Returns
/// - 201 Created when a new version was stored
/// - 200 OK when an identical definition already existed under the ref
/// - 400 Bad Request if the definition is not a JSON object
pub async fn publish_schema(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<PublishSchemaRequest>,
) -> Result<(StatusCode, Json<PublishedSchema>), ApiError> {
    let published = state.pipeline.publish_schema(caller.credential(), req).await?;
    let status = if published.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(published)))
}

/// Latest version of every schema.
pub async fn list_schemas(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<Json<Vec<Schema>>, ApiError> {
    Ok(Json(state.pipeline.list_schemas(caller.credential()).await?))
}

pub async fn list_versions(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Schema>>, ApiError> {
    Ok(Json(state.pipeline.schema_versions(caller.credential(), id).await?))
}

pub async fn get_schema(
    State(state): State<AppState>,
    caller: Caller,
    Path((id, version)): Path<(Uuid, i32)>,
) -> Result<Json<Schema>, ApiError> {
    let schema = state
        .pipeline
        .get_schema(caller.credential(), SchemaKey { id, version })
        .await?;
    Ok(Json(schema))
}
