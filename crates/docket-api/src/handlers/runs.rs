//! Run, overlay and export handlers.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use docket_pipeline::{
    to_jsonl, ExportRecord, Overlay, OverlayFilter, Run, RunRequest, RunResult, SchemaKey,
    JSONL_CONTENT_TYPE,
};

use crate::{ApiError, AppState, Caller};

/// Request body for a run. Without `schema_version` the latest version runs.
#[derive(Debug, Deserialize)]
pub struct RequestRunBody {
    pub schema_id: Uuid,
    #[serde(default)]
    pub schema_version: Option<i32>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct OverlayQuery {
    pub schema_id: Option<Uuid>,
    pub schema_version: Option<i32>,
    #[serde(default)]
    pub include_superseded: bool,
}

impl OverlayQuery {
    fn into_filter(self) -> Result<OverlayFilter, ApiError> {
        let schema = match (self.schema_id, self.schema_version) {
            (Some(id), Some(version)) => Some(SchemaKey { id, version }),
            (None, None) => None,
            _ => {
                return Err(ApiError::BadRequest(
                    "schema_id and schema_version must be given together".into(),
                ))
            }
        };
        Ok(OverlayFilter {
            schema,
            include_superseded: self.include_superseded,
        })
    }
}

/// Request a run of a schema against a document's live blocks.
///
/// # Returns
/// - 201 Created when a new run started
/// - 200 OK when an existing run for the same blocks was returned
/// - 409 Conflict if the document is not parsed
pub async fn request_run(
    State(state): State<AppState>,
    caller: Caller,
    Path(document_id): Path<Uuid>,
    Json(body): Json<RequestRunBody>,
) -> Result<(StatusCode, Json<RunResult>), ApiError> {
    let version = match body.schema_version {
        Some(version) => version,
        None => state
            .pipeline
            .schema_versions(caller.credential(), body.schema_id)
            .await?
            .iter()
            .map(|s| s.version)
            .max()
            .ok_or_else(|| ApiError::BadRequest("schema has no versions".into()))?,
    };
    let req = RunRequest {
        document_id,
        schema: SchemaKey {
            id: body.schema_id,
            version,
        },
        force: body.force,
    };
    let result = state.pipeline.request_run(caller.credential(), req).await?;
    let status = if result.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(result)))
}

pub async fn list_runs(
    State(state): State<AppState>,
    caller: Caller,
    Path(document_id): Path<Uuid>,
) -> Result<Json<Vec<Run>>, ApiError> {
    Ok(Json(state.pipeline.list_runs(caller.credential(), document_id).await?))
}

pub async fn get_run(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<Run>, ApiError> {
    Ok(Json(state.pipeline.get_run(caller.credential(), id).await?))
}

/// Request cancellation of a running run.
///
/// # Returns
/// - 200 OK with the run
/// - 409 Conflict if the run already finished
pub async fn cancel_run(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<Run>, ApiError> {
    Ok(Json(state.pipeline.cancel_run(caller.credential(), id).await?))
}

/// Overlays on a document, ordered by block.
pub async fn list_overlays(
    State(state): State<AppState>,
    caller: Caller,
    Path(document_id): Path<Uuid>,
    Query(query): Query<OverlayQuery>,
) -> Result<Json<Vec<Overlay>>, ApiError> {
    let filter = query.into_filter()?;
    let overlays = state
        .pipeline
        .list_overlays(caller.credential(), document_id, filter)
        .await?;
    Ok(Json(overlays))
}

pub async fn run_overlays(
    State(state): State<AppState>,
    caller: Caller,
    Path(run_id): Path<Uuid>,
) -> Result<Json<Vec<Overlay>>, ApiError> {
    Ok(Json(state.pipeline.run_overlays(caller.credential(), run_id).await?))
}

/// One JSON line per block with the run's annotations.
pub async fn export_run(
    State(state): State<AppState>,
    caller: Caller,
    Path(run_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let records = state.pipeline.export_run(caller.credential(), run_id).await?;
    jsonl_response(&records)
}

/// One JSON line per live block, without annotations.
pub async fn export_document(
    State(state): State<AppState>,
    caller: Caller,
    Path(document_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let records = state
        .pipeline
        .export_document(caller.credential(), document_id)
        .await?;
    jsonl_response(&records)
}

fn jsonl_response(records: &[ExportRecord]) -> Result<Response, ApiError> {
    let body = to_jsonl(records)?;
    Ok(([(header::CONTENT_TYPE, JSONL_CONTENT_TYPE)], body).into_response())
}
