//! Document handlers: ingestion, parsing control, and the documents view.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use docket_pipeline::{
    Block, ConversionRepresentation, DocumentView, IngestOutcome, IngestRequest, IngestResult,
    SourceDocument, SubmitOutcome,
};

use crate::{ApiError, AppState, Caller};

fn default_submit() -> bool {
    true
}

/// Request body for ingesting a document into a project.
#[derive(Debug, Deserialize)]
pub struct IngestDocumentBody {
    /// Storage locator handed to the parser.
    pub locator: String,
    /// Hash of the stored bytes; an unchanged hash never triggers a reparse.
    pub content_hash: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub source_type: Option<String>,
    /// Submit for parsing right away (default true).
    #[serde(default = "default_submit")]
    pub submit: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListDocumentsQuery {
    pub project_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub document_id: Uuid,
    pub outcome: SubmitOutcome,
}

/// Ingest a document.
///
/// # Returns
/// - 201 Created for a new document
/// - 200 OK for an unchanged or re-ingested document
/// - 404 Not Found if the project does not exist
pub async fn ingest_document(
    State(state): State<AppState>,
    caller: Caller,
    Path(project_id): Path<Uuid>,
    Json(body): Json<IngestDocumentBody>,
) -> Result<(StatusCode, Json<IngestResult>), ApiError> {
    let req = IngestRequest {
        project_id,
        locator: body.locator,
        content_hash: body.content_hash,
        title: body.title,
        source_type: body.source_type,
    };
    let result = state.pipeline.ingest(caller.credential(), req, body.submit).await?;
    let status = if result.outcome == IngestOutcome::Created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(result)))
}

/// Documents view, optionally scoped to one project.
pub async fn list_documents(
    State(state): State<AppState>,
    caller: Caller,
    Query(query): Query<ListDocumentsQuery>,
) -> Result<Json<Vec<DocumentView>>, ApiError> {
    let views = state
        .pipeline
        .list_documents(caller.credential(), query.project_id)
        .await?;
    Ok(Json(views))
}

pub async fn get_document(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<DocumentView>, ApiError> {
    Ok(Json(state.pipeline.get_document(caller.credential(), id).await?))
}

/// Submit a pending document for parsing.
///
/// # Returns
/// - 202 Accepted when a parse job was queued
/// - 200 OK when nothing needed doing (already parsing, parsed or failed)
pub async fn submit_document(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let outcome = state.pipeline.submit(caller.credential(), id).await?;
    Ok(submit_response(id, outcome))
}

/// Move a failed document back to pending and queue it again.
pub async fn resubmit_document(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let outcome = state.pipeline.resubmit(caller.credential(), id).await?;
    Ok(submit_response(id, outcome))
}

fn submit_response(document_id: Uuid, outcome: SubmitOutcome) -> (StatusCode, Json<SubmitResponse>) {
    let status = match outcome {
        SubmitOutcome::Queued | SubmitOutcome::Requeued => StatusCode::ACCEPTED,
        _ => StatusCode::OK,
    };
    (status, Json(SubmitResponse { document_id, outcome }))
}

/// Request cancellation; takes effect at the next parse checkpoint.
pub async fn cancel_document(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<SourceDocument>, ApiError> {
    Ok(Json(state.pipeline.cancel_document(caller.credential(), id).await?))
}

/// Blocks of the live representation, in order.
pub async fn list_blocks(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Block>>, ApiError> {
    Ok(Json(state.pipeline.blocks(caller.credential(), id).await?))
}

pub async fn list_representations(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ConversionRepresentation>>, ApiError> {
    Ok(Json(state.pipeline.representations(caller.credential(), id).await?))
}
