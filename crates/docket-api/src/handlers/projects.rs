//! Project handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use docket_pipeline::Project;

use crate::{ApiError, AppState, Caller};

#[derive(Debug, Deserialize)]
pub struct CreateProjectBody {
    pub name: String,
}

/// Create a project.
///
/// # Returns
/// - 201 Created with the project
/// - 400 Bad Request if the name is blank
pub async fn create_project(
    State(state): State<AppState>,
    caller: Caller,
    Json(body): Json<CreateProjectBody>,
) -> Result<(StatusCode, Json<Project>), ApiError> {
    let project = state.pipeline.create_project(caller.credential(), &body.name).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

pub async fn list_projects(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<Json<Vec<Project>>, ApiError> {
    Ok(Json(state.pipeline.list_projects(caller.credential()).await?))
}
