//! Mapping of pipeline errors onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use docket_core::logging::SUBSYSTEM_API;
use docket_pipeline::Error;

/// Handler error: a pipeline error or a request the API itself rejects.
#[derive(Debug)]
pub enum ApiError {
    Pipeline(Error),
    BadRequest(String),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError::Pipeline(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Pipeline(err) => match err {
                Error::NotFound(_)
                | Error::ProjectNotFound(_)
                | Error::DocumentNotFound(_)
                | Error::RunNotFound(_)
                | Error::SchemaNotFound { .. } => StatusCode::NOT_FOUND,
                Error::InvalidTransition { .. }
                | Error::StaleState { .. }
                | Error::RunNotRunning(_)
                | Error::DocumentNotParsed(_) => StatusCode::CONFLICT,
                Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
                Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
                Error::Forbidden(_) => StatusCode::FORBIDDEN,
                Error::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
                Error::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Pipeline(err) => err.kind(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.kind();
        let message = match &self {
            ApiError::BadRequest(msg) => msg.clone(),
            ApiError::Pipeline(err) => err.to_string(),
        };

        if status.is_server_error() {
            tracing::error!(subsystem = SUBSYSTEM_API, kind, error = %message, "Request failed");
        } else {
            tracing::debug!(subsystem = SUBSYSTEM_API, kind, error = %message, "Request rejected");
        }

        let body = Json(serde_json::json!({
            "error": message,
            "kind": kind,
        }));

        (status, body).into_response()
    }
}
