//! # docket-api
//!
//! HTTP surface for the docket pipeline.
//!
//! Exposes project and document ingestion, parsing control, schema runs,
//! overlays and exports, plus the realtime subscription protocol over SSE
//! (`/api/v1/events`) and WebSocket (`/api/v1/ws`).

pub mod error;
pub mod extract;
pub mod handlers;

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use docket_db::Database;
use docket_pipeline::Pipeline;

pub use error::ApiError;
pub use extract::Caller;

/// Storage backend the server is running against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Postgres,
    Memory,
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub store: StoreKind,
    /// Set when running on Postgres; its pool status is reported by `/health`.
    pub database: Option<Arc<Database>>,
    /// Open WebSocket connections.
    pub ws_connections: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>, store: StoreKind) -> Self {
        Self {
            pipeline,
            store,
            database: None,
            ws_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_database(mut self, database: Arc<Database>) -> Self {
        self.store = StoreKind::Postgres;
        self.database = Some(database);
        self
    }
}

/// Request ids are UUIDv7 so they sort with the events they cause.
#[derive(Clone, Default)]
pub struct MakeRequestUuidV7;

impl MakeRequestId for MakeRequestUuidV7 {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        let id = Uuid::now_v7().to_string().parse().ok()?;
        Some(RequestId::new(id))
    }
}

/// Parse `ALLOWED_ORIGINS` (comma-separated) into CORS origins.
pub fn parse_allowed_origins(raw: Option<&str>) -> Vec<HeaderValue> {
    let raw = raw.unwrap_or("http://localhost:3000");
    raw.split(',')
        .filter_map(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            match trimmed.parse::<HeaderValue>() {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!("Invalid CORS origin '{}': {}", trimmed, e);
                    None
                }
            }
        })
        .collect()
}

/// Routes only, without middleware. Used directly by router tests.
pub fn routes(state: AppState) -> Router {
    use handlers::{documents, events, projects, runs, schemas, system};

    Router::new()
        .route("/health", get(system::health))
        .route("/api/v1/health", get(system::pipeline_health))
        // Projects
        .route(
            "/api/v1/projects",
            post(projects::create_project).get(projects::list_projects),
        )
        .route("/api/v1/projects/:id/documents", post(documents::ingest_document))
        // Documents
        .route("/api/v1/documents", get(documents::list_documents))
        .route("/api/v1/documents/:id", get(documents::get_document))
        .route("/api/v1/documents/:id/submit", post(documents::submit_document))
        .route("/api/v1/documents/:id/resubmit", post(documents::resubmit_document))
        .route("/api/v1/documents/:id/cancel", post(documents::cancel_document))
        .route("/api/v1/documents/:id/blocks", get(documents::list_blocks))
        .route(
            "/api/v1/documents/:id/representations",
            get(documents::list_representations),
        )
        .route("/api/v1/documents/:id/overlays", get(runs::list_overlays))
        .route("/api/v1/documents/:id/export", get(runs::export_document))
        .route(
            "/api/v1/documents/:id/runs",
            post(runs::request_run).get(runs::list_runs),
        )
        // Runs
        .route("/api/v1/runs/:id", get(runs::get_run))
        .route("/api/v1/runs/:id/cancel", post(runs::cancel_run))
        .route("/api/v1/runs/:id/overlays", get(runs::run_overlays))
        .route("/api/v1/runs/:id/export", get(runs::export_run))
        // Schemas
        .route(
            "/api/v1/schemas",
            post(schemas::publish_schema).get(schemas::list_schemas),
        )
        .route("/api/v1/schemas/:id/versions", get(schemas::list_versions))
        .route("/api/v1/schemas/:id/versions/:version", get(schemas::get_schema))
        // Realtime
        .route("/api/v1/events", get(events::sse_events))
        .route("/api/v1/ws", get(events::ws_handler))
        .with_state(state)
}

/// Full application router with tracing, request ids, panic recovery and CORS.
pub fn router(state: AppState, allowed_origins: Vec<HeaderValue>) -> Router {
    routes(state)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuidV7))
        .layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(allowed_origins))
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([
                    header::AUTHORIZATION,
                    header::CONTENT_TYPE,
                    header::ACCEPT,
                    header::HeaderName::from_static(extract::API_KEY_HEADER),
                ])
                .max_age(std::time::Duration::from_secs(3600)),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_allowed_origins_skips_blank_and_invalid() {
        let origins = parse_allowed_origins(Some("https://a.example, ,bad\norigin,http://b.example"));
        assert_eq!(origins.len(), 2);
        assert_eq!(origins[0], "https://a.example");
        assert_eq!(origins[1], "http://b.example");
    }

    #[test]
    fn test_parse_allowed_origins_default() {
        let origins = parse_allowed_origins(None);
        assert_eq!(origins, vec![HeaderValue::from_static("http://localhost:3000")]);
    }

    #[test]
    fn test_request_ids_are_v7() {
        let mut make = MakeRequestUuidV7;
        let request = axum::http::Request::new(());
        let id = make.make_request_id(&request).unwrap();
        let parsed: Uuid = id.header_value().to_str().unwrap().parse().unwrap();
        assert_eq!(parsed.get_version_num(), 7);
    }
}
