//! Router tests driving the HTTP surface with `tower::ServiceExt::oneshot`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use tower::ServiceExt;
use uuid::Uuid;

use common::{TestApp, CONTRACT};
use docket_pipeline::{ApiKeyAuthorizer, JSONL_CONTENT_TYPE};

#[tokio::test]
async fn test_health_reports_store() {
    let app = TestApp::new().await;
    let (status, body) = app.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["store"], "memory");

    let (status, body) = app.get("/api/v1/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["executor"], "tagging");
    assert_eq!(body["worker_running"], true);
}

#[tokio::test]
async fn test_ingest_parse_run_export() {
    let app = TestApp::new().await;
    let project_id = app.create_project("contracts").await;
    let doc_id = app.ingest(&project_id, "msa.md", CONTRACT, true).await;

    let view = app
        .wait_for(&format!("/api/v1/documents/{}", doc_id), "state", "parsed")
        .await;
    assert_eq!(view["parsing_tool"], "markdown-file");

    let (status, blocks) = app.get(&format!("/api/v1/documents/{}/blocks", doc_id)).await;
    assert_eq!(status, StatusCode::OK);
    let block_count = blocks.as_array().unwrap().len();
    assert!(block_count >= 4);
    assert_eq!(view["block_count"], block_count);

    let (status, listed) = app
        .get(&format!("/api/v1/documents?project_id={}", project_id))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    // Publishing the same definition twice is idempotent.
    let definition = json!({"title": "Parties", "type": "object"});
    let (status, published) = app
        .post("/api/v1/schemas", json!({"definition": definition}))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(published["schema"]["schema_ref"], "parties");
    let schema_id = published["schema"]["id"].as_str().unwrap().to_string();
    let (status, again) = app
        .post("/api/v1/schemas", json!({"definition": definition}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["created"], false);

    // Without a version the latest one runs; the second request dedups.
    let runs_uri = format!("/api/v1/documents/{}/runs", doc_id);
    let (status, first) = app.post(&runs_uri, json!({"schema_id": schema_id})).await;
    assert_eq!(status, StatusCode::CREATED, "{}", first);
    assert_eq!(first["run"]["schema_version"], 1);
    let run_id = first["run"]["id"].as_str().unwrap().to_string();

    let run = app
        .wait_for(&format!("/api/v1/runs/{}", run_id), "status", "succeeded")
        .await;
    assert_eq!(run["overlay_count"], block_count);

    let (status, second) = app
        .post(&runs_uri, json!({"schema_id": schema_id, "schema_version": 1}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["run"]["id"], run_id.as_str());
    assert_eq!(second["created"], false);

    let (_, runs) = app.get(&runs_uri).await;
    assert_eq!(runs.as_array().unwrap().len(), 1);

    let (status, overlays) = app
        .get(&format!(
            "/api/v1/documents/{}/overlays?schema_id={}&schema_version=1",
            doc_id, schema_id
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    let overlays = overlays.as_array().unwrap();
    assert_eq!(overlays.len(), block_count);
    assert_eq!(overlays[0]["payload"]["schema"], "parties");

    // Export: one JSON line per block.
    let response = app
        .router
        .clone()
        .oneshot(
            Request::get(format!("/api/v1/runs/{}/export", run_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], JSONL_CONTENT_TYPE);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    let lines: Vec<serde_json::Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), block_count);
    assert_eq!(lines[0]["user_defined"]["schema_ref"], "parties");
    assert_eq!(lines[0]["immutable"]["source"]["document_id"], doc_id.as_str());
}

#[tokio::test]
async fn test_unchanged_reingest_is_not_resubmitted() {
    let app = TestApp::new().await;
    let project_id = app.create_project("contracts").await;
    let doc_id = app.ingest(&project_id, "msa.md", CONTRACT, true).await;
    app.wait_for(&format!("/api/v1/documents/{}", doc_id), "state", "parsed")
        .await;

    let (status, body) = app
        .post(
            &format!("/api/v1/projects/{}/documents", project_id),
            json!({
                "locator": "msa.md",
                "content_hash": docket_pipeline::hashing::sha256_hex(CONTRACT),
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "unchanged");
    assert!(body.get("submit").is_none());
    assert_eq!(body["document"]["state"], "parsed");
}

#[tokio::test]
async fn test_submit_and_cancel_status_codes() {
    let app = TestApp::new().await;
    let project_id = app.create_project("contracts").await;
    let doc_id = app.ingest(&project_id, "msa.md", CONTRACT, false).await;

    let (status, body) = app.get(&format!("/api/v1/documents/{}", doc_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "pending");

    let (status, body) = app
        .post(&format!("/api/v1/documents/{}/submit", doc_id), json!({}))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["outcome"], "queued");
    app.wait_for(&format!("/api/v1/documents/{}", doc_id), "state", "parsed")
        .await;

    let (status, body) = app
        .post(&format!("/api/v1/documents/{}/submit", doc_id), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "already_parsed");

    // Only parsing documents can be cancelled.
    let (status, body) = app
        .post(&format!("/api/v1/documents/{}/cancel", doc_id), json!({}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT, "{}", body);
    assert_eq!(body["kind"], "invalid_transition");
}

#[tokio::test]
async fn test_error_mapping() {
    let app = TestApp::new().await;
    let project_id = app.create_project("contracts").await;

    let (status, body) = app.get(&format!("/api/v1/documents/{}", Uuid::now_v7())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");

    let (status, _) = app.get(&format!("/api/v1/runs/{}", Uuid::now_v7())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app
        .get(&format!("/api/v1/schemas/{}/versions/1", Uuid::now_v7()))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = app.post("/api/v1/projects", json!({"name": "  "})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "invalid_input");

    let (status, _) = app
        .post("/api/v1/schemas", json!({"definition": ["not", "an", "object"]}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // A run needs a parsed document.
    let doc_id = app.ingest(&project_id, "draft.md", CONTRACT, false).await;
    let (_, published) = app
        .post("/api/v1/schemas", json!({"definition": {"title": "Terms"}}))
        .await;
    let (status, body) = app
        .post(
            &format!("/api/v1/documents/{}/runs", doc_id),
            json!({"schema_id": published["schema"]["id"], "schema_version": 1}),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "document_not_parsed");

    let (status, body) = app
        .get(&format!(
            "/api/v1/documents/{}/overlays?schema_id={}",
            doc_id,
            Uuid::now_v7()
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "bad_request");
}

#[tokio::test]
async fn test_api_key_authorization() {
    let authorizer = ApiKeyAuthorizer::new(100, Duration::from_secs(60))
        .unwrap()
        .with_key("writer-key", "alice", "team-a", false)
        .with_key("reader-key", "bob", "team-b", true);
    let app = TestApp::with_authorizer(Arc::new(authorizer)).await;

    let (status, body) = app.get("/api/v1/projects").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["kind"], "unauthorized");

    let create = |key_header: (&'static str, &'static str)| {
        Request::post("/api/v1/projects")
            .header("content-type", "application/json")
            .header(key_header.0, key_header.1)
            .body(Body::from(json!({"name": "contracts"}).to_string()))
            .unwrap()
    };

    let (status, _) = app.send(create(("authorization", "Bearer writer-key"))).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = app.send(create(("x-api-key", "reader-key"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app.send(create(("authorization", "Bearer unknown"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = app
        .send(
            Request::get("/api/v1/projects")
                .header("x-api-key", "reader-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    // Health stays open.
    let (status, _) = app.get("/health").await;
    assert_eq!(status, StatusCode::OK);
}
