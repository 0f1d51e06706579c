//! Realtime subscription tests against a live listener.

mod common;

use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

use common::{TestApp, CONTRACT};

async fn spawn_server(app: &TestApp) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app.full_router();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_sse_streams_scoped_events_in_order() {
    let app = TestApp::new().await;
    let base_url = spawn_server(&app).await;
    let project_id = app.create_project("contracts").await;
    let doc_id = app.ingest(&project_id, "msa.md", CONTRACT, false).await;
    let other_id = app.ingest(&project_id, "nda.md", "# NDA\n\nSecret.\n", false).await;

    let response = reqwest::get(format!("{}/api/v1/events?document_id={}", base_url, doc_id))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    // Only the subscribed document's events should arrive.
    app.post(&format!("/api/v1/documents/{}/submit", other_id), json!({}))
        .await;
    app.post(&format!("/api/v1/documents/{}/submit", doc_id), json!({}))
        .await;

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut transitions = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while transitions.len() < 2 {
        let chunk = tokio::time::timeout_at(deadline, stream.next())
            .await
            .expect("timed out waiting for SSE events")
            .expect("stream ended")
            .unwrap();
        buffer.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(end) = buffer.find("\n\n") {
            let frame: String = buffer.drain(..end + 2).collect();
            let Some(data) = frame.lines().find_map(|l| l.strip_prefix("data: ")) else {
                continue;
            };
            let Ok(envelope) = serde_json::from_str::<Value>(data) else {
                continue;
            };
            assert_eq!(envelope["document_id"], doc_id.as_str());
            if envelope["event_type"] == "document.state_changed" {
                transitions.push(envelope["payload"]["to"].as_str().unwrap().to_string());
            }
        }
    }
    assert_eq!(transitions, vec!["parsing", "parsed"]);
}

#[tokio::test]
async fn test_ws_delivers_run_events() {
    let app = TestApp::new().await;
    let base_url = spawn_server(&app).await;
    let project_id = app.create_project("contracts").await;
    let doc_id = app.ingest(&project_id, "msa.md", CONTRACT, true).await;
    app.wait_for(&format!("/api/v1/documents/{}", doc_id), "state", "parsed")
        .await;
    let (_, published) = app
        .post("/api/v1/schemas", json!({"definition": {"title": "Parties"}}))
        .await;

    let ws_url = format!(
        "{}/api/v1/ws?project_id={}",
        base_url.replace("http://", "ws://"),
        project_id
    );
    let (mut socket, response) = tokio_tungstenite::connect_async(&ws_url).await.unwrap();
    assert_eq!(response.status(), 101);

    let (status, _) = app
        .post(
            &format!("/api/v1/documents/{}/runs", doc_id),
            json!({"schema_id": published["schema"]["id"]}),
        )
        .await;
    assert_eq!(status, 201);

    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !seen.iter().any(|t| t == "run.succeeded") {
        let msg = tokio::time::timeout_at(deadline, socket.next())
            .await
            .expect("timed out waiting for WebSocket events")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = msg {
            let envelope: Value = serde_json::from_str(&text).unwrap();
            seen.push(envelope["event_type"].as_str().unwrap().to_string());
        }
    }
    assert_eq!(seen, vec!["run.started", "overlays.published", "run.succeeded"]);
}

#[tokio::test]
async fn test_ws_requires_authorization() {
    let authorizer = docket_pipeline::ApiKeyAuthorizer::new(10, Duration::from_secs(60))
        .unwrap()
        .with_key("k", "alice", "a", true);
    let app = TestApp::with_authorizer(std::sync::Arc::new(authorizer)).await;
    let base_url = spawn_server(&app).await;

    let response = reqwest::get(format!("{}/api/v1/events", base_url)).await.unwrap();
    assert_eq!(response.status(), 401);

    let ws_url = format!("{}/api/v1/ws", base_url.replace("http://", "ws://"));
    assert!(tokio_tungstenite::connect_async(&ws_url).await.is_err());
}
