//! Test server assembly shared by the API suites.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use docket_api::{router, routes, AppState, StoreKind};
use docket_db::MemoryStore;
use docket_pipeline::{
    Annotation, Authorizer, Block, CoordinatorConfig, MarkdownFileParser, ParserRegistry, Pipeline,
    PipelineConfig, Result, RetryPolicy, RunExecutorConfig, Schema, SchemaExecutor,
};

pub const CONTRACT: &str = "# Master Services Agreement\n\nThis agreement is made between Acme and Globex.\n\n## Term\n\nThe term is twelve months.\n";

/// Executor tagging every block with its type.
pub struct TaggingExecutor;

#[async_trait]
impl SchemaExecutor for TaggingExecutor {
    fn name(&self) -> &str {
        "tagging"
    }

    async fn execute(&self, schema: &Schema, blocks: &[Block]) -> Result<Vec<Annotation>> {
        Ok(blocks
            .iter()
            .map(|b| Annotation {
                block_id: b.id,
                payload: json!({"schema": schema.schema_ref, "type": b.block_type}),
            })
            .collect())
    }
}

pub struct TestApp {
    pub router: Router,
    pub pipeline: Arc<Pipeline>,
    pub storage: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::build(None).await
    }

    pub async fn with_authorizer(authorizer: Arc<dyn Authorizer>) -> Self {
        Self::build(Some(authorizer)).await
    }

    async fn build(authorizer: Option<Arc<dyn Authorizer>>) -> Self {
        let storage = tempfile::tempdir().unwrap();
        let retry = RetryPolicy::default().with_base_delay_ms(1).with_max_delay_ms(5);
        let config = PipelineConfig::default()
            .with_coordinator(CoordinatorConfig::default().with_retry(retry.clone()))
            .with_runs(RunExecutorConfig::default().with_retry(retry));

        let mut builder = Pipeline::builder(MemoryStore::new().repositories())
            .with_parsers(
                ParserRegistry::new().with_fallback(Arc::new(MarkdownFileParser::new(storage.path()))),
            )
            .with_executor(Arc::new(TaggingExecutor))
            .with_config(config);
        if let Some(authorizer) = authorizer {
            builder = builder.with_authorizer(authorizer);
        }
        let pipeline = Arc::new(builder.start().await);
        let router = routes(AppState::new(pipeline.clone(), StoreKind::Memory));
        Self {
            router,
            pipeline,
            storage,
        }
    }

    /// Full middleware stack, for tests that run a real listener.
    pub fn full_router(&self) -> Router {
        router(
            AppState::new(self.pipeline.clone(), StoreKind::Memory),
            vec!["http://localhost:3000".parse().unwrap()],
        )
    }

    pub fn write_source(&self, locator: &str, text: &str) {
        std::fs::write(self.storage.path().join(locator), text).unwrap();
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into()))
        };
        (status, body)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }

    pub async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send(
            Request::post(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    pub async fn create_project(&self, name: &str) -> String {
        let (status, body) = self.post("/api/v1/projects", json!({"name": name})).await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        body["id"].as_str().unwrap().to_string()
    }

    /// Write `locator`, ingest it, and return the document id.
    pub async fn ingest(&self, project_id: &str, locator: &str, text: &str, submit: bool) -> String {
        self.write_source(locator, text);
        let (status, body) = self
            .post(
                &format!("/api/v1/projects/{}/documents", project_id),
                json!({
                    "locator": locator,
                    "content_hash": docket_pipeline::hashing::sha256_hex(text),
                    "submit": submit,
                }),
            )
            .await;
        assert!(status.is_success(), "{} {}", status, body);
        body["document"]["id"].as_str().unwrap().to_string()
    }

    pub async fn wait_for(&self, uri: &str, field: &str, expected: &str) -> Value {
        for _ in 0..500 {
            let (status, body) = self.get(uri).await;
            assert_eq!(status, StatusCode::OK, "{}", body);
            if body[field] == expected {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never reported {} = {}", uri, field, expected);
    }
}
