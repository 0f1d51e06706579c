//! Schema executor backed by a remote execution service.
//!
//! `POST {base_url}/execute` with the schema and the ordered blocks; the
//! service answers `{"annotations": [{"block_id": ..., "payload": ...}]}`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};
use uuid::Uuid;

use docket_core::defaults::{HEALTH_CHECK_TIMEOUT_SECS, RUN_TIMEOUT_SECS};
use docket_core::{Annotation, Block, Error, Result, Schema, SchemaExecutor};
use docket_core::logging::SUBSYSTEM_PIPELINE;

use crate::http_client::{build_client, endpoint, status_error};

#[derive(Serialize)]
struct SchemaPayload<'a> {
    id: Uuid,
    version: i32,
    schema_ref: &'a str,
    definition: &'a JsonValue,
}

#[derive(Serialize)]
struct ExecuteRequest<'a> {
    schema: SchemaPayload<'a>,
    blocks: &'a [Block],
}

#[derive(Deserialize)]
struct ExecuteResponse {
    annotations: Vec<Annotation>,
}

/// HTTP schema-execution service client.
#[derive(Debug, Clone)]
pub struct HttpSchemaExecutor {
    client: Client,
    base_url: String,
}

impl HttpSchemaExecutor {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into();
        info!(subsystem = SUBSYSTEM_PIPELINE, component = "http_executor", %base_url, "Initializing schema executor");
        Ok(Self {
            client: build_client(timeout)?,
            base_url,
        })
    }

    /// Build from `SCHEMA_EXECUTOR_URL`; `None` when unset.
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var("SCHEMA_EXECUTOR_URL") {
            Ok(url) if !url.trim().is_empty() => {
                let timeout = std::env::var("RUN_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(RUN_TIMEOUT_SECS);
                Self::new(url, Duration::from_secs(timeout)).map(Some)
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl SchemaExecutor for HttpSchemaExecutor {
    fn name(&self) -> &str {
        "schema-executor"
    }

    async fn execute(&self, schema: &Schema, blocks: &[Block]) -> Result<Vec<Annotation>> {
        let request = ExecuteRequest {
            schema: SchemaPayload {
                id: schema.id,
                version: schema.version,
                schema_ref: &schema.schema_ref,
                definition: &schema.definition,
            },
            blocks,
        };

        let response = self
            .client
            .post(endpoint(&self.base_url, "execute"))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error("schema executor", response, Error::Execution).await);
        }

        let body: ExecuteResponse = response
            .json()
            .await
            .map_err(|e| Error::Execution(format!("invalid executor response: {}", e)))?;

        debug!(
            subsystem = SUBSYSTEM_PIPELINE,
            component = "http_executor",
            schema_id = %schema.id,
            schema_version = schema.version,
            annotation_count = body.annotations.len(),
            "Execution complete"
        );
        Ok(body.annotations)
    }

    async fn health_check(&self) -> Result<bool> {
        let response = self
            .client
            .get(endpoint(&self.base_url, "health"))
            .timeout(Duration::from_secs(HEALTH_CHECK_TIMEOUT_SECS))
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => Ok(true),
            Ok(resp) => {
                warn!("Schema executor health check failed: {}", resp.status());
                Ok(false)
            }
            Err(e) => {
                warn!("Schema executor health check error: {}", e);
                Ok(false)
            }
        }
    }
}
