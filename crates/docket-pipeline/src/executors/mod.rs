//! Schema-execution adapters.

pub mod http;

use async_trait::async_trait;

use docket_core::{Annotation, Block, Error, Result, Schema, SchemaExecutor};

pub use http::HttpSchemaExecutor;

pub const DISABLED_EXECUTOR_NAME: &str = "disabled";

/// Stand-in for deployments without an execution service. Every run fails
/// with an execution error.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledExecutor;

#[async_trait]
impl SchemaExecutor for DisabledExecutor {
    fn name(&self) -> &str {
        DISABLED_EXECUTOR_NAME
    }

    async fn execute(&self, _schema: &Schema, _blocks: &[Block]) -> Result<Vec<Annotation>> {
        Err(Error::Execution(
            "no schema executor configured (set SCHEMA_EXECUTOR_URL)".to_string(),
        ))
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(false)
    }
}
