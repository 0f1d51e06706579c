//! Schema Registry service: versioned schema definitions.
//!
//! A schema is addressed by its lineage id and version. Publishing a
//! definition under an existing ref adds a version unless the same
//! definition (by canonical hash) is already there.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use docket_core::hashing::{definition_hash, derive_schema_ref, slugify};
use docket_core::{
    ChangeNotifier, Error, EventContext, PipelineEvent, PublishSchemaRequest, PublishedSchema,
    Result, Schema, SchemaKey, SchemaRepository,
};
use docket_core::logging::SUBSYSTEM_PIPELINE;

/// Stores and serves schema versions.
#[derive(Clone)]
pub struct SchemaRegistry {
    schemas: Arc<dyn SchemaRepository>,
    notifier: Arc<ChangeNotifier>,
}

impl SchemaRegistry {
    pub fn new(schemas: Arc<dyn SchemaRepository>, notifier: Arc<ChangeNotifier>) -> Self {
        Self { schemas, notifier }
    }

    /// Publish a definition. The ref is the slug of the explicit ref, or is
    /// derived from the definition's `$id` or `title`.
    pub async fn publish(&self, ctx: &EventContext, req: PublishSchemaRequest) -> Result<PublishedSchema> {
        if !req.definition.is_object() {
            return Err(Error::InvalidInput(
                "schema definition must be a JSON object".to_string(),
            ));
        }
        let schema_ref = match req.schema_ref.as_deref().map(str::trim) {
            Some(explicit) if !explicit.is_empty() => slugify(explicit),
            _ => derive_schema_ref(&req.definition),
        };
        let hash = definition_hash(&req.definition);

        let published = self.schemas.publish(&schema_ref, req.definition, &hash).await?;
        if published.created {
            let schema = &published.schema;
            self.notifier.publish_with_context(
                PipelineEvent::SchemaPublished {
                    schema_id: schema.id,
                    schema_ref: schema.schema_ref.clone(),
                    version: schema.version,
                },
                ctx.clone(),
            );
            info!(
                subsystem = SUBSYSTEM_PIPELINE,
                component = "schema_registry",
                schema_id = %schema.id,
                schema_ref = %schema.schema_ref,
                schema_version = schema.version,
                "Schema version published"
            );
        }
        Ok(published)
    }

    /// A specific version.
    pub async fn get(&self, key: SchemaKey) -> Result<Schema> {
        self.schemas
            .get(key)
            .await?
            .ok_or(Error::SchemaNotFound {
                id: key.id,
                version: key.version,
            })
    }

    /// Latest version of a lineage.
    pub async fn latest(&self, id: Uuid) -> Result<Schema> {
        self.schemas
            .latest(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("schema {}", id)))
    }

    /// Latest version published under `schema_ref`.
    pub async fn find_by_ref(&self, schema_ref: &str) -> Result<Option<Schema>> {
        self.schemas.find_by_ref(&slugify(schema_ref)).await
    }

    /// Latest version of every lineage.
    pub async fn list(&self) -> Result<Vec<Schema>> {
        self.schemas.list_latest().await
    }

    /// All versions of a lineage, oldest first.
    pub async fn versions(&self, id: Uuid) -> Result<Vec<Schema>> {
        let versions = self.schemas.list_versions(id).await?;
        if versions.is_empty() {
            return Err(Error::NotFound(format!("schema {}", id)));
        }
        Ok(versions)
    }
}
