//! Schema repository implementation.
//!
//! Publication for one schema ref is serialized with a transaction-scoped
//! advisory lock so that concurrent publishers agree on version numbers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::{Pool, Postgres};
use tracing::info;
use uuid::Uuid;

use docket_core::{
    new_v7, Error, PublishedSchema, Result, Schema, SchemaKey, SchemaRepository, TableNames,
};
use docket_core::logging::SUBSYSTEM_DB;

use crate::rows::{parse_schema_row, SCHEMA_COLUMNS};

/// PostgreSQL implementation of SchemaRepository.
pub struct PgSchemaRepository {
    pool: Pool<Postgres>,
    tables: Arc<TableNames>,
}

impl PgSchemaRepository {
    pub fn new(pool: Pool<Postgres>, tables: Arc<TableNames>) -> Self {
        Self { pool, tables }
    }
}

#[async_trait]
impl SchemaRepository for PgSchemaRepository {
    async fn publish(
        &self,
        schema_ref: &str,
        definition: JsonValue,
        definition_hash: &str,
    ) -> Result<PublishedSchema> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!("schema:{}", schema_ref))
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE schema_ref = $1 ORDER BY version DESC",
            SCHEMA_COLUMNS, self.tables.schemas
        ))
        .bind(schema_ref)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;
        let existing: Vec<Schema> = rows.iter().map(parse_schema_row).collect();

        if let Some(same) = existing.iter().find(|s| s.definition_hash == definition_hash) {
            tx.commit().await.map_err(Error::Database)?;
            return Ok(PublishedSchema {
                schema: same.clone(),
                created: false,
            });
        }

        let (id, version) = match existing.first() {
            Some(latest) => (latest.id, latest.version + 1),
            None => (new_v7(), 1),
        };

        let row = sqlx::query(&format!(
            "INSERT INTO {} (id, version, schema_ref, definition, definition_hash, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {}",
            self.tables.schemas, SCHEMA_COLUMNS
        ))
        .bind(id)
        .bind(version)
        .bind(schema_ref)
        .bind(&definition)
        .bind(definition_hash)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await
        .map_err(Error::Database)?;
        tx.commit().await.map_err(Error::Database)?;

        let schema = parse_schema_row(&row);
        info!(
            subsystem = SUBSYSTEM_DB,
            component = "schemas",
            op = "publish",
            schema_id = %schema.id,
            schema_version = schema.version,
            schema_ref,
            "Schema version published"
        );
        Ok(PublishedSchema {
            schema,
            created: true,
        })
    }

    async fn get(&self, key: SchemaKey) -> Result<Option<Schema>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE id = $1 AND version = $2",
            SCHEMA_COLUMNS, self.tables.schemas
        ))
        .bind(key.id)
        .bind(key.version)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.as_ref().map(parse_schema_row))
    }

    async fn latest(&self, id: Uuid) -> Result<Option<Schema>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE id = $1 ORDER BY version DESC LIMIT 1",
            SCHEMA_COLUMNS, self.tables.schemas
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.as_ref().map(parse_schema_row))
    }

    async fn find_by_ref(&self, schema_ref: &str) -> Result<Option<Schema>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE schema_ref = $1 ORDER BY version DESC LIMIT 1",
            SCHEMA_COLUMNS, self.tables.schemas
        ))
        .bind(schema_ref)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.as_ref().map(parse_schema_row))
    }

    async fn list_latest(&self) -> Result<Vec<Schema>> {
        let rows = sqlx::query(&format!(
            "SELECT DISTINCT ON (id) {} FROM {} ORDER BY id, version DESC",
            SCHEMA_COLUMNS, self.tables.schemas
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        let mut schemas: Vec<Schema> = rows.iter().map(parse_schema_row).collect();
        schemas.sort_by(|a, b| a.schema_ref.cmp(&b.schema_ref));
        Ok(schemas)
    }

    async fn list_versions(&self, id: Uuid) -> Result<Vec<Schema>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE id = $1 ORDER BY version",
            SCHEMA_COLUMNS, self.tables.schemas
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(rows.iter().map(parse_schema_row).collect())
    }
}
