//! Conversion representation and block repository implementation.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use docket_core::{Block, ConversionRepresentation, Error, RepresentationRepository, Result, TableNames};

use crate::rows::{parse_block_row, parse_representation_row, BLOCK_COLUMNS, REPRESENTATION_COLUMNS};

/// PostgreSQL implementation of RepresentationRepository.
pub struct PgRepresentationRepository {
    pool: Pool<Postgres>,
    tables: Arc<TableNames>,
}

impl PgRepresentationRepository {
    pub fn new(pool: Pool<Postgres>, tables: Arc<TableNames>) -> Self {
        Self { pool, tables }
    }
}

#[async_trait]
impl RepresentationRepository for PgRepresentationRepository {
    async fn get(&self, id: Uuid) -> Result<Option<ConversionRepresentation>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE id = $1",
            REPRESENTATION_COLUMNS, self.tables.representations
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        row.as_ref().map(parse_representation_row).transpose()
    }

    async fn live_for_document(&self, document_id: Uuid) -> Result<Option<ConversionRepresentation>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE document_id = $1 AND superseded_at IS NULL",
            REPRESENTATION_COLUMNS, self.tables.representations
        ))
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        row.as_ref().map(parse_representation_row).transpose()
    }

    async fn list_for_document(&self, document_id: Uuid) -> Result<Vec<ConversionRepresentation>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE document_id = $1 ORDER BY parsed_at DESC, id DESC",
            REPRESENTATION_COLUMNS, self.tables.representations
        ))
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.iter().map(parse_representation_row).collect()
    }

    async fn blocks(&self, representation_id: Uuid) -> Result<Vec<Block>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE representation_id = $1 ORDER BY order_index",
            BLOCK_COLUMNS, self.tables.blocks
        ))
        .bind(representation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.iter().map(parse_block_row).collect()
    }
}
