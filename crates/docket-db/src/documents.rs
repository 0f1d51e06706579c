//! Source document repository implementation.
//!
//! State changes are compare-and-set updates keyed on `(id, version, state)`.
//! A miss is re-read to distinguish `DocumentNotFound` from `StaleState`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use docket_core::{
    new_v7, Block, ConversionRepresentation, DocumentRepository, DocumentState, DocumentTransition,
    DocumentView, Error, NewDocument, Result, SourceDocument, TableNames,
};
use docket_core::logging::SUBSYSTEM_DB;

use crate::rows::{parse_document_row, parse_view_row, to_json, DOCUMENT_COLUMNS};
use crate::rules::{cancel_rejected, cancellable, cas_miss, check_transition};

/// PostgreSQL implementation of DocumentRepository.
pub struct PgDocumentRepository {
    pool: Pool<Postgres>,
    tables: Arc<TableNames>,
}

impl PgDocumentRepository {
    pub fn new(pool: Pool<Postgres>, tables: Arc<TableNames>) -> Self {
        Self { pool, tables }
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<SourceDocument>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE id = $1",
            DOCUMENT_COLUMNS, self.tables.documents
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        row.as_ref().map(parse_document_row).transpose()
    }

    async fn supersede_live(&self, tx: &mut Transaction<'_, Postgres>, document_id: Uuid) -> Result<u64> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET superseded_at = $2 WHERE document_id = $1 AND superseded_at IS NULL",
            self.tables.representations
        ))
        .bind(document_id)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }

    /// Compare-and-set update inside `tx`. Returns `None` on a miss.
    async fn apply_transition(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        t: &DocumentTransition,
        representation_id: Option<Uuid>,
    ) -> Result<Option<SourceDocument>> {
        let failure = match (&t.failure, t.to) {
            (Some(reason), DocumentState::Failed) => Some(to_json(reason)?),
            _ => None,
        };
        let row = sqlx::query(&format!(
            "UPDATE {} SET
                state = $4,
                version = version + 1,
                updated_at = $5,
                content_hash = COALESCE($6, content_hash),
                failure = $7,
                representation_id = $8,
                cancel_requested_at = CASE WHEN $4 = 'pending' THEN NULL ELSE cancel_requested_at END
             WHERE id = $1 AND version = $2 AND state = $3
             RETURNING {}",
            self.tables.documents, DOCUMENT_COLUMNS
        ))
        .bind(t.id)
        .bind(t.expected_version)
        .bind(t.expected_state.to_string())
        .bind(t.to.to_string())
        .bind(Utc::now())
        .bind(&t.content_hash)
        .bind(failure)
        .bind(representation_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(Error::Database)?;
        row.as_ref().map(parse_document_row).transpose()
    }
}

#[async_trait]
impl DocumentRepository for PgDocumentRepository {
    async fn insert_or_get(&self, doc: NewDocument) -> Result<(SourceDocument, bool)> {
        let now = Utc::now();
        let inserted = sqlx::query(&format!(
            "INSERT INTO {} (id, project_id, title, source_type, locator, content_hash, state, version, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, 'pending', 1, $7, $7)
             ON CONFLICT (project_id, locator) DO NOTHING
             RETURNING {}",
            self.tables.documents, DOCUMENT_COLUMNS
        ))
        .bind(new_v7())
        .bind(doc.project_id)
        .bind(&doc.title)
        .bind(&doc.source_type)
        .bind(&doc.locator)
        .bind(&doc.content_hash)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        if let Some(row) = inserted {
            return Ok((parse_document_row(&row)?, true));
        }

        let row = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE project_id = $1 AND locator = $2",
            DOCUMENT_COLUMNS, self.tables.documents
        ))
        .bind(doc.project_id)
        .bind(&doc.locator)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok((parse_document_row(&row)?, false))
    }

    async fn get(&self, id: Uuid) -> Result<Option<SourceDocument>> {
        self.fetch(id).await
    }

    async fn transition(&self, t: DocumentTransition) -> Result<SourceDocument> {
        check_transition(&t)?;
        if t.to == DocumentState::Parsed {
            return Err(Error::InvalidInput(
                "use transition_parsed to install a representation".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let Some(updated) = self.apply_transition(&mut tx, &t, None).await? else {
            tx.rollback().await.map_err(Error::Database)?;
            let current = self.fetch(t.id).await?;
            return Err(cas_miss(current.as_ref(), t.id, t.expected_version));
        };
        if t.expected_state == DocumentState::Parsed {
            let superseded = self.supersede_live(&mut tx, t.id).await?;
            debug!(document_id = %t.id, superseded, "Superseded live representation");
        }
        tx.commit().await.map_err(Error::Database)?;
        Ok(updated)
    }

    async fn update_pending_hash(
        &self,
        id: Uuid,
        expected_version: i64,
        content_hash: &str,
    ) -> Result<SourceDocument> {
        let row = sqlx::query(&format!(
            "UPDATE {} SET content_hash = $3, version = version + 1, updated_at = $4
             WHERE id = $1 AND version = $2 AND state = 'pending'
             RETURNING {}",
            self.tables.documents, DOCUMENT_COLUMNS
        ))
        .bind(id)
        .bind(expected_version)
        .bind(content_hash)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        match row {
            Some(row) => parse_document_row(&row),
            None => {
                let current = self.fetch(id).await?;
                Err(cas_miss(current.as_ref(), id, expected_version))
            }
        }
    }

    async fn transition_parsed(
        &self,
        t: DocumentTransition,
        representation: ConversionRepresentation,
        blocks: Vec<Block>,
    ) -> Result<SourceDocument> {
        check_transition(&t)?;
        if t.to != DocumentState::Parsed {
            return Err(Error::invalid_transition("document", t.expected_state, t.to));
        }

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let Some(updated) = self
            .apply_transition(&mut tx, &t, Some(representation.id))
            .await?
        else {
            tx.rollback().await.map_err(Error::Database)?;
            let current = self.fetch(t.id).await?;
            return Err(cas_miss(current.as_ref(), t.id, t.expected_version));
        };

        self.supersede_live(&mut tx, t.id).await?;

        sqlx::query(&format!(
            "INSERT INTO {} (id, document_id, schema_version, parsing_tool, content, content_hash,
                             block_count, block_type_freq, total_characters, superseded_at, parsed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NULL, $10)",
            self.tables.representations
        ))
        .bind(representation.id)
        .bind(representation.document_id)
        .bind(&representation.schema_version)
        .bind(&representation.parsing_tool)
        .bind(to_json(&representation.content)?)
        .bind(&representation.content_hash)
        .bind(representation.block_count)
        .bind(to_json(&representation.block_type_freq)?)
        .bind(representation.total_characters)
        .bind(representation.parsed_at)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let insert_block = format!(
            "INSERT INTO {} (id, representation_id, order_index, block_type, section_path, locator, content, content_hash)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            self.tables.blocks
        );
        for block in &blocks {
            let locator = block.locator.as_ref().map(to_json).transpose()?;
            sqlx::query(&insert_block)
                .bind(block.id)
                .bind(block.representation_id)
                .bind(block.order_index)
                .bind(&block.block_type)
                .bind(to_json(&block.section_path)?)
                .bind(locator)
                .bind(&block.content)
                .bind(&block.content_hash)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?;
        }

        tx.commit().await.map_err(Error::Database)?;
        debug!(
            subsystem = SUBSYSTEM_DB,
            document_id = %t.id,
            representation_id = %representation.id,
            block_count = blocks.len(),
            "Representation installed"
        );
        Ok(updated)
    }

    async fn request_cancel(&self, id: Uuid) -> Result<SourceDocument> {
        let row = sqlx::query(&format!(
            "UPDATE {} SET cancel_requested_at = COALESCE(cancel_requested_at, $2), updated_at = $2
             WHERE id = $1 AND state IN ('pending', 'parsing')
             RETURNING {}",
            self.tables.documents, DOCUMENT_COLUMNS
        ))
        .bind(id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        match row {
            Some(row) => parse_document_row(&row),
            None => match self.fetch(id).await? {
                None => Err(Error::DocumentNotFound(id)),
                Some(doc) if cancellable(doc.state) => Ok(doc),
                Some(doc) => Err(cancel_rejected(&doc)),
            },
        }
    }

    async fn list_view(&self, project_id: Option<Uuid>) -> Result<Vec<DocumentView>> {
        let rows = sqlx::query(&format!(
            "SELECT {}, parsing_tool, parsed_at, block_count, block_type_freq, total_characters
             FROM {} WHERE ($1::uuid IS NULL OR project_id = $1)
             ORDER BY created_at, id",
            DOCUMENT_COLUMNS, self.tables.documents_view
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.iter().map(parse_view_row).collect()
    }

    async fn get_view(&self, id: Uuid) -> Result<Option<DocumentView>> {
        let row = sqlx::query(&format!(
            "SELECT {}, parsing_tool, parsed_at, block_count, block_type_freq, total_characters
             FROM {} WHERE id = $1",
            DOCUMENT_COLUMNS, self.tables.documents_view
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        row.as_ref().map(parse_view_row).transpose()
    }
}
