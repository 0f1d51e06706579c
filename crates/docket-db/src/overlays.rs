//! Overlay repository implementation.
//!
//! `append` locks the run row, inserts every overlay, and seals the run in a
//! single transaction, so a run is either `Succeeded` with all of its
//! overlays or has none.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres, Row};
use tracing::info;
use uuid::Uuid;

use docket_core::{Error, Overlay, OverlayFilter, OverlayRepository, Result, Run, TableNames};
use docket_core::logging::SUBSYSTEM_DB;

use crate::rows::{parse_overlay_row, parse_run_row, RUN_COLUMNS};

const OVERLAY_COLUMNS: &str = "o.id, o.run_id, o.block_id, o.order_index, o.payload, o.created_at";

/// PostgreSQL implementation of OverlayRepository.
pub struct PgOverlayRepository {
    pool: Pool<Postgres>,
    tables: Arc<TableNames>,
}

impl PgOverlayRepository {
    pub fn new(pool: Pool<Postgres>, tables: Arc<TableNames>) -> Self {
        Self { pool, tables }
    }
}

#[async_trait]
impl OverlayRepository for PgOverlayRepository {
    async fn append(&self, run_id: Uuid, overlays: Vec<Overlay>) -> Result<Run> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let status: Option<String> = sqlx::query(&format!(
            "SELECT status FROM {} WHERE id = $1 FOR UPDATE",
            self.tables.runs
        ))
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?
        .map(|row| row.get("status"));

        match status.as_deref() {
            None => return Err(Error::RunNotFound(run_id)),
            Some("running") => {}
            Some(_) => return Err(Error::RunNotRunning(run_id)),
        }

        let insert = format!(
            "INSERT INTO {} (id, run_id, block_id, order_index, payload, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
            self.tables.overlays
        );
        for overlay in &overlays {
            sqlx::query(&insert)
                .bind(overlay.id)
                .bind(run_id)
                .bind(overlay.block_id)
                .bind(overlay.order_index)
                .bind(&overlay.payload)
                .bind(overlay.created_at)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?;
        }

        let row = sqlx::query(&format!(
            "UPDATE {} SET status = 'succeeded', finished_at = $2, overlay_count = $3, failure = NULL
             WHERE id = $1
             RETURNING {}",
            self.tables.runs, RUN_COLUMNS
        ))
        .bind(run_id)
        .bind(Utc::now())
        .bind(overlays.len() as i32)
        .fetch_one(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = SUBSYSTEM_DB,
            component = "overlays",
            op = "append",
            run_id = %run_id,
            overlay_count = overlays.len(),
            "Overlays published"
        );
        parse_run_row(&row)
    }

    async fn list_for_document(&self, document_id: Uuid, filter: OverlayFilter) -> Result<Vec<Overlay>> {
        let (schema_id, schema_version) = match filter.schema {
            Some(key) => (Some(key.id), Some(key.version)),
            None => (None, None),
        };
        let rows = sqlx::query(&format!(
            "SELECT {}, (rep.superseded_at IS NOT NULL) AS superseded
             FROM {} o
             JOIN {} r ON r.id = o.run_id
             JOIN {} rep ON rep.id = r.representation_id
             WHERE r.document_id = $1
               AND r.status = 'succeeded'
               AND ($2::uuid IS NULL OR (r.schema_id = $2 AND r.schema_version = $3::int))
               AND ($4 OR rep.superseded_at IS NULL)
             ORDER BY o.order_index, o.created_at, o.id",
            OVERLAY_COLUMNS, self.tables.overlays, self.tables.runs, self.tables.representations
        ))
        .bind(document_id)
        .bind(schema_id)
        .bind(schema_version)
        .bind(filter.include_superseded)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(rows.iter().map(parse_overlay_row).collect())
    }

    async fn list_for_run(&self, run_id: Uuid) -> Result<Vec<Overlay>> {
        let rows = sqlx::query(&format!(
            "SELECT {}, (rep.superseded_at IS NOT NULL) AS superseded
             FROM {} o
             JOIN {} r ON r.id = o.run_id
             JOIN {} rep ON rep.id = r.representation_id
             WHERE o.run_id = $1
             ORDER BY o.order_index, o.created_at, o.id",
            OVERLAY_COLUMNS, self.tables.overlays, self.tables.runs, self.tables.representations
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(rows.iter().map(parse_overlay_row).collect())
    }
}
