//! Run repository implementation.
//!
//! Deduplication takes a transaction-scoped advisory lock on the dedup key
//! `(document, schema id, schema version, fingerprint)` before reading the
//! existing runs, so concurrent callers serialize and observe the same run.
//! The partial unique index on running runs backs this up at the table level.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres};
use tracing::debug;
use uuid::Uuid;

use docket_core::{
    new_v7, Error, FailureReason, NewRun, Result, Run, RunClaim, RunRepository, TableNames,
};

use crate::rows::{parse_run_row, to_json, RUN_COLUMNS};
use crate::rules::reusable_run;

/// PostgreSQL implementation of RunRepository.
pub struct PgRunRepository {
    pool: Pool<Postgres>,
    tables: Arc<TableNames>,
}

impl PgRunRepository {
    pub fn new(pool: Pool<Postgres>, tables: Arc<TableNames>) -> Self {
        Self { pool, tables }
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<Run>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE id = $1",
            RUN_COLUMNS, self.tables.runs
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        row.as_ref().map(parse_run_row).transpose()
    }

    async fn not_running(&self, id: Uuid) -> Error {
        match self.fetch(id).await {
            Ok(Some(_)) => Error::RunNotRunning(id),
            Ok(None) => Error::RunNotFound(id),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl RunRepository for PgRunRepository {
    async fn create_or_get(&self, run: NewRun, force: bool) -> Result<RunClaim> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!(
                "run:{}:{}:{}:{}",
                run.document_id, run.schema.id, run.schema.version, run.fingerprint
            ))
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM {}
             WHERE document_id = $1 AND schema_id = $2 AND schema_version = $3 AND fingerprint = $4
             ORDER BY started_at DESC, id DESC",
            RUN_COLUMNS, self.tables.runs
        ))
        .bind(run.document_id)
        .bind(run.schema.id)
        .bind(run.schema.version)
        .bind(&run.fingerprint)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;
        let existing = rows.iter().map(parse_run_row).collect::<Result<Vec<_>>>()?;

        if let Some(reused) = reusable_run(&existing, force) {
            tx.commit().await.map_err(Error::Database)?;
            debug!(run_id = %reused.id, status = %reused.status, "Reusing existing run");
            return Ok(RunClaim::Existing(reused));
        }

        let row = sqlx::query(&format!(
            "INSERT INTO {} (id, document_id, representation_id, schema_id, schema_version,
                             fingerprint, status, requested_by, overlay_count, started_at)
             VALUES ($1, $2, $3, $4, $5, $6, 'running', $7, 0, $8)
             RETURNING {}",
            self.tables.runs, RUN_COLUMNS
        ))
        .bind(new_v7())
        .bind(run.document_id)
        .bind(run.representation_id)
        .bind(run.schema.id)
        .bind(run.schema.version)
        .bind(&run.fingerprint)
        .bind(&run.requested_by)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await
        .map_err(Error::Database)?;
        tx.commit().await.map_err(Error::Database)?;

        Ok(RunClaim::Created(parse_run_row(&row)?))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Run>> {
        self.fetch(id).await
    }

    async fn list_for_document(&self, document_id: Uuid) -> Result<Vec<Run>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE document_id = $1 ORDER BY started_at DESC, id DESC",
            RUN_COLUMNS, self.tables.runs
        ))
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.iter().map(parse_run_row).collect()
    }

    async fn fail(&self, id: Uuid, reason: FailureReason) -> Result<Run> {
        let row = sqlx::query(&format!(
            "UPDATE {} SET status = 'failed', failure = $2, finished_at = $3
             WHERE id = $1 AND status = 'running'
             RETURNING {}",
            self.tables.runs, RUN_COLUMNS
        ))
        .bind(id)
        .bind(to_json(&reason)?)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        match row {
            Some(row) => parse_run_row(&row),
            None => Err(self.not_running(id).await),
        }
    }

    async fn request_cancel(&self, id: Uuid) -> Result<Run> {
        let row = sqlx::query(&format!(
            "UPDATE {} SET cancel_requested_at = COALESCE(cancel_requested_at, $2)
             WHERE id = $1 AND status = 'running'
             RETURNING {}",
            self.tables.runs, RUN_COLUMNS
        ))
        .bind(id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        match row {
            Some(row) => parse_run_row(&row),
            None => Err(self.not_running(id).await),
        }
    }
}
