//! Project repository implementation.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use docket_core::{new_v7, Error, Project, ProjectRepository, Result, TableNames};

/// PostgreSQL implementation of ProjectRepository.
pub struct PgProjectRepository {
    pool: Pool<Postgres>,
    tables: Arc<TableNames>,
}

impl PgProjectRepository {
    pub fn new(pool: Pool<Postgres>, tables: Arc<TableNames>) -> Self {
        Self { pool, tables }
    }

    fn parse_row(row: sqlx::postgres::PgRow) -> Project {
        Project {
            id: row.get("id"),
            name: row.get("name"),
            created_at: row.get("created_at"),
        }
    }
}

#[async_trait]
impl ProjectRepository for PgProjectRepository {
    async fn create(&self, name: &str) -> Result<Project> {
        let row = sqlx::query(&format!(
            "INSERT INTO {} (id, name, created_at) VALUES ($1, $2, $3) RETURNING id, name, created_at",
            self.tables.projects
        ))
        .bind(new_v7())
        .bind(name)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(Self::parse_row(row))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Project>> {
        let row = sqlx::query(&format!(
            "SELECT id, name, created_at FROM {} WHERE id = $1",
            self.tables.projects
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.map(Self::parse_row))
    }

    async fn list(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query(&format!(
            "SELECT id, name, created_at FROM {} ORDER BY created_at, id",
            self.tables.projects
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(rows.into_iter().map(Self::parse_row).collect())
    }
}
