//! # docket-db
//!
//! Storage layer for docket.
//!
//! This crate provides:
//! - Connection pool management
//! - PostgreSQL repositories for projects, documents, representations and
//!   blocks, schemas, runs, and overlays
//! - An in-memory backend ([`MemoryStore`]) with the same semantics
//!
//! ## Example
//!
//! ```rust,ignore
//! use docket_db::{Database, ProjectRepository};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/docket").await?;
//!     db.migrate().await?;
//!
//!     let project = db.projects.create("contracts").await?;
//!     println!("Created project: {}", project.id);
//!     Ok(())
//! }
//! ```
pub mod documents;
pub mod memory;
pub mod overlays;
pub mod pool;
pub mod projects;
pub mod representations;
mod rows;
mod rules;
pub mod runs;
pub mod schemas;
pub mod test_fixtures;

use std::sync::Arc;

// Re-export core types
pub use docket_core::*;

pub use documents::PgDocumentRepository;
pub use memory::MemoryStore;
pub use overlays::PgOverlayRepository;
pub use pool::{create_pool, create_pool_with_config, PoolConfig, PoolStatus};
pub use projects::PgProjectRepository;
pub use representations::PgRepresentationRepository;
pub use runs::PgRunRepository;
pub use schemas::PgSchemaRepository;

/// Database handle with all Postgres repositories.
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Table names the repositories were built with.
    pub tables: Arc<TableNames>,
    pub projects: Arc<PgProjectRepository>,
    pub documents: Arc<PgDocumentRepository>,
    pub representations: Arc<PgRepresentationRepository>,
    pub schemas: Arc<PgSchemaRepository>,
    pub runs: Arc<PgRunRepository>,
    pub overlays: Arc<PgOverlayRepository>,
}

impl Database {
    /// Create a new database instance from a connection pool with the
    /// default table layout.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self::with_tables(pool, TableNames::default())
    }

    /// Create a new database instance with explicit table names.
    pub fn with_tables(pool: sqlx::Pool<sqlx::Postgres>, tables: TableNames) -> Self {
        let tables = Arc::new(tables);
        Self {
            projects: Arc::new(PgProjectRepository::new(pool.clone(), tables.clone())),
            documents: Arc::new(PgDocumentRepository::new(pool.clone(), tables.clone())),
            representations: Arc::new(PgRepresentationRepository::new(pool.clone(), tables.clone())),
            schemas: Arc::new(PgSchemaRepository::new(pool.clone(), tables.clone())),
            runs: Arc::new(PgRunRepository::new(pool.clone(), tables.clone())),
            overlays: Arc::new(PgOverlayRepository::new(pool.clone(), tables.clone())),
            tables,
            pool,
        }
    }

    /// Connect to the database and create a new instance.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Connect with custom pool configuration and table names.
    pub async fn connect_with_config(url: &str, config: PoolConfig, tables: TableNames) -> Result<Self> {
        tables.validate()?;
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::with_tables(pool, tables))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }

    /// Current pool occupancy. Logged as a side effect.
    pub fn pool_status(&self) -> PoolStatus {
        let status = PoolStatus::of(&self.pool);
        status.log();
        status
    }

    /// Repository handles for the pipeline services.
    pub fn repositories(&self) -> Repositories {
        Repositories {
            projects: self.projects.clone(),
            documents: self.documents.clone(),
            representations: self.representations.clone(),
            schemas: self.schemas.clone(),
            runs: self.runs.clone(),
            overlays: self.overlays.clone(),
        }
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self::with_tables(self.pool.clone(), (*self.tables).clone())
    }
}
