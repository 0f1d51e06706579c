//! # docket-pipeline
//!
//! Parsing, block extraction, and schema-run services for docket.
//!
//! This crate provides:
//! - The document store and its state machine
//! - A parsing coordinator with pluggable parsers and retry with backoff
//! - Deterministic block extraction from conversion representations
//! - A deduplicating run executor and the overlay store
//! - A bounded worker pool that executes parse and run jobs
//! - API-key authorization with keyed rate limiting
//!
//! ## Example
//!
//! ```ignore
//! use docket_pipeline::{Pipeline, ParserRegistry, MarkdownFileParser, PipelineConfig};
//! use docket_db::MemoryStore;
//!
//! let pipeline = Pipeline::builder(MemoryStore::default().repositories())
//!     .with_parsers(ParserRegistry::new().with_fallback(Arc::new(MarkdownFileParser::from_env())))
//!     .with_config(PipelineConfig::from_env())
//!     .start()
//!     .await;
//!
//! let result = pipeline
//!     .ingest(&Credential::Anonymous, IngestRequest::new(project_id, "notes.md", hash), true)
//!     .await?;
//!
//! let mut events = pipeline
//!     .subscribe(&Credential::Anonymous, ScopeFilter::document(result.document.id))
//!     .await?;
//! while let Some(item) = events.next().await {
//!     println!("{:?}", item);
//! }
//!
//! pipeline.shutdown().await?;
//! ```

pub mod auth;
pub mod coordinator;
pub mod document_store;
pub mod executors;
pub mod export;
pub mod extractor;
pub mod handler;
pub(crate) mod http_client;
mod locks;
pub mod overlay_store;
pub mod parsers;
pub mod pipeline;
pub mod retry;
pub mod run_executor;
pub mod schema_registry;
pub mod worker;

// Re-export core types
pub use docket_core::*;

pub use auth::{AllowAllAuthorizer, ApiKeyAuthorizer};
pub use coordinator::{CoordinatorConfig, ParsingCoordinator, SubmitOutcome};
pub use document_store::DocumentStore;
pub use executors::{DisabledExecutor, HttpSchemaExecutor};
pub use export::{to_jsonl, ExportRecord, JSONL_CONTENT_TYPE};
pub use extractor::{BlockExtractor, Extraction};
pub use handler::{JobContext, JobHandler, JobKind, JobResult, PipelineJob};
pub use locks::DocumentLocks;
pub use overlay_store::OverlayStore;
pub use parsers::{HttpConversionParser, MarkdownFileParser, ParserRegistry};
pub use pipeline::{IngestResult, Pipeline, PipelineBuilder, PipelineConfig, PipelineHealth, RunResult};
pub use retry::RetryPolicy;
pub use run_executor::{RunExecutor, RunExecutorConfig, RunRequest};
pub use schema_registry::SchemaRegistry;
pub use worker::{
    default_job_queue, job_queue, JobReceiver, JobSender, PipelineWorker, WorkerBuilder,
    WorkerConfig, WorkerEvent, WorkerHandle,
};
