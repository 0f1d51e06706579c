//! Core traits for docket abstractions.
//!
//! Repository traits define the durable stores (implemented over Postgres
//! and in memory by `docket-db`). Capability traits define the external
//! collaborators the pipeline invokes: parsers, schema executors, and the
//! authorization context.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// PROJECTS
// =============================================================================

/// Repository for projects.
#[async_trait]
pub trait ProjectRepository: Send + Sync {
    async fn create(&self, name: &str) -> Result<Project>;

    async fn get(&self, id: Uuid) -> Result<Option<Project>>;

    async fn list(&self) -> Result<Vec<Project>>;
}

// =============================================================================
// DOCUMENTS
// =============================================================================

/// Fields for a new source document.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub project_id: Uuid,
    pub title: String,
    pub source_type: String,
    pub locator: String,
    pub content_hash: String,
}

/// Compare-and-set state transition of a source document.
///
/// Applied only when the stored document still has `expected_version` and
/// `expected_state`; otherwise the repository returns `StaleState`.
#[derive(Debug, Clone)]
pub struct DocumentTransition {
    pub id: Uuid,
    pub expected_version: i64,
    pub expected_state: DocumentState,
    pub to: DocumentState,
    /// New content hash (re-ingestion).
    pub content_hash: Option<String>,
    /// Stored when `to` is `Failed`; cleared otherwise.
    pub failure: Option<FailureReason>,
}

impl DocumentTransition {
    pub fn from_document(doc: &SourceDocument, to: DocumentState) -> Self {
        Self {
            id: doc.id,
            expected_version: doc.version,
            expected_state: doc.state,
            to,
            content_hash: None,
            failure: None,
        }
    }

    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    pub fn with_failure(mut self, reason: FailureReason) -> Self {
        self.failure = Some(reason);
        self
    }
}

/// Repository for source documents and the documents view.
///
/// Implementations must:
/// - bump `version` on every applied transition or hash update,
/// - supersede the live representation and clear `representation_id` when a
///   document leaves `Parsed`,
/// - clear the cancellation flag when a document enters `Pending`.
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    /// Insert a document in `Pending`, or return the existing one for the
    /// same `(project_id, locator)`. The flag is true when a row was created.
    async fn insert_or_get(&self, doc: NewDocument) -> Result<(SourceDocument, bool)>;

    async fn get(&self, id: Uuid) -> Result<Option<SourceDocument>>;

    /// Apply a validated state transition.
    async fn transition(&self, t: DocumentTransition) -> Result<SourceDocument>;

    /// Replace the content hash of a `Pending` document in place.
    async fn update_pending_hash(
        &self,
        id: Uuid,
        expected_version: i64,
        content_hash: &str,
    ) -> Result<SourceDocument>;

    /// `Parsing -> Parsed`: persist the representation and its blocks, supersede
    /// the previous representation, and transition the document, atomically.
    async fn transition_parsed(
        &self,
        t: DocumentTransition,
        representation: ConversionRepresentation,
        blocks: Vec<Block>,
    ) -> Result<SourceDocument>;

    /// Flag a non-terminal document for cooperative cancellation.
    async fn request_cancel(&self, id: Uuid) -> Result<SourceDocument>;

    async fn list_view(&self, project_id: Option<Uuid>) -> Result<Vec<DocumentView>>;

    async fn get_view(&self, id: Uuid) -> Result<Option<DocumentView>>;
}

// =============================================================================
// REPRESENTATIONS & BLOCKS
// =============================================================================

/// Read access to conversion representations and their blocks.
#[async_trait]
pub trait RepresentationRepository: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<ConversionRepresentation>>;

    /// The document's non-superseded representation.
    async fn live_for_document(&self, document_id: Uuid) -> Result<Option<ConversionRepresentation>>;

    /// Every representation of a document, newest first, superseded included.
    async fn list_for_document(&self, document_id: Uuid) -> Result<Vec<ConversionRepresentation>>;

    /// Blocks of a representation ordered by `order_index`.
    async fn blocks(&self, representation_id: Uuid) -> Result<Vec<Block>>;
}

// =============================================================================
// SCHEMAS
// =============================================================================

/// Result of publishing a schema definition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishedSchema {
    pub schema: Schema,
    /// False when an identical definition was already published under the ref.
    pub created: bool,
}

/// Repository for versioned schemas.
#[async_trait]
pub trait SchemaRepository: Send + Sync {
    /// Publish under `schema_ref`. An identical definition hash returns the
    /// existing version; otherwise version `latest + 1` is inserted with the
    /// ref's lineage id (or a new lineage for a new ref).
    async fn publish(
        &self,
        schema_ref: &str,
        definition: serde_json::Value,
        definition_hash: &str,
    ) -> Result<PublishedSchema>;

    async fn get(&self, key: SchemaKey) -> Result<Option<Schema>>;

    async fn latest(&self, id: Uuid) -> Result<Option<Schema>>;

    async fn find_by_ref(&self, schema_ref: &str) -> Result<Option<Schema>>;

    /// Latest version of every lineage.
    async fn list_latest(&self) -> Result<Vec<Schema>>;

    async fn list_versions(&self, id: Uuid) -> Result<Vec<Schema>>;
}

// =============================================================================
// RUNS & OVERLAYS
// =============================================================================

/// Fields for a new run.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub document_id: Uuid,
    pub representation_id: Uuid,
    pub schema: SchemaKey,
    pub fingerprint: String,
    pub requested_by: String,
}

/// Outcome of run deduplication.
#[derive(Debug, Clone, PartialEq)]
pub enum RunClaim {
    /// A new `Running` run was created; the caller must execute it.
    Created(Run),
    /// An equivalent run already exists and is returned instead.
    Existing(Run),
}

impl RunClaim {
    pub fn run(&self) -> &Run {
        match self {
            RunClaim::Created(run) | RunClaim::Existing(run) => run,
        }
    }

    pub fn into_run(self) -> Run {
        match self {
            RunClaim::Created(run) | RunClaim::Existing(run) => run,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, RunClaim::Created(_))
    }
}

/// Repository for runs.
#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Atomically deduplicate on `(document, schema id+version, fingerprint)`.
    ///
    /// A `Running` or `Succeeded` run is returned as `Existing`. The most
    /// recent `Failed` run is returned as `Existing` unless `force` is set.
    /// Otherwise a new `Running` run is created.
    async fn create_or_get(&self, run: NewRun, force: bool) -> Result<RunClaim>;

    async fn get(&self, id: Uuid) -> Result<Option<Run>>;

    /// Runs of a document, newest first.
    async fn list_for_document(&self, document_id: Uuid) -> Result<Vec<Run>>;

    /// `Running -> Failed(reason)`. `RunNotRunning` if already terminal.
    async fn fail(&self, id: Uuid, reason: FailureReason) -> Result<Run>;

    /// Flag a running run for cooperative cancellation.
    async fn request_cancel(&self, id: Uuid) -> Result<Run>;
}

/// Repository for overlays.
#[async_trait]
pub trait OverlayRepository: Send + Sync {
    /// Append-only, all-or-nothing publication that seals the run as
    /// `Succeeded`. `RunNotRunning` if the run is not `Running`.
    async fn append(&self, run_id: Uuid, overlays: Vec<Overlay>) -> Result<Run>;

    /// Overlays of a document ordered by block order index, then creation time.
    async fn list_for_document(&self, document_id: Uuid, filter: OverlayFilter) -> Result<Vec<Overlay>>;

    async fn list_for_run(&self, run_id: Uuid) -> Result<Vec<Overlay>>;
}

/// Bundle of repository handles shared by the pipeline services.
#[derive(Clone)]
pub struct Repositories {
    pub projects: Arc<dyn ProjectRepository>,
    pub documents: Arc<dyn DocumentRepository>,
    pub representations: Arc<dyn RepresentationRepository>,
    pub schemas: Arc<dyn SchemaRepository>,
    pub runs: Arc<dyn RunRepository>,
    pub overlays: Arc<dyn OverlayRepository>,
}

// =============================================================================
// CAPABILITIES
// =============================================================================

/// External parser capability: turns a stored source into a representation.
#[async_trait]
pub trait Parser: Send + Sync {
    /// Name recorded as the representation's `parsing_tool`.
    fn name(&self) -> &str;

    /// Parse the source behind `locator`.
    ///
    /// `Parse` errors are permanent; `Unavailable`/`Request` are retried.
    async fn parse(&self, locator: &str) -> Result<ParsedRepresentation>;

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

/// External schema-execution capability.
#[async_trait]
pub trait SchemaExecutor: Send + Sync {
    fn name(&self) -> &str;

    /// Execute `schema` over the ordered blocks and return annotations keyed
    /// by block id.
    async fn execute(&self, schema: &Schema, blocks: &[Block]) -> Result<Vec<Annotation>>;

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Opaque authorization decision consulted before submissions and runs.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Resolve the caller. Errors are `Unauthorized`, `Forbidden`, or `RateLimited`.
    async fn authorize(&self, credential: &Credential, action: Action) -> Result<Principal>;
}
