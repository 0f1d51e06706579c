//! The assembled pipeline: services, worker, notifier, and authorizer.
//!
//! Every public operation takes the caller's [`Credential`], consults the
//! [`Authorizer`], and attributes the resulting events to the resolved
//! principal.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use docket_core::defaults::{EVENT_BUS_CAPACITY, JOB_QUEUE_CAPACITY};
use docket_core::{
    Action, Authorizer, Block, ChangeNotifier, ConversionRepresentation, Credential, DocumentView,
    Error, EventActor, EventContext, IngestOutcome, IngestRequest, Overlay, OverlayFilter,
    Principal, Project, ProjectRepository, PublishSchemaRequest, PublishedSchema, Repositories,
    Result, Run, RunClaim, Schema, SchemaExecutor, SchemaKey, ScopeFilter, SourceDocument,
    Subscription,
};
use docket_core::logging::SUBSYSTEM_PIPELINE;

use crate::auth::AllowAllAuthorizer;
use crate::coordinator::{CoordinatorConfig, ParsingCoordinator, SubmitOutcome};
use crate::document_store::DocumentStore;
use crate::executors::DisabledExecutor;
use crate::export::ExportRecord;
use crate::locks::DocumentLocks;
use crate::overlay_store::OverlayStore;
use crate::parsers::ParserRegistry;
use crate::run_executor::{RunExecutor, RunExecutorConfig, RunRequest};
use crate::schema_registry::SchemaRegistry;
use crate::worker::{job_queue, JobSender, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle};

/// Configuration for the whole pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub worker: WorkerConfig,
    pub coordinator: CoordinatorConfig,
    pub runs: RunExecutorConfig,
    pub queue_capacity: usize,
    pub event_bus_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            coordinator: CoordinatorConfig::default(),
            runs: RunExecutorConfig::default(),
            queue_capacity: JOB_QUEUE_CAPACITY,
            event_bus_capacity: EVENT_BUS_CAPACITY,
        }
    }
}

impl PipelineConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// Reads the worker, coordinator and run-executor variables plus
    /// `EVENT_BUS_CAPACITY`.
    pub fn from_env() -> Self {
        let event_bus_capacity = std::env::var("EVENT_BUS_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(EVENT_BUS_CAPACITY)
            .max(1);
        Self {
            worker: WorkerConfig::from_env(),
            coordinator: CoordinatorConfig::from_env(),
            runs: RunExecutorConfig::from_env(),
            queue_capacity: JOB_QUEUE_CAPACITY,
            event_bus_capacity,
        }
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_coordinator(mut self, coordinator: CoordinatorConfig) -> Self {
        self.coordinator = coordinator;
        self
    }

    pub fn with_runs(mut self, runs: RunExecutorConfig) -> Self {
        self.runs = runs;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_event_bus_capacity(mut self, capacity: usize) -> Self {
        self.event_bus_capacity = capacity.max(1);
        self
    }
}

/// Result of an ingest call.
#[derive(Debug, Clone, Serialize)]
pub struct IngestResult {
    pub document: SourceDocument,
    pub outcome: IngestOutcome,
    /// Present when the call also submitted the document for parsing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submit: Option<SubmitOutcome>,
}

/// Result of a run request.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run: Run,
    /// False when an existing run was returned.
    pub created: bool,
}

impl From<RunClaim> for RunResult {
    fn from(claim: RunClaim) -> Self {
        let created = claim.is_created();
        Self {
            run: claim.into_run(),
            created,
        }
    }
}

/// Capability and worker status.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineHealth {
    pub parsers: HashMap<String, bool>,
    pub executor: String,
    pub executor_healthy: bool,
    pub worker_running: bool,
    pub pending_jobs: usize,
    pub subscribers: usize,
    pub last_sequence: u64,
}

/// Builder for [`Pipeline`].
pub struct PipelineBuilder {
    repos: Repositories,
    parsers: ParserRegistry,
    executor: Arc<dyn SchemaExecutor>,
    authorizer: Arc<dyn Authorizer>,
    config: PipelineConfig,
}

impl PipelineBuilder {
    pub fn new(repos: Repositories) -> Self {
        Self {
            repos,
            parsers: ParserRegistry::new(),
            executor: Arc::new(DisabledExecutor),
            authorizer: Arc::new(AllowAllAuthorizer),
            config: PipelineConfig::default(),
        }
    }

    pub fn with_parsers(mut self, parsers: ParserRegistry) -> Self {
        self.parsers = parsers;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn SchemaExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Wire the services and start the worker.
    pub async fn start(self) -> Pipeline {
        let notifier = Arc::new(ChangeNotifier::new(self.config.event_bus_capacity));
        let locks = DocumentLocks::new();
        let (jobs, receiver) = job_queue(self.config.queue_capacity);

        let documents = DocumentStore::new(self.repos.clone(), notifier.clone(), locks.clone());
        let coordinator = Arc::new(ParsingCoordinator::new(
            documents.clone(),
            self.parsers,
            jobs.clone(),
            self.config.coordinator.clone(),
        ));
        let runs = Arc::new(RunExecutor::new(
            self.repos.clone(),
            notifier.clone(),
            locks,
            jobs.clone(),
            self.executor,
            self.config.runs.clone(),
        ));

        let worker = WorkerBuilder::new(receiver)
            .with_config(self.config.worker.clone())
            .with_handler(coordinator.clone())
            .with_handler(runs.clone())
            .build()
            .await;
        let handle = worker.start();

        info!(
            subsystem = SUBSYSTEM_PIPELINE,
            component = "pipeline",
            max_concurrent_jobs = self.config.worker.max_concurrent_jobs,
            worker_enabled = self.config.worker.enabled,
            executor = runs.executor_name(),
            "Pipeline started"
        );

        Pipeline {
            projects: self.repos.projects.clone(),
            overlays: OverlayStore::new(self.repos.clone()),
            schemas: SchemaRegistry::new(self.repos.schemas.clone(), notifier.clone()),
            notifier,
            authorizer: self.authorizer,
            documents,
            coordinator,
            runs,
            jobs,
            worker: Mutex::new(Some(handle)),
        }
    }
}

/// Entry point to every pipeline operation.
pub struct Pipeline {
    notifier: Arc<ChangeNotifier>,
    authorizer: Arc<dyn Authorizer>,
    projects: Arc<dyn ProjectRepository>,
    documents: DocumentStore,
    coordinator: Arc<ParsingCoordinator>,
    runs: Arc<RunExecutor>,
    overlays: OverlayStore,
    schemas: SchemaRegistry,
    jobs: JobSender,
    worker: Mutex<Option<WorkerHandle>>,
}

impl Pipeline {
    pub fn builder(repos: Repositories) -> PipelineBuilder {
        PipelineBuilder::new(repos)
    }

    pub fn notifier(&self) -> Arc<ChangeNotifier> {
        self.notifier.clone()
    }

    async fn authorize(&self, credential: &Credential, action: Action) -> Result<Principal> {
        self.authorizer.authorize(credential, action).await
    }

    fn context(principal: &Principal) -> EventContext {
        EventContext::actor(EventActor::user(principal.identity.clone()))
    }

    // -------------------------------------------------------------------------
    // Projects
    // -------------------------------------------------------------------------

    pub async fn create_project(&self, credential: &Credential, name: &str) -> Result<Project> {
        self.authorize(credential, Action::Ingest).await?;
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidInput("project name must not be empty".to_string()));
        }
        self.projects.create(name).await
    }

    pub async fn list_projects(&self, credential: &Credential) -> Result<Vec<Project>> {
        self.authorize(credential, Action::Read).await?;
        self.projects.list().await
    }

    // -------------------------------------------------------------------------
    // Documents
    // -------------------------------------------------------------------------

    /// Ingest a document, optionally submitting it for parsing.
    ///
    /// Unchanged re-ingests are never submitted.
    pub async fn ingest(&self, credential: &Credential, req: IngestRequest, submit: bool) -> Result<IngestResult> {
        let principal = self.authorize(credential, Action::Ingest).await?;
        let (document, outcome) = self.documents.ingest(&Self::context(&principal), req).await?;

        let submit = if submit && outcome != IngestOutcome::Unchanged {
            let submit_principal = self.authorize(credential, Action::Submit).await?;
            Some(self.coordinator.submit(&submit_principal, document.id).await?)
        } else {
            None
        };
        Ok(IngestResult {
            document,
            outcome,
            submit,
        })
    }

    pub async fn submit(&self, credential: &Credential, document_id: Uuid) -> Result<SubmitOutcome> {
        let principal = self.authorize(credential, Action::Submit).await?;
        self.coordinator.submit(&principal, document_id).await
    }

    pub async fn resubmit(&self, credential: &Credential, document_id: Uuid) -> Result<SubmitOutcome> {
        let principal = self.authorize(credential, Action::Submit).await?;
        self.coordinator.resubmit(&principal, document_id).await
    }

    pub async fn cancel_document(&self, credential: &Credential, document_id: Uuid) -> Result<SourceDocument> {
        let principal = self.authorize(credential, Action::Cancel).await?;
        self.coordinator.cancel(&principal, document_id).await
    }

    pub async fn get_document(&self, credential: &Credential, document_id: Uuid) -> Result<DocumentView> {
        self.authorize(credential, Action::Read).await?;
        self.documents.get_view(document_id).await
    }

    pub async fn list_documents(&self, credential: &Credential, project_id: Option<Uuid>) -> Result<Vec<DocumentView>> {
        self.authorize(credential, Action::Read).await?;
        self.documents.list_view(project_id).await
    }

    pub async fn blocks(&self, credential: &Credential, document_id: Uuid) -> Result<Vec<Block>> {
        self.authorize(credential, Action::Read).await?;
        self.documents.live_blocks(document_id).await
    }

    /// Every representation of a document, superseded ones included.
    pub async fn representations(
        &self,
        credential: &Credential,
        document_id: Uuid,
    ) -> Result<Vec<ConversionRepresentation>> {
        self.authorize(credential, Action::Read).await?;
        self.documents.representations(document_id).await
    }

    // -------------------------------------------------------------------------
    // Runs and overlays
    // -------------------------------------------------------------------------

    pub async fn request_run(&self, credential: &Credential, req: RunRequest) -> Result<RunResult> {
        let principal = self.authorize(credential, Action::RequestRun).await?;
        self.runs.request_run(&principal, req).await.map(RunResult::from)
    }

    pub async fn get_run(&self, credential: &Credential, run_id: Uuid) -> Result<Run> {
        self.authorize(credential, Action::Read).await?;
        self.runs.get_run(run_id).await
    }

    pub async fn list_runs(&self, credential: &Credential, document_id: Uuid) -> Result<Vec<Run>> {
        self.authorize(credential, Action::Read).await?;
        self.runs.list_runs(document_id).await
    }

    pub async fn cancel_run(&self, credential: &Credential, run_id: Uuid) -> Result<Run> {
        let principal = self.authorize(credential, Action::Cancel).await?;
        self.runs.cancel_run(&principal, run_id).await
    }

    pub async fn list_overlays(
        &self,
        credential: &Credential,
        document_id: Uuid,
        filter: OverlayFilter,
    ) -> Result<Vec<Overlay>> {
        self.authorize(credential, Action::Read).await?;
        self.overlays.list_overlays(document_id, filter).await
    }

    pub async fn run_overlays(&self, credential: &Credential, run_id: Uuid) -> Result<Vec<Overlay>> {
        self.authorize(credential, Action::Read).await?;
        self.overlays.list_for_run(run_id).await
    }

    pub async fn export_run(&self, credential: &Credential, run_id: Uuid) -> Result<Vec<ExportRecord>> {
        self.authorize(credential, Action::Read).await?;
        self.overlays.export_run(run_id).await
    }

    pub async fn export_document(&self, credential: &Credential, document_id: Uuid) -> Result<Vec<ExportRecord>> {
        self.authorize(credential, Action::Read).await?;
        self.overlays.export_document(document_id).await
    }

    // -------------------------------------------------------------------------
    // Schemas
    // -------------------------------------------------------------------------

    pub async fn publish_schema(&self, credential: &Credential, req: PublishSchemaRequest) -> Result<PublishedSchema> {
        let principal = self.authorize(credential, Action::PublishSchema).await?;
        self.schemas.publish(&Self::context(&principal), req).await
    }

    pub async fn list_schemas(&self, credential: &Credential) -> Result<Vec<Schema>> {
        self.authorize(credential, Action::Read).await?;
        self.schemas.list().await
    }

    pub async fn get_schema(&self, credential: &Credential, key: SchemaKey) -> Result<Schema> {
        self.authorize(credential, Action::Read).await?;
        self.schemas.get(key).await
    }

    pub async fn schema_versions(&self, credential: &Credential, schema_id: Uuid) -> Result<Vec<Schema>> {
        self.authorize(credential, Action::Read).await?;
        self.schemas.versions(schema_id).await
    }

    // -------------------------------------------------------------------------
    // Events and lifecycle
    // -------------------------------------------------------------------------

    /// Live event stream for a scope. Reconnecting clients resync by reading
    /// current state after subscribing.
    pub async fn subscribe(&self, credential: &Credential, filter: ScopeFilter) -> Result<Subscription> {
        self.authorize(credential, Action::Read).await?;
        Ok(self.notifier.subscribe(filter))
    }

    pub async fn health(&self) -> PipelineHealth {
        let executor_healthy = match self.runs.executor_health().await {
            Ok(healthy) => healthy,
            Err(e) => {
                warn!(error = %e, "Schema executor health check errored");
                false
            }
        };
        PipelineHealth {
            parsers: self.coordinator.parsers().health_check_all().await,
            executor: self.runs.executor_name().to_string(),
            executor_healthy,
            worker_running: self.worker.lock().await.is_some(),
            pending_jobs: self.jobs.pending_count(),
            subscribers: self.notifier.subscriber_count(),
            last_sequence: self.notifier.last_sequence(),
        }
    }

    /// Worker lifecycle events; `None` after shutdown.
    pub async fn worker_events(&self) -> Option<broadcast::Receiver<WorkerEvent>> {
        self.worker.lock().await.as_ref().map(WorkerHandle::events)
    }

    /// Stop the worker after in-flight jobs finish. Runs still queued are
    /// failed as cancelled. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        let handle = self.worker.lock().await.take();
        match handle {
            Some(handle) => {
                handle.shutdown().await?;
                info!(subsystem = SUBSYSTEM_PIPELINE, component = "pipeline", "Pipeline stopped");
                Ok(())
            }
            None => Ok(()),
        }
    }
}
