//! Run Executor: executes a schema version against a document's block set.
//!
//! `request_run` deduplicates on `(document, schema version, fingerprint)`
//! and only enqueues; the run job invokes the schema-execution capability on
//! the worker pool and publishes its overlays atomically.
//!
//! A `Running` run whose job is gone is failed with `Cancelled` by
//! `cancel_run`; one whose job was still queued at shutdown is failed the
//! same way by the worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use docket_core::defaults::RUN_TIMEOUT_SECS;
use docket_core::hashing::block_set_fingerprint;
use docket_core::{
    new_v7, Annotation, Block, ChangeNotifier, DocumentState, Error, EventActor, EventContext,
    FailureReason, NewRun, Overlay, PipelineEvent, Principal, Repositories, Result, Run, RunClaim,
    RunStatus, SchemaExecutor, SchemaKey,
};
use docket_core::logging::SUBSYSTEM_PIPELINE;

use crate::handler::{JobContext, JobHandler, JobKind, JobResult, PipelineJob};
use crate::locks::DocumentLocks;
use crate::retry::RetryPolicy;
use crate::worker::JobSender;

/// Request to run a schema version against a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub document_id: Uuid,
    pub schema: SchemaKey,
    /// Start a new run even if the last one for this fingerprint failed.
    #[serde(default)]
    pub force: bool,
}

/// Run-job configuration.
#[derive(Debug, Clone)]
pub struct RunExecutorConfig {
    /// Bound on a single execution call.
    pub run_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for RunExecutorConfig {
    fn default() -> Self {
        Self {
            run_timeout: Duration::from_secs(RUN_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
        }
    }
}

impl RunExecutorConfig {
    /// `RUN_TIMEOUT_SECS` plus [`RetryPolicy::from_env`].
    pub fn from_env() -> Self {
        let run_timeout = std::env::var("RUN_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(RUN_TIMEOUT_SECS)
            .max(1);
        Self {
            run_timeout: Duration::from_secs(run_timeout),
            retry: RetryPolicy::from_env(),
        }
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Executes schema runs and publishes their overlays.
pub struct RunExecutor {
    repos: Repositories,
    notifier: Arc<ChangeNotifier>,
    locks: DocumentLocks,
    jobs: JobSender,
    executor: Arc<dyn SchemaExecutor>,
    config: RunExecutorConfig,
}

impl RunExecutor {
    pub fn new(
        repos: Repositories,
        notifier: Arc<ChangeNotifier>,
        locks: DocumentLocks,
        jobs: JobSender,
        executor: Arc<dyn SchemaExecutor>,
        config: RunExecutorConfig,
    ) -> Self {
        Self {
            repos,
            notifier,
            locks,
            jobs,
            executor,
            config,
        }
    }

    /// Name of the schema-execution capability in use.
    pub fn executor_name(&self) -> &str {
        self.executor.name()
    }

    pub async fn executor_health(&self) -> Result<bool> {
        self.executor.health_check().await
    }

    /// Start a run, or return the existing run for the same block set.
    ///
    /// A `Running` or `Succeeded` run with the same fingerprint is always
    /// returned. A `Failed` one is returned unless `force` is set.
    #[instrument(skip(self, principal), fields(subsystem = SUBSYSTEM_PIPELINE, component = "run_executor", op = "request_run", document_id = %req.document_id))]
    pub async fn request_run(&self, principal: &Principal, req: RunRequest) -> Result<RunClaim> {
        if self.repos.schemas.get(req.schema).await?.is_none() {
            return Err(Error::SchemaNotFound {
                id: req.schema.id,
                version: req.schema.version,
            });
        }

        // The block set is read under the lock so a concurrent re-ingest
        // cannot supersede it between the read and the claim.
        let guard = self.locks.lock(req.document_id).await;
        let doc = self
            .repos
            .documents
            .get(req.document_id)
            .await?
            .ok_or(Error::DocumentNotFound(req.document_id))?;
        if doc.state != DocumentState::Parsed {
            return Err(Error::DocumentNotParsed(doc.id));
        }
        let representation = self
            .repos
            .representations
            .live_for_document(doc.id)
            .await?
            .ok_or(Error::DocumentNotParsed(doc.id))?;
        let blocks = self.repos.representations.blocks(representation.id).await?;
        let fingerprint = block_set_fingerprint(&blocks);

        let claim = self
            .repos
            .runs
            .create_or_get(
                NewRun {
                    document_id: doc.id,
                    representation_id: representation.id,
                    schema: req.schema,
                    fingerprint: fingerprint.clone(),
                    requested_by: principal.identity.clone(),
                },
                req.force,
            )
            .await?;
        if let RunClaim::Created(run) = &claim {
            self.notifier.publish_with_context(
                PipelineEvent::RunStarted {
                    project_id: doc.project_id,
                    document_id: doc.id,
                    run_id: run.id,
                    schema_id: run.schema_id,
                    schema_version: run.schema_version,
                    fingerprint,
                },
                user_context(principal, doc.id),
            );
        }
        // `fail` below takes the lock again.
        drop(guard);

        match &claim {
            RunClaim::Created(run) => {
                info!(run_id = %run.id, schema_id = %run.schema_id, schema_version = run.schema_version, "Run started");
                if let Err(e) = self.jobs.enqueue(PipelineJob::Run { run_id: run.id }) {
                    error!(run_id = %run.id, error = %e, "Failed to enqueue run");
                    let ctx = user_context(principal, doc.id);
                    self.fail(&ctx, run, doc.project_id, FailureReason::Internal { message: e.to_string() })
                        .await?;
                    return Err(e);
                }
            }
            RunClaim::Existing(run) => {
                debug!(run_id = %run.id, status = %run.status, "Reusing existing run");
            }
        }
        Ok(claim)
    }

    /// Flag a running run for cancellation; the run job fails it at the next
    /// checkpoint. A run that no job of this process holds is failed right
    /// away.
    pub async fn cancel_run(&self, principal: &Principal, run_id: Uuid) -> Result<Run> {
        let run = self.repos.runs.request_cancel(run_id).await?;
        info!(
            subsystem = SUBSYSTEM_PIPELINE,
            component = "run_executor",
            op = "cancel_run",
            run_id = %run_id,
            requested_by = %principal.identity,
            "Run cancellation requested"
        );
        if self.jobs.is_held(run.id) {
            return Ok(run);
        }
        let project_id = self.project_of(&run).await?;
        let ctx = user_context(principal, run.document_id);
        if let JobResult::Failed(_) = self.fail(&ctx, &run, project_id, FailureReason::Cancelled).await? {
            warn!(run_id = %run.id, "Run had no job, failed as cancelled");
        }
        self.get_run(run_id).await
    }

    /// Fail a run whose job was dropped from the queue at shutdown.
    async fn abandon_run(&self, run_id: Uuid) -> Result<()> {
        let run = self.get_run(run_id).await?;
        if run.status != RunStatus::Running {
            return Ok(());
        }
        let project_id = self.project_of(&run).await?;
        let ctx = EventContext::actor(EventActor::system()).with_correlation(run.id);
        self.fail(&ctx, &run, project_id, FailureReason::Cancelled).await?;
        Ok(())
    }

    async fn project_of(&self, run: &Run) -> Result<Uuid> {
        Ok(self
            .repos
            .documents
            .get(run.document_id)
            .await?
            .ok_or(Error::DocumentNotFound(run.document_id))?
            .project_id)
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<Run> {
        self.repos
            .runs
            .get(run_id)
            .await?
            .ok_or(Error::RunNotFound(run_id))
    }

    /// Runs of a document, newest first.
    pub async fn list_runs(&self, document_id: Uuid) -> Result<Vec<Run>> {
        if self.repos.documents.get(document_id).await?.is_none() {
            return Err(Error::DocumentNotFound(document_id));
        }
        self.repos.runs.list_for_document(document_id).await
    }

    /// Body of the run job.
    #[instrument(skip(self), fields(subsystem = SUBSYSTEM_PIPELINE, component = "run_executor", op = "execute"))]
    pub async fn process(&self, run_id: Uuid) -> Result<JobResult> {
        let run = self.get_run(run_id).await?;
        if run.status != RunStatus::Running {
            return Ok(JobResult::Skipped(format!("run is {}", run.status)));
        }
        let project_id = self.project_of(&run).await?;
        let ctx = EventContext::actor(EventActor::system()).with_correlation(run.id);

        let overlays = match self.execute(&run).await {
            Ok(overlays) => overlays,
            Err(e) => return self.fail(&ctx, &run, project_id, run_failure(&e)).await,
        };

        let appended = {
            let _guard = self.locks.lock(run.document_id).await;
            let appended = self.repos.overlays.append(run.id, overlays).await;
            if let Ok(sealed) = &appended {
                self.notifier.publish_with_context(
                    PipelineEvent::OverlaysPublished {
                        project_id,
                        document_id: run.document_id,
                        run_id: run.id,
                        overlay_count: sealed.overlay_count,
                    },
                    ctx.clone(),
                );
                self.notifier.publish_with_context(
                    PipelineEvent::RunSucceeded {
                        project_id,
                        document_id: run.document_id,
                        run_id: run.id,
                        overlay_count: sealed.overlay_count,
                    },
                    ctx.clone(),
                );
            }
            appended
        };

        match appended {
            Ok(sealed) => {
                info!(run_id = %run.id, overlay_count = sealed.overlay_count, "Run succeeded");
                Ok(JobResult::Success)
            }
            Err(Error::RunNotRunning(_)) => Ok(JobResult::Skipped("run already finished".to_string())),
            Err(e) => {
                error!(run_id = %run.id, error = %e, "Failed to publish overlays");
                self.fail(&ctx, &run, project_id, FailureReason::Internal { message: e.to_string() })
                    .await
            }
        }
    }

    /// Invoke the capability and turn its annotations into overlays.
    async fn execute(&self, run: &Run) -> Result<Vec<Overlay>> {
        self.checkpoint(run.id).await?;

        let schema = self
            .repos
            .schemas
            .get(run.schema_key())
            .await?
            .ok_or(Error::SchemaNotFound {
                id: run.schema_id,
                version: run.schema_version,
            })?;
        let blocks = self.repos.representations.blocks(run.representation_id).await?;

        let annotations = self
            .config
            .retry
            .run("execute", self.config.run_timeout, || self.executor.execute(&schema, &blocks))
            .await?;

        self.checkpoint(run.id).await?;

        to_overlays(run.id, &blocks, annotations)
    }

    /// Fail with `Cancelled` if cancellation was requested.
    async fn checkpoint(&self, run_id: Uuid) -> Result<()> {
        let current = self.get_run(run_id).await?;
        if current.cancel_requested() {
            return Err(Error::Cancelled(format!("run {}", run_id)));
        }
        Ok(())
    }

    async fn fail(
        &self,
        ctx: &EventContext,
        run: &Run,
        project_id: Uuid,
        reason: FailureReason,
    ) -> Result<JobResult> {
        let message = reason.message().to_string();
        let _guard = self.locks.lock(run.document_id).await;
        match self.repos.runs.fail(run.id, reason.clone()).await {
            Ok(_) => {
                self.notifier.publish_with_context(
                    PipelineEvent::RunFailed {
                        project_id,
                        document_id: run.document_id,
                        run_id: run.id,
                        failure: reason,
                    },
                    ctx.clone(),
                );
                warn!(run_id = %run.id, %message, "Run failed");
                Ok(JobResult::Failed(message))
            }
            Err(Error::RunNotRunning(_)) => Ok(JobResult::Skipped("run already finished".to_string())),
            Err(e) => Err(e),
        }
    }
}

fn user_context(principal: &Principal, document_id: Uuid) -> EventContext {
    EventContext::actor(EventActor::user(principal.identity.clone())).with_correlation(document_id)
}

/// One overlay per annotation, in block order. Annotations for blocks outside
/// the run's block set reject the whole batch.
fn to_overlays(run_id: Uuid, blocks: &[Block], annotations: Vec<Annotation>) -> Result<Vec<Overlay>> {
    let order: HashMap<Uuid, i32> = blocks.iter().map(|b| (b.id, b.order_index)).collect();
    let created_at = Utc::now();
    let mut overlays = annotations
        .into_iter()
        .map(|a| {
            let order_index = *order.get(&a.block_id).ok_or_else(|| {
                Error::Execution(format!("annotation references unknown block {}", a.block_id))
            })?;
            Ok(Overlay {
                id: new_v7(),
                run_id,
                block_id: a.block_id,
                order_index,
                payload: a.payload,
                created_at,
                superseded: false,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    overlays.sort_by_key(|o| o.order_index);
    Ok(overlays)
}

/// Failure reason recorded for an execution error. Transient errors that
/// exhausted their retries are attributed to the executor.
fn run_failure(err: &Error) -> FailureReason {
    match err {
        Error::Unavailable(m) | Error::Request(m) => FailureReason::Execution {
            message: format!("schema executor unavailable: {}", m),
        },
        other => FailureReason::from(other),
    }
}

#[async_trait]
impl JobHandler for RunExecutor {
    fn kind(&self) -> JobKind {
        JobKind::Run
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        let Some(run_id) = ctx.run_id() else {
            return JobResult::Failed("run handler received a non-run job".to_string());
        };
        match self.process(run_id).await {
            Ok(result) => result,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Run job errored");
                JobResult::Failed(e.to_string())
            }
        }
    }

    async fn abandon(&self, ctx: JobContext) {
        let Some(run_id) = ctx.run_id() else {
            return;
        };
        if let Err(e) = self.abandon_run(run_id).await {
            error!(run_id = %run_id, error = %e, "Failed to fail abandoned run");
        }
    }
}
