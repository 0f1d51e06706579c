//! Parsing Coordinator: drives documents from `Pending` through parsing.
//!
//! `submit` only enqueues; the parse job does the work on the worker pool:
//!
//! 1. `Pending -> Parsing` (losing the race to another job is a no-op)
//! 2. cancellation checkpoint
//! 3. parser call, retried on transient failures, bounded by a timeout
//! 4. cancellation checkpoint
//! 5. block extraction
//! 6. `Parsing -> Parsed` with the representation and blocks
//!
//! Any failure after step 1 ends in `Parsing -> Failed(reason)`.
//!
//! A `Parsing` document whose job is gone (crash, restart) is failed with
//! `Cancelled` by `cancel`, or by `resubmit` once cancellation was requested.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use docket_core::defaults::PARSE_TIMEOUT_SECS;
use docket_core::{
    DocumentState, Error, EventActor, EventContext, FailureReason, Principal, Result,
    SourceDocument,
};
use docket_core::logging::SUBSYSTEM_PIPELINE;

use crate::document_store::DocumentStore;
use crate::extractor::{BlockExtractor, Extraction};
use crate::handler::{JobContext, JobHandler, JobKind, JobResult, PipelineJob};
use crate::parsers::ParserRegistry;
use crate::retry::RetryPolicy;
use crate::worker::JobSender;

/// What `submit` did with the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// A parse job was enqueued.
    Queued,
    /// Already being parsed.
    AlreadyParsing,
    /// Already parsed with the current content.
    AlreadyParsed,
    /// The document failed; use `resubmit` to try again.
    Failed,
    /// A failed document was moved back to `Pending` and enqueued.
    Requeued,
}

/// Parse-job configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Bound on a single parser call.
    pub parse_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            parse_timeout: Duration::from_secs(PARSE_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
        }
    }
}

impl CoordinatorConfig {
    /// `PARSE_TIMEOUT_SECS` plus [`RetryPolicy::from_env`].
    pub fn from_env() -> Self {
        let parse_timeout = std::env::var("PARSE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(PARSE_TIMEOUT_SECS)
            .max(1);
        Self {
            parse_timeout: Duration::from_secs(parse_timeout),
            retry: RetryPolicy::from_env(),
        }
    }

    pub fn with_parse_timeout(mut self, timeout: Duration) -> Self {
        self.parse_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Drives source documents through parsing.
pub struct ParsingCoordinator {
    documents: DocumentStore,
    parsers: ParserRegistry,
    extractor: BlockExtractor,
    jobs: JobSender,
    config: CoordinatorConfig,
}

impl ParsingCoordinator {
    pub fn new(
        documents: DocumentStore,
        parsers: ParserRegistry,
        jobs: JobSender,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            documents,
            parsers,
            extractor: BlockExtractor::new(),
            jobs,
            config,
        }
    }

    pub fn parsers(&self) -> &ParserRegistry {
        &self.parsers
    }

    /// Request parsing of a document. Returns immediately.
    ///
    /// Only `Pending` documents are enqueued; any other state is reported
    /// back without side effects.
    pub async fn submit(&self, principal: &Principal, document_id: Uuid) -> Result<SubmitOutcome> {
        let doc = self.documents.get(document_id).await?;
        let outcome = match doc.state {
            DocumentState::Pending => {
                self.jobs.enqueue(PipelineJob::Parse { document_id })?;
                SubmitOutcome::Queued
            }
            DocumentState::Parsing => SubmitOutcome::AlreadyParsing,
            DocumentState::Parsed => SubmitOutcome::AlreadyParsed,
            DocumentState::Failed => SubmitOutcome::Failed,
        };
        info!(
            subsystem = SUBSYSTEM_PIPELINE,
            component = "coordinator",
            op = "submit",
            document_id = %document_id,
            requested_by = %principal.identity,
            ?outcome,
            "Submit"
        );
        Ok(outcome)
    }

    /// Like [`submit`](Self::submit), but a `Failed` document is moved back
    /// to `Pending` and enqueued.
    pub async fn resubmit(&self, principal: &Principal, document_id: Uuid) -> Result<SubmitOutcome> {
        let ctx = user_context(principal);
        let mut doc = self.documents.get(document_id).await?;
        if doc.state == DocumentState::Parsing && doc.cancel_requested() {
            doc = self.fail_orphaned(&ctx, doc).await?;
        }
        if doc.state != DocumentState::Failed {
            return self.submit(principal, document_id).await;
        }
        self.documents.requeue(&ctx, &doc).await?;
        self.jobs.enqueue(PipelineJob::Parse { document_id })?;
        info!(
            subsystem = SUBSYSTEM_PIPELINE,
            component = "coordinator",
            op = "resubmit",
            document_id = %document_id,
            requested_by = %principal.identity,
            "Failed document requeued"
        );
        Ok(SubmitOutcome::Requeued)
    }

    /// Request cancellation of a `Pending` or `Parsing` document.
    ///
    /// A parse job observes the flag at its next checkpoint. A `Parsing`
    /// document that no job of this process holds is failed right away.
    pub async fn cancel(&self, principal: &Principal, document_id: Uuid) -> Result<SourceDocument> {
        let ctx = user_context(principal);
        let doc = self.documents.request_cancel(&ctx, document_id).await?;
        if doc.state == DocumentState::Parsing {
            return self.fail_orphaned(&ctx, doc).await;
        }
        Ok(doc)
    }

    /// `Parsing -> Failed(Cancelled)` unless a job here still holds the
    /// document. Returns the current document either way.
    async fn fail_orphaned(&self, ctx: &EventContext, doc: SourceDocument) -> Result<SourceDocument> {
        if self.jobs.is_held(doc.id) {
            return Ok(doc);
        }
        match self.documents.mark_failed(ctx, &doc, FailureReason::Cancelled).await {
            Ok(failed) => {
                warn!(
                    subsystem = SUBSYSTEM_PIPELINE,
                    component = "coordinator",
                    document_id = %doc.id,
                    "Document had no parse job, failed as cancelled"
                );
                Ok(failed)
            }
            // A job elsewhere finished it first.
            Err(Error::StaleState { .. }) => self.documents.get(doc.id).await,
            Err(e) => Err(e),
        }
    }

    /// Body of the parse job.
    #[instrument(skip(self), fields(subsystem = SUBSYSTEM_PIPELINE, component = "coordinator", op = "parse"))]
    pub async fn process(&self, document_id: Uuid) -> Result<JobResult> {
        let ctx = EventContext::actor(EventActor::system()).with_correlation(document_id);

        let doc = self.documents.get(document_id).await?;
        if doc.state != DocumentState::Pending {
            return Ok(JobResult::Skipped(format!("document is {}", doc.state)));
        }

        let parsing = match self.documents.mark_parsing(&ctx, &doc).await {
            Ok(parsing) => parsing,
            Err(Error::StaleState { .. }) => {
                let current = self.documents.get(document_id).await?;
                debug!(state = %current.state, "Lost the race to start parsing");
                return Ok(JobResult::Skipped(format!(
                    "document moved to {} concurrently",
                    current.state
                )));
            }
            Err(e) => return Err(e),
        };

        match self.parse_and_extract(&parsing).await {
            Ok(extraction) => match self.documents.mark_parsed(&ctx, &parsing, extraction).await {
                Ok(_) => Ok(JobResult::Success),
                Err(Error::StaleState { .. }) => Ok(JobResult::Skipped(
                    "document changed while parsing".to_string(),
                )),
                Err(e) => {
                    error!(error = %e, "Failed to persist representation");
                    self.fail(&ctx, &parsing, FailureReason::Internal { message: e.to_string() })
                        .await
                }
            },
            Err(e) => {
                let reason = parse_failure(&e);
                self.fail(&ctx, &parsing, reason).await
            }
        }
    }

    async fn parse_and_extract(&self, parsing: &SourceDocument) -> Result<Extraction> {
        self.checkpoint(parsing.id).await?;

        let parser = self.parsers.resolve(&parsing.source_type).ok_or_else(|| {
            Error::Parse(format!("no parser for source type '{}'", parsing.source_type))
        })?;

        let parsed = self
            .config
            .retry
            .run("parse", self.config.parse_timeout, || parser.parse(&parsing.locator))
            .await?;

        self.checkpoint(parsing.id).await?;

        self.extractor.build(parsing.id, parsed)
    }

    /// Fail with `Cancelled` if cancellation was requested.
    async fn checkpoint(&self, document_id: Uuid) -> Result<()> {
        let current = self.documents.get(document_id).await?;
        if current.cancel_requested() {
            return Err(Error::Cancelled(format!("document {}", document_id)));
        }
        Ok(())
    }

    async fn fail(
        &self,
        ctx: &EventContext,
        parsing: &SourceDocument,
        reason: FailureReason,
    ) -> Result<JobResult> {
        let message = reason.message().to_string();
        match self.documents.mark_failed(ctx, parsing, reason).await {
            Ok(_) => {
                warn!(document_id = %parsing.id, %message, "Parsing failed");
                Ok(JobResult::Failed(message))
            }
            Err(Error::StaleState { .. }) => Ok(JobResult::Skipped(
                "document changed while parsing".to_string(),
            )),
            Err(e) => Err(e),
        }
    }
}

fn user_context(principal: &Principal) -> EventContext {
    EventContext::actor(EventActor::user(principal.identity.clone()))
}

/// Failure reason recorded for a parse error. Transient errors that
/// exhausted their retries are attributed to the parser.
fn parse_failure(err: &Error) -> FailureReason {
    match err {
        Error::Unavailable(m) | Error::Request(m) => FailureReason::Parse {
            message: format!("parser unavailable: {}", m),
        },
        other => FailureReason::from(other),
    }
}

#[async_trait]
impl JobHandler for ParsingCoordinator {
    fn kind(&self) -> JobKind {
        JobKind::Parse
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        let Some(document_id) = ctx.document_id() else {
            return JobResult::Failed("parse handler received a non-parse job".to_string());
        };
        match self.process(document_id).await {
            Ok(result) => result,
            Err(e) => {
                error!(document_id = %document_id, error = %e, "Parse job errored");
                JobResult::Failed(e.to_string())
            }
        }
    }
}
