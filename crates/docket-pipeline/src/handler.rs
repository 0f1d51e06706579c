//! Pipeline jobs and the handlers that execute them.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of pipeline job, used to route jobs to handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Parse,
    Run,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Parse => write!(f, "parse"),
            JobKind::Run => write!(f, "run"),
        }
    }
}

/// A unit of background work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineJob {
    /// Parse a `Pending` document.
    Parse { document_id: Uuid },
    /// Execute a `Running` run.
    Run { run_id: Uuid },
}

impl PipelineJob {
    pub fn kind(&self) -> JobKind {
        match self {
            PipelineJob::Parse { .. } => JobKind::Parse,
            PipelineJob::Run { .. } => JobKind::Run,
        }
    }

    /// Document or run the job operates on.
    pub fn subject_id(&self) -> Uuid {
        match self {
            PipelineJob::Parse { document_id } => *document_id,
            PipelineJob::Run { run_id } => *run_id,
        }
    }
}

/// Context provided to job handlers.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// The job being processed.
    pub job: PipelineJob,
}

impl JobContext {
    pub fn new(job: PipelineJob) -> Self {
        Self { job }
    }

    pub fn document_id(&self) -> Option<Uuid> {
        match self.job {
            PipelineJob::Parse { document_id } => Some(document_id),
            PipelineJob::Run { .. } => None,
        }
    }

    pub fn run_id(&self) -> Option<Uuid> {
        match self.job {
            PipelineJob::Run { run_id } => Some(run_id),
            PipelineJob::Parse { .. } => None,
        }
    }
}

/// Result of job execution.
///
/// Failures of the document or run itself are recorded durably by the
/// handler; `Failed` only reports them to the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// The job ran to completion.
    Success,
    /// Nothing to do (the subject moved on or another job won the race).
    Skipped(String),
    /// The job ended in a failure.
    Failed(String),
}

/// Trait for job handlers.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The job kind this handler processes.
    fn kind(&self) -> JobKind;

    /// Execute the job.
    async fn execute(&self, ctx: JobContext) -> JobResult;

    /// Called instead of `execute` for a job still queued at shutdown.
    async fn abandon(&self, _ctx: JobContext) {}

    /// Check if this handler can process the given job kind.
    fn can_handle(&self, kind: JobKind) -> bool {
        self.kind() == kind
    }
}
