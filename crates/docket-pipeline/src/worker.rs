//! Worker pool that executes parse and run jobs.
//!
//! Jobs arrive over a bounded in-process queue and run on tokio tasks, at
//! most `max_concurrent_jobs` at a time. Shutdown stops intake, hands jobs
//! still queued to their handler's `abandon`, and waits for in-flight jobs
//! to finish.
//!
//! Every queued or running job holds a lease on its subject (document or
//! run). A `Parsing` document or `Running` run without a lease has lost its
//! job, e.g. to a crash, and may be failed directly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, RwLock, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use docket_core::defaults::{EVENT_BUS_CAPACITY, JOB_QUEUE_CAPACITY, MAX_CONCURRENT_JOBS};
use docket_core::{Error, Result};
use docket_core::logging::SUBSYSTEM_PIPELINE;

use crate::handler::{JobContext, JobHandler, JobKind, JobResult, PipelineJob};

/// Configuration for the pipeline worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum number of concurrent jobs.
    pub max_concurrent_jobs: usize,
    /// Whether to enable job processing.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: MAX_CONCURRENT_JOBS,
            enabled: true,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `PIPELINE_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `PIPELINE_MAX_CONCURRENT` | `4` | Max concurrent jobs |
    pub fn from_env() -> Self {
        let enabled = std::env::var("PIPELINE_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let max_concurrent_jobs = std::env::var("PIPELINE_MAX_CONCURRENT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(MAX_CONCURRENT_JOBS)
            .max(1);

        Self {
            max_concurrent_jobs,
            enabled,
        }
    }

    /// Set maximum concurrent jobs.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max.max(1);
        self
    }

    /// Enable or disable job processing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Event emitted by the pipeline worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// A job was started.
    JobStarted { job: PipelineJob },
    /// A job completed successfully.
    JobCompleted { job: PipelineJob },
    /// A job found nothing to do.
    JobSkipped { job: PipelineJob, reason: String },
    /// A job failed.
    JobFailed { job: PipelineJob, error: String },
    /// A queued job was dropped at shutdown.
    JobAbandoned { job: PipelineJob },
    /// Worker started.
    WorkerStarted,
    /// Worker stopped.
    WorkerStopped,
}

// =============================================================================
// QUEUE
// =============================================================================

/// Subjects with a job queued or running in this process, with a count per
/// subject.
#[derive(Debug, Clone, Default)]
struct JobLeases {
    inner: Arc<Mutex<HashMap<Uuid, usize>>>,
}

impl JobLeases {
    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, usize>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn acquire(&self, subject_id: Uuid) {
        *self.map().entry(subject_id).or_insert(0) += 1;
    }

    fn release(&self, subject_id: Uuid) {
        let mut map = self.map();
        if let Some(count) = map.get_mut(&subject_id) {
            *count -= 1;
            if *count == 0 {
                map.remove(&subject_id);
            }
        }
    }

    fn is_held(&self, subject_id: Uuid) -> bool {
        self.map().contains_key(&subject_id)
    }
}

/// Releases a dequeued job's lease when dropped, panics included.
struct LeaseGuard {
    leases: JobLeases,
    subject_id: Uuid,
}

impl LeaseGuard {
    fn new(leases: &JobLeases, job: &PipelineJob) -> Self {
        Self {
            leases: leases.clone(),
            subject_id: job.subject_id(),
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.leases.release(self.subject_id);
    }
}

/// Sending half of the job queue, shared by the services that enqueue work.
#[derive(Debug, Clone)]
pub struct JobSender {
    tx: mpsc::Sender<PipelineJob>,
    leases: JobLeases,
}

impl JobSender {
    /// Enqueue a job without waiting.
    ///
    /// Fails with `Unavailable` when the queue is full and `Internal` when
    /// the worker is gone.
    pub fn enqueue(&self, job: PipelineJob) -> Result<()> {
        // The lease is taken first so the worker can never release it early.
        self.leases.acquire(job.subject_id());
        self.tx.try_send(job).map_err(|e| {
            self.leases.release(job.subject_id());
            match e {
                mpsc::error::TrySendError::Full(job) => {
                    warn!(kind = %job.kind(), subject_id = %job.subject_id(), "Job queue full");
                    Error::Unavailable("job queue is full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    Error::Internal("job queue is closed".to_string())
                }
            }
        })?;
        debug!(kind = %job.kind(), subject_id = %job.subject_id(), "Job enqueued");
        Ok(())
    }

    /// Whether a job for this document or run is queued or running here.
    pub fn is_held(&self, subject_id: Uuid) -> bool {
        self.leases.is_held(subject_id)
    }

    /// Jobs waiting in the queue.
    pub fn pending_count(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Receiving half of the job queue, consumed by the worker.
#[derive(Debug)]
pub struct JobReceiver {
    rx: mpsc::Receiver<PipelineJob>,
    leases: JobLeases,
}

/// Create a bounded job queue.
pub fn job_queue(capacity: usize) -> (JobSender, JobReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let leases = JobLeases::default();
    (
        JobSender {
            tx,
            leases: leases.clone(),
        },
        JobReceiver { rx, leases },
    )
}

/// Job queue with the default capacity.
pub fn default_job_queue() -> (JobSender, JobReceiver) {
    job_queue(JOB_QUEUE_CAPACITY)
}

// =============================================================================
// WORKER
// =============================================================================

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker to shut down, abandon queued jobs, and wait for
    /// in-flight ones.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        self.task
            .await
            .map_err(|e| Error::Internal(format!("Worker task failed: {}", e)))?;
        Ok(())
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

/// Worker that executes pipeline jobs from the queue.
pub struct PipelineWorker {
    config: WorkerConfig,
    jobs: JobReceiver,
    handlers: Arc<RwLock<HashMap<JobKind, Arc<dyn JobHandler>>>>,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl PipelineWorker {
    /// Create a new worker consuming `jobs`.
    pub fn new(config: WorkerConfig, jobs: JobReceiver) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            config,
            jobs,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
        }
    }

    /// Register a job handler. Replaces any handler for the same kind.
    pub async fn register_handler(&self, handler: Arc<dyn JobHandler>) {
        let kind = handler.kind();
        let mut handlers = self.handlers.write().await;
        handlers.insert(kind, handler);
        debug!(%kind, "Registered job handler");
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();
        let task = tokio::spawn(self.run(shutdown_rx));
        WorkerHandle {
            shutdown_tx,
            event_rx,
            task,
        }
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    #[instrument(skip(self, shutdown_rx), fields(subsystem = SUBSYSTEM_PIPELINE, component = "worker"))]
    async fn run(mut self, mut shutdown_rx: mpsc::Receiver<()>) {
        if !self.config.enabled {
            // Jobs stay queued until the queue fills up.
            info!("Pipeline worker is disabled, not starting");
            let _ = shutdown_rx.recv().await;
            self.abandon_queued().await;
            return;
        }

        info!(
            max_concurrent = self.config.max_concurrent_jobs,
            "Pipeline worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_jobs));
        let mut tasks = JoinSet::new();

        'intake: loop {
            // Wait for capacity, reaping finished jobs meanwhile.
            let permit = loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break 'intake,
                    Some(result) = tasks.join_next(), if !tasks.is_empty() => log_join(result),
                    permit = permits.clone().acquire_owned() => match permit {
                        Ok(permit) => break permit,
                        Err(_) => break 'intake,
                    },
                }
            };

            let job = loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break 'intake,
                    Some(result) = tasks.join_next(), if !tasks.is_empty() => log_join(result),
                    job = self.jobs.rx.recv() => match job {
                        Some(job) => break job,
                        None => {
                            info!("Job queue closed");
                            break 'intake;
                        }
                    },
                }
            };

            let lease = LeaseGuard::new(&self.jobs.leases, &job);
            let runner = self.clone_refs();
            tasks.spawn(async move {
                let _permit = permit;
                let _lease = lease;
                runner.execute_job(job).await;
            });
        }

        self.abandon_queued().await;
        info!(in_flight = tasks.len(), "Pipeline worker draining");
        while let Some(result) = tasks.join_next().await {
            log_join(result);
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Pipeline worker stopped");
    }

    /// Close the queue and pass every job still in it to its handler's
    /// `abandon`. Later enqueues fail with `Internal`.
    async fn abandon_queued(&mut self) {
        self.jobs.rx.close();
        let runner = self.clone_refs();
        let mut abandoned = 0usize;
        while let Some(job) = self.jobs.rx.recv().await {
            let _lease = LeaseGuard::new(&self.jobs.leases, &job);
            runner.abandon_job(job).await;
            abandoned += 1;
        }
        if abandoned > 0 {
            warn!(abandoned, "Queued jobs abandoned at shutdown");
        }
    }

    fn clone_refs(&self) -> JobRunner {
        JobRunner {
            handlers: self.handlers.clone(),
            event_tx: self.event_tx.clone(),
        }
    }
}

fn log_join(result: std::result::Result<(), JoinError>) {
    if let Err(e) = result {
        error!(error = ?e, "Job task panicked");
    }
}

/// Lightweight reference bundle for executing a single job in a spawned task.
struct JobRunner {
    handlers: Arc<RwLock<HashMap<JobKind, Arc<dyn JobHandler>>>>,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl JobRunner {
    async fn handler(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.read().await.get(&kind).cloned()
    }

    async fn abandon_job(&self, job: PipelineJob) {
        debug!(kind = %job.kind(), subject_id = %job.subject_id(), "Abandoning queued job");
        if let Some(handler) = self.handler(job.kind()).await {
            handler.abandon(JobContext::new(job)).await;
        }
        let _ = self.event_tx.send(WorkerEvent::JobAbandoned { job });
    }

    async fn execute_job(self, job: PipelineJob) {
        let start = Instant::now();
        let kind = job.kind();
        let subject_id: Uuid = job.subject_id();

        debug!(%kind, %subject_id, "Processing job");
        let _ = self.event_tx.send(WorkerEvent::JobStarted { job });

        let handler = self.handler(kind).await;

        let result = match handler {
            Some(handler) => handler.execute(JobContext::new(job)).await,
            None => {
                warn!(%kind, "No handler registered for job kind");
                JobResult::Failed(format!("No handler for job kind: {}", kind))
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        match result {
            JobResult::Success => {
                info!(%kind, %subject_id, duration_ms, "Job completed");
                let _ = self.event_tx.send(WorkerEvent::JobCompleted { job });
            }
            JobResult::Skipped(reason) => {
                debug!(%kind, %subject_id, %reason, "Job skipped");
                let _ = self.event_tx.send(WorkerEvent::JobSkipped { job, reason });
            }
            JobResult::Failed(error) => {
                warn!(%kind, %subject_id, %error, duration_ms, "Job failed");
                let _ = self.event_tx.send(WorkerEvent::JobFailed { job, error });
            }
        }
    }
}

/// Builder for creating a worker with handlers.
pub struct WorkerBuilder {
    config: WorkerConfig,
    jobs: JobReceiver,
    handlers: Vec<Arc<dyn JobHandler>>,
}

impl WorkerBuilder {
    pub fn new(jobs: JobReceiver) -> Self {
        Self {
            config: WorkerConfig::default(),
            jobs,
            handlers: Vec::new(),
        }
    }

    /// Set the worker configuration.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a handler.
    pub fn with_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Build and return the worker.
    pub async fn build(self) -> PipelineWorker {
        let worker = PipelineWorker::new(self.config, self.jobs);
        for handler in self.handlers {
            worker.register_handler(handler).await;
        }
        worker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingHandler {
        kind: JobKind,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        done: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        fn kind(&self) -> JobKind {
            self.kind
        }

        async fn execute(&self, _ctx: JobContext) -> JobResult {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.done.fetch_add(1, Ordering::SeqCst);
            JobResult::Success
        }
    }

    fn counting(kind: JobKind) -> (Arc<CountingHandler>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(CountingHandler {
            kind,
            running: Arc::new(AtomicUsize::new(0)),
            peak: peak.clone(),
            done: done.clone(),
        });
        (handler, peak, done)
    }

    /// Records abandoned jobs; executes nothing.
    #[derive(Default)]
    struct AbandonRecorder {
        abandoned: std::sync::Mutex<Vec<PipelineJob>>,
    }

    #[async_trait]
    impl JobHandler for AbandonRecorder {
        fn kind(&self) -> JobKind {
            JobKind::Run
        }

        async fn execute(&self, _ctx: JobContext) -> JobResult {
            JobResult::Success
        }

        async fn abandon(&self, ctx: JobContext) {
            self.abandoned.lock().unwrap().push(ctx.job);
        }
    }

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.max_concurrent_jobs, 4);
        assert!(config.enabled);
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::default()
            .with_max_concurrent(0)
            .with_enabled(false);
        assert_eq!(config.max_concurrent_jobs, 1);
        assert!(!config.enabled);
    }

    #[test]
    fn test_enqueue_full_queue_is_unavailable() {
        let (sender, _rx) = job_queue(1);
        let job = PipelineJob::Parse {
            document_id: Uuid::now_v7(),
        };
        sender.enqueue(job).unwrap();
        assert_eq!(sender.pending_count(), 1);
        assert!(matches!(sender.enqueue(job), Err(Error::Unavailable(_))));
    }

    #[test]
    fn test_enqueue_closed_queue_is_internal() {
        let (sender, rx) = job_queue(4);
        drop(rx);
        let result = sender.enqueue(PipelineJob::Run { run_id: Uuid::now_v7() });
        assert!(matches!(result, Err(Error::Internal(_))));
    }

    #[tokio::test]
    async fn test_worker_runs_jobs_with_bounded_concurrency() {
        let (sender, rx) = job_queue(64);
        let (handler, peak, done) = counting(JobKind::Parse);
        let worker = WorkerBuilder::new(rx)
            .with_config(WorkerConfig::default().with_max_concurrent(2))
            .with_handler(handler)
            .build()
            .await;
        let handle = worker.start();

        for _ in 0..6 {
            sender
                .enqueue(PipelineJob::Parse {
                    document_id: Uuid::now_v7(),
                })
                .unwrap();
        }

        for _ in 0..200 {
            if done.load(Ordering::SeqCst) == 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(done.load(Ordering::SeqCst), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_reports_missing_handler() {
        let (sender, rx) = job_queue(8);
        let worker = PipelineWorker::new(WorkerConfig::default(), rx);
        let mut events = worker.events();
        let handle = worker.start();

        let job = PipelineJob::Run { run_id: Uuid::now_v7() };
        sender.enqueue(job).unwrap();

        let failed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(WorkerEvent::JobFailed { job: j, error }) = events.recv().await {
                    return (j, error);
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(failed.0, job);
        assert!(failed.1.contains("run"));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_jobs() {
        let (sender, rx) = job_queue(8);
        let (handler, _peak, done) = counting(JobKind::Run);
        let worker = WorkerBuilder::new(rx).with_handler(handler).build().await;
        let mut events = worker.events();
        let handle = worker.start();

        sender.enqueue(PipelineJob::Run { run_id: Uuid::now_v7() }).unwrap();
        // Wait until the job is running, then stop.
        loop {
            if let Ok(WorkerEvent::JobStarted { .. }) = events.recv().await {
                break;
            }
        }
        handle.shutdown().await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lease_held_until_job_finishes() {
        let (sender, rx) = job_queue(8);
        let (handler, _peak, done) = counting(JobKind::Parse);
        let worker = WorkerBuilder::new(rx).with_handler(handler).build().await;
        let handle = worker.start();

        let document_id = Uuid::now_v7();
        sender.enqueue(PipelineJob::Parse { document_id }).unwrap();
        assert!(sender.is_held(document_id));

        for _ in 0..200 {
            if done.load(Ordering::SeqCst) == 1 && !sender.is_held(document_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!sender.is_held(document_id));
        handle.shutdown().await.unwrap();
    }

    #[test]
    fn test_rejected_enqueue_releases_lease() {
        let (sender, _rx) = job_queue(1);
        let first = Uuid::now_v7();
        let second = Uuid::now_v7();
        sender.enqueue(PipelineJob::Run { run_id: first }).unwrap();
        assert!(sender.enqueue(PipelineJob::Run { run_id: second }).is_err());
        assert!(sender.is_held(first));
        assert!(!sender.is_held(second));
    }

    #[tokio::test]
    async fn test_shutdown_abandons_queued_jobs() {
        let (sender, rx) = job_queue(8);
        let recorder = Arc::new(AbandonRecorder::default());
        let worker = WorkerBuilder::new(rx)
            .with_config(WorkerConfig::default().with_enabled(false))
            .with_handler(recorder.clone())
            .build()
            .await;
        let mut events = worker.events();
        let handle = worker.start();

        let jobs = [
            PipelineJob::Run { run_id: Uuid::now_v7() },
            PipelineJob::Run { run_id: Uuid::now_v7() },
        ];
        for job in jobs {
            sender.enqueue(job).unwrap();
        }
        handle.shutdown().await.unwrap();

        assert_eq!(*recorder.abandoned.lock().unwrap(), jobs.to_vec());
        assert!(jobs.iter().all(|j| !sender.is_held(j.subject_id())));
        assert_eq!(
            events.recv().await.unwrap(),
            WorkerEvent::JobAbandoned { job: jobs[0] }
        );

        // The queue is closed for good.
        let late = sender.enqueue(PipelineJob::Run { run_id: Uuid::now_v7() });
        assert!(matches!(late, Err(Error::Internal(_))));
    }

    #[tokio::test]
    async fn test_disabled_worker_does_not_process() {
        let (sender, rx) = job_queue(8);
        let (handler, _peak, done) = counting(JobKind::Parse);
        let worker = WorkerBuilder::new(rx)
            .with_config(WorkerConfig::default().with_enabled(false))
            .with_handler(handler)
            .build()
            .await;
        let handle = worker.start();
        sender
            .enqueue(PipelineJob::Parse {
                document_id: Uuid::now_v7(),
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(done.load(Ordering::SeqCst), 0);
        assert_eq!(sender.pending_count(), 1);
        handle.shutdown().await.unwrap();
    }
}
