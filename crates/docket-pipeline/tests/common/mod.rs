//! Scripted capabilities and helpers shared by the pipeline suites.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{Notify, Semaphore};
use uuid::Uuid;

use docket_db::MemoryStore;
use docket_pipeline::{
    Annotation, Block, ConversionRepresentation, CoordinatorConfig, Credential, DocumentState,
    DocumentView, Error, ParsedRepresentation, Parser, ParserRegistry, Pipeline, PipelineConfig,
    PublishSchemaRequest, RepresentationContent, RepresentationRepository, Repositories, Result,
    RetryPolicy, Run, RunExecutorConfig, RunStatus, Schema, SchemaExecutor, WorkerConfig,
};

pub const ANON: Credential = Credential::Anonymous;

/// Failure injected into a scripted capability call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Transient,
    Permanent,
}

/// Holds calls until the test releases them.
#[derive(Clone)]
pub struct Gate(Arc<Semaphore>);

impl Gate {
    pub fn closed() -> Self {
        Self(Arc::new(Semaphore::new(0)))
    }

    pub fn release(&self, calls: usize) {
        self.0.add_permits(calls);
    }

    async fn pass(&self) {
        if let Ok(permit) = self.0.acquire().await {
            permit.forget();
        }
    }
}

/// Parser serving markdown from an in-memory map.
#[derive(Default)]
pub struct ScriptedParser {
    sources: Mutex<HashMap<String, String>>,
    faults: Mutex<VecDeque<Fault>>,
    gate: Mutex<Option<Gate>>,
    calls: AtomicUsize,
}

impl ScriptedParser {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, locator: &str, text: &str) {
        self.sources.lock().unwrap().insert(locator.to_string(), text.to_string());
    }

    pub fn fail_next(&self, fault: Fault) {
        self.faults.lock().unwrap().push_back(fault);
    }

    pub fn gate(&self) -> Gate {
        let gate = Gate::closed();
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Parser for ScriptedParser {
    fn name(&self) -> &str {
        "scripted-parser"
    }

    async fn parse(&self, locator: &str) -> Result<ParsedRepresentation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        let fault = self.faults.lock().unwrap().pop_front();
        match fault {
            Some(Fault::Transient) => return Err(Error::Unavailable("converter restarting".into())),
            Some(Fault::Permanent) => return Err(Error::Parse("unsupported layout".into())),
            None => {}
        }
        let text = self
            .sources
            .lock()
            .unwrap()
            .get(locator)
            .cloned()
            .ok_or_else(|| Error::Parse(format!("no source at {}", locator)))?;
        Ok(ParsedRepresentation {
            parsing_tool: "scripted-parser".into(),
            schema_version: "1".into(),
            content: RepresentationContent::Markdown { text },
        })
    }
}

/// Executor annotating every block with its type and length.
#[derive(Default)]
pub struct ScriptedExecutor {
    faults: Mutex<VecDeque<Fault>>,
    gate: Mutex<Option<Gate>>,
    stray_block: Mutex<bool>,
    calls: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self, fault: Fault) {
        self.faults.lock().unwrap().push_back(fault);
    }

    pub fn gate(&self) -> Gate {
        let gate = Gate::closed();
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Also annotate a block that is not part of the run.
    pub fn annotate_stray_block(&self) {
        *self.stray_block.lock().unwrap() = true;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SchemaExecutor for ScriptedExecutor {
    fn name(&self) -> &str {
        "scripted-executor"
    }

    async fn execute(&self, _schema: &Schema, blocks: &[Block]) -> Result<Vec<Annotation>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        let fault = self.faults.lock().unwrap().pop_front();
        match fault {
            Some(Fault::Transient) => return Err(Error::Unavailable("executor overloaded".into())),
            Some(Fault::Permanent) => return Err(Error::Execution("schema rejected by model".into())),
            None => {}
        }
        let mut annotations: Vec<Annotation> = blocks
            .iter()
            .map(|b| Annotation {
                block_id: b.id,
                payload: json!({"type": b.block_type, "len": b.content.chars().count()}),
            })
            .collect();
        if *self.stray_block.lock().unwrap() {
            annotations.push(Annotation {
                block_id: Uuid::now_v7(),
                payload: json!({}),
            });
        }
        Ok(annotations)
    }
}

/// Representation reads that can be held at `live_for_document`.
pub struct PausingRepresentations {
    inner: Arc<dyn RepresentationRepository>,
    armed: AtomicBool,
    entered: Notify,
    gate: Gate,
}

impl PausingRepresentations {
    pub fn wrap(inner: Arc<dyn RepresentationRepository>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            armed: AtomicBool::new(false),
            entered: Notify::new(),
            gate: Gate::closed(),
        })
    }

    /// Hold the next `live_for_document` call until the gate is released.
    pub fn pause_next(&self) -> Gate {
        self.armed.store(true, Ordering::SeqCst);
        self.gate.clone()
    }

    /// Wait until a paused call is being held.
    pub async fn wait_paused(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.entered.notified())
            .await
            .expect("no representation read was paused");
    }
}

#[async_trait]
impl RepresentationRepository for PausingRepresentations {
    async fn get(&self, id: Uuid) -> Result<Option<ConversionRepresentation>> {
        self.inner.get(id).await
    }

    async fn live_for_document(&self, document_id: Uuid) -> Result<Option<ConversionRepresentation>> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.gate.pass().await;
        }
        self.inner.live_for_document(document_id).await
    }

    async fn list_for_document(&self, document_id: Uuid) -> Result<Vec<ConversionRepresentation>> {
        self.inner.list_for_document(document_id).await
    }

    async fn blocks(&self, representation_id: Uuid) -> Result<Vec<Block>> {
        self.inner.blocks(representation_id).await
    }
}

pub fn fast_config() -> PipelineConfig {
    let retry = RetryPolicy::default()
        .with_base_delay_ms(1)
        .with_max_delay_ms(5);
    PipelineConfig::default()
        .with_worker(WorkerConfig::default().with_max_concurrent(4))
        .with_coordinator(
            CoordinatorConfig::default()
                .with_parse_timeout(Duration::from_secs(5))
                .with_retry(retry.clone()),
        )
        .with_runs(
            RunExecutorConfig::default()
                .with_run_timeout(Duration::from_secs(5))
                .with_retry(retry),
        )
}

pub struct Harness {
    pub pipeline: Pipeline,
    pub parser: Arc<ScriptedParser>,
    pub executor: Arc<ScriptedExecutor>,
    pub project_id: Uuid,
}

pub async fn harness() -> Harness {
    harness_with(MemoryStore::default().repositories()).await
}

/// Harness over caller-supplied repositories, e.g. a store shared with a
/// second pipeline.
pub async fn harness_with(repos: Repositories) -> Harness {
    harness_with_config(repos, fast_config()).await
}

pub async fn harness_with_config(repos: Repositories, config: PipelineConfig) -> Harness {
    let parser = ScriptedParser::new();
    let executor = ScriptedExecutor::new();
    let pipeline = Pipeline::builder(repos)
        .with_parsers(ParserRegistry::new().with_fallback(parser.clone()))
        .with_executor(executor.clone())
        .with_config(config)
        .start()
        .await;
    let project_id = pipeline.create_project(&ANON, "contracts").await.unwrap().id;
    Harness {
        pipeline,
        parser,
        executor,
        project_id,
    }
}

pub async fn wait_for_document(pipeline: &Pipeline, id: Uuid, state: DocumentState) -> DocumentView {
    for _ in 0..500 {
        let view = pipeline.get_document(&ANON, id).await.unwrap();
        if view.document.state == state {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("document {} never reached {}", id, state);
}

pub async fn wait_for_run(pipeline: &Pipeline, id: Uuid, status: RunStatus) -> Run {
    for _ in 0..500 {
        let run = pipeline.get_run(&ANON, id).await.unwrap();
        if run.status == status {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {} never reached {}", id, status);
}

pub async fn publish_schema(pipeline: &Pipeline, name: &str) -> Schema {
    pipeline
        .publish_schema(
            &ANON,
            PublishSchemaRequest {
                schema_ref: Some(name.to_string()),
                definition: json!({"title": name, "type": "object"}),
            },
        )
        .await
        .unwrap()
        .schema
}
