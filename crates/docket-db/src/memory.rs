//! In-memory implementation of every repository trait.
//!
//! Used by the test suites and by deployments that run without
//! `DATABASE_URL`. All state lives behind a single mutex, so each repository
//! call is atomic with the same guarantees the Postgres transactions give:
//! compare-and-set document transitions, serialized run deduplication, and
//! all-or-nothing overlay publication.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use docket_core::{
    new_v7, Block, ConversionRepresentation, DocumentRepository, DocumentState, DocumentTransition,
    DocumentView, Error, FailureReason, NewDocument, NewRun, Overlay, OverlayFilter,
    OverlayRepository, Project, ProjectRepository, PublishedSchema, Repositories,
    RepresentationRepository, Result, Run, RunClaim, RunRepository, RunStatus, Schema, SchemaKey,
    SchemaRepository, SourceDocument,
};

use crate::rules::{cancel_rejected, cancellable, cas_miss, check_transition, reusable_run};

#[derive(Default)]
struct State {
    projects: BTreeMap<Uuid, Project>,
    documents: HashMap<Uuid, SourceDocument>,
    documents_by_locator: HashMap<(Uuid, String), Uuid>,
    representations: HashMap<Uuid, ConversionRepresentation>,
    blocks: HashMap<Uuid, Vec<Block>>,
    schemas: Vec<Schema>,
    runs: HashMap<Uuid, Run>,
    overlays: Vec<Overlay>,
}

impl State {
    fn supersede_live(&mut self, document_id: Uuid) {
        let now = Utc::now();
        for rep in self.representations.values_mut() {
            if rep.document_id == document_id && rep.superseded_at.is_none() {
                rep.superseded_at = Some(now);
            }
        }
    }

    fn live_representation(&self, document_id: Uuid) -> Option<&ConversionRepresentation> {
        self.representations
            .values()
            .find(|r| r.document_id == document_id && r.superseded_at.is_none())
    }

    fn view(&self, doc: &SourceDocument) -> DocumentView {
        DocumentView::new(doc.clone(), self.live_representation(doc.id))
    }

    /// Apply `t` if the stored document still matches it.
    fn apply(&mut self, t: &DocumentTransition, representation_id: Option<Uuid>) -> Result<SourceDocument> {
        match self.documents.get(&t.id) {
            Some(d) if d.version == t.expected_version && d.state == t.expected_state => {}
            current => return Err(cas_miss(current, t.id, t.expected_version)),
        }
        let doc = self
            .documents
            .get_mut(&t.id)
            .ok_or(Error::DocumentNotFound(t.id))?;

        doc.state = t.to;
        doc.version += 1;
        doc.updated_at = Utc::now();
        if let Some(hash) = &t.content_hash {
            doc.content_hash = hash.clone();
        }
        doc.failure = match t.to {
            DocumentState::Failed => t.failure.clone(),
            _ => None,
        };
        doc.representation_id = representation_id;
        if t.to == DocumentState::Pending {
            doc.cancel_requested_at = None;
        }
        Ok(doc.clone())
    }

    fn superseded(&self, run: &Run) -> bool {
        self.representations
            .get(&run.representation_id)
            .map(|r| r.superseded_at.is_some())
            .unwrap_or(false)
    }
}

/// Mutex-backed repository backend.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repository handles backed by this store.
    pub fn repositories(&self) -> Repositories {
        Repositories {
            projects: Arc::new(self.clone()),
            documents: Arc::new(self.clone()),
            representations: Arc::new(self.clone()),
            schemas: Arc::new(self.clone()),
            runs: Arc::new(self.clone()),
            overlays: Arc::new(self.clone()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// =============================================================================
// PROJECTS
// =============================================================================

#[async_trait]
impl ProjectRepository for MemoryStore {
    async fn create(&self, name: &str) -> Result<Project> {
        let project = Project {
            id: new_v7(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        self.lock().projects.insert(project.id, project.clone());
        Ok(project)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Project>> {
        Ok(self.lock().projects.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Project>> {
        Ok(self.lock().projects.values().cloned().collect())
    }
}

// =============================================================================
// DOCUMENTS
// =============================================================================

#[async_trait]
impl DocumentRepository for MemoryStore {
    async fn insert_or_get(&self, new: NewDocument) -> Result<(SourceDocument, bool)> {
        let mut state = self.lock();
        if !state.projects.contains_key(&new.project_id) {
            return Err(Error::ProjectNotFound(new.project_id));
        }
        let key = (new.project_id, new.locator.clone());
        if let Some(existing) = state.documents_by_locator.get(&key).and_then(|id| state.documents.get(id)) {
            return Ok((existing.clone(), false));
        }

        let now = Utc::now();
        let doc = SourceDocument {
            id: new_v7(),
            project_id: new.project_id,
            title: new.title,
            source_type: new.source_type,
            locator: new.locator,
            content_hash: new.content_hash,
            state: DocumentState::Pending,
            failure: None,
            representation_id: None,
            version: 1,
            cancel_requested_at: None,
            created_at: now,
            updated_at: now,
        };
        state.documents_by_locator.insert(key, doc.id);
        state.documents.insert(doc.id, doc.clone());
        Ok((doc, true))
    }

    async fn get(&self, id: Uuid) -> Result<Option<SourceDocument>> {
        Ok(self.lock().documents.get(&id).cloned())
    }

    async fn transition(&self, t: DocumentTransition) -> Result<SourceDocument> {
        check_transition(&t)?;
        if t.to == DocumentState::Parsed {
            return Err(Error::InvalidInput(
                "use transition_parsed to install a representation".to_string(),
            ));
        }
        let mut state = self.lock();
        let updated = state.apply(&t, None)?;
        if t.expected_state == DocumentState::Parsed {
            state.supersede_live(t.id);
        }
        Ok(updated)
    }

    async fn update_pending_hash(
        &self,
        id: Uuid,
        expected_version: i64,
        content_hash: &str,
    ) -> Result<SourceDocument> {
        let mut state = self.lock();
        match state.documents.get(&id) {
            Some(d) if d.version == expected_version && d.state == DocumentState::Pending => {}
            current => return Err(cas_miss(current, id, expected_version)),
        }
        let doc = state.documents.get_mut(&id).ok_or(Error::DocumentNotFound(id))?;
        doc.content_hash = content_hash.to_string();
        doc.version += 1;
        doc.updated_at = Utc::now();
        Ok(doc.clone())
    }

    async fn transition_parsed(
        &self,
        t: DocumentTransition,
        representation: ConversionRepresentation,
        blocks: Vec<Block>,
    ) -> Result<SourceDocument> {
        check_transition(&t)?;
        if t.to != DocumentState::Parsed {
            return Err(Error::invalid_transition("document", t.expected_state, t.to));
        }
        let mut state = self.lock();
        let updated = state.apply(&t, Some(representation.id))?;
        state.supersede_live(t.id);
        state.blocks.insert(representation.id, blocks);
        state.representations.insert(representation.id, representation);
        Ok(updated)
    }

    async fn request_cancel(&self, id: Uuid) -> Result<SourceDocument> {
        let mut state = self.lock();
        let doc = state.documents.get_mut(&id).ok_or(Error::DocumentNotFound(id))?;
        if !cancellable(doc.state) {
            return Err(cancel_rejected(doc));
        }
        if doc.cancel_requested_at.is_none() {
            let now = Utc::now();
            doc.cancel_requested_at = Some(now);
            doc.updated_at = now;
        }
        Ok(doc.clone())
    }

    async fn list_view(&self, project_id: Option<Uuid>) -> Result<Vec<DocumentView>> {
        let state = self.lock();
        let mut docs: Vec<&SourceDocument> = state
            .documents
            .values()
            .filter(|d| project_id.map_or(true, |p| d.project_id == p))
            .collect();
        docs.sort_by_key(|d| (d.created_at, d.id));
        Ok(docs.into_iter().map(|d| state.view(d)).collect())
    }

    async fn get_view(&self, id: Uuid) -> Result<Option<DocumentView>> {
        let state = self.lock();
        Ok(state.documents.get(&id).map(|d| state.view(d)))
    }
}

// =============================================================================
// REPRESENTATIONS & BLOCKS
// =============================================================================

#[async_trait]
impl RepresentationRepository for MemoryStore {
    async fn get(&self, id: Uuid) -> Result<Option<ConversionRepresentation>> {
        Ok(self.lock().representations.get(&id).cloned())
    }

    async fn live_for_document(&self, document_id: Uuid) -> Result<Option<ConversionRepresentation>> {
        Ok(self.lock().live_representation(document_id).cloned())
    }

    async fn list_for_document(&self, document_id: Uuid) -> Result<Vec<ConversionRepresentation>> {
        let state = self.lock();
        let mut reps: Vec<ConversionRepresentation> = state
            .representations
            .values()
            .filter(|r| r.document_id == document_id)
            .cloned()
            .collect();
        reps.sort_by(|a, b| (b.parsed_at, b.id).cmp(&(a.parsed_at, a.id)));
        Ok(reps)
    }

    async fn blocks(&self, representation_id: Uuid) -> Result<Vec<Block>> {
        let mut blocks = self
            .lock()
            .blocks
            .get(&representation_id)
            .cloned()
            .unwrap_or_default();
        blocks.sort_by_key(|b| b.order_index);
        Ok(blocks)
    }
}

// =============================================================================
// SCHEMAS
// =============================================================================

#[async_trait]
impl SchemaRepository for MemoryStore {
    async fn publish(
        &self,
        schema_ref: &str,
        definition: JsonValue,
        definition_hash: &str,
    ) -> Result<PublishedSchema> {
        let mut state = self.lock();
        let lineage: Vec<&Schema> = state.schemas.iter().filter(|s| s.schema_ref == schema_ref).collect();

        if let Some(same) = lineage.iter().find(|s| s.definition_hash == definition_hash) {
            return Ok(PublishedSchema {
                schema: (*same).clone(),
                created: false,
            });
        }

        let (id, version) = match lineage.iter().max_by_key(|s| s.version) {
            Some(latest) => (latest.id, latest.version + 1),
            None => (new_v7(), 1),
        };
        let schema = Schema {
            id,
            schema_ref: schema_ref.to_string(),
            version,
            definition,
            definition_hash: definition_hash.to_string(),
            created_at: Utc::now(),
        };
        state.schemas.push(schema.clone());
        Ok(PublishedSchema {
            schema,
            created: true,
        })
    }

    async fn get(&self, key: SchemaKey) -> Result<Option<Schema>> {
        Ok(self.lock().schemas.iter().find(|s| s.key() == key).cloned())
    }

    async fn latest(&self, id: Uuid) -> Result<Option<Schema>> {
        Ok(self
            .lock()
            .schemas
            .iter()
            .filter(|s| s.id == id)
            .max_by_key(|s| s.version)
            .cloned())
    }

    async fn find_by_ref(&self, schema_ref: &str) -> Result<Option<Schema>> {
        Ok(self
            .lock()
            .schemas
            .iter()
            .filter(|s| s.schema_ref == schema_ref)
            .max_by_key(|s| s.version)
            .cloned())
    }

    async fn list_latest(&self) -> Result<Vec<Schema>> {
        let state = self.lock();
        let mut latest: HashMap<Uuid, &Schema> = HashMap::new();
        for schema in &state.schemas {
            let slot = latest.entry(schema.id).or_insert(schema);
            if schema.version > slot.version {
                *slot = schema;
            }
        }
        let mut out: Vec<Schema> = latest.into_values().cloned().collect();
        out.sort_by(|a, b| a.schema_ref.cmp(&b.schema_ref));
        Ok(out)
    }

    async fn list_versions(&self, id: Uuid) -> Result<Vec<Schema>> {
        let state = self.lock();
        let mut versions: Vec<Schema> = state.schemas.iter().filter(|s| s.id == id).cloned().collect();
        versions.sort_by_key(|s| s.version);
        Ok(versions)
    }
}

// =============================================================================
// RUNS
// =============================================================================

#[async_trait]
impl RunRepository for MemoryStore {
    async fn create_or_get(&self, new: NewRun, force: bool) -> Result<RunClaim> {
        let mut state = self.lock();
        let mut existing: Vec<Run> = state
            .runs
            .values()
            .filter(|r| {
                r.document_id == new.document_id
                    && r.schema_key() == new.schema
                    && r.fingerprint == new.fingerprint
            })
            .cloned()
            .collect();
        existing.sort_by(|a, b| (b.started_at, b.id).cmp(&(a.started_at, a.id)));

        if let Some(reused) = reusable_run(&existing, force) {
            return Ok(RunClaim::Existing(reused));
        }

        let run = Run {
            id: new_v7(),
            document_id: new.document_id,
            representation_id: new.representation_id,
            schema_id: new.schema.id,
            schema_version: new.schema.version,
            fingerprint: new.fingerprint,
            status: RunStatus::Running,
            failure: None,
            requested_by: new.requested_by,
            overlay_count: 0,
            cancel_requested_at: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        state.runs.insert(run.id, run.clone());
        Ok(RunClaim::Created(run))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Run>> {
        Ok(self.lock().runs.get(&id).cloned())
    }

    async fn list_for_document(&self, document_id: Uuid) -> Result<Vec<Run>> {
        let state = self.lock();
        let mut runs: Vec<Run> = state
            .runs
            .values()
            .filter(|r| r.document_id == document_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| (b.started_at, b.id).cmp(&(a.started_at, a.id)));
        Ok(runs)
    }

    async fn fail(&self, id: Uuid, reason: FailureReason) -> Result<Run> {
        let mut state = self.lock();
        let run = state.runs.get_mut(&id).ok_or(Error::RunNotFound(id))?;
        if run.status != RunStatus::Running {
            return Err(Error::RunNotRunning(id));
        }
        run.status = RunStatus::Failed;
        run.failure = Some(reason);
        run.finished_at = Some(Utc::now());
        Ok(run.clone())
    }

    async fn request_cancel(&self, id: Uuid) -> Result<Run> {
        let mut state = self.lock();
        let run = state.runs.get_mut(&id).ok_or(Error::RunNotFound(id))?;
        if run.status != RunStatus::Running {
            return Err(Error::RunNotRunning(id));
        }
        if run.cancel_requested_at.is_none() {
            run.cancel_requested_at = Some(Utc::now());
        }
        Ok(run.clone())
    }
}

// =============================================================================
// OVERLAYS
// =============================================================================

#[async_trait]
impl OverlayRepository for MemoryStore {
    async fn append(&self, run_id: Uuid, overlays: Vec<Overlay>) -> Result<Run> {
        let mut state = self.lock();
        let run = state.runs.get_mut(&run_id).ok_or(Error::RunNotFound(run_id))?;
        if run.status != RunStatus::Running {
            return Err(Error::RunNotRunning(run_id));
        }
        run.status = RunStatus::Succeeded;
        run.failure = None;
        run.finished_at = Some(Utc::now());
        run.overlay_count = overlays.len() as i32;
        let sealed = run.clone();
        state
            .overlays
            .extend(overlays.into_iter().map(|o| Overlay { run_id, ..o }));
        Ok(sealed)
    }

    async fn list_for_document(&self, document_id: Uuid, filter: OverlayFilter) -> Result<Vec<Overlay>> {
        let state = self.lock();
        let mut out: Vec<Overlay> = state
            .overlays
            .iter()
            .filter_map(|o| {
                let run = state.runs.get(&o.run_id)?;
                if run.document_id != document_id || run.status != RunStatus::Succeeded {
                    return None;
                }
                if filter.schema.is_some_and(|key| key != run.schema_key()) {
                    return None;
                }
                let superseded = state.superseded(run);
                if superseded && !filter.include_superseded {
                    return None;
                }
                Some(Overlay {
                    superseded,
                    ..o.clone()
                })
            })
            .collect();
        out.sort_by(|a, b| (a.order_index, a.created_at, a.id).cmp(&(b.order_index, b.created_at, b.id)));
        Ok(out)
    }

    async fn list_for_run(&self, run_id: Uuid) -> Result<Vec<Overlay>> {
        let state = self.lock();
        let superseded = state.runs.get(&run_id).map(|r| state.superseded(r)).unwrap_or(false);
        let mut out: Vec<Overlay> = state
            .overlays
            .iter()
            .filter(|o| o.run_id == run_id)
            .map(|o| Overlay {
                superseded,
                ..o.clone()
            })
            .collect();
        out.sort_by(|a, b| (a.order_index, a.created_at, a.id).cmp(&(b.order_index, b.created_at, b.id)));
        Ok(out)
    }
}
