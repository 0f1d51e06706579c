//! Document Store service: ingestion and the document state machine.
//!
//! All state mutations of a source document go through this service. Each
//! one is a compare-and-set on the document's version and state, followed
//! by publication of the matching change events while the document's lock
//! is still held.

use std::sync::Arc;

use tracing::{debug, info, instrument};
use uuid::Uuid;

use docket_core::{
    Block, ChangeNotifier, ConversionRepresentation, DocumentState, DocumentTransition,
    DocumentView, Error, EventContext, FailureReason, IngestOutcome, IngestRequest, NewDocument,
    PipelineEvent, Repositories, Result, SourceDocument,
};
use docket_core::logging::SUBSYSTEM_PIPELINE;

use crate::extractor::Extraction;
use crate::locks::DocumentLocks;

/// Durable record of source documents and their parsing state.
#[derive(Clone)]
pub struct DocumentStore {
    repos: Repositories,
    notifier: Arc<ChangeNotifier>,
    locks: DocumentLocks,
}

impl DocumentStore {
    pub fn new(repos: Repositories, notifier: Arc<ChangeNotifier>, locks: DocumentLocks) -> Self {
        Self {
            repos,
            notifier,
            locks,
        }
    }

    /// Create a `Pending` document, or reconcile an existing one for the same
    /// `(project, locator)` with the submitted content hash.
    ///
    /// - same hash: unchanged, no event
    /// - `Pending`: hash replaced in place
    /// - `Parsed`/`Failed`: back to `Pending`, live representation superseded
    /// - `Parsing`: `InvalidTransition`
    #[instrument(skip(self, ctx, req), fields(subsystem = SUBSYSTEM_PIPELINE, component = "document_store", op = "ingest", project_id = %req.project_id))]
    pub async fn ingest(
        &self,
        ctx: &EventContext,
        req: IngestRequest,
    ) -> Result<(SourceDocument, IngestOutcome)> {
        if req.locator.trim().is_empty() {
            return Err(Error::InvalidInput("locator must not be empty".to_string()));
        }
        if req.content_hash.trim().is_empty() {
            return Err(Error::InvalidInput("content_hash must not be empty".to_string()));
        }
        if self.repos.projects.get(req.project_id).await?.is_none() {
            return Err(Error::ProjectNotFound(req.project_id));
        }

        let (doc, created) = self
            .repos
            .documents
            .insert_or_get(NewDocument {
                project_id: req.project_id,
                title: req.resolved_title(),
                source_type: req.resolved_source_type(),
                locator: req.locator.clone(),
                content_hash: req.content_hash.clone(),
            })
            .await?;

        let _guard = self.locks.lock(doc.id).await;

        if created {
            info!(document_id = %doc.id, locator = %doc.locator, "Document ingested");
            self.publish_ingested(ctx, &doc, IngestOutcome::Created);
            return Ok((doc, IngestOutcome::Created));
        }

        // Re-read under the lock; the row may have moved since insert_or_get.
        let current = self.get(doc.id).await?;
        if current.content_hash == req.content_hash {
            debug!(document_id = %current.id, "Content unchanged, ingest is a no-op");
            return Ok((current, IngestOutcome::Unchanged));
        }

        let updated = match current.state {
            DocumentState::Pending => {
                self.repos
                    .documents
                    .update_pending_hash(current.id, current.version, &req.content_hash)
                    .await?
            }
            DocumentState::Parsed | DocumentState::Failed => {
                let updated = self
                    .repos
                    .documents
                    .transition(
                        DocumentTransition::from_document(&current, DocumentState::Pending)
                            .with_content_hash(req.content_hash.clone()),
                    )
                    .await?;
                self.publish_state_changed(ctx, &current, &updated);
                if let Some(representation_id) = current.representation_id {
                    self.notifier.publish_with_context(
                        PipelineEvent::RepresentationSuperseded {
                            project_id: current.project_id,
                            document_id: current.id,
                            representation_id,
                        },
                        ctx.clone(),
                    );
                }
                updated
            }
            DocumentState::Parsing => {
                return Err(Error::invalid_transition(
                    "document",
                    DocumentState::Parsing,
                    DocumentState::Pending,
                ));
            }
        };

        info!(
            document_id = %updated.id,
            from_state = %current.state,
            "Document re-ingested with new content"
        );
        self.publish_ingested(ctx, &updated, IngestOutcome::Reingested);
        Ok((updated, IngestOutcome::Reingested))
    }

    /// `Pending -> Parsing`.
    pub async fn mark_parsing(&self, ctx: &EventContext, doc: &SourceDocument) -> Result<SourceDocument> {
        self.apply(ctx, DocumentTransition::from_document(doc, DocumentState::Parsing))
            .await
    }

    /// `Parsing -> Parsed`, persisting the representation and its blocks.
    ///
    /// Publishes the state change, then the extracted block set.
    pub async fn mark_parsed(
        &self,
        ctx: &EventContext,
        doc: &SourceDocument,
        extraction: Extraction,
    ) -> Result<SourceDocument> {
        let _guard = self.locks.lock(doc.id).await;
        let Extraction {
            representation,
            blocks,
            fingerprint,
        } = extraction;
        let representation_id = representation.id;
        let block_count = blocks.len() as i32;

        let parsed = self
            .repos
            .documents
            .transition_parsed(
                DocumentTransition::from_document(doc, DocumentState::Parsed),
                representation,
                blocks,
            )
            .await?;

        self.publish_state_changed(ctx, doc, &parsed);
        self.notifier.publish_with_context(
            PipelineEvent::BlocksExtracted {
                project_id: parsed.project_id,
                document_id: parsed.id,
                representation_id,
                block_count,
                fingerprint,
            },
            ctx.clone(),
        );
        info!(
            subsystem = SUBSYSTEM_PIPELINE,
            component = "document_store",
            document_id = %parsed.id,
            representation_id = %representation_id,
            block_count,
            "Document parsed"
        );
        Ok(parsed)
    }

    /// `Parsing -> Failed(reason)`.
    pub async fn mark_failed(
        &self,
        ctx: &EventContext,
        doc: &SourceDocument,
        reason: FailureReason,
    ) -> Result<SourceDocument> {
        self.apply(
            ctx,
            DocumentTransition::from_document(doc, DocumentState::Failed).with_failure(reason),
        )
        .await
    }

    /// `Failed -> Pending` for an explicit resubmission.
    pub async fn requeue(&self, ctx: &EventContext, doc: &SourceDocument) -> Result<SourceDocument> {
        self.apply(ctx, DocumentTransition::from_document(doc, DocumentState::Pending))
            .await
    }

    /// Flag a `Pending` or `Parsing` document for cancellation. The parse job
    /// observes the flag at its next checkpoint.
    pub async fn request_cancel(&self, ctx: &EventContext, document_id: Uuid) -> Result<SourceDocument> {
        let _guard = self.locks.lock(document_id).await;
        let doc = self.repos.documents.request_cancel(document_id).await?;
        self.notifier.publish_with_context(
            PipelineEvent::DocumentCancelRequested {
                project_id: doc.project_id,
                document_id: doc.id,
            },
            ctx.clone(),
        );
        info!(
            subsystem = SUBSYSTEM_PIPELINE,
            component = "document_store",
            document_id = %doc.id,
            state = %doc.state,
            "Cancellation requested"
        );
        Ok(doc)
    }

    pub async fn get(&self, document_id: Uuid) -> Result<SourceDocument> {
        self.repos
            .documents
            .get(document_id)
            .await?
            .ok_or(Error::DocumentNotFound(document_id))
    }

    pub async fn get_view(&self, document_id: Uuid) -> Result<DocumentView> {
        self.repos
            .documents
            .get_view(document_id)
            .await?
            .ok_or(Error::DocumentNotFound(document_id))
    }

    /// Documents view, optionally restricted to one project.
    pub async fn list_view(&self, project_id: Option<Uuid>) -> Result<Vec<DocumentView>> {
        if let Some(id) = project_id {
            if self.repos.projects.get(id).await?.is_none() {
                return Err(Error::ProjectNotFound(id));
            }
        }
        self.repos.documents.list_view(project_id).await
    }

    /// Blocks of the live representation; empty when the document is not parsed.
    pub async fn live_blocks(&self, document_id: Uuid) -> Result<Vec<Block>> {
        self.get(document_id).await?;
        match self.repos.representations.live_for_document(document_id).await? {
            Some(rep) => self.repos.representations.blocks(rep.id).await,
            None => Ok(Vec::new()),
        }
    }

    /// Every representation of the document, newest first.
    pub async fn representations(&self, document_id: Uuid) -> Result<Vec<ConversionRepresentation>> {
        self.get(document_id).await?;
        self.repos.representations.list_for_document(document_id).await
    }

    async fn apply(&self, ctx: &EventContext, t: DocumentTransition) -> Result<SourceDocument> {
        let _guard = self.locks.lock(t.id).await;
        let from = t.expected_state;
        let id = t.id;
        let before_version = t.expected_version;
        let updated = self.repos.documents.transition(t).await?;
        self.notifier.publish_with_context(
            PipelineEvent::DocumentStateChanged {
                project_id: updated.project_id,
                document_id: updated.id,
                from,
                to: updated.state,
                version: updated.version,
                failure: updated.failure.clone(),
            },
            ctx.clone(),
        );
        debug!(
            subsystem = SUBSYSTEM_PIPELINE,
            component = "document_store",
            document_id = %id,
            from_state = %from,
            to_state = %updated.state,
            from_version = before_version,
            "Document transition applied"
        );
        Ok(updated)
    }

    fn publish_state_changed(&self, ctx: &EventContext, before: &SourceDocument, after: &SourceDocument) {
        self.notifier.publish_with_context(
            PipelineEvent::DocumentStateChanged {
                project_id: after.project_id,
                document_id: after.id,
                from: before.state,
                to: after.state,
                version: after.version,
                failure: after.failure.clone(),
            },
            ctx.clone(),
        );
    }

    fn publish_ingested(&self, ctx: &EventContext, doc: &SourceDocument, outcome: IngestOutcome) {
        self.notifier.publish_with_context(
            PipelineEvent::DocumentIngested {
                project_id: doc.project_id,
                document_id: doc.id,
                locator: doc.locator.clone(),
                content_hash: doc.content_hash.clone(),
                outcome,
            },
            ctx.clone(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docket_core::{ParsedRepresentation, RepresentationContent};
    use docket_db::MemoryStore;

    use crate::extractor::BlockExtractor;

    async fn setup() -> (DocumentStore, Arc<ChangeNotifier>, Uuid) {
        let store = MemoryStore::default();
        let repos = store.repositories();
        let project = repos.projects.create("p").await.unwrap();
        let notifier = Arc::new(ChangeNotifier::default());
        (
            DocumentStore::new(repos, notifier.clone(), DocumentLocks::new()),
            notifier,
            project.id,
        )
    }

    fn extraction(doc: &SourceDocument, text: &str) -> Extraction {
        BlockExtractor::new()
            .build(
                doc.id,
                ParsedRepresentation {
                    parsing_tool: "test".into(),
                    schema_version: "1".into(),
                    content: RepresentationContent::Markdown { text: text.into() },
                },
            )
            .unwrap()
    }

    async fn parse(store: &DocumentStore, doc: &SourceDocument, text: &str) -> SourceDocument {
        let ctx = EventContext::default();
        let parsing = store.mark_parsing(&ctx, doc).await.unwrap();
        store.mark_parsed(&ctx, &parsing, extraction(&parsing, text)).await.unwrap()
    }

    #[tokio::test]
    async fn test_ingest_creates_pending_document() {
        let (store, notifier, project) = setup().await;
        let (doc, outcome) = store
            .ingest(&EventContext::default(), IngestRequest::new(project, "docs/Report.MD", "h1"))
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Created);
        assert_eq!(doc.state, DocumentState::Pending);
        assert_eq!(doc.title, "Report");
        assert_eq!(doc.source_type, "md");
        assert_eq!(notifier.last_sequence(), 1);
    }

    #[tokio::test]
    async fn test_ingest_same_hash_is_unchanged() {
        let (store, notifier, project) = setup().await;
        let ctx = EventContext::default();
        let (doc, _) = store.ingest(&ctx, IngestRequest::new(project, "a.md", "h1")).await.unwrap();
        let (again, outcome) = store.ingest(&ctx, IngestRequest::new(project, "a.md", "h1")).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Unchanged);
        assert_eq!(again.id, doc.id);
        assert_eq!(again.version, doc.version);
        assert_eq!(notifier.last_sequence(), 1);
    }

    #[tokio::test]
    async fn test_ingest_changed_hash_while_pending_updates_in_place() {
        let (store, _, project) = setup().await;
        let ctx = EventContext::default();
        let (doc, _) = store.ingest(&ctx, IngestRequest::new(project, "a.md", "h1")).await.unwrap();
        let (again, outcome) = store.ingest(&ctx, IngestRequest::new(project, "a.md", "h2")).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Reingested);
        assert_eq!(again.state, DocumentState::Pending);
        assert_eq!(again.content_hash, "h2");
        assert!(again.version > doc.version);
    }

    #[tokio::test]
    async fn test_ingest_changed_hash_while_parsing_is_rejected() {
        let (store, _, project) = setup().await;
        let ctx = EventContext::default();
        let (doc, _) = store.ingest(&ctx, IngestRequest::new(project, "a.md", "h1")).await.unwrap();
        store.mark_parsing(&ctx, &doc).await.unwrap();
        let result = store.ingest(&ctx, IngestRequest::new(project, "a.md", "h2")).await;
        assert!(matches!(result, Err(Error::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_reingest_parsed_document_supersedes_representation() {
        let (store, notifier, project) = setup().await;
        let ctx = EventContext::default();
        let (doc, _) = store.ingest(&ctx, IngestRequest::new(project, "a.md", "h1")).await.unwrap();
        let parsed = parse(&store, &doc, "# A\n\nbody\n").await;
        assert_eq!(store.live_blocks(doc.id).await.unwrap().len(), 2);

        let mut sub = notifier.subscribe(docket_core::ScopeFilter::document(doc.id));
        let (pending, outcome) = store.ingest(&ctx, IngestRequest::new(project, "a.md", "h2")).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Reingested);
        assert_eq!(pending.state, DocumentState::Pending);
        assert!(store.live_blocks(doc.id).await.unwrap().is_empty());

        let reps = store.representations(doc.id).await.unwrap();
        assert_eq!(reps.len(), 1);
        assert!(reps[0].is_superseded());
        assert_eq!(Some(reps[0].id), parsed.representation_id);

        use futures::StreamExt;
        let mut types = Vec::new();
        for _ in 0..3 {
            match sub.next().await {
                Some(docket_core::SubscriptionItem::Event(e)) => types.push(e.event_type),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(
            types,
            vec![
                "document.state_changed",
                "document.representation_superseded",
                "document.ingested"
            ]
        );
    }

    #[tokio::test]
    async fn test_mark_parsed_publishes_state_then_blocks() {
        let (store, notifier, project) = setup().await;
        let ctx = EventContext::default();
        let (doc, _) = store.ingest(&ctx, IngestRequest::new(project, "a.md", "h1")).await.unwrap();
        let parsing = store.mark_parsing(&ctx, &doc).await.unwrap();

        let mut sub = notifier.subscribe(docket_core::ScopeFilter::document(doc.id));
        store.mark_parsed(&ctx, &parsing, extraction(&parsing, "one\n\ntwo\n")).await.unwrap();

        use futures::StreamExt;
        let first = sub.next().await.unwrap();
        let second = sub.next().await.unwrap();
        match (first, second) {
            (
                docket_core::SubscriptionItem::Event(a),
                docket_core::SubscriptionItem::Event(b),
            ) => {
                assert_eq!(a.event_type, "document.state_changed");
                assert_eq!(b.event_type, "document.blocks_extracted");
                assert!(a.sequence < b.sequence);
            }
            other => panic!("unexpected {:?}", other),
        }
        let view = store.get_view(doc.id).await.unwrap();
        assert_eq!(view.block_count, 2);
        assert_eq!(view.document.state, DocumentState::Parsed);
    }

    #[tokio::test]
    async fn test_stale_transition_is_reported() {
        let (store, _, project) = setup().await;
        let ctx = EventContext::default();
        let (doc, _) = store.ingest(&ctx, IngestRequest::new(project, "a.md", "h1")).await.unwrap();
        store.mark_parsing(&ctx, &doc).await.unwrap();
        let again = store.mark_parsing(&ctx, &doc).await;
        assert!(matches!(again, Err(Error::StaleState { .. })));
    }

    #[tokio::test]
    async fn test_failed_then_requeued() {
        let (store, _, project) = setup().await;
        let ctx = EventContext::default();
        let (doc, _) = store.ingest(&ctx, IngestRequest::new(project, "a.md", "h1")).await.unwrap();
        let parsing = store.mark_parsing(&ctx, &doc).await.unwrap();
        let failed = store
            .mark_failed(&ctx, &parsing, FailureReason::Parse { message: "bad".into() })
            .await
            .unwrap();
        assert_eq!(failed.state, DocumentState::Failed);
        let pending = store.requeue(&ctx, &failed).await.unwrap();
        assert_eq!(pending.state, DocumentState::Pending);
        assert!(pending.failure.is_none());
    }

    #[tokio::test]
    async fn test_ingest_validates_input() {
        let (store, _, project) = setup().await;
        let ctx = EventContext::default();
        assert!(matches!(
            store.ingest(&ctx, IngestRequest::new(project, " ", "h")).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            store.ingest(&ctx, IngestRequest::new(Uuid::now_v7(), "a.md", "h")).await,
            Err(Error::ProjectNotFound(_))
        ));
    }
}
