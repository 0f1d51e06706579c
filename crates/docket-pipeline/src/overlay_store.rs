//! Overlay Store service: read side of run output.
//!
//! Overlays are only ever written by the run executor, through
//! [`OverlayRepository::append`](docket_core::OverlayRepository::append).
//! Everything here is side-effect free.

use tracing::debug;
use uuid::Uuid;

use docket_core::{Error, Overlay, OverlayFilter, Repositories, Result, RunStatus};
use docket_core::logging::SUBSYSTEM_PIPELINE;

use crate::export::{build_records, ExportRecord};

#[derive(Clone)]
pub struct OverlayStore {
    repos: Repositories,
}

impl OverlayStore {
    pub fn new(repos: Repositories) -> Self {
        Self { repos }
    }

    /// Overlays of a document's succeeded runs, ordered by block then
    /// creation time.
    pub async fn list_overlays(&self, document_id: Uuid, filter: OverlayFilter) -> Result<Vec<Overlay>> {
        if self.repos.documents.get(document_id).await?.is_none() {
            return Err(Error::DocumentNotFound(document_id));
        }
        self.repos.overlays.list_for_document(document_id, filter).await
    }

    /// Overlays published by one run.
    pub async fn list_for_run(&self, run_id: Uuid) -> Result<Vec<Overlay>> {
        if self.repos.runs.get(run_id).await?.is_none() {
            return Err(Error::RunNotFound(run_id));
        }
        self.repos.overlays.list_for_run(run_id).await
    }

    /// Export records for a run: every block of the run's representation,
    /// with the run's overlay data where there is any.
    ///
    /// A run that has not succeeded exports empty data.
    pub async fn export_run(&self, run_id: Uuid) -> Result<Vec<ExportRecord>> {
        let run = self
            .repos
            .runs
            .get(run_id)
            .await?
            .ok_or(Error::RunNotFound(run_id))?;
        let document = self
            .repos
            .documents
            .get(run.document_id)
            .await?
            .ok_or(Error::DocumentNotFound(run.document_id))?;
        let representation = self
            .repos
            .representations
            .get(run.representation_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("representation {}", run.representation_id)))?;
        let schema = self
            .repos
            .schemas
            .get(run.schema_key())
            .await?
            .ok_or(Error::SchemaNotFound {
                id: run.schema_id,
                version: run.schema_version,
            })?;
        let blocks = self.repos.representations.blocks(representation.id).await?;
        let overlays = if run.status == RunStatus::Succeeded {
            self.repos.overlays.list_for_run(run.id).await?
        } else {
            Vec::new()
        };

        debug!(
            subsystem = SUBSYSTEM_PIPELINE,
            component = "overlay_store",
            op = "export_run",
            run_id = %run.id,
            block_count = blocks.len(),
            overlay_count = overlays.len(),
            "Exporting run"
        );
        Ok(build_records(&document, &representation, &blocks, Some(&schema), &overlays))
    }

    /// Export records for a document's live representation, without overlay
    /// data.
    pub async fn export_document(&self, document_id: Uuid) -> Result<Vec<ExportRecord>> {
        let document = self
            .repos
            .documents
            .get(document_id)
            .await?
            .ok_or(Error::DocumentNotFound(document_id))?;
        let representation = self
            .repos
            .representations
            .live_for_document(document_id)
            .await?
            .ok_or(Error::DocumentNotParsed(document_id))?;
        let blocks = self.repos.representations.blocks(representation.id).await?;
        Ok(build_records(&document, &representation, &blocks, None, &[]))
    }
}
