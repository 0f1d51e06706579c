//! Storage rules shared by the Postgres and in-memory backends.

use uuid::Uuid;

use docket_core::{DocumentState, DocumentTransition, Error, Result, Run, RunStatus, SourceDocument};

/// Reject transitions that are not edges of the document state machine.
pub(crate) fn check_transition(t: &DocumentTransition) -> Result<()> {
    if t.expected_state.can_transition_to(t.to) {
        Ok(())
    } else {
        Err(Error::invalid_transition("document", t.expected_state, t.to))
    }
}

/// Error for a compare-and-set that matched no row.
pub(crate) fn cas_miss(current: Option<&SourceDocument>, id: Uuid, expected_version: i64) -> Error {
    match current {
        None => Error::DocumentNotFound(id),
        Some(_) => Error::StaleState {
            entity: "document",
            id,
            expected_version,
        },
    }
}

/// Error for cancelling a document that is not in flight.
pub(crate) fn cancel_rejected(doc: &SourceDocument) -> Error {
    Error::invalid_transition("document", doc.state, "cancel_requested")
}

/// Whether a document in `state` accepts a cancellation request.
pub(crate) fn cancellable(state: DocumentState) -> bool {
    matches!(state, DocumentState::Pending | DocumentState::Parsing)
}

/// Run to reuse instead of creating a new one.
///
/// `existing` holds every run for one dedup key, newest first.
pub(crate) fn reusable_run(existing: &[Run], force: bool) -> Option<Run> {
    if let Some(running) = existing.iter().find(|r| r.status == RunStatus::Running) {
        return Some(running.clone());
    }
    if let Some(done) = existing.iter().find(|r| r.status == RunStatus::Succeeded) {
        return Some(done.clone());
    }
    match existing.first() {
        Some(failed) if failed.status == RunStatus::Failed && !force => Some(failed.clone()),
        _ => None,
    }
}
