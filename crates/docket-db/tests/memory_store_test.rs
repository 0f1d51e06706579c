//! Repository contract suite against the in-memory backend.

mod common;

use std::sync::Arc;

use docket_db::{
    DocumentRepository, DocumentState, DocumentTransition, MemoryStore, NewDocument,
    ProjectRepository, Repositories,
};
use uuid::Uuid;

fn repos() -> Repositories {
    MemoryStore::new().repositories()
}

#[tokio::test]
async fn test_insert_or_get_is_idempotent() {
    common::check_insert_or_get_is_idempotent(&repos()).await;
}

#[tokio::test]
async fn test_stale_transition_is_rejected() {
    common::check_stale_transition_is_rejected(&repos()).await;
}

#[tokio::test]
async fn test_invalid_transition_is_rejected() {
    common::check_invalid_transition_is_rejected(&repos()).await;
}

#[tokio::test]
async fn test_reparse_supersedes_representation() {
    common::check_reparse_supersedes_representation(&repos()).await;
}

#[tokio::test]
async fn test_failed_transition_records_reason() {
    common::check_failed_transition_records_reason(&repos()).await;
}

#[tokio::test]
async fn test_cancel_flag() {
    common::check_cancel_flag_keeps_version(&repos()).await;
}

#[tokio::test]
async fn test_run_dedup() {
    common::check_run_dedup(&repos()).await;
}

#[tokio::test]
async fn test_overlay_append_is_atomic_and_once() {
    common::check_overlay_append_is_atomic_and_once(&repos()).await;
}

#[tokio::test]
async fn test_schema_versions() {
    common::check_schema_versions(&repos()).await;
}

#[tokio::test]
async fn test_insert_requires_project() {
    let store = MemoryStore::new();
    let result = store
        .insert_or_get(NewDocument {
            project_id: Uuid::now_v7(),
            title: "x".into(),
            source_type: "md".into(),
            locator: "x.md".into(),
            content_hash: "h".into(),
        })
        .await;
    assert!(matches!(result, Err(docket_db::Error::ProjectNotFound(_))));
}

#[tokio::test]
async fn test_concurrent_transitions_have_one_winner() {
    let store = MemoryStore::new();
    let project = ProjectRepository::create(&store, "p").await.unwrap();
    let (doc, _) = store
        .insert_or_get(NewDocument {
            project_id: project.id,
            title: "x".into(),
            source_type: "md".into(),
            locator: "x.md".into(),
            content_hash: "h".into(),
        })
        .await
        .unwrap();

    let store = Arc::new(store);
    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let t = DocumentTransition::from_document(&doc, DocumentState::Parsing);
        handles.push(tokio::spawn(async move { store.transition(t).await }));
    }
    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}
