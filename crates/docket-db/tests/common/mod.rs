//! Repository contract checks shared by the in-memory and Postgres suites.

#![allow(dead_code)]

use std::collections::HashSet;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use docket_db::test_fixtures::sample_representation;
use docket_db::{
    new_v7, DocumentState, DocumentTransition, Error, FailureReason, NewDocument, NewRun, Overlay,
    OverlayFilter, Repositories, RunStatus, SchemaKey, SourceDocument,
};

pub async fn new_document(repos: &Repositories, locator: &str) -> SourceDocument {
    let project = repos.projects.create("contract-tests").await.unwrap();
    let (doc, created) = repos
        .documents
        .insert_or_get(NewDocument {
            project_id: project.id,
            title: "t".into(),
            source_type: "md".into(),
            locator: locator.into(),
            content_hash: "h1".into(),
        })
        .await
        .unwrap();
    assert!(created);
    doc
}

/// Drive a document to `Parsed` with the given block texts.
pub async fn parsed_document(repos: &Repositories, texts: &[&str]) -> (SourceDocument, Uuid) {
    let doc = new_document(repos, &format!("doc-{}.md", new_v7())).await;
    let parsing = repos
        .documents
        .transition(DocumentTransition::from_document(&doc, DocumentState::Parsing))
        .await
        .unwrap();
    let (rep, blocks) = sample_representation(doc.id, texts);
    let rep_id = rep.id;
    let parsed = repos
        .documents
        .transition_parsed(
            DocumentTransition::from_document(&parsing, DocumentState::Parsed),
            rep,
            blocks,
        )
        .await
        .unwrap();
    (parsed, rep_id)
}

pub async fn check_insert_or_get_is_idempotent(repos: &Repositories) {
    let doc = new_document(repos, "a/report.md").await;
    assert_eq!(doc.state, DocumentState::Pending);
    assert_eq!(doc.version, 1);

    let (again, created) = repos
        .documents
        .insert_or_get(NewDocument {
            project_id: doc.project_id,
            title: "other".into(),
            source_type: "md".into(),
            locator: "a/report.md".into(),
            content_hash: "h2".into(),
        })
        .await
        .unwrap();
    assert!(!created);
    assert_eq!(again.id, doc.id);
    assert_eq!(again.content_hash, "h1");
}

pub async fn check_stale_transition_is_rejected(repos: &Repositories) {
    let doc = new_document(repos, &format!("race-{}.md", new_v7())).await;
    let t = DocumentTransition::from_document(&doc, DocumentState::Parsing);

    let winner = repos.documents.transition(t.clone()).await.unwrap();
    assert_eq!(winner.state, DocumentState::Parsing);
    assert_eq!(winner.version, doc.version + 1);

    let loser = repos.documents.transition(t).await;
    assert!(matches!(loser, Err(Error::StaleState { .. })), "{:?}", loser);
}

pub async fn check_invalid_transition_is_rejected(repos: &Repositories) {
    let doc = new_document(repos, &format!("bad-{}.md", new_v7())).await;
    let result = repos
        .documents
        .transition(DocumentTransition::from_document(&doc, DocumentState::Failed))
        .await;
    assert!(matches!(result, Err(Error::InvalidTransition { .. })));

    let missing = repos
        .documents
        .transition(DocumentTransition {
            id: Uuid::now_v7(),
            expected_version: 1,
            expected_state: DocumentState::Pending,
            to: DocumentState::Parsing,
            content_hash: None,
            failure: None,
        })
        .await;
    assert!(matches!(missing, Err(Error::DocumentNotFound(_))));
}

pub async fn check_reparse_supersedes_representation(repos: &Repositories) {
    let (parsed, r1) = parsed_document(repos, &["alpha", "beta"]).await;
    assert_eq!(parsed.representation_id, Some(r1));

    let view = repos.documents.get_view(parsed.id).await.unwrap().unwrap();
    assert_eq!(view.block_count, 2);
    assert_eq!(view.parsing_tool.as_deref(), Some("fixture"));

    // Re-ingest with a changed hash: Parsed -> Pending.
    let pending = repos
        .documents
        .transition(
            DocumentTransition::from_document(&parsed, DocumentState::Pending).with_content_hash("h2"),
        )
        .await
        .unwrap();
    assert_eq!(pending.content_hash, "h2");
    assert!(pending.representation_id.is_none());
    assert!(repos.representations.live_for_document(parsed.id).await.unwrap().is_none());

    let old = repos.representations.get(r1).await.unwrap().unwrap();
    assert!(old.is_superseded());
    // Superseded blocks are retained.
    assert_eq!(repos.representations.blocks(r1).await.unwrap().len(), 2);

    let parsing = repos
        .documents
        .transition(DocumentTransition::from_document(&pending, DocumentState::Parsing))
        .await
        .unwrap();
    let (rep2, blocks2) = sample_representation(parsed.id, &["gamma"]);
    let r2 = rep2.id;
    repos
        .documents
        .transition_parsed(
            DocumentTransition::from_document(&parsing, DocumentState::Parsed),
            rep2,
            blocks2,
        )
        .await
        .unwrap();

    let live = repos.representations.live_for_document(parsed.id).await.unwrap().unwrap();
    assert_eq!(live.id, r2);
    let all = repos.representations.list_for_document(parsed.id).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all.iter().filter(|r| r.is_superseded()).count(), 1);
}

pub async fn check_failed_transition_records_reason(repos: &Repositories) {
    let doc = new_document(repos, &format!("fail-{}.md", new_v7())).await;
    let parsing = repos
        .documents
        .transition(DocumentTransition::from_document(&doc, DocumentState::Parsing))
        .await
        .unwrap();
    let failed = repos
        .documents
        .transition(
            DocumentTransition::from_document(&parsing, DocumentState::Failed).with_failure(
                FailureReason::Parse {
                    message: "unsupported".into(),
                },
            ),
        )
        .await
        .unwrap();
    assert_eq!(failed.state, DocumentState::Failed);
    assert_eq!(failed.failure.as_ref().map(|f| f.message()), Some("unsupported"));

    let cancel = repos.documents.request_cancel(doc.id).await;
    assert!(matches!(cancel, Err(Error::InvalidTransition { .. })));

    let pending = repos
        .documents
        .transition(DocumentTransition::from_document(&failed, DocumentState::Pending))
        .await
        .unwrap();
    assert!(pending.failure.is_none());
}

pub async fn check_cancel_flag_keeps_version(repos: &Repositories) {
    let doc = new_document(repos, &format!("cancel-{}.md", new_v7())).await;
    let flagged = repos.documents.request_cancel(doc.id).await.unwrap();
    assert!(flagged.cancel_requested());
    assert_eq!(flagged.version, doc.version, "cancel flag does not bump version");
}

pub async fn check_run_dedup(repos: &Repositories) {
    let (doc, rep_id) = parsed_document(repos, &["one"]).await;
    let schema = repos
        .schemas
        .publish(&format!("dedup_{}", new_v7().simple()), json!({"type": "object"}), "hash-a")
        .await
        .unwrap()
        .schema;
    let new_run = || NewRun {
        document_id: doc.id,
        representation_id: rep_id,
        schema: schema.key(),
        fingerprint: "fp-1".into(),
        requested_by: "tester".into(),
    };

    let first = repos.runs.create_or_get(new_run(), false).await.unwrap();
    assert!(first.is_created());
    let second = repos.runs.create_or_get(new_run(), false).await.unwrap();
    assert!(!second.is_created());
    assert_eq!(first.run().id, second.run().id);

    let failed = repos
        .runs
        .fail(
            first.run().id,
            FailureReason::Execution {
                message: "boom".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(failed.status, RunStatus::Failed);

    // Failed run is returned unless forced.
    let reused = repos.runs.create_or_get(new_run(), false).await.unwrap();
    assert_eq!(reused.run().id, failed.id);
    let forced = repos.runs.create_or_get(new_run(), true).await.unwrap();
    assert!(forced.is_created());
    assert_ne!(forced.run().id, failed.id);

    // Terminal runs cannot fail twice.
    let again = repos.runs.fail(failed.id, FailureReason::Cancelled).await;
    assert!(matches!(again, Err(Error::RunNotRunning(_))));
}

pub async fn check_overlay_append_is_atomic_and_once(repos: &Repositories) {
    let (doc, rep_id) = parsed_document(repos, &["one", "two"]).await;
    let blocks = repos.representations.blocks(rep_id).await.unwrap();
    let schema = repos
        .schemas
        .publish(&format!("ov_{}", new_v7().simple()), json!({"title": "x"}), "hash-x")
        .await
        .unwrap()
        .schema;
    let run = repos
        .runs
        .create_or_get(
            NewRun {
                document_id: doc.id,
                representation_id: rep_id,
                schema: schema.key(),
                fingerprint: "fp".into(),
                requested_by: "tester".into(),
            },
            false,
        )
        .await
        .unwrap()
        .into_run();

    let overlays: Vec<Overlay> = blocks
        .iter()
        .rev()
        .map(|b| Overlay {
            id: new_v7(),
            run_id: run.id,
            block_id: b.id,
            order_index: b.order_index,
            payload: json!({"len": b.content.len()}),
            created_at: Utc::now(),
            superseded: false,
        })
        .collect();

    let sealed = repos.overlays.append(run.id, overlays.clone()).await.unwrap();
    assert_eq!(sealed.status, RunStatus::Succeeded);
    assert_eq!(sealed.overlay_count, 2);

    let twice = repos.overlays.append(run.id, overlays).await;
    assert!(matches!(twice, Err(Error::RunNotRunning(_))));

    let listed = repos
        .overlays
        .list_for_document(doc.id, OverlayFilter::default())
        .await
        .unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].order_index, 0);
    assert_eq!(listed[1].order_index, 1);
    assert!(listed.iter().all(|o| !o.superseded));

    let filtered = repos
        .overlays
        .list_for_document(
            doc.id,
            OverlayFilter {
                schema: Some(SchemaKey {
                    id: schema.id,
                    version: schema.version + 1,
                }),
                include_superseded: true,
            },
        )
        .await
        .unwrap();
    assert!(filtered.is_empty());

    assert_eq!(repos.overlays.list_for_run(run.id).await.unwrap().len(), 2);
}

pub async fn check_schema_versions(repos: &Repositories) {
    let schema_ref = format!("invoice_{}", new_v7().simple());
    let v1 = repos.schemas.publish(&schema_ref, json!({"v": 1}), "h1").await.unwrap();
    assert!(v1.created);
    assert_eq!(v1.schema.version, 1);

    let same = repos.schemas.publish(&schema_ref, json!({"v": 1}), "h1").await.unwrap();
    assert!(!same.created);
    assert_eq!(same.schema.key(), v1.schema.key());

    let v2 = repos.schemas.publish(&schema_ref, json!({"v": 2}), "h2").await.unwrap();
    assert!(v2.created);
    assert_eq!(v2.schema.id, v1.schema.id);
    assert_eq!(v2.schema.version, 2);

    let latest = repos.schemas.find_by_ref(&schema_ref).await.unwrap().unwrap();
    assert_eq!(latest.version, 2);
    let versions = repos.schemas.list_versions(v1.schema.id).await.unwrap();
    assert_eq!(versions.iter().map(|s| s.version).collect::<Vec<_>>(), vec![1, 2]);
    let ids: HashSet<Uuid> = repos
        .schemas
        .list_latest()
        .await
        .unwrap()
        .iter()
        .filter(|s| s.schema_ref == schema_ref)
        .map(|s| s.id)
        .collect();
    assert_eq!(ids.len(), 1);
}
