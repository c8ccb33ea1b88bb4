mod common;

use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

use common::{harness, op, sample_catalog, FakeAggregator, GatedEmbedder, KeywordEmbedder};
use toolgate::config::RetrievalConfig;
use toolgate::error::RouterError;
use toolgate::models::{RebuildReason, RebuildStatus};
use toolgate::router::{CallRequest, RequestRouter};
use toolgate::snapshot::SnapshotStore;

#[tokio::test]
async fn test_rebuild_is_idempotent() {
    let agg = FakeAggregator::new(sample_catalog());
    let embedder = KeywordEmbedder::new();
    let h = harness(&agg, embedder.clone(), None);
    h.upstream.connect().await;

    let first = h.index.rebuild(RebuildReason::Startup).await;
    assert_eq!(first.status, RebuildStatus::Rebuilt);
    assert_eq!(first.added, 3);
    assert_eq!(first.total, 3);
    assert_eq!(embedder.texts_embedded(), 3);
    let calls_after_first = embedder.calls();

    let second = h.index.rebuild(RebuildReason::Poll).await;
    assert_eq!(second.status, RebuildStatus::Unchanged);
    assert_eq!(second.added, 0);
    assert_eq!(second.removed, 0);
    assert_eq!(second.unchanged, 3);
    assert_eq!(embedder.calls(), calls_after_first);
}

#[tokio::test]
async fn test_description_change_reembeds_only_that_entry() {
    let agg = FakeAggregator::new(sample_catalog());
    let embedder = KeywordEmbedder::new();
    let h = harness(&agg, embedder.clone(), None);
    h.upstream.connect().await;
    h.index.rebuild(RebuildReason::Startup).await;
    let before = h.index.current_snapshot().unwrap();

    agg.update(|ops| ops[1].description = "Tomorrow's weather, by city".into());
    let report = h.index.rebuild(RebuildReason::Notification).await;

    assert_eq!(report.status, RebuildStatus::Rebuilt);
    assert_eq!(report.added, 1);
    assert_eq!(report.unchanged, 2);
    assert_eq!(embedder.texts_embedded(), 4);

    let after = h.index.current_snapshot().unwrap();
    assert_ne!(before.fingerprint, after.fingerprint);
    for name in ["github_create_issue", "gmail_send"] {
        assert_eq!(
            before.get(name).unwrap().embedding,
            after.get(name).unwrap().embedding
        );
    }
    assert_eq!(
        after.get("weather_forecast").unwrap().description,
        "Tomorrow's weather, by city"
    );
}

#[tokio::test]
async fn test_schema_only_change_publishes_without_embedding() {
    let agg = FakeAggregator::new(sample_catalog());
    let embedder = KeywordEmbedder::new();
    let h = harness(&agg, embedder.clone(), None);
    h.upstream.connect().await;
    h.index.rebuild(RebuildReason::Startup).await;
    let calls = embedder.calls();

    let schema = json!({"type": "object", "required": ["to"], "properties": {"to": {"type": "string"}}});
    let expected = schema.clone();
    agg.update(move |ops| ops[2].schema = schema);
    let report = h.index.rebuild(RebuildReason::Poll).await;

    assert_eq!(report.status, RebuildStatus::Rebuilt);
    assert_eq!(report.added, 0);
    assert_eq!(report.unchanged, 3);
    assert_eq!(embedder.calls(), calls);
    let snap = h.index.current_snapshot().unwrap();
    assert_eq!(snap.get("gmail_send").unwrap().parameter_schema, expected);
}

#[tokio::test]
async fn test_removed_operations_are_counted() {
    let agg = FakeAggregator::new(sample_catalog());
    let h = harness(&agg, KeywordEmbedder::new(), None);
    h.upstream.connect().await;
    h.index.rebuild(RebuildReason::Startup).await;

    agg.update(|ops| {
        ops.remove(0);
    });
    let report = h.index.rebuild(RebuildReason::Manual).await;
    assert_eq!(report.removed, 1);
    assert_eq!(report.total, 2);
    assert!(h
        .index
        .current_snapshot()
        .unwrap()
        .get("github_create_issue")
        .is_none());
}

#[tokio::test]
async fn test_duplicate_names_keep_first() {
    let mut catalog = sample_catalog();
    catalog.push(op("gmail_send", "A second, shadowed definition"));
    let agg = FakeAggregator::new(catalog);
    let h = harness(&agg, KeywordEmbedder::new(), None);
    h.upstream.connect().await;

    let report = h.index.rebuild(RebuildReason::Startup).await;
    assert_eq!(report.total, 3);
    let snap = h.index.current_snapshot().unwrap();
    assert_eq!(snap.get("gmail_send").unwrap().description, "Send an email message");
}

#[tokio::test]
async fn test_rebuild_skipped_while_disconnected() {
    let agg = FakeAggregator::new(sample_catalog());
    let embedder = KeywordEmbedder::new();
    let h = harness(&agg, embedder.clone(), None);

    let report = h.index.rebuild(RebuildReason::Manual).await;
    assert_eq!(report.status, RebuildStatus::SkippedDisconnected);
    assert_eq!(embedder.calls(), 0);
    assert!(h.index.current_snapshot().is_none());
}

#[tokio::test]
async fn test_cold_start_reuses_persisted_embeddings() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("catalog.json");
    let agg = FakeAggregator::new(sample_catalog());

    let first = harness(&agg, KeywordEmbedder::new(), Some(SnapshotStore::new(&path)));
    first.upstream.connect().await;
    first.index.rebuild(RebuildReason::Startup).await;
    first.upstream.shutdown().await;
    assert!(path.exists());

    let embedder = KeywordEmbedder::new();
    let second = harness(&agg, embedder.clone(), Some(SnapshotStore::new(&path)));
    assert_eq!(second.index.load_persisted().await.unwrap(), 3);
    assert!(second.index.current_snapshot().is_none());

    second.upstream.connect().await;
    let report = second.index.rebuild(RebuildReason::Startup).await;
    assert_eq!(report.status, RebuildStatus::Rebuilt);
    assert_eq!(report.added, 0);
    assert_eq!(report.unchanged, 3);
    assert_eq!(embedder.calls(), 0);
}

#[tokio::test]
async fn test_corrupt_snapshot_is_reported() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("catalog.json");
    std::fs::write(&path, "{ not json").unwrap();

    let agg = FakeAggregator::new(sample_catalog());
    let h = harness(&agg, KeywordEmbedder::new(), Some(SnapshotStore::new(&path)));
    assert!(h.index.load_persisted().await.is_err());

    // The index still builds from scratch.
    h.upstream.connect().await;
    let report = h.index.rebuild(RebuildReason::Startup).await;
    assert_eq!(report.added, 3);
}

fn router(h: &common::Harness) -> RequestRouter {
    RequestRouter::new(
        h.upstream.clone(),
        h.index.clone(),
        RetrievalConfig::default(),
    )
}

#[tokio::test]
async fn test_discover_not_ready_until_indexed() {
    let agg = FakeAggregator::new(sample_catalog());
    let h = harness(&agg, KeywordEmbedder::new(), None);
    let router = router(&h);

    let err = router.discover("send mail", None).await.unwrap_err();
    assert!(matches!(err, RouterError::NotReady(_)));
    assert!(err.to_string().contains("disconnected"));

    h.upstream.connect().await;
    let err = router.discover("send mail", None).await.unwrap_err();
    assert!(matches!(err, RouterError::NotReady(_)));
    assert!(err.to_string().contains("not been indexed"));
}

#[tokio::test]
async fn test_discover_ranks_by_similarity() {
    let agg = FakeAggregator::new(sample_catalog());
    let h = harness(&agg, KeywordEmbedder::new(), None);
    h.upstream.connect().await;
    h.index.rebuild(RebuildReason::Startup).await;
    let router = router(&h);

    let results = router.discover("file an issue about the bug", Some(2)).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].name, "github_create_issue");
    assert!(results[0].relevance >= results[1].relevance);
    assert!(results.iter().all(|r| (0.0..=1.0).contains(&r.relevance)));
    assert_eq!(results[0].parameter_schema, json!({"type": "object"}));

    let all = router.discover("anything", Some(1000)).await.unwrap();
    assert_eq!(all.len(), 3);

    assert!(matches!(
        router.discover("anything", Some(0)).await,
        Err(RouterError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn test_execute_passes_result_through() {
    let agg = FakeAggregator::new(sample_catalog());
    let h = harness(&agg, KeywordEmbedder::new(), None);
    h.upstream.connect().await;
    let router = router(&h);

    let result = router
        .execute("gmail_send", json!({"to": "a@example.com"}))
        .await
        .unwrap();
    assert_eq!(result["structuredContent"]["to"], "a@example.com");

    agg.fail_calls_to("gmail_send");
    let err = router.execute("gmail_send", json!({})).await.unwrap_err();
    assert!(matches!(err, RouterError::Upstream(_)));
    assert!(err.to_string().contains("exploded"));

    assert!(matches!(
        router.execute("", json!({})).await,
        Err(RouterError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn test_batch_failures_are_isolated() {
    let agg = FakeAggregator::new(sample_catalog());
    agg.fail_calls_to("weather_forecast");
    agg.report_error_from("gmail_send");
    let h = harness(&agg, KeywordEmbedder::new(), None);
    h.upstream.connect().await;
    let router = router(&h);

    let calls = vec![
        CallRequest {
            operation_name: "github_create_issue".into(),
            arguments: json!({"title": "crash"}),
        },
        CallRequest {
            operation_name: "weather_forecast".into(),
            arguments: json!({"city": "Oslo"}),
        },
        CallRequest {
            operation_name: "gmail_send".into(),
            arguments: serde_json::Value::Null,
        },
    ];
    let outcomes = router.batch_execute(calls).await.unwrap();

    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes[0].operation_name, "github_create_issue");
    assert!(outcomes[0].success);
    assert_eq!(outcomes[0].result.as_ref().unwrap()["structuredContent"]["title"], "crash");

    assert!(!outcomes[1].success);
    assert!(outcomes[1].result.is_none());
    assert!(outcomes[1].error.as_deref().unwrap().contains("exploded"));

    assert!(!outcomes[2].success);
    assert!(outcomes[2].result.is_some());
    assert_eq!(outcomes[2].error.as_deref(), Some("rate limit exceeded"));
}

#[tokio::test]
async fn test_batch_validation_rejects_before_any_call() {
    let agg = FakeAggregator::new(sample_catalog());
    let h = harness(&agg, KeywordEmbedder::new(), None);
    h.upstream.connect().await;
    let router = router(&h);

    let calls = vec![
        CallRequest {
            operation_name: "gmail_send".into(),
            arguments: json!({}),
        },
        CallRequest {
            operation_name: "weather_forecast".into(),
            arguments: json!("Oslo"),
        },
    ];
    let err = router.batch_execute(calls).await.unwrap_err();
    assert!(matches!(err, RouterError::InvalidInput(_)));
    assert!(err.to_string().contains("calls[1].arguments"));
    assert!(agg.invocations().is_empty());

    assert!(matches!(
        router.batch_execute(Vec::new()).await,
        Err(RouterError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn test_refresh_reports_counts() {
    let agg = FakeAggregator::new(sample_catalog());
    let h = harness(&agg, KeywordEmbedder::new(), None);
    let router = router(&h);

    let summary = router.refresh().await;
    assert_eq!(summary.status, RebuildStatus::SkippedDisconnected);
    assert!(!summary.connected);

    h.upstream.connect().await;
    let summary = router.refresh().await;
    assert_eq!(summary.status, RebuildStatus::Rebuilt);
    assert_eq!(summary.added, 3);
    assert!(summary.connected);

    agg.update(|ops| ops.push(op("slack_post", "Post a message to a Slack channel")));
    let summary = router.refresh().await;
    assert_eq!(summary.added, 1);
    assert_eq!(summary.unchanged, 3);
    assert_eq!(summary.total, 4);
    assert!(summary.message.contains("4 operations indexed"));
}

#[tokio::test]
async fn test_persist_failure_still_publishes() {
    let tmp = TempDir::new().unwrap();
    let target = tmp.path().join("catalog.json");
    std::fs::create_dir(&target).unwrap();

    let agg = FakeAggregator::new(sample_catalog());
    let h = harness(&agg, KeywordEmbedder::new(), Some(SnapshotStore::new(&target)));
    h.upstream.connect().await;

    let report = h.index.rebuild(RebuildReason::Startup).await;
    assert_eq!(report.status, RebuildStatus::Rebuilt);
    assert_eq!(report.total, 3);
    assert_eq!(h.index.operation_count(), 3);
    assert!(target.is_dir());
    // The temporary file is cleaned up after the failed rename.
    assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 1);
}

#[tokio::test]
async fn test_concurrent_rebuild_is_dropped() {
    let agg = FakeAggregator::new(sample_catalog());
    let gated = GatedEmbedder::new();
    let h = harness(&agg, gated.clone(), None);
    h.upstream.connect().await;

    let index = Arc::clone(&h.index);
    let first = tokio::spawn(async move { index.rebuild(RebuildReason::Startup).await });
    gated.wait_entered().await;

    let second = h.index.rebuild(RebuildReason::Notification).await;
    assert_eq!(second.status, RebuildStatus::SkippedInFlight);
    assert_eq!(second.total, 0);

    gated.release();
    let first = first.await.unwrap();
    assert_eq!(first.status, RebuildStatus::Rebuilt);
    assert_eq!(first.total, 3);
    assert_eq!(gated.inner().texts_embedded(), 3);
    assert_eq!(h.index.operation_count(), 3);
}
