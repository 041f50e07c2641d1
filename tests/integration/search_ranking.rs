#![allow(missing_docs)]

//! Ranking semantics through the full search pipeline.

use std::sync::Arc;

use mnemora::ai::{AiRuntime, AiTelemetry, AiUsage, CallOptions, CancelToken, EmbeddingClient};
use mnemora::config::{AiRuntimeConfig, EmbeddingConfig, SearchConfig, VectorIndexConfig};
use mnemora::error::{MnemoraError, Result};
use mnemora::search::SearchPipeline;
use mnemora::store::{NewContextNode, NewScreenshot, Store};
use mnemora::types::{
    encode_embedding, IssueInfo, Knowledge, NodeKind, SourceKey, StateSnapshot,
};
use mnemora::vector::VectorIndexService;

/// Always embeds to the origin, so stored vectors' coordinates are their
/// exact L2 distances from any query.
struct OriginEmbedding;

impl EmbeddingClient for OriginEmbedding {
    fn embed(
        &self,
        _text: &str,
        dimensions: usize,
        _opts: &CallOptions,
    ) -> Result<(Vec<f32>, AiUsage)> {
        Ok((vec![0.0; dimensions], AiUsage::default()))
    }
}

struct Fixture {
    store: Arc<Store>,
    pipeline: SearchPipeline,
    node_ids: Vec<i64>,
}

fn seed_scored_node(
    store: &Store,
    index: &Arc<VectorIndexService>,
    ts: i64,
    importance: u8,
    distance: f32,
    issue: bool,
) -> i64 {
    let key = SourceKey::screen("1");
    let sid = store
        .insert_screenshot(&NewScreenshot::for_test(key.clone(), ts), ts)
        .unwrap();
    let batch = store.create_and_persist_batch(&key, &[sid], ts).unwrap();
    let nid = store
        .upsert_node(
            &NewContextNode {
                batch_id: batch.batch.id,
                screenshot_id: sid,
                kind: if issue {
                    NodeKind::StateSnapshot
                } else {
                    NodeKind::Knowledge
                },
                title: format!("workspace item {ts}"),
                summary: "quiet background activity".into(),
                app_context: "vscode".into(),
                knowledge: (!issue).then(|| Knowledge {
                    content: "notes".into(),
                    language: None,
                    text_region: None,
                    key_insights: vec![],
                }),
                state_snapshot: issue.then(|| StateSnapshot {
                    description: Some("build output".into()),
                    issue: Some(IssueInfo {
                        detected: true,
                        description: Some("compile error".into()),
                    }),
                }),
                ui_text_snippets: vec![],
                keywords: vec![],
                entities: vec![],
                importance,
                confidence: 8,
                event_time: ts,
            },
            ts,
        )
        .unwrap();
    let doc = store.insert_vector_document(nid, ts).unwrap();
    let vector = vec![distance, 0.0];
    store
        .store_embedding(doc, &encode_embedding(&vector), ts)
        .unwrap();
    index.upsert(doc, &vector).unwrap();
    store
        .complete(&mnemora::store::INDEX_MACHINE, doc, ts)
        .unwrap();
    nid
}

fn fixture() -> (tempfile::TempDir, Fixture) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open_in_memory().unwrap());
    let index = VectorIndexService::load(
        dir.path().join("vector_index.bin"),
        Arc::clone(&store),
        VectorIndexConfig::default(),
        2,
    )
    .unwrap();

    // The worked example: N1{imp 5, d 0.10}, N2{imp 9, d 0.20},
    // N3{imp 5, d 0.50, issue}.
    let n1 = seed_scored_node(&store, &index, 1_000, 5, 0.10, false);
    let n2 = seed_scored_node(&store, &index, 2_000, 9, 0.20, false);
    let n3 = seed_scored_node(&store, &index, 3_000, 5, 0.50, true);

    let pipeline = SearchPipeline::new(
        Arc::clone(&store),
        index,
        Arc::new(AiRuntime::new(&AiRuntimeConfig::default())),
        Arc::new(AiTelemetry::new(16)),
        None,
        Some(Arc::new(OriginEmbedding)),
        SearchConfig::default(),
        EmbeddingConfig {
            dimensions: 2,
            ..EmbeddingConfig::default()
        },
        120_000,
        0,
    );
    (
        dir,
        Fixture {
            store,
            pipeline,
            node_ids: vec![n1, n2, n3],
        },
    )
}

#[test]
fn issue_boost_then_importance_discounted_distance() {
    let (_dir, fx) = fixture();
    let result = fx
        .pipeline
        .search("unrelated query words", None, CancelToken::new())
        .unwrap();

    // All three are non-event kinds, so they land in `nodes`.
    let order: Vec<i64> = result.nodes.iter().map(|node| node.id).collect();
    let (n1, n2, n3) = (fx.node_ids[0], fx.node_ids[1], fx.node_ids[2]);
    assert_eq!(order, vec![n3, n2, n1]);
    assert!(result.related_events.is_empty());
    // Evidence covers the result set, newest capture first.
    assert_eq!(result.evidence.len(), 3);
    assert!(result.evidence[0].ts >= result.evidence[2].ts);
}

#[test]
fn cancelled_search_changes_no_state() {
    let (_dir, fx) = fixture();
    let cancel = CancelToken::new();
    cancel.cancel();
    let err = fx
        .pipeline
        .search("query", None, cancel)
        .unwrap_err();
    assert!(matches!(err, MnemoraError::Cancelled));

    // No vector document or node changed state as a result.
    for doc_id in 1..=3 {
        let doc = fx.store.get_vector_document(doc_id).unwrap().unwrap();
        assert_eq!(doc.index_status, mnemora::types::StageStatus::Succeeded);
    }
    for &node_id in &fx.node_ids {
        assert!(fx.store.get_node(node_id).unwrap().is_some());
    }
}

#[test]
fn keyword_hits_outrank_semantic_distance() {
    let (_dir, fx) = fixture();
    // "workspace" appears in every title; keyword hits carry score zero,
    // which beats any nonzero semantic distance at equal boosts, and the
    // issue node still leads.
    let result = fx
        .pipeline
        .search("workspace", None, CancelToken::new())
        .unwrap();
    let order: Vec<i64> = result.nodes.iter().map(|node| node.id).collect();
    let n3 = fx.node_ids[2];
    assert_eq!(order[0], n3);
    assert_eq!(order.len(), 3);
}
