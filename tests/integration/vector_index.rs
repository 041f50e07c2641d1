#![allow(missing_docs)]

//! Dimension migration driven through the vector document scheduler.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mnemora::ai::{AiRuntime, AiTelemetry, AiUsage, CallOptions, EmbeddingClient};
use mnemora::config::{AiRuntimeConfig, EmbeddingConfig, SchedulerConfig, VectorIndexConfig};
use mnemora::error::Result;
use mnemora::sched::{SchedulerJob, VectorDocumentScheduler};
use mnemora::store::{NewContextNode, NewScreenshot, Store};
use mnemora::types::{NodeKind, SourceKey, StageStatus};
use mnemora::vector::VectorIndexService;

/// Returns embeddings at whatever dimension the switch currently says,
/// ignoring the requested dimension the way a misconfigured provider would.
struct SwitchableEmbedding {
    dims: Arc<AtomicUsize>,
}

impl EmbeddingClient for SwitchableEmbedding {
    fn embed(
        &self,
        text: &str,
        _dimensions: usize,
        _opts: &CallOptions,
    ) -> Result<(Vec<f32>, AiUsage)> {
        let dims = self.dims.load(Ordering::SeqCst);
        let mut out = vec![0.0f32; dims];
        for (i, byte) in text.bytes().enumerate() {
            out[i % dims] += f32::from(byte) / 255.0;
        }
        Ok((out, AiUsage::default()))
    }
}

fn seed_node(store: &Store, ts: i64, title: &str) -> i64 {
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
                kind: NodeKind::Knowledge,
                title: title.into(),
                summary: "summary text".into(),
                app_context: "vscode".into(),
                knowledge: None,
                state_snapshot: None,
                ui_text_snippets: vec![],
                keywords: vec![],
                entities: vec![],
                importance: 5,
                confidence: 5,
                event_time: ts,
            },
            ts,
        )
        .unwrap();
    store.insert_vector_document(nid, ts).unwrap();
    nid
}

#[test]
fn dimension_change_cascades_and_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open_in_memory().unwrap());
    let mut index_cfg = VectorIndexConfig::default();
    index_cfg.capacity_headroom = 16;
    let index = VectorIndexService::load(
        dir.path().join("vector_index.bin"),
        Arc::clone(&store),
        index_cfg,
        4,
    )
    .unwrap();

    let dims = Arc::new(AtomicUsize::new(4));
    let mut embedding_cfg = EmbeddingConfig::default();
    embedding_cfg.dimensions = 4;
    let scheduler = VectorDocumentScheduler::new(
        Arc::clone(&store),
        Arc::new(AiRuntime::new(&AiRuntimeConfig::default())),
        Arc::new(AiTelemetry::new(16)),
        Some(Arc::new(SwitchableEmbedding {
            dims: Arc::clone(&dims),
        })),
        Arc::clone(&index),
        SchedulerConfig {
            retry_delay_ms: 0,
            ..SchedulerConfig::default()
        },
        embedding_cfg,
    );

    // First document embeds and indexes at 4 dims.
    let first = seed_node(&store, 1_000, "first node");
    scheduler.run_cycle().unwrap();
    assert_eq!(index.stats().dimensions, 4);
    assert_eq!(index.stats().live_vectors, 1);

    // The provider starts returning 2-dim vectors. The next document's
    // index step detects the mismatch, recreates the index at 2 dims, and
    // resets every vector document for re-embedding.
    dims.store(2, Ordering::SeqCst);
    let second = seed_node(&store, 2_000, "second node");
    scheduler.run_cycle().unwrap();
    assert_eq!(index.stats().dimensions, 2);

    // The cascade reset both documents: embeddings cleared, both state
    // machines back at pending.
    for doc_id in [1, 2] {
        let doc = store.get_vector_document(doc_id).unwrap().unwrap();
        assert!(doc.embedding.is_none());
        assert_eq!(doc.embedding_status, StageStatus::Pending);
        assert_eq!(doc.index_status, StageStatus::Pending);
    }

    // Following cycles re-embed everything at the new dimension and the
    // index converges to both documents.
    for _ in 0..4 {
        scheduler.run_cycle().unwrap();
    }
    assert_eq!(index.stats().dimensions, 2);
    assert_eq!(index.stats().live_vectors, 2);

    // Search succeeds on the new dimension and both nodes resolve.
    let hits = index.search_knn(&[0.5, 0.5], 10);
    assert_eq!(hits.len(), 2);
    let doc_ids: Vec<i64> = hits.iter().map(|hit| hit.id).collect();
    let refs = store.ref_ids_for_documents(&doc_ids).unwrap();
    let mut nodes: Vec<i64> = refs.values().copied().collect();
    nodes.sort_unstable();
    assert_eq!(nodes, vec![first, second]);
}

#[test]
fn p7_indexed_documents_are_bit_equal_with_the_index() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open_in_memory().unwrap());
    let index = VectorIndexService::load(
        dir.path().join("vector_index.bin"),
        Arc::clone(&store),
        VectorIndexConfig::default(),
        4,
    )
    .unwrap();
    let dims = Arc::new(AtomicUsize::new(4));
    let scheduler = VectorDocumentScheduler::new(
        Arc::clone(&store),
        Arc::new(AiRuntime::new(&AiRuntimeConfig::default())),
        Arc::new(AiTelemetry::new(16)),
        Some(Arc::new(SwitchableEmbedding { dims })),
        Arc::clone(&index),
        SchedulerConfig::default(),
        EmbeddingConfig {
            dimensions: 4,
            ..EmbeddingConfig::default()
        },
    );

    seed_node(&store, 1_000, "alpha");
    seed_node(&store, 2_000, "beta");
    scheduler.run_cycle().unwrap();

    // For every indexStatus=succeeded row, the exact stored vector must be
    // retrievable at distance zero.
    for (doc_id, blob) in store.indexable_documents().unwrap() {
        let doc = store.get_vector_document(doc_id).unwrap().unwrap();
        assert_eq!(doc.index_status, StageStatus::Succeeded);
        let vector = mnemora::types::decode_embedding(&blob).unwrap();
        let hits = index.search_knn(&vector, 1);
        assert_eq!(hits[0].id, doc_id);
        assert!(hits[0].distance < 1e-6);
    }
}
