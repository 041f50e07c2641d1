//! Vector-document row operations.

use rusqlite::{params, OptionalExtension, Row};
use rustc_hash::FxHashMap;
use tracing::info;

use super::Store;
use crate::error::Result;
use crate::types::{NodeId, StageStatus, VectorDocId, VectorDocument};

const DOC_COLUMNS: &str = "id, ref_id, embedding, embedding_status, embedding_attempts, \
     embedding_next_run_at, index_status, index_attempts, index_next_run_at, updated_at";

fn row_to_doc(row: &Row<'_>) -> rusqlite::Result<VectorDocument> {
    let embedding_raw: String = row.get(3)?;
    let index_raw: String = row.get(6)?;
    Ok(VectorDocument {
        id: row.get(0)?,
        ref_id: row.get(1)?,
        embedding: row.get(2)?,
        embedding_status: StageStatus::parse(&embedding_raw).unwrap_or(StageStatus::Pending),
        embedding_attempts: row.get(4)?,
        embedding_next_run_at: row.get(5)?,
        index_status: StageStatus::parse(&index_raw).unwrap_or(StageStatus::Pending),
        index_attempts: row.get(7)?,
        index_next_run_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

impl Store {
    /// Creates the companion vector document for a node; idempotent.
    pub fn insert_vector_document(&self, ref_id: NodeId, now_ms: i64) -> Result<VectorDocId> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO vector_documents (ref_id, embedding_status, index_status, updated_at) \
                 VALUES (?1, 'pending', 'pending', ?2) ON CONFLICT(ref_id) DO NOTHING",
                params![ref_id, now_ms],
            )?;
            let id = conn.query_row(
                "SELECT id FROM vector_documents WHERE ref_id = ?1",
                params![ref_id],
                |row| row.get(0),
            )?;
            Ok(id)
        })
    }

    /// Loads one vector document.
    pub fn get_vector_document(&self, id: VectorDocId) -> Result<Option<VectorDocument>> {
        let sql = format!("SELECT {DOC_COLUMNS} FROM vector_documents WHERE id = ?1");
        self.with_conn(|conn| {
            let row = conn.query_row(&sql, params![id], row_to_doc).optional()?;
            Ok(row)
        })
    }

    /// Stores a fresh embedding and re-arms the index machine.
    ///
    /// A previously-indexed document gets reindexed after re-embedding, so
    /// index status and attempts reset unconditionally.
    pub fn store_embedding(&self, id: VectorDocId, blob: &[u8], now_ms: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE vector_documents SET embedding = ?2, embedding_status = 'succeeded', \
                 embedding_next_run_at = NULL, index_status = 'pending', index_attempts = 0, \
                 index_next_run_at = NULL, updated_at = ?3 WHERE id = ?1",
                params![id, blob, now_ms],
            )?;
            Ok(())
        })
    }

    /// Any one stored embedding blob, used for dimension self-detection.
    pub fn any_embedding_blob(&self) -> Result<Option<Vec<u8>>> {
        self.with_conn(|conn| {
            let blob = conn
                .query_row(
                    "SELECT embedding FROM vector_documents \
                     WHERE embedding IS NOT NULL ORDER BY id ASC LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(blob)
        })
    }

    /// Documents ready for (re)insertion into the vector index.
    pub fn indexable_documents(&self) -> Result<Vec<(VectorDocId, Vec<u8>)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, embedding FROM vector_documents \
                 WHERE embedding_status = 'succeeded' AND embedding IS NOT NULL ORDER BY id ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// The node ids behind a set of vector documents.
    pub fn ref_ids_for_documents(
        &self,
        ids: &[VectorDocId],
    ) -> Result<FxHashMap<VectorDocId, NodeId>> {
        if ids.is_empty() {
            return Ok(FxHashMap::default());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("SELECT id, ref_id FROM vector_documents WHERE id IN ({placeholders})");
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(ids.iter()), |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?;
            let mut out = FxHashMap::default();
            for row in rows {
                let (id, ref_id) = row?;
                out.insert(id, ref_id);
            }
            Ok(out)
        })
    }

    /// Dimension migration cascade: every document re-embeds from scratch.
    pub fn reset_documents_for_dimension_migration(&self, now_ms: i64) -> Result<usize> {
        self.with_conn(|conn| {
            let reset = conn.execute(
                "UPDATE vector_documents SET embedding = NULL, \
                 embedding_status = 'pending', embedding_attempts = 0, \
                 embedding_next_run_at = NULL, index_status = 'pending', index_attempts = 0, \
                 index_next_run_at = NULL, updated_at = ?1",
                params![now_ms],
            )?;
            info!(reset, "store.vector_documents.dimension_reset");
            Ok(reset)
        })
    }

    /// Index rebuild cascade: indexed documents queue for re-insertion,
    /// keeping their embeddings.
    pub fn reset_indexed_documents(&self, now_ms: i64) -> Result<usize> {
        self.with_conn(|conn| {
            let reset = conn.execute(
                "UPDATE vector_documents SET index_status = 'pending', index_attempts = 0, \
                 index_next_run_at = NULL, updated_at = ?1 WHERE index_status = 'succeeded'",
                params![now_ms],
            )?;
            info!(reset, "store.vector_documents.index_reset");
            Ok(reset)
        })
    }

    /// Count of documents whose given stage is in the given status.
    pub fn count_documents_in_stage(&self, stage_column: &str, status: &str) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM vector_documents WHERE {stage_column} = ?1");
        self.with_conn(|conn| {
            let count = conn.query_row(&sql, params![status], |row| row.get(0))?;
            Ok(count)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewContextNode, NewScreenshot, EMBEDDING_MACHINE, INDEX_MACHINE};
    use crate::types::{encode_embedding, NodeKind, SourceKey};

    fn store_with_doc() -> (Store, VectorDocId) {
        let store = Store::open_in_memory().unwrap();
        let sid = store
            .insert_screenshot(&NewScreenshot::for_test(SourceKey::screen("1"), 1_000), 1_000)
            .unwrap();
        let batch = store
            .create_and_persist_batch(&SourceKey::screen("1"), &[sid], 1_000)
            .unwrap();
        let nid = store
            .upsert_node(
                &NewContextNode {
                    batch_id: batch.batch.id,
                    screenshot_id: sid,
                    kind: NodeKind::Event,
                    title: "t".into(),
                    summary: "s".into(),
                    app_context: String::new(),
                    knowledge: None,
                    state_snapshot: None,
                    ui_text_snippets: vec![],
                    keywords: vec![],
                    entities: vec![],
                    importance: 5,
                    confidence: 5,
                    event_time: 1_000,
                },
                1_000,
            )
            .unwrap();
        let doc = store.insert_vector_document(nid, 1_000).unwrap();
        (store, doc)
    }

    #[test]
    fn insert_is_idempotent_per_node() {
        let (store, doc) = store_with_doc();
        let doc2 = store.insert_vector_document(1, 2_000).unwrap();
        assert_eq!(doc, doc2);
    }

    #[test]
    fn index_stage_waits_for_embedding() {
        let (store, doc) = store_with_doc();
        // Nothing indexable while the embedding is pending.
        assert!(store
            .fetch_claimable(&INDEX_MACHINE, 2, 2_000, 10)
            .unwrap()
            .is_empty());
        assert!(!store.try_claim(&INDEX_MACHINE, doc, 2, 2_000).unwrap());

        assert!(store.try_claim(&EMBEDDING_MACHINE, doc, 2, 2_000).unwrap());
        store
            .store_embedding(doc, &encode_embedding(&[1.0, 2.0]), 2_500)
            .unwrap();
        store.complete(&EMBEDDING_MACHINE, doc, 2_500).unwrap();

        let claimable = store.fetch_claimable(&INDEX_MACHINE, 2, 3_000, 10).unwrap();
        assert_eq!(claimable.len(), 1);
        assert!(store.try_claim(&INDEX_MACHINE, doc, 2, 3_000).unwrap());
    }

    #[test]
    fn re_embedding_rearms_the_index_machine() {
        let (store, doc) = store_with_doc();
        store
            .store_embedding(doc, &encode_embedding(&[1.0]), 2_000)
            .unwrap();
        store.complete(&INDEX_MACHINE, doc, 2_100).unwrap();
        let loaded = store.get_vector_document(doc).unwrap().unwrap();
        assert_eq!(loaded.index_status, StageStatus::Succeeded);

        store
            .store_embedding(doc, &encode_embedding(&[2.0]), 3_000)
            .unwrap();
        let loaded = store.get_vector_document(doc).unwrap().unwrap();
        assert_eq!(loaded.index_status, StageStatus::Pending);
        assert_eq!(loaded.index_attempts, 0);
    }

    #[test]
    fn dimension_reset_clears_everything() {
        let (store, doc) = store_with_doc();
        store
            .store_embedding(doc, &encode_embedding(&[1.0]), 2_000)
            .unwrap();
        let reset = store.reset_documents_for_dimension_migration(3_000).unwrap();
        assert_eq!(reset, 1);
        let loaded = store.get_vector_document(doc).unwrap().unwrap();
        assert!(loaded.embedding.is_none());
        assert_eq!(loaded.embedding_status, StageStatus::Pending);
        assert_eq!(loaded.index_status, StageStatus::Pending);
    }
}
