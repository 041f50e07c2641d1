//! Vector index lifecycle service.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use super::hnsw::{HnswGraph, Neighbor};
use crate::config::VectorIndexConfig;
use crate::error::{MnemoraError, Result};
use crate::store::Store;
use crate::types::{decode_embedding, now_ms, VectorDocId};

/// Result of one upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The vector entered the index.
    Applied,
    /// The embedding dimension changed; the index was recreated and every
    /// vector document was reset to re-embed. The caller's row will come
    /// back around naturally.
    DimensionMigrated {
        /// The new index dimension.
        new_dim: usize,
    },
}

/// Point-in-time index summary for health and stats.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct VectorIndexStats {
    /// Live vectors.
    pub live_vectors: usize,
    /// Detected dimension.
    pub dimensions: usize,
    /// Current admission cap.
    pub max_elements: usize,
    /// Whether unflushed changes exist.
    pub dirty: bool,
}

struct ServiceState {
    graph: HnswGraph,
    dirty: bool,
}

/// Owns the single HNSW graph persisted at `<data>/vector_index.bin`.
pub struct VectorIndexService {
    state: Mutex<ServiceState>,
    path: PathBuf,
    config: VectorIndexConfig,
    store: Arc<Store>,
    flush_tx: Mutex<Option<Sender<()>>>,
}

impl VectorIndexService {
    /// Loads (or freshly creates) the index.
    ///
    /// The dimension is detected from the first stored embedding, falling
    /// back to `default_dims`. A loaded index that is undersized for the
    /// current document count is resized; an unreadable file is replaced
    /// with a fresh index and all indexed rows are reset to rebuild.
    pub fn load(
        path: impl AsRef<Path>,
        store: Arc<Store>,
        config: VectorIndexConfig,
        default_dims: usize,
    ) -> Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        let detected_dims = match store.any_embedding_blob()? {
            Some(blob) => match decode_embedding(&blob) {
                Ok(vector) if !vector.is_empty() => vector.len(),
                _ => default_dims,
            },
            None => default_dims,
        };
        let doc_count = store.count_documents_in_stage("embedding_status", "succeeded")? as usize;
        let wanted_capacity = doc_count + config.capacity_headroom;

        let graph = if path.exists() {
            match fs::read(&path).map_err(MnemoraError::from).and_then(|bytes| {
                HnswGraph::decode(&bytes)
            }) {
                Ok(mut graph) if graph.dims() == detected_dims => {
                    if graph.max_elements() < wanted_capacity {
                        graph.resize(wanted_capacity);
                    }
                    info!(
                        live = graph.len(),
                        dims = graph.dims(),
                        "vector.index.loaded"
                    );
                    graph
                }
                Ok(graph) => {
                    warn!(
                        file_dims = graph.dims(),
                        detected_dims, "vector.index.dimension_stale_rebuild"
                    );
                    store.reset_indexed_documents(now_ms())?;
                    Self::fresh_graph(&config, detected_dims, wanted_capacity)
                }
                Err(err) => {
                    warn!(%err, "vector.index.load_failed_rebuild");
                    store.reset_indexed_documents(now_ms())?;
                    Self::fresh_graph(&config, detected_dims, wanted_capacity)
                }
            }
        } else {
            Self::fresh_graph(&config, detected_dims, wanted_capacity)
        };

        let service = Arc::new(Self {
            state: Mutex::new(ServiceState {
                graph,
                dirty: false,
            }),
            path,
            config,
            store,
            flush_tx: Mutex::new(None),
        });
        service.spawn_flusher();
        Ok(service)
    }

    fn fresh_graph(config: &VectorIndexConfig, dims: usize, capacity: usize) -> HnswGraph {
        HnswGraph::new(
            dims,
            capacity.max(config.capacity_headroom),
            config.max_connections,
            config.ef_construction,
        )
    }

    /// Spawns the debounced flush worker. Requests arriving while a
    /// debounce window is open coalesce into a single write.
    fn spawn_flusher(self: &Arc<Self>) {
        let (tx, rx) = mpsc::channel::<()>();
        *self.flush_tx.lock() = Some(tx);
        let service = Arc::downgrade(self);
        let debounce = Duration::from_millis(self.config.flush_debounce_ms);
        thread::Builder::new()
            .name("vector-flush".into())
            .spawn(move || loop {
                match rx.recv() {
                    Ok(()) => {
                        // Coalesce within the debounce window.
                        loop {
                            match rx.recv_timeout(debounce) {
                                Ok(()) => continue,
                                Err(RecvTimeoutError::Timeout) => break,
                                Err(RecvTimeoutError::Disconnected) => break,
                            }
                        }
                        let Some(service) = service.upgrade() else {
                            return;
                        };
                        if let Err(err) = service.flush_now() {
                            warn!(%err, "vector.flush.failed");
                        }
                    }
                    Err(_) => return,
                }
            })
            .map(|_| ())
            .unwrap_or_else(|err| warn!(%err, "vector.flush.spawn_failed"));
    }

    /// Inserts or replaces one document vector.
    ///
    /// A dimension change triggers the migration cascade instead of an
    /// error: fresh index at the new dimension, all documents reset.
    pub fn upsert(&self, doc_id: VectorDocId, vector: &[f32]) -> Result<UpsertOutcome> {
        let mut state = self.state.lock();
        if vector.len() != state.graph.dims() {
            let new_dim = vector.len();
            warn!(
                old_dim = state.graph.dims(),
                new_dim, "vector.index.dimension_migration"
            );
            let capacity = self.config.capacity_headroom;
            state.graph = Self::fresh_graph(&self.config, new_dim, capacity);
            state.dirty = true;
            drop(state);
            self.store.reset_documents_for_dimension_migration(now_ms())?;
            self.request_flush();
            return Ok(UpsertOutcome::DimensionMigrated { new_dim });
        }

        if state.graph.len() >= state.graph.max_elements() {
            let grown = state.graph.len() + self.config.capacity_headroom;
            state.graph.resize(grown);
            info!(max_elements = grown, "vector.index.resized");
        }
        state.graph.insert(doc_id, vector)?;
        state.dirty = true;
        Ok(UpsertOutcome::Applied)
    }

    /// Requests a debounced flush.
    pub fn request_flush(&self) {
        if let Some(tx) = self.flush_tx.lock().as_ref() {
            let _ = tx.send(());
        }
    }

    /// Writes the index to disk immediately (write-temp-then-rename).
    pub fn flush_now(&self) -> Result<()> {
        let bytes = {
            let mut state = self.state.lock();
            if !state.dirty {
                return Ok(());
            }
            state.dirty = false;
            state.graph.encode()
        };
        let dir = self
            .path
            .parent()
            .ok_or_else(|| MnemoraError::InvalidArgument("index path has no parent".into()))?;
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.persist(&self.path)
            .map_err(|err| MnemoraError::Io(err.error))?;
        info!(bytes = bytes.len(), path = %self.path.display(), "vector.flush.completed");
        Ok(())
    }

    /// The `top_k` nearest documents, or empty when the index is empty or
    /// the query dimension mismatches (degraded, not fatal).
    pub fn search_knn(&self, query: &[f32], top_k: usize) -> Vec<Neighbor> {
        let state = self.state.lock();
        if state.graph.is_empty() {
            return Vec::new();
        }
        if query.len() != state.graph.dims() {
            warn!(
                query_dims = query.len(),
                index_dims = state.graph.dims(),
                "vector.search.dimension_mismatch"
            );
            return Vec::new();
        }
        match state.graph.search(query, top_k, self.config.ef_search) {
            Ok(hits) => hits,
            Err(err) => {
                warn!(%err, "vector.search.failed");
                Vec::new()
            }
        }
    }

    /// Rebuilds the index from stored embeddings, reporting progress.
    ///
    /// Returns the number of vectors inserted. Used by the admin reindex
    /// path; rows whose embedding dimension disagrees with the detected
    /// dimension are skipped with a warning.
    pub fn rebuild_from_store(&self, mut progress: impl FnMut(usize, usize)) -> Result<usize> {
        let docs = self.store.indexable_documents()?;
        let total = docs.len();
        let mut inserted = 0usize;
        {
            let mut state = self.state.lock();
            let dims = state.graph.dims();
            state.graph = Self::fresh_graph(
                &self.config,
                dims,
                total + self.config.capacity_headroom,
            );
            for (i, (doc_id, blob)) in docs.into_iter().enumerate() {
                match decode_embedding(&blob) {
                    Ok(vector) if vector.len() == dims => {
                        state.graph.insert(doc_id, &vector)?;
                        inserted += 1;
                    }
                    Ok(vector) => {
                        warn!(
                            doc_id,
                            dims = vector.len(),
                            expected = dims,
                            "vector.rebuild.dimension_skip"
                        );
                    }
                    Err(err) => {
                        warn!(doc_id, %err, "vector.rebuild.damaged_skip");
                    }
                }
                progress(i + 1, total);
            }
            state.dirty = true;
        }
        self.flush_now()?;
        info!(inserted, total, "vector.rebuild.completed");
        Ok(inserted)
    }

    /// Point-in-time summary.
    pub fn stats(&self) -> VectorIndexStats {
        let state = self.state.lock();
        VectorIndexStats {
            live_vectors: state.graph.len(),
            dimensions: state.graph.dims(),
            max_elements: state.graph.max_elements(),
            dirty: state.dirty,
        }
    }
}
