//! Vector document scheduler: embedding, then index insertion.
//!
//! Each row carries two independent state machines. The embedding subtask
//! calls the embedding client and stores raw little-endian f32 bytes; the
//! index subtask feeds stored embeddings into the vector index. Both run in
//! one cycle, embedding first, so fresh embeddings usually index in the
//! same cycle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::core::{CycleOutcome, SchedulerJob};
use super::lanes::{split_lanes, LaneConfig};
use super::run_bounded;
use crate::ai::{AiCallRecord, AiRuntime, AiTelemetry, CallOptions, Capability, EmbeddingClient};
use crate::config::{EmbeddingConfig, SchedulerConfig};
use crate::error::{MnemoraError, Result};
use crate::store::{MachineSpec, Store, EMBEDDING_MACHINE, INDEX_MACHINE};
use crate::types::{decode_embedding, encode_embedding, now_ms, VectorDocId};
use crate::vector::{UpsertOutcome, VectorIndexService};

const FETCH_LIMIT: usize = 32;
const INDEX_CONCURRENCY: usize = 10;

/// Scheduler driving both vector-document state machines.
pub struct VectorDocumentScheduler {
    store: Arc<Store>,
    runtime: Arc<AiRuntime>,
    telemetry: Arc<AiTelemetry>,
    client: Option<Arc<dyn EmbeddingClient>>,
    index: Arc<VectorIndexService>,
    sched_cfg: SchedulerConfig,
    embedding_cfg: EmbeddingConfig,
}

impl VectorDocumentScheduler {
    /// Builds the scheduler. Without an embedding client the embedding
    /// stage idles; stored embeddings still index.
    pub fn new(
        store: Arc<Store>,
        runtime: Arc<AiRuntime>,
        telemetry: Arc<AiTelemetry>,
        client: Option<Arc<dyn EmbeddingClient>>,
        index: Arc<VectorIndexService>,
        sched_cfg: SchedulerConfig,
        embedding_cfg: EmbeddingConfig,
    ) -> Self {
        Self {
            store,
            runtime,
            telemetry,
            client,
            index,
            sched_cfg,
            embedding_cfg,
        }
    }

    fn lane_config(&self) -> LaneConfig {
        LaneConfig {
            recovery_age_ms: self.sched_cfg.lane_recovery_age_ms,
            weight_realtime: self.sched_cfg.lane_weight_realtime,
            weight_recovery: self.sched_cfg.lane_weight_recovery,
        }
    }

    fn embed_document(
        &self,
        doc_id: VectorDocId,
        client: &Arc<dyn EmbeddingClient>,
    ) -> Result<()> {
        let doc = self
            .store
            .get_vector_document(doc_id)?
            .ok_or(MnemoraError::NotFound("vector document"))?;
        let node = self
            .store
            .get_node(doc.ref_id)?
            .ok_or(MnemoraError::NotFound("context node"))?;
        let text = node.embedding_text();
        if text.is_empty() {
            return Err(MnemoraError::InvalidArgument(
                "node has no embeddable text".into(),
            ));
        }

        let permit = self.runtime.acquire(Capability::Embedding)?;
        let opts = CallOptions::with_timeout(self.embedding_cfg.timeout_ms);
        let started = Instant::now();
        let call_ts = now_ms();
        let result = client.embed(&text, self.embedding_cfg.dimensions, &opts);
        drop(permit);
        let duration_ms = started.elapsed().as_millis() as u64;

        let embedding = match result {
            Ok((embedding, usage)) => {
                self.runtime.record_success(Capability::Embedding);
                self.telemetry.record(
                    Capability::Embedding,
                    AiCallRecord {
                        ts: call_ts,
                        capability: "embedding",
                        operation: "embed",
                        status: "ok",
                        model: self.embedding_cfg.model.clone(),
                        duration_ms,
                        total_tokens: usage.total_tokens,
                        preview: None,
                    },
                );
                embedding
            }
            Err(err) => {
                self.runtime
                    .record_failure(Capability::Embedding, err.is_transient());
                self.telemetry.record(
                    Capability::Embedding,
                    AiCallRecord {
                        ts: call_ts,
                        capability: "embedding",
                        operation: "embed",
                        status: if err.is_cancelled() { "cancelled" } else { "error" },
                        model: self.embedding_cfg.model.clone(),
                        duration_ms,
                        total_tokens: None,
                        preview: Some(err.to_string()),
                    },
                );
                return Err(err);
            }
        };
        if embedding.is_empty() {
            return Err(MnemoraError::InvalidAiOutput("empty embedding".into()));
        }

        // Storing also re-arms the index machine, so a re-embedded doc is
        // reindexed.
        self.store
            .store_embedding(doc_id, &encode_embedding(&embedding), now_ms())?;
        Ok(())
    }

    fn index_document(&self, doc_id: VectorDocId) -> Result<()> {
        let doc = self
            .store
            .get_vector_document(doc_id)?
            .ok_or(MnemoraError::NotFound("vector document"))?;
        let blob = doc
            .embedding
            .ok_or(MnemoraError::NotFound("embedding blob"))?;
        let vector = decode_embedding(&blob)?;
        match self.index.upsert(doc_id, &vector)? {
            UpsertOutcome::Applied => {
                self.index.request_flush();
                self.store.complete(&INDEX_MACHINE, doc_id, now_ms())?;
                Ok(())
            }
            UpsertOutcome::DimensionMigrated { new_dim } => {
                // The cascade reset already returned every row (this one
                // included) to pending; nothing further to record here.
                info!(new_dim, doc = doc_id, "sched.vector.dimension_migrated");
                Ok(())
            }
        }
    }

    fn run_stage(
        &self,
        machine: &MachineSpec,
        concurrency: usize,
        stage: &'static str,
        work: impl Fn(VectorDocId) -> Result<()> + Sync,
    ) -> Result<usize> {
        let now = now_ms();
        self.store
            .sweep_stale_running(machine, self.sched_cfg.stale_running_threshold_ms, now)?;
        let candidates =
            self.store
                .fetch_claimable(machine, self.sched_cfg.max_attempts, now, FETCH_LIMIT)?;
        if candidates.is_empty() {
            return Ok(0);
        }
        let ordered = split_lanes(candidates, now, self.lane_config());

        let worked = AtomicUsize::new(0);
        run_bounded(ordered, concurrency, |candidate| {
            let claim =
                self.store
                    .try_claim(machine, candidate.id, self.sched_cfg.max_attempts, now_ms());
            match claim {
                Ok(true) => {}
                Ok(false) => return,
                Err(err) => {
                    warn!(doc = candidate.id, stage, %err, "sched.vector.claim_failed");
                    return;
                }
            }
            worked.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = work(candidate.id) {
                let finished = now_ms();
                let update = if err.is_cancelled() {
                    self.store.release_claim(machine, candidate.id, finished)
                } else {
                    warn!(doc = candidate.id, stage, %err, "sched.vector.task_failed");
                    self.store.fail(
                        machine,
                        candidate.id,
                        self.sched_cfg.max_attempts,
                        self.sched_cfg.retry_delay_ms,
                        finished,
                    )
                };
                if let Err(err) = update {
                    warn!(doc = candidate.id, stage, %err, "sched.vector.status_update_failed");
                }
            }
        });
        Ok(worked.into_inner())
    }
}

impl SchedulerJob for VectorDocumentScheduler {
    fn name(&self) -> &'static str {
        "vector"
    }

    fn run_cycle(&self) -> Result<CycleOutcome> {
        let mut worked = 0usize;

        if let Some(client) = self.client.clone() {
            let concurrency = self
                .runtime
                .limit(Capability::Embedding)
                .min(self.embedding_cfg.max_concurrency);
            worked += self.run_stage(&EMBEDDING_MACHINE, concurrency, "embedding", |doc_id| {
                self.embed_document(doc_id, &client)
            })?;
        }

        worked += self.run_stage(&INDEX_MACHINE, INDEX_CONCURRENCY, "index", |doc_id| {
            self.index_document(doc_id)
        })?;

        if worked > 0 {
            debug!(worked, "sched.vector.cycle_complete");
        }
        Ok(CycleOutcome { worked })
    }

    fn earliest_next_run(&self, now_ms: i64) -> Result<Option<i64>> {
        let embedding =
            self.store
                .earliest_next_run(&EMBEDDING_MACHINE, self.sched_cfg.max_attempts, now_ms)?;
        let index =
            self.store
                .earliest_next_run(&INDEX_MACHINE, self.sched_cfg.max_attempts, now_ms)?;
        Ok(match (embedding, index) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        })
    }
}
