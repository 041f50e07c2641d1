//! VLM batch analysis scheduler.
//!
//! Claims pending batches, submits their screenshots to the vision-language
//! client, and upserts the validated, normalized context nodes. Each new
//! node gets a companion vector document; nodes whose payload requests OCR
//! are handed to the OCR scheduler.

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use base64::Engine as _;
use tracing::{debug, warn};

use super::core::{CycleOutcome, SchedulerJob};
use super::lanes::{split_lanes, LaneConfig};
use super::ocr::{OcrScheduler, OcrTask};
use super::run_bounded;
use crate::ai::{
    AiCallRecord, AiRuntime, AiTelemetry, CallOptions, Capability, VlmClient, VlmImagePayload,
    VlmNodeOutput, VlmRequest,
};
use crate::bus::{Event, EventBus};
use crate::config::{SchedulerConfig, VlmConfig};
use crate::error::{MnemoraError, Result};
use crate::store::{NewContextNode, Store, BATCH_VLM_MACHINE};
use crate::types::{now_ms, BatchDbId, NodeKind, Screenshot};

const FETCH_LIMIT: usize = 32;

/// Scheduler driving the `batches.vlm_status` machine.
pub struct VlmScheduler {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    runtime: Arc<AiRuntime>,
    telemetry: Arc<AiTelemetry>,
    client: Option<Arc<dyn VlmClient>>,
    ocr: Arc<OcrScheduler>,
    sched_cfg: SchedulerConfig,
    vlm_cfg: VlmConfig,
    ocr_languages: String,
}

impl VlmScheduler {
    /// Builds the scheduler. A missing client leaves batches pending
    /// rather than burning their attempts.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        runtime: Arc<AiRuntime>,
        telemetry: Arc<AiTelemetry>,
        client: Option<Arc<dyn VlmClient>>,
        ocr: Arc<OcrScheduler>,
        sched_cfg: SchedulerConfig,
        vlm_cfg: VlmConfig,
        ocr_languages: String,
    ) -> Self {
        Self {
            store,
            bus,
            runtime,
            telemetry,
            client,
            ocr,
            sched_cfg,
            vlm_cfg,
            ocr_languages,
        }
    }

    fn lane_config(&self) -> LaneConfig {
        LaneConfig {
            recovery_age_ms: self.sched_cfg.lane_recovery_age_ms,
            weight_realtime: self.sched_cfg.lane_weight_realtime,
            weight_recovery: self.sched_cfg.lane_weight_recovery,
        }
    }

    fn process_batch(&self, batch_id: BatchDbId, client: &Arc<dyn VlmClient>) -> Result<()> {
        let batch = self
            .store
            .get_batch(batch_id)?
            .ok_or(MnemoraError::NotFound("batch"))?;
        let screenshots = self.store.screenshots_by_ids(&batch.screenshot_ids)?;
        if screenshots.is_empty() {
            return Err(MnemoraError::InvalidArgument(
                "batch has no loadable screenshots".into(),
            ));
        }

        let mut images = Vec::with_capacity(screenshots.len());
        for (index, shot) in screenshots.iter().enumerate() {
            let path = shot
                .file_path
                .as_ref()
                .ok_or(MnemoraError::NotFound("screenshot file"))?;
            let bytes = fs::read(path)?;
            images.push(VlmImagePayload {
                index,
                screenshot_id: shot.id,
                captured_at: shot.ts,
                source_key: shot.source_key.as_str().to_string(),
                app_hint: shot.app_hint.clone(),
                window_title: shot.window_title.clone(),
                image_base64: base64::engine::general_purpose::STANDARD.encode(&bytes),
            });
        }
        let request = VlmRequest {
            model: self.vlm_cfg.model.clone(),
            images,
        };

        let permit = self.runtime.acquire(Capability::Vlm)?;
        let opts = CallOptions::with_timeout(self.vlm_cfg.timeout_ms);
        let started = Instant::now();
        let call_ts = now_ms();
        let result = client.analyze_batch(&request, &opts);
        drop(permit);
        let duration_ms = started.elapsed().as_millis() as u64;

        let output = match result {
            Ok((output, usage)) => {
                self.runtime.record_success(Capability::Vlm);
                self.telemetry.record(
                    Capability::Vlm,
                    AiCallRecord {
                        ts: call_ts,
                        capability: "vlm",
                        operation: "analyze_batch",
                        status: "ok",
                        model: self.vlm_cfg.model.clone(),
                        duration_ms,
                        total_tokens: usage.total_tokens,
                        preview: output.nodes.first().map(|n| n.title.clone()),
                    },
                );
                output
            }
            Err(err) => {
                self.runtime
                    .record_failure(Capability::Vlm, err.is_transient());
                self.telemetry.record(
                    Capability::Vlm,
                    AiCallRecord {
                        ts: call_ts,
                        capability: "vlm",
                        operation: "analyze_batch",
                        status: if err.is_cancelled() { "cancelled" } else { "error" },
                        model: self.vlm_cfg.model.clone(),
                        duration_ms,
                        total_tokens: None,
                        preview: Some(err.to_string()),
                    },
                );
                return Err(err);
            }
        };

        // Exactly one node per screenshot: anything else is a schema-level
        // violation of the batch contract.
        if output.nodes.len() != screenshots.len() {
            return Err(MnemoraError::InvalidAiOutput(format!(
                "expected {} nodes, got {}",
                screenshots.len(),
                output.nodes.len()
            )));
        }
        let mut seen = vec![false; screenshots.len()];
        for node in &output.nodes {
            if node.screenshot_index >= screenshots.len() || seen[node.screenshot_index] {
                return Err(MnemoraError::InvalidAiOutput(format!(
                    "bad screenshot index {}",
                    node.screenshot_index
                )));
            }
            seen[node.screenshot_index] = true;
        }

        let now = now_ms();
        let mut node_ids = Vec::with_capacity(output.nodes.len());
        let mut ocr_requested = 0usize;
        for node_output in output.nodes {
            let shot = &screenshots[node_output.screenshot_index];
            let new_node = normalize_node(node_output, shot, &self.vlm_cfg);
            let node_id = self.store.upsert_node(&new_node, now)?;
            self.store.insert_vector_document(node_id, now)?;
            node_ids.push(node_id);

            if let Some(node) = self.store.get_node(node_id)? {
                if node.wants_ocr(&self.ocr_languages) {
                    ocr_requested += 1;
                    self.ocr.enqueue(OcrTask {
                        node_id,
                        screenshot_id: shot.id,
                    });
                }
            }
        }

        self.store.complete(&BATCH_VLM_MACHINE, batch_id, now)?;
        debug!(
            batch_id = %batch.batch_id,
            nodes = node_ids.len(),
            ocr_requested,
            "sched.vlm.batch_succeeded"
        );
        self.bus.publish(&Event::NodesCreated {
            node_ids,
            ocr_requested,
        });
        self.bus.publish(&Event::VectorDocumentsDirty);
        Ok(())
    }
}

/// Applies the output caps and derivations from the analysis contract.
fn normalize_node(output: VlmNodeOutput, shot: &Screenshot, cfg: &VlmConfig) -> NewContextNode {
    let mut keywords = output.keywords;
    keywords.truncate(cfg.max_keywords);
    let mut entities = output.entities;
    entities.truncate(cfg.max_entities);
    let mut ui_text_snippets = output.ui_text_snippets;
    ui_text_snippets.truncate(cfg.max_ui_snippets);

    let app_context = output
        .app_context
        .as_deref()
        .or(shot.app_hint.as_deref())
        .and_then(crate::types::apps::canonicalize_app_hint)
        .unwrap_or_default();

    let kind = NodeKind::derive(output.knowledge.as_ref(), output.state_snapshot.as_ref());
    NewContextNode {
        batch_id: shot.batch_id.unwrap_or_default(),
        screenshot_id: shot.id,
        kind,
        title: truncate_chars(&output.title, cfg.max_title_chars),
        summary: truncate_chars(&output.summary, cfg.max_summary_chars),
        app_context,
        knowledge: output.knowledge,
        state_snapshot: output.state_snapshot,
        ui_text_snippets,
        keywords,
        entities,
        importance: clamp_score(output.importance),
        confidence: clamp_score(output.confidence),
        event_time: shot.ts,
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

fn clamp_score(raw: f64) -> u8 {
    raw.round().clamp(0.0, 10.0) as u8
}

impl SchedulerJob for VlmScheduler {
    fn name(&self) -> &'static str {
        "vlm"
    }

    fn run_cycle(&self) -> Result<CycleOutcome> {
        let Some(client) = self.client.clone() else {
            return Ok(CycleOutcome::default());
        };
        let now = now_ms();
        self.store.sweep_stale_running(
            &BATCH_VLM_MACHINE,
            self.sched_cfg.stale_running_threshold_ms,
            now,
        )?;
        let candidates = self.store.fetch_claimable(
            &BATCH_VLM_MACHINE,
            self.sched_cfg.max_attempts,
            now,
            FETCH_LIMIT,
        )?;
        if candidates.is_empty() {
            return Ok(CycleOutcome::default());
        }
        let ordered = split_lanes(candidates, now, self.lane_config());
        let concurrency = self.runtime.limit(Capability::Vlm);

        let worked = AtomicUsize::new(0);
        run_bounded(ordered, concurrency, |candidate| {
            let claim = self.store.try_claim(
                &BATCH_VLM_MACHINE,
                candidate.id,
                self.sched_cfg.max_attempts,
                now_ms(),
            );
            match claim {
                Ok(true) => {}
                Ok(false) => return,
                Err(err) => {
                    warn!(batch = candidate.id, %err, "sched.vlm.claim_failed");
                    return;
                }
            }
            worked.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = self.process_batch(candidate.id, &client) {
                let finished = now_ms();
                let update = if err.is_cancelled() {
                    self.store
                        .release_claim(&BATCH_VLM_MACHINE, candidate.id, finished)
                } else {
                    warn!(batch = candidate.id, %err, "sched.vlm.batch_failed");
                    self.store.fail(
                        &BATCH_VLM_MACHINE,
                        candidate.id,
                        self.sched_cfg.max_attempts,
                        self.sched_cfg.retry_delay_ms,
                        finished,
                    )
                };
                if let Err(err) = update {
                    warn!(batch = candidate.id, %err, "sched.vlm.status_update_failed");
                }
            }
        });
        Ok(CycleOutcome {
            worked: worked.into_inner(),
        })
    }

    fn earliest_next_run(&self, now_ms: i64) -> Result<Option<i64>> {
        self.store
            .earliest_next_run(&BATCH_VLM_MACHINE, self.sched_cfg.max_attempts, now_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phash::PHash;
    use crate::types::{SourceKey, StorageState};

    fn shot(ts: i64) -> Screenshot {
        Screenshot {
            id: 1,
            source_key: SourceKey::screen("1"),
            ts,
            phash: PHash::from_bits(0),
            file_path: None,
            app_hint: Some("Visual Studio Code".into()),
            window_title: None,
            width: None,
            height: None,
            storage_state: StorageState::Persisted,
            retention_expires_at: None,
            batch_id: Some(9),
            created_at: ts,
            updated_at: ts,
        }
    }

    fn raw_node(index: usize) -> VlmNodeOutput {
        VlmNodeOutput {
            screenshot_index: index,
            title: "T".repeat(300),
            summary: "S".repeat(900),
            app_context: None,
            knowledge: None,
            state_snapshot: None,
            ui_text_snippets: (0..9).map(|i| format!("snippet {i}")).collect(),
            keywords: (0..9).map(|i| format!("kw{i}")).collect(),
            entities: vec![],
            importance: 14.0,
            confidence: -3.0,
        }
    }

    #[test]
    fn normalization_applies_caps_and_clamps() {
        let cfg = VlmConfig::default();
        let node = normalize_node(raw_node(0), &shot(5_000), &cfg);
        assert_eq!(node.title.chars().count(), 100);
        assert_eq!(node.summary.chars().count(), 500);
        assert_eq!(node.keywords.len(), 5);
        assert_eq!(node.ui_text_snippets.len(), 5);
        assert_eq!(node.importance, 10);
        assert_eq!(node.confidence, 0);
        assert_eq!(node.event_time, 5_000);
        // App hint canonicalized from the screenshot fallback.
        assert_eq!(node.app_context, "vscode");
        assert_eq!(node.kind, NodeKind::Event);
    }

    #[test]
    fn kind_derives_from_payloads() {
        let cfg = VlmConfig::default();
        let mut raw = raw_node(0);
        raw.knowledge = Some(crate::types::Knowledge {
            content: "c".into(),
            language: None,
            text_region: None,
            key_insights: vec![],
        });
        let node = normalize_node(raw, &shot(1), &cfg);
        assert_eq!(node.kind, NodeKind::Knowledge);
    }
}
