//! Hybrid search pipeline.
//!
//! Keyword (LIKE over node text plus the FTS index over OCR output),
//! semantic (vector index), and temporal candidate collection, merged into
//! one score map, filtered, expanded around the top pivots, ranked with
//! importance/issue/entity boosts, and optionally planned and answered by
//! the text model. Retrieval legs degrade independently: a failed or
//! unavailable leg shrinks recall, never the whole search.

mod rank;
mod synthesis;

pub use rank::{entity_boost, rank_candidates, RankedCandidate};

use std::sync::Arc;
use std::time::Instant;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ai::{
    AiCallRecord, AiRuntime, AiTelemetry, AnswerSynthesisRequest, CallOptions, CancelToken,
    Capability, CandidateEvent, EmbeddingClient, SearchAnswer, SearchPlanRequest, SearchQueryPlan,
    SynthesisNode, TextClient, TimeRange,
};
use crate::config::{EmbeddingConfig, SearchConfig};
use crate::error::Result;
use crate::store::{ScreenshotEvidence, Store};
use crate::types::{apps, now_ms, ContextNode, NodeId, NodeKind};
use crate::vector::VectorIndexService;

/// Caller-supplied search filters. The thread filter is never overridden
/// by the query planner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Restrict to an event-time range.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
    /// Restrict to one thread.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Entity filters, union-merged with planner extractions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<String>,
    /// Restrict to one application.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_hint: Option<String>,
}

/// The assembled search response.
#[derive(Debug, Clone)]
pub struct SearchResult {
    /// Non-event nodes, ranked.
    pub nodes: Vec<ContextNode>,
    /// Event-kind nodes, ranked.
    pub related_events: Vec<ContextNode>,
    /// Screenshot evidence backing the result set, newest first.
    pub evidence: Vec<ScreenshotEvidence>,
    /// The planner's output, when planning ran.
    pub query_plan: Option<SearchQueryPlan>,
    /// The synthesized answer, when synthesis ran.
    pub answer: Option<SearchAnswer>,
}

struct MergedFilters {
    time_range: Option<TimeRange>,
    time_range_from_plan: bool,
    thread_id: Option<String>,
    entities: Vec<String>,
    app_hint: Option<String>,
}

/// The search pipeline over the shared store and vector index.
pub struct SearchPipeline {
    store: Arc<Store>,
    index: Arc<VectorIndexService>,
    runtime: Arc<AiRuntime>,
    telemetry: Arc<AiTelemetry>,
    text: Option<Arc<dyn TextClient>>,
    embedding: Option<Arc<dyn EmbeddingClient>>,
    config: SearchConfig,
    embedding_cfg: EmbeddingConfig,
    text_timeout_ms: u64,
    tz_offset_minutes: i32,
}

impl SearchPipeline {
    /// Builds the pipeline. Either client may be absent; the pipeline
    /// degrades to the retrieval legs that remain.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        index: Arc<VectorIndexService>,
        runtime: Arc<AiRuntime>,
        telemetry: Arc<AiTelemetry>,
        text: Option<Arc<dyn TextClient>>,
        embedding: Option<Arc<dyn EmbeddingClient>>,
        config: SearchConfig,
        embedding_cfg: EmbeddingConfig,
        text_timeout_ms: u64,
        tz_offset_minutes: i32,
    ) -> Self {
        Self {
            store,
            index,
            runtime,
            telemetry,
            text,
            embedding,
            config,
            embedding_cfg,
            text_timeout_ms,
            tz_offset_minutes,
        }
    }

    /// Runs the full pipeline.
    pub fn search(
        &self,
        query: &str,
        filters: Option<SearchFilters>,
        cancel: CancelToken,
    ) -> Result<SearchResult> {
        let user_filters = filters.unwrap_or_default();
        cancel.check()?;

        // Step 1: optional query plan.
        let plan = self.plan_query(query, &cancel);
        cancel.check()?;

        // Step 2: filter merge.
        let merged = merge_filters(&user_filters, plan.as_ref(), self.config.min_plan_confidence);

        // Step 3: candidate collection into a min-merged score map.
        let mut nodes: FxHashMap<NodeId, ContextNode> = FxHashMap::default();
        let mut scores: FxHashMap<NodeId, f32> = FxHashMap::default();

        if merged.time_range_from_plan {
            if let Some(range) = merged.time_range {
                for node in self.store.nodes_in_range(
                    range.start,
                    range.end,
                    self.config.time_range_recall_limit,
                )? {
                    nodes.entry(node.id).or_insert(node);
                }
            }
        }
        cancel.check()?;

        for node in self.keyword_candidates(query, &merged)? {
            scores.entry(node.id).or_insert(0.0);
            nodes.entry(node.id).or_insert(node);
        }
        cancel.check()?;

        for (node, distance) in self.semantic_candidates(query, plan.as_ref(), &cancel) {
            scores
                .entry(node.id)
                .and_modify(|existing| *existing = existing.min(distance))
                .or_insert(distance);
            nodes.entry(node.id).or_insert(node);
        }
        cancel.check()?;

        // Filters apply to every candidate set.
        let filtered = self.apply_filters(nodes.into_values().collect(), &merged)?;
        let mut candidates: Vec<RankedCandidate> = filtered
            .into_iter()
            .map(|node| RankedCandidate {
                score: scores.get(&node.id).copied(),
                node,
            })
            .collect();

        // Step 4: neighbor expansion around the provisional top pivots.
        rank_candidates(&mut candidates, &merged.entities);
        let expansion = self.expand_neighbors(&candidates, &merged)?;
        let mut known: FxHashSet<NodeId> =
            candidates.iter().map(|candidate| candidate.node.id).collect();
        for node in expansion {
            if known.insert(node.id) {
                candidates.push(RankedCandidate { node, score: None });
            }
        }
        cancel.check()?;

        // Step 5: final ranking.
        rank_candidates(&mut candidates, &merged.entities);
        let ranked: Vec<ContextNode> = candidates.into_iter().map(|c| c.node).collect();

        // Step 6: evidence.
        let mut screenshot_ids: Vec<i64> = Vec::new();
        let mut seen_shots: FxHashSet<i64> = FxHashSet::default();
        for node in &ranked {
            if seen_shots.insert(node.screenshot_id) {
                screenshot_ids.push(node.screenshot_id);
            }
        }
        let evidence = self.store.evidence_for_screenshots(&screenshot_ids)?;

        // Step 7: UI partition.
        let (related_events, mut plain_nodes): (Vec<ContextNode>, Vec<ContextNode>) =
            ranked.iter().cloned().partition(|node| node.kind == NodeKind::Event);
        let kind_hint = plan
            .as_ref()
            .and_then(|plan| plan.kind_hint.as_deref())
            .and_then(NodeKind::parse);
        if let Some(kind) = kind_hint {
            let hinted: Vec<ContextNode> = plain_nodes
                .iter()
                .filter(|node| node.kind == kind)
                .cloned()
                .collect();
            if !hinted.is_empty() {
                plain_nodes = hinted;
            }
        }
        cancel.check()?;

        // Step 8: optional answer synthesis.
        let answer = self.synthesize(query, &ranked, &merged, kind_hint, &cancel);

        debug!(
            nodes = plain_nodes.len(),
            events = related_events.len(),
            evidence = evidence.len(),
            planned = plan.is_some(),
            answered = answer.is_some(),
            "search.completed"
        );
        Ok(SearchResult {
            nodes: plain_nodes,
            related_events,
            evidence,
            query_plan: plan,
            answer,
        })
    }

    fn plan_query(&self, query: &str, cancel: &CancelToken) -> Option<SearchQueryPlan> {
        let client = self.text.as_ref()?;
        let request = SearchPlanRequest {
            query: query.to_string(),
            now_ms: now_ms(),
            tz_offset_minutes: self.tz_offset_minutes,
        };
        let permit = match self.runtime.acquire(Capability::Text) {
            Ok(permit) => permit,
            Err(err) => {
                warn!(%err, "search.plan.unavailable");
                return None;
            }
        };
        let opts = CallOptions {
            timeout_ms: self.text_timeout_ms,
            cancel: cancel.clone(),
        };
        let started = Instant::now();
        let ts = now_ms();
        let result = client.plan_search(&request, &opts);
        drop(permit);
        let duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok((plan, usage)) => {
                self.runtime.record_success(Capability::Text);
                self.telemetry.record(
                    Capability::Text,
                    AiCallRecord {
                        ts,
                        capability: "text",
                        operation: "plan_search",
                        status: "ok",
                        model: String::new(),
                        duration_ms,
                        total_tokens: usage.total_tokens,
                        preview: Some(plan.embedding_text.clone()),
                    },
                );
                Some(plan)
            }
            Err(err) => {
                // Request-time boundary: a failed plan degrades this search
                // only and never feeds the breaker that gates background
                // analysis.
                self.runtime.record_failure(Capability::Text, false);
                self.telemetry.record(
                    Capability::Text,
                    AiCallRecord {
                        ts,
                        capability: "text",
                        operation: "plan_search",
                        status: if err.is_cancelled() { "cancelled" } else { "error" },
                        model: String::new(),
                        duration_ms,
                        total_tokens: None,
                        preview: Some(err.to_string()),
                    },
                );
                None
            }
        }
    }

    fn keyword_candidates(
        &self,
        query: &str,
        merged: &MergedFilters,
    ) -> Result<Vec<ContextNode>> {
        let mut terms: Vec<String> = query
            .split_whitespace()
            .filter(|token| token.chars().count() > 1)
            .map(str::to_string)
            .collect();
        for entity in &merged.entities {
            if !terms.iter().any(|term| term.eq_ignore_ascii_case(entity)) {
                terms.push(entity.clone());
            }
        }
        terms.truncate(self.config.max_keyword_terms);

        let mut out = self.store.keyword_search_nodes(&terms, 200)?;

        // The FTS leg reaches text the node columns never see: OCR output.
        let mut seen: FxHashSet<NodeId> = out.iter().map(|node| node.id).collect();
        for (screenshot_id, _bm25) in self.store.fts_search(query, 100)? {
            if let Some(node) = self.store.node_by_screenshot(screenshot_id)? {
                if seen.insert(node.id) {
                    out.push(node);
                }
            }
        }
        Ok(out)
    }

    fn semantic_candidates(
        &self,
        query: &str,
        plan: Option<&SearchQueryPlan>,
        cancel: &CancelToken,
    ) -> Vec<(ContextNode, f32)> {
        let Some(client) = self.embedding.as_ref() else {
            return Vec::new();
        };
        let text = plan
            .map(|plan| plan.embedding_text.as_str())
            .filter(|text| !text.trim().is_empty())
            .unwrap_or(query);

        let permit = match self.runtime.acquire(Capability::Embedding) {
            Ok(permit) => permit,
            Err(err) => {
                warn!(%err, "search.semantic.unavailable");
                return Vec::new();
            }
        };
        let opts = CallOptions {
            timeout_ms: self.embedding_cfg.timeout_ms,
            cancel: cancel.clone(),
        };
        let embedded = client.embed(text, self.embedding_cfg.dimensions, &opts);
        drop(permit);
        let vector = match embedded {
            Ok((vector, _usage)) => {
                self.runtime.record_success(Capability::Embedding);
                vector
            }
            Err(err) => {
                // Request-time boundary: the semantic leg drops out of this
                // search without feeding the breaker.
                self.runtime.record_failure(Capability::Embedding, false);
                warn!(%err, "search.semantic.embed_failed");
                return Vec::new();
            }
        };

        let hits = self.index.search_knn(&vector, self.config.semantic_top_k);
        if hits.is_empty() {
            return Vec::new();
        }
        let doc_ids: Vec<i64> = hits.iter().map(|hit| hit.id).collect();
        let ref_ids = match self.store.ref_ids_for_documents(&doc_ids) {
            Ok(map) => map,
            Err(err) => {
                warn!(%err, "search.semantic.ref_lookup_failed");
                return Vec::new();
            }
        };
        let node_ids: Vec<NodeId> = hits
            .iter()
            .filter_map(|hit| ref_ids.get(&hit.id).copied())
            .collect();
        let loaded = match self.store.nodes_by_ids(&node_ids) {
            Ok(nodes) => nodes,
            Err(err) => {
                warn!(%err, "search.semantic.node_load_failed");
                return Vec::new();
            }
        };
        let by_id: FxHashMap<NodeId, ContextNode> =
            loaded.into_iter().map(|node| (node.id, node)).collect();
        hits.into_iter()
            .filter_map(|hit| {
                let node_id = ref_ids.get(&hit.id)?;
                let node = by_id.get(node_id)?;
                Some((node.clone(), hit.distance))
            })
            .collect()
    }

    fn apply_filters(
        &self,
        candidates: Vec<ContextNode>,
        merged: &MergedFilters,
    ) -> Result<Vec<ContextNode>> {
        let mut out = candidates;
        if let Some(range) = merged.time_range {
            out.retain(|node| node.event_time >= range.start && node.event_time < range.end);
        }
        if let Some(thread_id) = &merged.thread_id {
            out.retain(|node| node.thread_id.as_deref() == Some(thread_id.as_str()));
        }
        if !merged.entities.is_empty() {
            out.retain(|node| entity_boost(node, &merged.entities));
        }
        if let Some(app_hint) = &merged.app_hint {
            let screenshot_ids: Vec<i64> = out.iter().map(|node| node.screenshot_id).collect();
            let hints = self.store.app_hints_for_screenshots(&screenshot_ids)?;
            out.retain(|node| {
                if node.app_context == *app_hint {
                    return true;
                }
                hints
                    .get(&node.screenshot_id)
                    .and_then(|hint| hint.as_deref())
                    .and_then(apps::canonicalize_app_hint)
                    .is_some_and(|canonical| canonical == *app_hint)
            });
        }
        Ok(out)
    }

    fn expand_neighbors(
        &self,
        ranked: &[RankedCandidate],
        merged: &MergedFilters,
    ) -> Result<Vec<ContextNode>> {
        let mut out = Vec::new();
        for pivot in ranked.iter().take(self.config.expansion_pivots) {
            let node = &pivot.node;
            let thread_id = merged
                .thread_id
                .as_deref()
                .or(node.thread_id.as_deref());
            if let Some(thread_id) = thread_id {
                out.extend(self.store.thread_neighbors(
                    thread_id,
                    node.event_time,
                    self.config.thread_neighbor_before,
                    self.config.thread_neighbor_after,
                )?);
            } else {
                out.extend(self.store.temporal_neighbors(
                    node.event_time,
                    self.config.temporal_window_ms,
                    self.config.thread_neighbor_before + self.config.thread_neighbor_after + 1,
                )?);
            }
        }
        Ok(out)
    }

    fn synthesize(
        &self,
        query: &str,
        ranked: &[ContextNode],
        merged: &MergedFilters,
        kind_hint: Option<NodeKind>,
        cancel: &CancelToken,
    ) -> Option<SearchAnswer> {
        let client = self.text.as_ref()?;
        if ranked.is_empty() {
            return None;
        }

        let selected = synthesis::select_nodes(
            ranked,
            &synthesis::SelectionContext {
                filter_entities: &merged.entities,
                kind_hint,
                time_range: merged.time_range,
                limit: self.config.synthesis_node_limit,
                per_thread: self.config.synthesis_per_thread,
            },
        );
        let screenshot_ids: Vec<i64> = selected
            .iter()
            .map(|node| node.screenshot_id)
            .take(self.config.synthesis_evidence_limit)
            .collect();
        let evidence = self
            .store
            .evidence_for_screenshots(&screenshot_ids)
            .unwrap_or_default();
        let request = AnswerSynthesisRequest {
            query: query.to_string(),
            nodes: selected
                .iter()
                .map(|node| SynthesisNode {
                    node_id: node.id,
                    title: node.title.clone(),
                    summary: truncate_chars(&node.summary, self.config.synthesis_summary_chars),
                    event_time: node.event_time,
                    thread_id: node.thread_id.clone(),
                })
                .collect(),
            evidence: evidence
                .into_iter()
                .take(self.config.synthesis_evidence_limit)
                .map(|item| CandidateEvent {
                    screenshot_id: item.screenshot_id,
                    ts: item.ts,
                    app_hint: item.app_hint,
                })
                .collect(),
        };

        let permit = match self.runtime.acquire(Capability::Text) {
            Ok(permit) => permit,
            Err(err) => {
                warn!(%err, "search.synthesis.unavailable");
                return None;
            }
        };
        let opts = CallOptions {
            timeout_ms: self.text_timeout_ms,
            cancel: cancel.clone(),
        };
        let started = Instant::now();
        let ts = now_ms();
        let result = client.synthesize_answer(&request, &opts);
        drop(permit);
        let duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok((mut answer, usage)) => {
                self.runtime.record_success(Capability::Text);
                self.telemetry.record(
                    Capability::Text,
                    AiCallRecord {
                        ts,
                        capability: "text",
                        operation: "synthesize_answer",
                        status: "ok",
                        model: String::new(),
                        duration_ms,
                        total_tokens: usage.total_tokens,
                        preview: Some(answer.answer.clone()),
                    },
                );
                // An uncited answer cannot be confident.
                if answer.citations.is_empty() && answer.confidence > 0.2 {
                    answer.confidence = 0.2;
                }
                Some(answer)
            }
            Err(err) => {
                // Request-time boundary: the answer is optional and its
                // failure never feeds the breaker.
                self.runtime.record_failure(Capability::Text, false);
                self.telemetry.record(
                    Capability::Text,
                    AiCallRecord {
                        ts,
                        capability: "text",
                        operation: "synthesize_answer",
                        status: if err.is_cancelled() { "cancelled" } else { "error" },
                        model: String::new(),
                        duration_ms,
                        total_tokens: None,
                        preview: Some(err.to_string()),
                    },
                );
                None
            }
        }
    }
}

/// Merges the planner's filter proposals under the user's filters.
///
/// The user's thread filter is untouchable. Time range and app hint from
/// the plan apply only when the user supplied none and the plan is
/// confident; entities union-merge; only canonical app hints pass.
fn merge_filters(
    user: &SearchFilters,
    plan: Option<&SearchQueryPlan>,
    min_confidence: f64,
) -> MergedFilters {
    let mut merged = MergedFilters {
        time_range: user.time_range,
        time_range_from_plan: false,
        thread_id: user.thread_id.clone(),
        entities: user.entities.clone(),
        app_hint: user
            .app_hint
            .as_deref()
            .and_then(apps::canonicalize_app_hint),
    };
    let Some(plan) = plan else {
        return merged;
    };
    let confident = plan.confidence >= min_confidence;

    if confident {
        if let Some(patch) = &plan.filters_patch {
            if merged.time_range.is_none() {
                if let Some(range) = patch.time_range {
                    merged.time_range = Some(range);
                    merged.time_range_from_plan = true;
                }
            }
            if merged.app_hint.is_none() {
                if let Some(hint) = patch
                    .app_hint
                    .as_deref()
                    .and_then(apps::canonicalize_app_hint)
                {
                    if apps::is_known_app(&hint) {
                        merged.app_hint = Some(hint);
                    }
                }
            }
            for entity in &patch.entities {
                if !merged
                    .entities
                    .iter()
                    .any(|existing| existing.eq_ignore_ascii_case(entity))
                {
                    merged.entities.push(entity.clone());
                }
            }
        }
        for entity in &plan.extracted_entities {
            if !merged
                .entities
                .iter()
                .any(|existing| existing.eq_ignore_ascii_case(entity))
            {
                merged.entities.push(entity.clone());
            }
        }
    }
    merged
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::FiltersPatch;

    fn plan(confidence: f64) -> SearchQueryPlan {
        SearchQueryPlan {
            embedding_text: "embed me".into(),
            filters_patch: Some(FiltersPatch {
                time_range: Some(TimeRange {
                    start: 100,
                    end: 200,
                }),
                app_hint: Some("Visual Studio Code".into()),
                entities: vec!["deploy".into()],
            }),
            kind_hint: None,
            extracted_entities: vec!["Mnemora".into()],
            keywords: vec![],
            confidence,
        }
    }

    #[test]
    fn user_thread_filter_is_never_overwritten() {
        let user = SearchFilters {
            thread_id: Some("thr_user".into()),
            ..SearchFilters::default()
        };
        let merged = merge_filters(&user, Some(&plan(0.9)), 0.5);
        assert_eq!(merged.thread_id.as_deref(), Some("thr_user"));
    }

    #[test]
    fn plan_fills_gaps_only_when_confident() {
        let user = SearchFilters::default();
        let merged = merge_filters(&user, Some(&plan(0.9)), 0.5);
        assert_eq!(
            merged.time_range,
            Some(TimeRange {
                start: 100,
                end: 200
            })
        );
        assert!(merged.time_range_from_plan);
        assert_eq!(merged.app_hint.as_deref(), Some("vscode"));
        assert!(merged.entities.iter().any(|e| e == "deploy"));
        assert!(merged.entities.iter().any(|e| e == "Mnemora"));

        let unconfident = merge_filters(&user, Some(&plan(0.3)), 0.5);
        assert!(unconfident.time_range.is_none());
        assert!(unconfident.app_hint.is_none());
        assert!(unconfident.entities.is_empty());
    }

    #[test]
    fn user_time_range_beats_plan() {
        let user = SearchFilters {
            time_range: Some(TimeRange { start: 0, end: 50 }),
            ..SearchFilters::default()
        };
        let merged = merge_filters(&user, Some(&plan(0.9)), 0.5);
        assert_eq!(merged.time_range, Some(TimeRange { start: 0, end: 50 }));
        assert!(!merged.time_range_from_plan);
    }

    #[test]
    fn unknown_plan_app_hints_are_dropped() {
        let user = SearchFilters::default();
        let mut custom = plan(0.9);
        custom.filters_patch.as_mut().unwrap().app_hint = Some("Some Niche Tool".into());
        let merged = merge_filters(&user, Some(&custom), 0.5);
        assert!(merged.app_hint.is_none());
    }
}
