//! Answer-synthesis node selection.
//!
//! The model gets at most a few dozen nodes; selection walks priority
//! tiers over the ranked result set, deduplicating as it goes: entity-
//! pinned events, hinted-kind nodes, recent nodes per thread, temporal-
//! bucket diversity across a time range, app diversity, then rank-order
//! fill.

use rustc_hash::{FxHashMap, FxHashSet};

use super::rank::entity_boost;
use crate::ai::TimeRange;
use crate::types::{ContextNode, NodeId, NodeKind};

const TEMPORAL_BUCKETS: i64 = 8;

/// Selection inputs distilled from the pipeline state.
pub struct SelectionContext<'a> {
    /// Filter entities (user plus plan).
    pub filter_entities: &'a [String],
    /// Plan-supplied kind hint, already validated.
    pub kind_hint: Option<NodeKind>,
    /// Effective time range, when one applied.
    pub time_range: Option<TimeRange>,
    /// Hard cap on selected nodes.
    pub limit: usize,
    /// Recent nodes admitted per thread in the thread tier.
    pub per_thread: usize,
}

/// Picks the nodes offered to the synthesis model, in priority order.
pub fn select_nodes(ranked: &[ContextNode], ctx: &SelectionContext<'_>) -> Vec<ContextNode> {
    let mut chosen: Vec<ContextNode> = Vec::with_capacity(ctx.limit.min(ranked.len()));
    let mut seen: FxHashSet<NodeId> = FxHashSet::default();
    let mut admit = |node: &ContextNode, chosen: &mut Vec<ContextNode>| -> bool {
        if chosen.len() >= ctx.limit || !seen.insert(node.id) {
            return false;
        }
        chosen.push(node.clone());
        true
    };

    // Tier 1: entity-pinned events.
    if !ctx.filter_entities.is_empty() {
        for node in ranked {
            if node.kind == NodeKind::Event && entity_boost(node, ctx.filter_entities) {
                admit(node, &mut chosen);
            }
        }
    }

    // Tier 2: hinted-kind nodes.
    if let Some(kind) = ctx.kind_hint {
        for node in ranked {
            if node.kind == kind {
                admit(node, &mut chosen);
            }
        }
    }

    // Tier 3: recent nodes per thread.
    let mut per_thread: FxHashMap<&str, usize> = FxHashMap::default();
    let mut by_recency: Vec<&ContextNode> = ranked.iter().collect();
    by_recency.sort_by(|a, b| b.event_time.cmp(&a.event_time));
    for node in by_recency {
        let Some(thread_id) = node.thread_id.as_deref() else {
            continue;
        };
        let used = per_thread.entry(thread_id).or_default();
        if *used >= ctx.per_thread {
            continue;
        }
        if admit(node, &mut chosen) {
            *used += 1;
        }
    }

    // Tier 4: temporal-bucket diversity across the time range.
    if let Some(range) = ctx.time_range {
        let span = (range.end - range.start).max(1);
        let bucket_width = (span / TEMPORAL_BUCKETS).max(1);
        let mut buckets_seen: FxHashSet<i64> = FxHashSet::default();
        for node in ranked {
            if node.event_time < range.start || node.event_time >= range.end {
                continue;
            }
            let bucket = (node.event_time - range.start) / bucket_width;
            if buckets_seen.insert(bucket) {
                admit(node, &mut chosen);
            }
        }
    }

    // Tier 5: app diversity.
    let mut apps_seen: FxHashSet<&str> = FxHashSet::default();
    for node in ranked {
        if node.app_context.is_empty() {
            continue;
        }
        if apps_seen.insert(node.app_context.as_str()) {
            admit(node, &mut chosen);
        }
    }

    // Tier 6: fill in rank order.
    for node in ranked {
        admit(node, &mut chosen);
    }
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntityRef;

    fn node(id: i64, kind: NodeKind, event_time: i64) -> ContextNode {
        ContextNode {
            id,
            batch_id: 1,
            screenshot_id: id,
            kind,
            thread_id: None,
            title: format!("n{id}"),
            summary: String::new(),
            app_context: String::new(),
            knowledge: None,
            state_snapshot: None,
            ui_text_snippets: vec![],
            keywords: vec![],
            entities: vec![],
            importance: 5,
            confidence: 5,
            event_time,
            ocr_text: None,
            thread_snapshot: None,
            created_at: event_time,
            updated_at: event_time,
        }
    }

    #[test]
    fn entity_pinned_events_lead() {
        let mut pinned = node(1, NodeKind::Event, 100);
        pinned.entities = vec![EntityRef {
            name: "deploy".into(),
            kind: None,
        }];
        let ranked = vec![node(2, NodeKind::Knowledge, 900), pinned.clone(), node(3, NodeKind::Event, 800)];
        let entities = vec!["deploy".to_string()];
        let chosen = select_nodes(
            &ranked,
            &SelectionContext {
                filter_entities: &entities,
                kind_hint: None,
                time_range: None,
                limit: 10,
                per_thread: 3,
            },
        );
        assert_eq!(chosen[0].id, 1);
        assert_eq!(chosen.len(), 3);
    }

    #[test]
    fn per_thread_cap_holds() {
        let mut ranked = Vec::new();
        for i in 0..6 {
            let mut n = node(i, NodeKind::Event, 1_000 + i);
            n.thread_id = Some("thr_1".into());
            ranked.push(n);
        }
        let chosen = select_nodes(
            &ranked,
            &SelectionContext {
                filter_entities: &[],
                kind_hint: None,
                time_range: None,
                limit: 3,
                per_thread: 3,
            },
        );
        // Thread tier admits the 3 newest, then the cap stops everything.
        assert_eq!(chosen.len(), 3);
        let ids: Vec<i64> = chosen.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![5, 4, 3]);
    }

    #[test]
    fn temporal_buckets_spread_selection() {
        let ranked: Vec<ContextNode> = (0..16)
            .map(|i| node(i, NodeKind::Event, i * 100))
            .collect();
        let chosen = select_nodes(
            &ranked,
            &SelectionContext {
                filter_entities: &[],
                kind_hint: None,
                time_range: Some(TimeRange {
                    start: 0,
                    end: 1_600,
                }),
                limit: 8,
                per_thread: 3,
            },
        );
        assert_eq!(chosen.len(), 8);
        // One node from each 200ms bucket: strictly increasing spread.
        let times: Vec<i64> = chosen.iter().map(|n| n.event_time).collect();
        assert_eq!(times, vec![0, 200, 400, 600, 800, 1_000, 1_200, 1_400]);
    }

    #[test]
    fn limit_is_a_hard_cap() {
        let ranked: Vec<ContextNode> = (0..100).map(|i| node(i, NodeKind::Event, i)).collect();
        let chosen = select_nodes(
            &ranked,
            &SelectionContext {
                filter_entities: &[],
                kind_hint: None,
                time_range: None,
                limit: 50,
                per_thread: 3,
            },
        );
        assert_eq!(chosen.len(), 50);
    }
}
