//! Candidate ranking.
//!
//! A stable sort over ordered keys: issue boost, entity boost, scored
//! before unscored, recency for unscored pairs, importance-discounted
//! distance for scored pairs, recency tiebreak. Lower discounted distance
//! is better; importance at or above 5 shrinks the effective distance.

use std::cmp::Ordering;

use crate::types::ContextNode;

/// A candidate with its best (minimum) retrieval distance, when any
/// retrieval leg scored it. Keyword hits carry `Some(0.0)`.
#[derive(Debug, Clone)]
pub struct RankedCandidate {
    /// The candidate node.
    pub node: ContextNode,
    /// Best L2 distance across retrieval legs; `None` for expansion-only
    /// candidates.
    pub score: Option<f32>,
}

impl RankedCandidate {
    fn issue_boost(&self) -> bool {
        self.node
            .state_snapshot
            .as_ref()
            .is_some_and(|snapshot| snapshot.issue_detected())
    }

    fn recency(&self) -> i64 {
        if self.node.event_time != 0 {
            self.node.event_time
        } else {
            self.node.created_at
        }
    }

    fn discounted_distance(&self) -> f32 {
        let importance = f32::from(self.node.effective_importance());
        self.score.unwrap_or(f32::MAX) * (1.2 - importance / 10.0)
    }
}

/// Whether any filter entity matches any node entity, case-insensitively
/// at token level.
pub fn entity_boost(node: &ContextNode, filter_entities: &[String]) -> bool {
    if filter_entities.is_empty() {
        return false;
    }
    node.entities.iter().any(|entity| {
        filter_entities
            .iter()
            .any(|filter| entity_matches(&entity.name, filter))
    })
}

fn entity_matches(name: &str, filter: &str) -> bool {
    let name_lower = name.to_lowercase();
    let filter_lower = filter.to_lowercase();
    if name_lower == filter_lower {
        return true;
    }
    let name_tokens: Vec<&str> = name_lower.split_whitespace().collect();
    filter_lower
        .split_whitespace()
        .any(|token| name_tokens.contains(&token))
}

/// Sorts candidates most-important-first per the ordered ranking keys.
pub fn rank_candidates(candidates: &mut [RankedCandidate], filter_entities: &[String]) {
    candidates.sort_by(|a, b| compare(a, b, filter_entities));
}

fn compare(a: &RankedCandidate, b: &RankedCandidate, filter_entities: &[String]) -> Ordering {
    // 1. Issue boost.
    match b.issue_boost().cmp(&a.issue_boost()) {
        Ordering::Equal => {}
        other => return other,
    }
    // 2. Entity boost.
    let a_entity = entity_boost(&a.node, filter_entities);
    let b_entity = entity_boost(&b.node, filter_entities);
    match b_entity.cmp(&a_entity) {
        Ordering::Equal => {}
        other => return other,
    }
    // 3. Scored before unscored.
    match (a.score.is_some(), b.score.is_some()) {
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        // 4. Both unscored: newer first.
        (false, false) => return b.recency().cmp(&a.recency()),
        (true, true) => {}
    }
    // 5. Both scored: smaller importance-discounted distance first.
    match a
        .discounted_distance()
        .total_cmp(&b.discounted_distance())
    {
        Ordering::Equal => {}
        other => return other,
    }
    // 6. Tiebreak: newer first.
    b.recency().cmp(&a.recency())
}
