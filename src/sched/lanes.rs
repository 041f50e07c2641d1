//! Realtime/recovery lane splitting.
//!
//! Fresh rows (no failed attempts, younger than the recovery age) ride the
//! realtime lane newest-first for latency; everything else drains the
//! recovery lane oldest-first. Dispatch interleaves the lanes with a
//! weighted round-robin so a deep backlog cannot starve fresh work and
//! fresh work cannot starve the backlog.

use crate::store::ClaimCandidate;

/// Lane splitting parameters.
#[derive(Debug, Clone, Copy)]
pub struct LaneConfig {
    /// Rows younger than this with zero attempts count as realtime.
    pub recovery_age_ms: u64,
    /// Realtime dispatches per round-robin window.
    pub weight_realtime: u32,
    /// Recovery dispatches per round-robin window.
    pub weight_recovery: u32,
}

/// Orders claim candidates for dispatch.
pub fn split_lanes(
    candidates: Vec<ClaimCandidate>,
    now_ms: i64,
    config: LaneConfig,
) -> Vec<ClaimCandidate> {
    let mut realtime = Vec::new();
    let mut recovery = Vec::new();
    for candidate in candidates {
        let age = now_ms.saturating_sub(candidate.age_ts);
        if candidate.attempts == 0 && age < config.recovery_age_ms as i64 {
            realtime.push(candidate);
        } else {
            recovery.push(candidate);
        }
    }
    realtime.sort_by(|a, b| b.age_ts.cmp(&a.age_ts));
    recovery.sort_by(|a, b| a.age_ts.cmp(&b.age_ts));

    let mut out = Vec::with_capacity(realtime.len() + recovery.len());
    let mut realtime = realtime.into_iter();
    let mut recovery = recovery.into_iter();
    let take_realtime = config.weight_realtime.max(1) as usize;
    let take_recovery = config.weight_recovery as usize;
    loop {
        let mut emitted = false;
        for _ in 0..take_realtime {
            if let Some(candidate) = realtime.next() {
                out.push(candidate);
                emitted = true;
            }
        }
        for _ in 0..take_recovery {
            if let Some(candidate) = recovery.next() {
                out.push(candidate);
                emitted = true;
            }
        }
        if !emitted {
            return out;
        }
    }
}
