//! AI call telemetry: a fixed-capacity ring of recent calls plus rolling
//! usage counters per capability.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Serialize;

use super::Capability;

const PREVIEW_CHARS: usize = 160;

/// One recorded AI call.
#[derive(Debug, Clone, Serialize)]
pub struct AiCallRecord {
    /// When the call started, epoch ms.
    pub ts: i64,
    /// Capability label.
    pub capability: &'static str,
    /// Operation label, e.g. `analyze_batch`.
    pub operation: &'static str,
    /// Outcome label: `ok`, `error`, `timeout`, `cancelled`.
    pub status: &'static str,
    /// Model identifier.
    pub model: String,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// Total tokens, when reported.
    pub total_tokens: Option<u64>,
    /// Truncated response or error preview.
    pub preview: Option<String>,
}

/// Rolling totals for one capability.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UsageTotals {
    /// Calls recorded.
    pub calls: u64,
    /// Calls that did not succeed.
    pub errors: u64,
    /// Tokens accumulated from reporting providers.
    pub total_tokens: u64,
}

/// Ring buffer plus usage counters, shared by every AI caller.
pub struct AiTelemetry {
    ring: Mutex<VecDeque<AiCallRecord>>,
    capacity: usize,
    totals: Mutex<[UsageTotals; 3]>,
}

impl AiTelemetry {
    /// Creates a telemetry sink holding the most recent `capacity` calls.
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            totals: Mutex::new([UsageTotals::default(); 3]),
        }
    }

    /// Records one call, truncating its preview.
    pub fn record(&self, capability: Capability, mut record: AiCallRecord) {
        if let Some(preview) = &record.preview {
            if preview.chars().count() > PREVIEW_CHARS {
                record.preview = Some(preview.chars().take(PREVIEW_CHARS).collect());
            }
        }
        {
            let mut totals = self.totals.lock();
            let entry = &mut totals[capability.index()];
            entry.calls += 1;
            if record.status != "ok" {
                entry.errors += 1;
            }
            entry.total_tokens += record.total_tokens.unwrap_or(0);
        }
        let mut ring = self.ring.lock();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(record);
    }

    /// The most recent calls, newest last.
    pub fn recent(&self, limit: usize) -> Vec<AiCallRecord> {
        let ring = self.ring.lock();
        ring.iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }

    /// Rolling totals per capability, in `[vlm, text, embedding]` order.
    pub fn totals(&self) -> [UsageTotals; 3] {
        *self.totals.lock()
    }
}
