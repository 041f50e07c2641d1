use serde::{Deserialize, Serialize};

use super::{NodeId, WindowId};

/// Summarization state machine over an activity window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    /// Seeded, waiting for a summarization cycle.
    Pending,
    /// Claimed by a cycle.
    Running,
    /// Summarized.
    Succeeded,
    /// Retryable failure.
    Failed,
    /// Seeded but the range held no nodes when processed; self-heals if
    /// nodes arrive later.
    NoData,
    /// Attempts exhausted.
    FailedPermanent,
}

impl ActivityStatus {
    /// Stable column representation.
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityStatus::Pending => "pending",
            ActivityStatus::Running => "running",
            ActivityStatus::Succeeded => "succeeded",
            ActivityStatus::Failed => "failed",
            ActivityStatus::NoData => "no_data",
            ActivityStatus::FailedPermanent => "failed_permanent",
        }
    }

    /// Parses the column representation; unknown values are `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(ActivityStatus::Pending),
            "running" => Some(ActivityStatus::Running),
            "succeeded" => Some(ActivityStatus::Succeeded),
            "failed" => Some(ActivityStatus::Failed),
            "no_data" => Some(ActivityStatus::NoData),
            "failed_permanent" => Some(ActivityStatus::FailedPermanent),
            _ => None,
        }
    }
}

/// Lazy-generation state of a long event's details text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailsStatus {
    /// Not requested yet.
    NotRequested,
    /// Requested by the UI, waiting for the companion task.
    Pending,
    /// Details text generated.
    Succeeded,
    /// Generation failed.
    Failed,
}

impl DetailsStatus {
    /// Stable column representation.
    pub fn as_str(self) -> &'static str {
        match self {
            DetailsStatus::NotRequested => "not_requested",
            DetailsStatus::Pending => "pending",
            DetailsStatus::Succeeded => "succeeded",
            DetailsStatus::Failed => "failed",
        }
    }

    /// Parses the column representation; unknown values are `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "not_requested" => Some(DetailsStatus::NotRequested),
            "pending" => Some(DetailsStatus::Pending),
            "succeeded" => Some(DetailsStatus::Succeeded),
            "failed" => Some(DetailsStatus::Failed),
            _ => None,
        }
    }
}

/// Aggregate counts the summarizer reports for a window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityStats {
    /// Nodes inside the window.
    #[serde(default)]
    pub node_count: u32,
    /// Distinct threads touched.
    #[serde(default)]
    pub thread_count: u32,
    /// Distinct app contexts observed.
    #[serde(default)]
    pub app_count: u32,
}

/// One cell of the fixed 20-minute timeline grid.
#[derive(Debug, Clone)]
pub struct ActivityWindow {
    /// Row id.
    pub id: WindowId,
    /// Grid-aligned start, epoch ms.
    pub window_start: i64,
    /// Grid-aligned end, epoch ms.
    pub window_end: i64,
    /// Title produced by the summarizer.
    pub title: Option<String>,
    /// Summary text; empty until summarized.
    pub summary_text: String,
    /// Bullet highlights, when produced.
    pub highlights: Vec<String>,
    /// Aggregate stats, when produced.
    pub stats: Option<ActivityStats>,
    /// Summarization state.
    pub status: ActivityStatus,
    /// Claim attempts so far.
    pub attempts: u32,
    /// Earliest time the next claim may run, epoch ms.
    pub next_run_at: Option<i64>,
}

/// A contiguous span of related activity inside a window.
#[derive(Debug, Clone)]
pub struct ActivityEvent {
    /// Row id.
    pub id: i64,
    /// Owning window row.
    pub window_id: WindowId,
    /// Event title.
    pub title: String,
    /// Coarse event category from the summarizer.
    pub kind: String,
    /// Span start, epoch ms.
    pub start_ts: i64,
    /// Span end, epoch ms.
    pub end_ts: i64,
    /// Span duration.
    pub duration_ms: i64,
    /// Whether the span meets the long-event threshold.
    pub is_long: bool,
    /// Attributed thread, resolved from node thread snapshots.
    pub thread_id: Option<String>,
    /// Member nodes.
    pub node_ids: Vec<NodeId>,
    /// Lazy details generation state.
    pub details_status: DetailsStatus,
    /// Details text, once generated.
    pub details: Option<String>,
}

/// Aligns a timestamp down to its grid cell start.
pub(crate) fn align_window_start(ts: i64, window_ms: i64) -> i64 {
    (ts.div_euclid(window_ms)) * window_ms
}
