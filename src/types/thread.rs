use serde::{Deserialize, Serialize};

/// Whether a thread is still accumulating nodes.
///
/// Recomputed lazily: a thread flips to inactive once the gap since its last
/// node exceeds the configured threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    /// Saw a node recently.
    Active,
    /// Gap since the last node exceeded the inactivity threshold.
    Inactive,
}

impl ThreadStatus {
    /// Stable column representation.
    pub fn as_str(self) -> &'static str {
        match self {
            ThreadStatus::Active => "active",
            ThreadStatus::Inactive => "inactive",
        }
    }

    /// Parses the column representation; unknown values are `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(ThreadStatus::Active),
            "inactive" => Some(ThreadStatus::Inactive),
            _ => None,
        }
    }
}

/// A notable step in a thread's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    /// What happened.
    pub title: String,
    /// When it happened, epoch ms.
    pub ts: i64,
}

/// An activity lineage across context nodes.
///
/// Nodes reference threads by stable string id (never by pointer), so the
/// thread row can evolve independently of its members.
#[derive(Debug, Clone)]
pub struct Thread {
    /// Stable identifier; survives renames and summary updates.
    pub thread_id: String,
    /// Current title.
    pub title: String,
    /// Rolling summary maintained by the thread scheduler.
    pub summary: String,
    /// Current phase of work, when the model reports one.
    pub current_phase: Option<String>,
    /// Current focus, when the model reports one.
    pub current_focus: Option<String>,
    /// Recorded milestones, oldest first.
    pub milestones: Vec<Milestone>,
    /// Most recent member node's event time, epoch ms.
    pub last_event_ts: i64,
    /// Activity status, recomputed lazily from `last_event_ts`.
    pub status: ThreadStatus,
}

impl Thread {
    /// Recomputes the status for the given instant.
    pub fn status_at(&self, now_ms: i64, inactive_gap_ms: u64) -> ThreadStatus {
        if now_ms.saturating_sub(self.last_event_ts) > inactive_gap_ms as i64 {
            ThreadStatus::Inactive
        } else {
            ThreadStatus::Active
        }
    }
}
