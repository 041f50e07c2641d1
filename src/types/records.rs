use serde::{Deserialize, Serialize};

use super::{BatchDbId, ScreenshotId, SourceKey};
use crate::phash::PHash;

/// Lifecycle of a screenshot's on-disk image file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageState {
    /// Written but not yet assigned to a batch; may be discarded freely.
    Ephemeral,
    /// Owned by a batch; kept until retention expires.
    Persisted,
    /// Tombstoned: the file is gone, the row remains for referential reads.
    Deleted,
}

impl StorageState {
    /// Stable column representation.
    pub fn as_str(self) -> &'static str {
        match self {
            StorageState::Ephemeral => "ephemeral",
            StorageState::Persisted => "persisted",
            StorageState::Deleted => "deleted",
        }
    }

    /// Parses the column representation; unknown values are `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "ephemeral" => Some(StorageState::Ephemeral),
            "persisted" => Some(StorageState::Persisted),
            "deleted" => Some(StorageState::Deleted),
            _ => None,
        }
    }
}

/// An accepted capture.
#[derive(Debug, Clone)]
pub struct Screenshot {
    /// Row id.
    pub id: ScreenshotId,
    /// Capture source this screenshot came from.
    pub source_key: SourceKey,
    /// Capture timestamp, epoch ms.
    pub ts: i64,
    /// 64-bit perceptual hash.
    pub phash: PHash,
    /// Image file location; `None` once tombstoned.
    pub file_path: Option<String>,
    /// Best-effort owning application name.
    pub app_hint: Option<String>,
    /// Window title at capture time.
    pub window_title: Option<String>,
    /// Pixel width, when known.
    pub width: Option<u32>,
    /// Pixel height, when known.
    pub height: Option<u32>,
    /// File lifecycle state.
    pub storage_state: StorageState,
    /// When retention allows tombstoning, epoch ms.
    pub retention_expires_at: Option<i64>,
    /// Owning batch; set once, inside the batch-builder transaction.
    pub batch_id: Option<BatchDbId>,
    /// Row creation time, epoch ms.
    pub created_at: i64,
    /// Last row update time, epoch ms.
    pub updated_at: i64,
}

/// VLM analysis state machine over a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VlmStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a scheduler cycle.
    Running,
    /// Analysis completed; every screenshot has a context node.
    Succeeded,
    /// Retryable failure; `next_run_at` gates the retry.
    Failed,
    /// Attempts exhausted or output permanently rejected.
    FailedPermanent,
}

impl VlmStatus {
    /// Stable column representation.
    pub fn as_str(self) -> &'static str {
        match self {
            VlmStatus::Pending => "pending",
            VlmStatus::Running => "running",
            VlmStatus::Succeeded => "succeeded",
            VlmStatus::Failed => "failed",
            VlmStatus::FailedPermanent => "failed_permanent",
        }
    }

    /// Parses the column representation; unknown values are `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(VlmStatus::Pending),
            "running" => Some(VlmStatus::Running),
            "succeeded" => Some(VlmStatus::Succeeded),
            "failed" => Some(VlmStatus::Failed),
            "failed_permanent" => Some(VlmStatus::FailedPermanent),
            _ => None,
        }
    }
}

/// A time-ordered, content-addressed group of screenshots from one source.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Row id.
    pub id: BatchDbId,
    /// Content-addressed identifier (`batch_` + 24 hex chars).
    pub batch_id: String,
    /// Source the screenshots came from.
    pub source_key: SourceKey,
    /// Member screenshots, ascending by capture time.
    pub screenshot_ids: Vec<ScreenshotId>,
    /// First member's capture time, epoch ms.
    pub ts_start: i64,
    /// Last member's capture time, epoch ms.
    pub ts_end: i64,
    /// Analysis state.
    pub vlm_status: VlmStatus,
    /// Claim attempts so far.
    pub vlm_attempts: u32,
    /// Earliest time the next claim may run, epoch ms.
    pub vlm_next_run_at: Option<i64>,
    /// Row creation time, epoch ms.
    pub created_at: i64,
    /// Last row update time, epoch ms.
    pub updated_at: i64,
}
