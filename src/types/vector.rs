use serde::{Deserialize, Serialize};

use super::{NodeId, VectorDocId};
use crate::error::{MnemoraError, Result};

/// Shared state machine for the two vector-document subtasks.
///
/// A vector document row carries two of these: one for embedding, one for
/// index insertion. They advance independently; re-embedding resets the
/// index machine back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a scheduler cycle.
    Running,
    /// Completed.
    Succeeded,
    /// Retryable failure.
    Failed,
    /// Attempts exhausted.
    FailedPermanent,
}

impl StageStatus {
    /// Stable column representation.
    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::FailedPermanent => "failed_permanent",
        }
    }

    /// Parses the column representation; unknown values are `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(StageStatus::Pending),
            "running" => Some(StageStatus::Running),
            "succeeded" => Some(StageStatus::Succeeded),
            "failed" => Some(StageStatus::Failed),
            "failed_permanent" => Some(StageStatus::FailedPermanent),
            _ => None,
        }
    }
}

/// Row coupling a context node to its embedding and index lifecycles.
#[derive(Debug, Clone)]
pub struct VectorDocument {
    /// Row id; also the label used inside the vector index.
    pub id: VectorDocId,
    /// The context node this document embeds.
    pub ref_id: NodeId,
    /// Raw little-endian f32 embedding bytes; `None` until embedded.
    pub embedding: Option<Vec<u8>>,
    /// Embedding subtask state.
    pub embedding_status: StageStatus,
    /// Embedding attempts so far.
    pub embedding_attempts: u32,
    /// Earliest time the next embedding claim may run, epoch ms.
    pub embedding_next_run_at: Option<i64>,
    /// Index subtask state.
    pub index_status: StageStatus,
    /// Index attempts so far.
    pub index_attempts: u32,
    /// Earliest time the next index claim may run, epoch ms.
    pub index_next_run_at: Option<i64>,
    /// Last row update time, epoch ms.
    pub updated_at: i64,
}

/// Encodes an embedding as raw little-endian f32 bytes.
pub fn encode_embedding(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for value in values {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Decodes raw little-endian f32 bytes back into an embedding.
///
/// A length that is not a multiple of four is corruption, not a format
/// choice.
pub fn decode_embedding(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(MnemoraError::Corruption(format!(
            "embedding blob length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    let mut out = Vec::with_capacity(bytes.len() / 4);
    for chunk in bytes.chunks_exact(4) {
        out.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Ok(out)
}
