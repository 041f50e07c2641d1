//! Data models for capture-and-recall entities.
//!
//! This module defines the typed records that flow through the pipeline:
//! screenshots, batches, context nodes, threads, activity windows, and
//! vector documents. Rows persist JSON in a handful of columns; parsing
//! happens once on load (defensively, with fallbacks) and the rest of the
//! process works with these types only.
//!
//! # Key Types
//!
//! - [`Screenshot`] - An accepted capture bound to a source
//! - [`Batch`] - A content-addressed group of screenshots awaiting analysis
//! - [`ContextNode`] - A typed artifact the VLM produces per screenshot
//! - [`Thread`] - An activity lineage across nodes, referenced by stable id
//! - [`ActivityWindow`] / [`ActivityEvent`] - The 20-minute timeline grid
//! - [`VectorDocument`] - Embedding + index lifecycles for one node

mod activity;
pub mod apps;
mod node;
mod records;
mod thread;
mod vector;

pub use activity::{
    ActivityEvent, ActivityStats, ActivityStatus, ActivityWindow, DetailsStatus,
};
pub(crate) use activity::align_window_start;
pub use node::{
    ContextNode, EntityRef, IssueInfo, Knowledge, NodeKind, StateSnapshot, TextRegion,
    ThreadSnapshot,
};
pub use records::{Batch, Screenshot, StorageState, VlmStatus};
pub use thread::{Milestone, Thread, ThreadStatus};
pub use vector::{decode_embedding, encode_embedding, StageStatus, VectorDocument};

use std::fmt;

use serde::{Deserialize, Serialize};

/// Database row id of a screenshot.
pub type ScreenshotId = i64;
/// Database row id of a batch (distinct from its content-addressed string id).
pub type BatchDbId = i64;
/// Database row id of a context node.
pub type NodeId = i64;
/// Database row id of a vector document.
pub type VectorDocId = i64;
/// Database row id of an activity window.
pub type WindowId = i64;

/// Stable identifier of a capture source.
///
/// One of `screen:<displayId>` or `window:<winId>`; the string form is the
/// canonical representation stored on rows and used as registry keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceKey(String);

impl SourceKey {
    /// Key for a physical display.
    pub fn screen(display_id: &str) -> Self {
        Self(format!("screen:{display_id}"))
    }

    /// Key for an application window.
    pub fn window(win_id: &str) -> Self {
        Self(format!("window:{win_id}"))
    }

    /// Parses a stored key, accepting only the two known shapes.
    pub fn parse(raw: &str) -> Option<Self> {
        let (prefix, rest) = raw.split_once(':')?;
        if rest.is_empty() {
            return None;
        }
        match prefix {
            "screen" | "window" => Some(Self(raw.to_string())),
            _ => None,
        }
    }

    /// Whether this key names a physical display.
    pub fn is_screen(&self) -> bool {
        self.0.starts_with("screen:")
    }

    /// The canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Current wall-clock time as epoch milliseconds.
pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_key_round_trip() {
        let key = SourceKey::screen("1");
        assert_eq!(key.as_str(), "screen:1");
        assert!(key.is_screen());
        assert_eq!(SourceKey::parse("screen:1"), Some(key));
        assert_eq!(SourceKey::parse("window:42"), Some(SourceKey::window("42")));
    }

    #[test]
    fn source_key_rejects_unknown_shapes() {
        assert!(SourceKey::parse("display:1").is_none());
        assert!(SourceKey::parse("screen:").is_none());
        assert!(SourceKey::parse("screen1").is_none());
    }
}
