use serde::{Deserialize, Serialize};

use super::{BatchDbId, NodeId, ScreenshotId};

/// The typed artifact the VLM produces per screenshot.
///
/// Kind is never stored directly; it derives from which payload is present:
/// a state snapshot wins over knowledge, and a bare node is an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Something happened on screen.
    Event,
    /// Durable information worth recalling later.
    Knowledge,
    /// A snapshot of application or system state, possibly an issue.
    StateSnapshot,
}

impl NodeKind {
    /// Stable column representation.
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Event => "event",
            NodeKind::Knowledge => "knowledge",
            NodeKind::StateSnapshot => "state_snapshot",
        }
    }

    /// Parses the column representation; unknown values are `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "event" => Some(NodeKind::Event),
            "knowledge" => Some(NodeKind::Knowledge),
            "state_snapshot" => Some(NodeKind::StateSnapshot),
            _ => None,
        }
    }

    /// Derives the kind from payload presence.
    pub fn derive(knowledge: Option<&Knowledge>, snapshot: Option<&StateSnapshot>) -> Self {
        if snapshot.is_some() {
            NodeKind::StateSnapshot
        } else if knowledge.is_some() {
            NodeKind::Knowledge
        } else {
            NodeKind::Event
        }
    }
}

/// A named entity surfaced by the VLM (person, repo, ticket, file, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    /// Display name; matching is case-insensitive and token-level.
    pub name: String,
    /// Optional coarse category supplied by the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// A rectangular region of the source image, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextRegion {
    /// Left edge.
    pub left: u32,
    /// Top edge.
    pub top: u32,
    /// Region width.
    pub width: u32,
    /// Region height.
    pub height: u32,
}

/// Knowledge payload: durable content the model extracted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Knowledge {
    /// The extracted content itself.
    pub content: String,
    /// Natural language of on-screen text, when the model recognized one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Region to OCR for verbatim text, when the model located one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_region: Option<TextRegion>,
    /// Salient takeaways, used when building embedding text.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_insights: Vec<String>,
}

/// Detected problem state within a state snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueInfo {
    /// Whether the model believes an issue is visible.
    pub detected: bool,
    /// Short description of the issue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// State-snapshot payload: what the application looked like it was doing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StateSnapshot {
    /// Free-form description of the observed state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Problem state, when detected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue: Option<IssueInfo>,
}

impl StateSnapshot {
    /// Whether an issue was positively detected.
    pub fn issue_detected(&self) -> bool {
        self.issue.as_ref().is_some_and(|issue| issue.detected)
    }
}

/// The owning thread's state captured at assignment time.
///
/// Long-event detection reads this snapshot instead of the mutable thread
/// row; when the two disagree the snapshot wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadSnapshot {
    /// Stable thread id.
    pub thread_id: String,
    /// Thread title at assignment time.
    pub title: String,
    /// Phase at assignment time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    /// Focus at assignment time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_focus: Option<String>,
    /// Thread's last event time at assignment, epoch ms.
    pub last_event_ts: i64,
}

/// The typed artifact produced for exactly one screenshot of one batch.
#[derive(Debug, Clone)]
pub struct ContextNode {
    /// Row id.
    pub id: NodeId,
    /// Owning batch row.
    pub batch_id: BatchDbId,
    /// The screenshot this node describes.
    pub screenshot_id: ScreenshotId,
    /// Derived node kind.
    pub kind: NodeKind,
    /// Owning thread, assigned later by the thread scheduler.
    pub thread_id: Option<String>,
    /// Short title (normalized to the configured cap).
    pub title: String,
    /// Summary (normalized to the configured cap).
    pub summary: String,
    /// Canonicalized application context (e.g. `vscode`).
    pub app_context: String,
    /// Knowledge payload, when present.
    pub knowledge: Option<Knowledge>,
    /// State-snapshot payload, when present.
    pub state_snapshot: Option<StateSnapshot>,
    /// Short verbatim strings visible in the UI.
    pub ui_text_snippets: Vec<String>,
    /// Search keywords.
    pub keywords: Vec<String>,
    /// Named entities.
    pub entities: Vec<EntityRef>,
    /// Importance, clamped to 0..=10. Issue nodes are promoted to >= 7 on
    /// load.
    pub importance: u8,
    /// Model confidence, clamped to 0..=10.
    pub confidence: u8,
    /// When the described moment happened, epoch ms.
    pub event_time: i64,
    /// OCR output stored by the OCR scheduler.
    pub ocr_text: Option<String>,
    /// Thread state captured at assignment time.
    pub thread_snapshot: Option<ThreadSnapshot>,
    /// Row creation time, epoch ms.
    pub created_at: i64,
    /// Last row update time, epoch ms.
    pub updated_at: i64,
}

impl ContextNode {
    /// Whether this node's payload requests OCR.
    ///
    /// OCR runs when the knowledge payload names a supported language and
    /// locates a text region.
    pub fn wants_ocr(&self, supported_languages: &str) -> bool {
        match &self.knowledge {
            Some(knowledge) => match (&knowledge.language, &knowledge.text_region) {
                (Some(language), Some(_)) => supported_languages
                    .split('+')
                    .any(|supported| supported.eq_ignore_ascii_case(language)),
                _ => false,
            },
            None => false,
        }
    }

    /// The text representation handed to the embedding client:
    /// title, summary, key insights, and entity names.
    pub fn embedding_text(&self) -> String {
        let mut parts = vec![self.title.clone(), self.summary.clone()];
        if let Some(knowledge) = &self.knowledge {
            parts.extend(knowledge.key_insights.iter().cloned());
        }
        parts.extend(self.entities.iter().map(|entity| entity.name.clone()));
        parts.retain(|part| !part.trim().is_empty());
        parts.join("\n")
    }

    /// Importance with the issue promotion applied.
    pub fn effective_importance(&self) -> u8 {
        let issue = self
            .state_snapshot
            .as_ref()
            .is_some_and(StateSnapshot::issue_detected);
        if issue {
            self.importance.max(7)
        } else {
            self.importance
        }
    }
}
