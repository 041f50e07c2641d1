//! Typed facades over the model clients.
//!
//! Each trait method corresponds to one schema-validated call shape the
//! pipeline issues. Implementations own transport, schema enforcement, and
//! deadline/abort plumbing; callers treat a returned error as transient
//! unless it is [`crate::error::MnemoraError::InvalidAiOutput`].

use serde::{Deserialize, Serialize};

use super::CancelToken;
use crate::error::Result;
use crate::types::{
    EntityRef, Knowledge, NodeId, ScreenshotId, StateSnapshot,
};

/// Deadline and abort handle for one call.
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Per-call deadline.
    pub timeout_ms: u64,
    /// External abort, combined with the deadline.
    pub cancel: CancelToken,
}

impl CallOptions {
    /// Options with a deadline and a fresh token.
    pub fn with_timeout(timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            cancel: CancelToken::new(),
        }
    }
}

/// Token accounting reported by a client.
#[derive(Debug, Clone, Copy, Default)]
pub struct AiUsage {
    /// Total tokens consumed, when the provider reports it.
    pub total_tokens: Option<u64>,
}

// ---------------------------------------------------------------------------
// VLM

/// One image of a batch request, with its capture metadata.
#[derive(Debug, Clone, Serialize)]
pub struct VlmImagePayload {
    /// Position within the batch, referenced by the output nodes.
    pub index: usize,
    /// Screenshot row id.
    pub screenshot_id: ScreenshotId,
    /// Capture time, epoch ms.
    pub captured_at: i64,
    /// Capture source key.
    pub source_key: String,
    /// Best-effort owning application name.
    pub app_hint: Option<String>,
    /// Window title at capture time.
    pub window_title: Option<String>,
    /// Base64-encoded image bytes.
    pub image_base64: String,
}

/// A multi-modal batch analysis request.
#[derive(Debug, Clone, Serialize)]
pub struct VlmRequest {
    /// Model identifier.
    pub model: String,
    /// Batch members in capture order.
    pub images: Vec<VlmImagePayload>,
}

/// One node of the VLM's structured output, before normalization.
#[derive(Debug, Clone, Deserialize)]
pub struct VlmNodeOutput {
    /// Which request image this node describes.
    pub screenshot_index: usize,
    /// Proposed title.
    pub title: String,
    /// Proposed summary.
    pub summary: String,
    /// Application the model believes owns the screen.
    #[serde(default)]
    pub app_context: Option<String>,
    /// Knowledge payload, when extracted.
    #[serde(default)]
    pub knowledge: Option<Knowledge>,
    /// State-snapshot payload, when observed.
    #[serde(default)]
    pub state_snapshot: Option<StateSnapshot>,
    /// Verbatim UI strings.
    #[serde(default)]
    pub ui_text_snippets: Vec<String>,
    /// Search keywords.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Named entities.
    #[serde(default)]
    pub entities: Vec<EntityRef>,
    /// Importance as reported; clamped during normalization.
    #[serde(default)]
    pub importance: f64,
    /// Confidence as reported; clamped during normalization.
    #[serde(default)]
    pub confidence: f64,
}

/// The VLM's structured output for one batch.
#[derive(Debug, Clone, Deserialize)]
pub struct VlmOutput {
    /// One node per analyzed screenshot.
    pub nodes: Vec<VlmNodeOutput>,
}

/// Vision-language batch analysis.
pub trait VlmClient: Send + Sync {
    /// Analyzes a batch of screenshots into typed nodes.
    fn analyze_batch(&self, request: &VlmRequest, opts: &CallOptions)
        -> Result<(VlmOutput, AiUsage)>;
}

// ---------------------------------------------------------------------------
// Text model

/// An existing thread offered to the assignment model.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadOffer {
    /// Stable thread id.
    pub thread_id: String,
    /// Current title.
    pub title: String,
    /// Rolling summary.
    pub summary: String,
    /// Recent member node titles, newest first.
    pub recent_node_titles: Vec<String>,
}

/// Prompt bundle for assigning a batch of nodes to threads.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadAssignmentRequest {
    /// Nodes awaiting assignment: `(index, title, summary, event_time)`.
    pub nodes: Vec<(usize, String, String, i64)>,
    /// Candidate threads.
    pub threads: Vec<ThreadOffer>,
}

/// One node-to-thread decision.
#[derive(Debug, Clone, Deserialize)]
pub struct ThreadAssignment {
    /// Index into the request's node list.
    pub node_index: usize,
    /// Chosen thread id (existing or newly proposed).
    pub thread_id: String,
    /// Model's stated reason, for telemetry only.
    #[serde(default)]
    pub reason: Option<String>,
}

/// An update the model proposes for an existing thread.
#[derive(Debug, Clone, Deserialize)]
pub struct ThreadUpdateOutput {
    /// Target thread.
    pub thread_id: String,
    /// New title, if renamed.
    #[serde(default)]
    pub title: Option<String>,
    /// New rolling summary.
    #[serde(default)]
    pub summary: Option<String>,
    /// New phase.
    #[serde(default)]
    pub current_phase: Option<String>,
    /// New focus.
    #[serde(default)]
    pub current_focus: Option<String>,
    /// Milestone titles to append.
    #[serde(default)]
    pub new_milestones: Vec<String>,
}

/// A thread the model proposes creating.
#[derive(Debug, Clone, Deserialize)]
pub struct NewThreadOutput {
    /// Proposed stable id.
    pub thread_id: String,
    /// Title.
    pub title: String,
    /// Initial summary.
    #[serde(default)]
    pub summary: String,
}

/// The assignment model's structured output.
#[derive(Debug, Clone, Deserialize)]
pub struct ThreadAssignmentOutput {
    /// Per-node decisions.
    pub assignments: Vec<ThreadAssignment>,
    /// Updates to existing threads.
    #[serde(default)]
    pub thread_updates: Vec<ThreadUpdateOutput>,
    /// Threads to create first.
    #[serde(default)]
    pub new_threads: Vec<NewThreadOutput>,
}

/// Prompt bundle for summarizing one activity window.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityWindowRequest {
    /// Window bounds, epoch ms.
    pub window_start: i64,
    /// Window bounds, epoch ms.
    pub window_end: i64,
    /// Nodes inside the window: `(node_id, title, summary, thread_id, event_time)`.
    pub nodes: Vec<(NodeId, String, String, Option<String>, i64)>,
}

/// An event span the summarizer detected.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectedEventOutput {
    /// Event title.
    pub title: String,
    /// Coarse category.
    pub kind: String,
    /// Span start, epoch ms.
    pub start_ts: i64,
    /// Span end, epoch ms.
    pub end_ts: i64,
    /// Member nodes by id.
    #[serde(default)]
    pub node_ids: Vec<NodeId>,
}

/// The activity summarizer's structured output.
#[derive(Debug, Clone, Deserialize)]
pub struct ActivitySummaryOutput {
    /// Window title.
    pub title: String,
    /// Window summary.
    pub summary: String,
    /// Bullet highlights.
    #[serde(default)]
    pub highlights: Vec<String>,
    /// Candidate event spans.
    #[serde(default)]
    pub events: Vec<DetectedEventOutput>,
}

/// Prompt bundle for generating a long event's details text.
#[derive(Debug, Clone, Serialize)]
pub struct EventDetailsRequest {
    /// Event title.
    pub title: String,
    /// Event span, epoch ms.
    pub start_ts: i64,
    /// Event span, epoch ms.
    pub end_ts: i64,
    /// Member node summaries.
    pub node_summaries: Vec<String>,
}

/// Prompt bundle for the optional search query plan.
#[derive(Debug, Clone, Serialize)]
pub struct SearchPlanRequest {
    /// Raw user query.
    pub query: String,
    /// Current time, epoch ms, so relative ranges resolve.
    pub now_ms: i64,
    /// Local timezone offset in minutes east of UTC.
    pub tz_offset_minutes: i32,
}

/// A time range filter, epoch ms, half-open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Inclusive start.
    pub start: i64,
    /// Exclusive end.
    pub end: i64,
}

/// Filters the planner proposes merging into the search.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FiltersPatch {
    /// Proposed time range.
    #[serde(default)]
    pub time_range: Option<TimeRange>,
    /// Proposed app hint.
    #[serde(default)]
    pub app_hint: Option<String>,
    /// Proposed entity filters.
    #[serde(default)]
    pub entities: Vec<String>,
}

/// The planner's structured output.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchQueryPlan {
    /// Text to embed for the semantic leg.
    pub embedding_text: String,
    /// Filter proposals.
    #[serde(default)]
    pub filters_patch: Option<FiltersPatch>,
    /// Node-kind hint for UI partitioning.
    #[serde(default)]
    pub kind_hint: Option<String>,
    /// Entities the planner extracted from the query.
    #[serde(default)]
    pub extracted_entities: Vec<String>,
    /// Keywords the planner extracted.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Planner confidence in `[0, 1]`.
    pub confidence: f64,
}

/// One node offered to answer synthesis.
#[derive(Debug, Clone, Serialize)]
pub struct SynthesisNode {
    /// Node row id, citable.
    pub node_id: NodeId,
    /// Node title.
    pub title: String,
    /// Truncated summary.
    pub summary: String,
    /// Node event time, epoch ms.
    pub event_time: i64,
    /// Owning thread.
    pub thread_id: Option<String>,
}

/// Evidence reference offered to answer synthesis.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateEvent {
    /// Screenshot row id, citable.
    pub screenshot_id: ScreenshotId,
    /// Capture time, epoch ms.
    pub ts: i64,
    /// App hint.
    pub app_hint: Option<String>,
}

/// Prompt bundle for answer synthesis.
#[derive(Debug, Clone, Serialize)]
pub struct AnswerSynthesisRequest {
    /// Raw user query.
    pub query: String,
    /// Selected nodes, priority order.
    pub nodes: Vec<SynthesisNode>,
    /// Truncated evidence list.
    pub evidence: Vec<CandidateEvent>,
}

/// A citation in a synthesized answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchAnswerCitation {
    /// Cited node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    /// Cited screenshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_id: Option<ScreenshotId>,
    /// Supporting quote.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<String>,
}

/// The synthesized answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchAnswer {
    /// Optional short title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_title: Option<String>,
    /// The answer text.
    pub answer: String,
    /// Optional bullets.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bullets: Vec<String>,
    /// Citations backing the answer.
    #[serde(default)]
    pub citations: Vec<SearchAnswerCitation>,
    /// Answer confidence in `[0, 1]`; clamped low when citations are empty.
    pub confidence: f64,
}

/// Text-model reasoning calls.
pub trait TextClient: Send + Sync {
    /// Assigns freshly analyzed nodes to threads.
    fn assign_threads(
        &self,
        request: &ThreadAssignmentRequest,
        opts: &CallOptions,
    ) -> Result<(ThreadAssignmentOutput, AiUsage)>;

    /// Summarizes one activity window and detects event spans.
    fn summarize_activity(
        &self,
        request: &ActivityWindowRequest,
        opts: &CallOptions,
    ) -> Result<(ActivitySummaryOutput, AiUsage)>;

    /// Generates details text for a long event.
    fn event_details(
        &self,
        request: &EventDetailsRequest,
        opts: &CallOptions,
    ) -> Result<(String, AiUsage)>;

    /// Rewrites a search query into a plan.
    fn plan_search(
        &self,
        request: &SearchPlanRequest,
        opts: &CallOptions,
    ) -> Result<(SearchQueryPlan, AiUsage)>;

    /// Synthesizes an answer over selected nodes.
    fn synthesize_answer(
        &self,
        request: &AnswerSynthesisRequest,
        opts: &CallOptions,
    ) -> Result<(SearchAnswer, AiUsage)>;
}

/// Embedding generation.
pub trait EmbeddingClient: Send + Sync {
    /// Embeds one text at the requested dimension.
    fn embed(
        &self,
        text: &str,
        dimensions: usize,
        opts: &CallOptions,
    ) -> Result<(Vec<f32>, AiUsage)>;
}
