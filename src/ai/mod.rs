//! AI runtime and client facades.
//!
//! The model clients themselves are external collaborators behind traits;
//! this module owns what surrounds every call: per-capability semaphores
//! with AIMD-tuned capacity, failure breakers, cancellation, deadlines, and
//! call telemetry.

mod clients;
mod runtime;
mod telemetry;

pub use clients::{
    ActivitySummaryOutput, ActivityWindowRequest, AiUsage, AnswerSynthesisRequest, CallOptions,
    CandidateEvent, DetectedEventOutput, EmbeddingClient, EventDetailsRequest, FiltersPatch,
    NewThreadOutput, SearchAnswer, SearchAnswerCitation, SearchPlanRequest, SearchQueryPlan,
    SynthesisNode, TextClient, ThreadAssignment, ThreadAssignmentOutput, ThreadAssignmentRequest,
    ThreadOffer, ThreadUpdateOutput, TimeRange, VlmClient, VlmImagePayload, VlmNodeOutput,
    VlmOutput, VlmRequest,
};
pub use runtime::{AiRuntime, Permit};
pub use telemetry::{AiCallRecord, AiTelemetry, UsageTotals};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{MnemoraError, Result};

/// The three governed model capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Vision-language batch analysis.
    Vlm,
    /// Text reasoning (threads, activity, search planning, synthesis).
    Text,
    /// Embedding generation.
    Embedding,
}

impl Capability {
    /// Stable label for logs and telemetry.
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Vlm => "vlm",
            Capability::Text => "text",
            Capability::Embedding => "embedding",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Capability::Vlm => 0,
            Capability::Text => 1,
            Capability::Embedding => 2,
        }
    }
}

/// Cheap clonable cancellation flag combined into every AI call.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A token that never fires unless cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; observers see it on their next check.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Errors with [`MnemoraError::Cancelled`] once cancellation fired.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(MnemoraError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_fires_once_set() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        let observer = token.clone();
        token.cancel();
        assert!(observer.is_cancelled());
        assert!(matches!(observer.check(), Err(MnemoraError::Cancelled)));
    }
}
