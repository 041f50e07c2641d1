use std::io;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, MnemoraError>;

/// Errors produced by the capture-and-recall pipeline.
///
/// Variants are grouped by meaning rather than by origin: AI call sites
/// feed [`MnemoraError::is_transient`] into the runtime's failure breaker,
/// permanence is attempts-based in the store's state machines, and
/// cancellation takes its own path (the claimed row is released).
#[derive(Debug, Error)]
pub enum MnemoraError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("corruption detected: {0}")]
    Corruption(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("image decode failed: {0}")]
    DecodeFailed(String),
    #[error("ai capability unavailable: {0}")]
    AiUnavailable(String),
    #[error("ai call timed out after {0} ms")]
    AiTimeout(u64),
    #[error("ai output rejected: {0}")]
    InvalidAiOutput(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl MnemoraError {
    /// Whether this is endpoint trouble a retry may reasonably outlast.
    ///
    /// Timeouts, open breakers, and I/O hiccups qualify and count toward
    /// the capability's circuit breaker; schema violations, conflicts, and
    /// corruption never do. Cancellation is neither: callers release the
    /// claim instead of failing it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MnemoraError::Io(_) | MnemoraError::AiUnavailable(_) | MnemoraError::AiTimeout(_)
        )
    }

    /// Whether the error is an external abort.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MnemoraError::Cancelled)
    }
}

impl From<serde_json::Error> for MnemoraError {
    fn from(err: serde_json::Error) -> Self {
        MnemoraError::Serialization(err.to_string())
    }
}
