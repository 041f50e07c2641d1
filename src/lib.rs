//! # Mnemora - Local Capture-and-Recall Engine
//!
//! Mnemora continuously samples screens and application windows, deduplicates
//! captures perceptually, batches them for vision-language analysis, threads
//! the resulting context nodes into activity lineages, and indexes everything
//! for hybrid (keyword + vector + temporal) recall.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mnemora::{Config, Engine};
//!
//! // Bootstrap the full pipeline against the default data directory.
//! let engine = Engine::bootstrap(Config::default())?;
//!
//! // The capture driver feeds completed captures into the engine; search is
//! // available immediately and improves as analysis catches up.
//! let result = engine.search("rust borrow checker error", None)?;
//! for node in &result.nodes {
//!     println!("{} - {}", node.title, node.summary);
//! }
//!
//! engine.shutdown();
//! # Ok::<(), mnemora::MnemoraError>(())
//! ```
//!
//! ## Architecture
//!
//! The pipeline is a chain of small, separately-recoverable stages:
//!
//! - **Capture layer**: per-source buffers with perceptual-hash dedup and
//!   batch triggering, plus an adaptive backpressure controller
//! - **Storage layer**: a single embedded relational store (screenshots,
//!   batches, context nodes, threads, activity windows, vector documents)
//!   with a full-text index over OCR output
//! - **Scheduler layer**: a shared state-machine loop driving VLM analysis,
//!   OCR, thread assignment, activity timelining, and embedding/indexing,
//!   with retry lanes, stale-state recovery, and adaptive concurrency
//! - **Vector layer**: an on-disk HNSW index with dimension self-detection
//!   and debounced flushes
//! - **Search layer**: hybrid retrieval merged and ranked with importance,
//!   issue, and entity boosts, optionally planned and synthesized by an LLM

#![forbid(unsafe_code)]

pub mod ai;
pub mod bus;
pub mod capture;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod phash;
pub mod rpc;
pub mod sched;
pub mod search;
pub mod store;
pub mod types;
pub mod vector;

// Re-export the main public API
pub use crate::config::Config;
pub use crate::engine::{Engine, EngineStats, HealthCheck, HealthStatus};
pub use crate::error::{MnemoraError, Result};
pub use crate::phash::PHash;
pub use crate::search::SearchResult;
pub use crate::types::{
    Batch, ContextNode, NodeKind, Screenshot, SourceKey, Thread, VectorDocument,
};
