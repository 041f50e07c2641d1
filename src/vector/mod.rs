//! On-disk vector index.
//!
//! [`HnswGraph`] is the in-memory structure; [`VectorIndexService`] owns its
//! lifecycle: dimension self-detection, capacity headroom, debounced
//! flushing to a single checksummed file, rebuild on corruption, and the
//! dimension-migration cascade.

mod hnsw;
mod service;

pub use hnsw::{HnswGraph, Neighbor};
pub use service::{UpsertOutcome, VectorIndexService, VectorIndexStats};
