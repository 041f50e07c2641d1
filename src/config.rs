//! Engine configuration.
//!
//! Every tunable in the pipeline lives here as a plain struct with a
//! `Default` impl carrying the shipped values. `Config::load` overlays a TOML
//! file from the data directory when one exists; missing keys keep their
//! defaults so the file only needs to name what it changes.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{MnemoraError, Result};

/// Capture-side tunables: sampling cadence and dedup sensitivity.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Base capture interval handed to the driver; backpressure multiplies it.
    pub base_interval_ms: u64,
    /// Perceptual-hash Hamming threshold; captures at or below are duplicates.
    pub phash_threshold: u32,
    /// How long a buffer for a deselected source survives before discard.
    pub source_grace_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: 5_000,
            phash_threshold: 8,
            source_grace_ms: 60_000,
        }
    }
}

/// Batch formation thresholds for the source buffer registry.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// A buffer this long is drained immediately.
    pub min_size: usize,
    /// A non-empty buffer older than this is drained on the next tick.
    pub timeout_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            min_size: 2,
            timeout_ms: 60_000,
        }
    }
}

/// Shared scheduler-loop tunables (see the scheduler framework docs).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Lower clamp for the delay between cycles.
    pub min_delay_ms: u64,
    /// Upper clamp; a cycle always runs at least this often.
    pub default_interval_ms: u64,
    /// Rows stuck `running` longer than this are swept back to `pending`.
    pub stale_running_threshold_ms: u64,
    /// Rows younger than this with no failed attempts ride the realtime lane.
    pub lane_recovery_age_ms: u64,
    /// Realtime dispatches per round-robin window.
    pub lane_weight_realtime: u32,
    /// Recovery dispatches per round-robin window.
    pub lane_weight_recovery: u32,
    /// Attempts before a row is parked as `failed_permanent`.
    pub max_attempts: u32,
    /// Backoff applied to a retryable failure.
    pub retry_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 5_000,
            default_interval_ms: 30_000,
            stale_running_threshold_ms: 300_000,
            lane_recovery_age_ms: 600_000,
            lane_weight_realtime: 3,
            lane_weight_recovery: 1,
            max_attempts: 2,
            retry_delay_ms: 60_000,
        }
    }
}

/// VLM analysis limits and normalization caps.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VlmConfig {
    /// Model identifier forwarded to the VLM client.
    pub model: String,
    /// Per-call deadline.
    pub timeout_ms: u64,
    /// Title length cap applied during normalization.
    pub max_title_chars: usize,
    /// Summary length cap applied during normalization.
    pub max_summary_chars: usize,
    /// Keyword list cap.
    pub max_keywords: usize,
    /// Entity list cap.
    pub max_entities: usize,
    /// UI text snippet cap.
    pub max_ui_snippets: usize,
}

impl Default for VlmConfig {
    fn default() -> Self {
        Self {
            model: "mnemora-vision-default".to_string(),
            timeout_ms: 120_000,
            max_title_chars: 100,
            max_summary_chars: 500,
            max_keywords: 5,
            max_entities: 10,
            max_ui_snippets: 5,
        }
    }
}

/// OCR worker pool settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    /// Number of long-lived OCR engine instances.
    pub concurrency: usize,
    /// Language pack handed to each engine at initialization.
    pub languages: String,
    /// Recognized text is truncated to this many characters.
    pub max_chars: usize,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            languages: "eng+chi_sim".to_string(),
            max_chars: 8_000,
        }
    }
}

/// Thread-assignment prompt bundle shape.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThreadConfig {
    /// Active threads offered to the assignment model.
    pub max_active_threads: usize,
    /// Recent nodes included per offered thread.
    pub recent_nodes_per_thread: usize,
    /// Recent inactive threads offered when nothing is active.
    pub fallback_recent_threads: usize,
    /// Nodes arriving within this window are assigned together.
    pub batch_window_ms: u64,
    /// A thread with no node for this long is recomputed as inactive.
    pub inactive_gap_ms: u64,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            max_active_threads: 3,
            recent_nodes_per_thread: 3,
            fallback_recent_threads: 1,
            batch_window_ms: 5_000,
            inactive_gap_ms: 4 * 3_600_000,
        }
    }
}

/// Activity timeline grid and summarization settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    /// Fixed grid cell width.
    pub window_ms: i64,
    /// Events at or above this duration are flagged long.
    pub long_event_threshold_ms: i64,
    /// Concurrent window summarizations.
    pub summary_concurrency: usize,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            window_ms: 20 * 60_000,
            long_event_threshold_ms: 25 * 60_000,
            summary_concurrency: 2,
        }
    }
}

/// Embedding client settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Model identifier forwarded to the embedding client.
    pub model: String,
    /// Requested embedding dimension.
    pub dimensions: usize,
    /// Per-call deadline.
    pub timeout_ms: u64,
    /// Upper bound on concurrent embedding subtasks.
    pub max_concurrency: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "mnemora-embed-default".to_string(),
            dimensions: 1024,
            timeout_ms: 60_000,
            max_concurrency: 10,
        }
    }
}

/// On-disk vector index construction parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VectorIndexConfig {
    /// Extra capacity reserved beyond the current document count.
    pub capacity_headroom: usize,
    /// Coalescing window for flush requests.
    pub flush_debounce_ms: u64,
    /// Max neighbors kept per node on upper layers.
    pub max_connections: usize,
    /// Candidate list width during construction.
    pub ef_construction: usize,
    /// Candidate list width during search.
    pub ef_search: usize,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            capacity_headroom: 5_000,
            flush_debounce_ms: 500,
            max_connections: 16,
            ef_construction: 200,
            ef_search: 64,
        }
    }
}

/// AI runtime concurrency governance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AiRuntimeConfig {
    /// Configured ceiling for concurrent VLM calls.
    pub vlm_max_concurrency: usize,
    /// Configured ceiling for concurrent text-model calls.
    pub text_max_concurrency: usize,
    /// Configured ceiling for concurrent embedding calls.
    pub embedding_max_concurrency: usize,
    /// Per-call deadline for text-model calls.
    pub text_timeout_ms: u64,
    /// AIMD observation window length.
    pub aimd_window: usize,
    /// Failure rate within the window that halves the limit.
    pub aimd_failure_rate: f64,
    /// Consecutive failures that halve the limit regardless of rate.
    pub aimd_consecutive_failures: u32,
    /// Consecutive successes required before recovery.
    pub aimd_success_run: u32,
    /// Quiet period after a decrease before recovery may start.
    pub aimd_cooldown_ms: u64,
    /// Limit increase applied per recovery step.
    pub aimd_recovery_step: usize,
    /// Floor below which the tuner never drops a limit.
    pub adaptive_min_concurrency: usize,
    /// Hard failures that open the per-capability breaker.
    pub breaker_trip_threshold: u32,
    /// How long an open breaker stays open before a half-open probe.
    pub breaker_open_ms: u64,
}

impl Default for AiRuntimeConfig {
    fn default() -> Self {
        Self {
            vlm_max_concurrency: 3,
            text_max_concurrency: 4,
            embedding_max_concurrency: 8,
            text_timeout_ms: 120_000,
            aimd_window: 20,
            aimd_failure_rate: 0.2,
            aimd_consecutive_failures: 2,
            aimd_success_run: 20,
            aimd_cooldown_ms: 30_000,
            aimd_recovery_step: 1,
            adaptive_min_concurrency: 1,
            breaker_trip_threshold: 5,
            breaker_open_ms: 60_000,
        }
    }
}

/// One row of the backpressure level table.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BackpressureLevelConfig {
    /// Highest pending+running batch count this level covers.
    pub max_pending: Option<u64>,
    /// Multiplier applied to the base capture interval.
    pub interval_factor: u32,
    /// Perceptual-hash threshold while at this level.
    pub phash_threshold: u32,
}

/// Backpressure controller settings, including the level table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    /// Queue-depth polling cadence.
    pub check_interval_ms: u64,
    /// Time the recovery condition must hold before upgrading.
    pub recovery_hysteresis_ms: u64,
    /// Consecutive passing checks required before upgrading.
    pub recovery_batch_threshold: u32,
    /// Level table, most permissive first. The last row must be unbounded.
    pub levels: Vec<BackpressureLevelConfig>,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 5_000,
            recovery_hysteresis_ms: 30_000,
            recovery_batch_threshold: 2,
            levels: vec![
                BackpressureLevelConfig {
                    max_pending: Some(3),
                    interval_factor: 1,
                    phash_threshold: 8,
                },
                BackpressureLevelConfig {
                    max_pending: Some(7),
                    interval_factor: 1,
                    phash_threshold: 9,
                },
                BackpressureLevelConfig {
                    max_pending: Some(11),
                    interval_factor: 2,
                    phash_threshold: 10,
                },
                BackpressureLevelConfig {
                    max_pending: None,
                    interval_factor: 4,
                    phash_threshold: 11,
                },
            ],
        }
    }
}

/// Search pipeline limits and expansion windows.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Nearest neighbors requested from the vector index.
    pub semantic_top_k: usize,
    /// Keyword terms extracted from the query (plus filter entities).
    pub max_keyword_terms: usize,
    /// Cap on nodes recalled for a plan-supplied time range.
    pub time_range_recall_limit: usize,
    /// Top candidates used as neighbor-expansion pivots.
    pub expansion_pivots: usize,
    /// Thread neighbors fetched before each pivot.
    pub thread_neighbor_before: usize,
    /// Thread neighbors fetched after each pivot.
    pub thread_neighbor_after: usize,
    /// Fallback temporal expansion window around unthreaded pivots.
    pub temporal_window_ms: i64,
    /// Query plans below this confidence are ignored for filter merging.
    pub min_plan_confidence: f64,
    /// Nodes handed to answer synthesis.
    pub synthesis_node_limit: usize,
    /// Evidence items included in the synthesis payload.
    pub synthesis_evidence_limit: usize,
    /// Per-node summary truncation in the synthesis payload.
    pub synthesis_summary_chars: usize,
    /// Recent nodes per thread during synthesis selection.
    pub synthesis_per_thread: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            semantic_top_k: 20,
            max_keyword_terms: 8,
            time_range_recall_limit: 2_000,
            expansion_pivots: 5,
            thread_neighbor_before: 3,
            thread_neighbor_after: 3,
            temporal_window_ms: 120_000,
            min_plan_confidence: 0.5,
            synthesis_node_limit: 50,
            synthesis_evidence_limit: 25,
            synthesis_summary_chars: 600,
            synthesis_per_thread: 3,
        }
    }
}

/// Retention sweeper cadence.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Whether the sweeper thread runs at all.
    pub enabled: bool,
    /// Sweep cadence.
    pub sweep_interval_ms: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval_ms: 3_600_000,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Data directory; `None` resolves to `<home>/.mnemora`.
    pub data_dir: Option<PathBuf>,
    /// Capture-side tunables.
    pub capture: CaptureConfig,
    /// Batch formation thresholds.
    pub batching: BatchConfig,
    /// Shared scheduler-loop tunables.
    pub scheduler: SchedulerConfig,
    /// VLM analysis settings.
    pub vlm: VlmConfig,
    /// OCR pool settings.
    pub ocr: OcrConfig,
    /// Thread assignment settings.
    pub threads: ThreadConfig,
    /// Activity timeline settings.
    pub activity: ActivityConfig,
    /// Embedding settings.
    pub embedding: EmbeddingConfig,
    /// Vector index settings.
    pub vector_index: VectorIndexConfig,
    /// AI runtime governance.
    pub ai: AiRuntimeConfig,
    /// Backpressure controller settings.
    pub backpressure: BackpressureConfig,
    /// Search pipeline settings.
    pub search: SearchConfig,
    /// Retention sweeper settings.
    pub retention: RetentionConfig,
}

impl Config {
    /// Resolves the effective data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".mnemora")
        })
    }

    /// Path of the embedded relational store.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join("mnemora.db")
    }

    /// Path of the on-disk vector index.
    pub fn vector_index_path(&self) -> PathBuf {
        self.data_dir().join("vector_index.bin")
    }

    /// Loads configuration from `<data_dir>/config.toml` when present.
    ///
    /// A missing file yields the defaults; a malformed file is an error
    /// rather than a silent fallback.
    pub fn load() -> Result<Self> {
        let defaults = Config::default();
        let path = defaults.data_dir().join("config.toml");
        Self::load_from(&path)
    }

    /// Loads configuration from an explicit path, defaulting when absent.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let raw = fs::read_to_string(path)?;
        toml::from_str(&raw)
            .map_err(|err| MnemoraError::InvalidArgument(format!("config parse: {err}")))
    }

    /// A preset that trades recall latency for battery life: slower capture,
    /// coarser dedup, single-worker OCR, smaller AI ceilings.
    pub fn low_power() -> Self {
        let mut cfg = Config::default();
        cfg.capture.base_interval_ms = 15_000;
        cfg.capture.phash_threshold = 10;
        cfg.ocr.concurrency = 1;
        cfg.ai.vlm_max_concurrency = 1;
        cfg.ai.text_max_concurrency = 2;
        cfg.ai.embedding_max_concurrency = 4;
        cfg.scheduler.default_interval_ms = 60_000;
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_shipped_backpressure_table() {
        let cfg = BackpressureConfig::default();
        assert_eq!(cfg.levels.len(), 4);
        assert_eq!(cfg.levels[0].max_pending, Some(3));
        assert!(cfg.levels.last().unwrap().max_pending.is_none());
        assert_eq!(cfg.levels[3].interval_factor, 4);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [capture]
            phash_threshold = 6
            "#,
        )
        .unwrap();
        assert_eq!(cfg.capture.phash_threshold, 6);
        assert_eq!(cfg.capture.base_interval_ms, 5_000);
        assert_eq!(cfg.batching.min_size, 2);
    }

    #[test]
    fn missing_config_file_is_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(cfg.embedding.dimensions, 1024);
    }
}
