//! Application-scoped engine context.
//!
//! There are no process-wide singletons: `Engine::bootstrap` wires store,
//! bus, vector index, AI runtime, schedulers, capture registry, and the
//! backpressure controller in that order, and `shutdown` tears them down in
//! reverse. The engine also owns the three auxiliary worker threads (buffer
//! flush ticker, backpressure loop, retention sweeper) and exposes the RPC
//! operations, health, and stats.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::ai::{
    AiRuntime, AiTelemetry, CancelToken, Capability, EmbeddingClient, TextClient, UsageTotals,
    VlmClient,
};
use crate::bus::{Channel, Event, EventBus};
use crate::capture::{
    AddOutcome, BackpressureController, BatchBuilder, CaptureDriver, CaptureInput,
    CapturePreferences, SourceBufferRegistry,
};
use crate::config::Config;
use crate::error::Result;
use crate::sched::{
    spawn_scheduler, ActivityScheduler, OcrEngineProvider, OcrScheduler, SchedulerHandle,
    SchedulerTiming, ThreadScheduler, VectorDocumentScheduler, VlmScheduler,
};
use crate::search::{SearchFilters, SearchPipeline, SearchResult};
use crate::store::{RetentionReport, ScreenshotEvidence, Store};
use crate::types::{now_ms, ContextNode, NodeId};
use crate::vector::{VectorIndexService, VectorIndexStats};

const TELEMETRY_RING_CAPACITY: usize = 256;

/// The model clients the embedder supplies; any may be absent, and the
/// corresponding pipeline stages idle.
#[derive(Default, Clone)]
pub struct AiClients {
    /// Vision-language batch analysis.
    pub vlm: Option<Arc<dyn VlmClient>>,
    /// Text reasoning.
    pub text: Option<Arc<dyn TextClient>>,
    /// Embedding generation.
    pub embedding: Option<Arc<dyn EmbeddingClient>>,
}

/// Aggregate health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    /// All checks pass.
    Healthy,
    /// Something is off but the pipeline still moves.
    Degraded,
    /// The engine cannot make progress.
    Unhealthy,
}

/// One health check result.
#[derive(Debug, Clone, Serialize)]
pub enum Check {
    /// Unfinished-batch depth against the backpressure table.
    PendingBatches {
        /// Current unfinished count.
        count: u64,
        /// Current pressure label.
        level: &'static str,
        /// Whether the depth is inside comfortable levels.
        healthy: bool,
    },
    /// Per-capability breaker states.
    AiBreakers {
        /// Whether the VLM breaker is open.
        vlm_open: bool,
        /// Whether the text breaker is open.
        text_open: bool,
        /// Whether the embedding breaker is open.
        embedding_open: bool,
        /// Whether every breaker is closed.
        healthy: bool,
    },
    /// Vector index state.
    VectorIndex {
        /// Live vectors.
        live_vectors: usize,
        /// Detected dimension.
        dimensions: usize,
        /// Whether the index is usable.
        healthy: bool,
    },
    /// Relational store reachability.
    Database {
        /// Whether a trivial query succeeded.
        healthy: bool,
    },
}

impl Check {
    fn healthy(&self) -> bool {
        match self {
            Check::PendingBatches { healthy, .. }
            | Check::AiBreakers { healthy, .. }
            | Check::VectorIndex { healthy, .. }
            | Check::Database { healthy } => *healthy,
        }
    }
}

/// Aggregated health report.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    /// Aggregate status.
    pub status: HealthStatus,
    /// Individual check results.
    pub checks: Vec<Check>,
}

impl HealthCheck {
    fn new() -> Self {
        Self {
            status: HealthStatus::Healthy,
            checks: Vec::new(),
        }
    }

    fn add_check(&mut self, check: Check) {
        if !check.healthy() {
            self.status = match (&self.status, &check) {
                (_, Check::Database { .. }) => HealthStatus::Unhealthy,
                (HealthStatus::Unhealthy, _) => HealthStatus::Unhealthy,
                _ => HealthStatus::Degraded,
            };
        }
        self.checks.push(check);
    }
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    /// Screenshot rows (including tombstones).
    pub screenshots: u64,
    /// Batch rows.
    pub batches: u64,
    /// Unfinished batches (the backpressure signal).
    pub unfinished_batches: u64,
    /// Context-node rows.
    pub nodes: u64,
    /// Thread rows.
    pub threads: u64,
    /// Seeded activity windows.
    pub activity_windows: u64,
    /// Queued OCR tasks.
    pub ocr_queue: usize,
    /// Vector index summary.
    pub vector_index: VectorIndexStats,
    /// Current backpressure level label.
    pub backpressure_level: &'static str,
    /// AI usage totals in `[vlm, text, embedding]` order.
    pub ai_usage: [UsageTotals; 3],
}

struct Worker {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

impl Worker {
    fn stop(self) {
        let _ = self.stop_tx.send(());
        let _ = self.thread.join();
    }
}

fn spawn_worker(name: &str, interval: Duration, tick: impl FnMut() + Send + 'static) -> Worker {
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let mut tick = tick;
    let thread = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => tick(),
            }
        })
        .expect("worker thread spawn");
    Worker { stop_tx, thread }
}

/// The fully wired capture-and-recall engine.
pub struct Engine {
    config: Config,
    store: Arc<Store>,
    bus: Arc<EventBus>,
    index: Arc<VectorIndexService>,
    runtime: Arc<AiRuntime>,
    telemetry: Arc<AiTelemetry>,
    registry: Arc<SourceBufferRegistry>,
    ocr: Arc<OcrScheduler>,
    search: SearchPipeline,
    backpressure: Arc<BackpressureController>,
    driver: Option<Arc<dyn CaptureDriver>>,
    schedulers: Mutex<Vec<SchedulerHandle>>,
    workers: Mutex<Vec<Worker>>,
}

impl Engine {
    /// Bootstraps the engine with no model clients, no OCR engines, and no
    /// capture driver: storage, search-by-keyword, and the RPC surface
    /// still work, analysis stages idle.
    pub fn bootstrap(config: Config) -> Result<Arc<Self>> {
        Self::bootstrap_with(config, AiClients::default(), None, None)
    }

    /// Bootstraps the engine with the supplied collaborators.
    pub fn bootstrap_with(
        config: Config,
        clients: AiClients,
        ocr_provider: Option<Arc<dyn OcrEngineProvider>>,
        driver: Option<Arc<dyn CaptureDriver>>,
    ) -> Result<Arc<Self>> {
        let data_dir = config.data_dir();
        fs::create_dir_all(&data_dir)?;
        info!(data_dir = %data_dir.display(), "engine.bootstrap.begin");

        let store = Arc::new(Store::open(config.db_path())?);
        let bus = Arc::new(EventBus::new());
        let index = VectorIndexService::load(
            config.vector_index_path(),
            Arc::clone(&store),
            config.vector_index.clone(),
            config.embedding.dimensions,
        )?;
        let runtime = Arc::new(AiRuntime::new(&config.ai));
        let telemetry = Arc::new(AiTelemetry::new(TELEMETRY_RING_CAPACITY));

        // Capture side: registry persists accepted captures through the
        // store, the builder turns ready buffers into batch rows.
        let persist_store = Arc::clone(&store);
        let registry = Arc::new(SourceBufferRegistry::new(
            Arc::clone(&bus),
            config.capture.phash_threshold,
            config.batching.min_size,
            config.batching.timeout_ms,
            config.capture.source_grace_ms,
            Box::new(move |new| persist_store.insert_screenshot(new, now_ms())),
        ));
        Arc::new(BatchBuilder::new(Arc::clone(&store), Arc::clone(&bus))).attach();

        // Schedulers.
        let ocr = Arc::new(OcrScheduler::new(
            Arc::clone(&store),
            ocr_provider,
            config.ocr.clone(),
        )?);
        let vlm = VlmScheduler::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&runtime),
            Arc::clone(&telemetry),
            clients.vlm.clone(),
            Arc::clone(&ocr),
            config.scheduler.clone(),
            config.vlm.clone(),
            config.ocr.languages.clone(),
        );
        let threads = ThreadScheduler::new(
            Arc::clone(&store),
            Arc::clone(&runtime),
            Arc::clone(&telemetry),
            clients.text.clone(),
            config.threads.clone(),
            config.ai.text_timeout_ms,
        );
        let activity = ActivityScheduler::new(
            Arc::clone(&store),
            Arc::clone(&runtime),
            Arc::clone(&telemetry),
            clients.text.clone(),
            config.scheduler.clone(),
            config.activity.clone(),
            config.ai.text_timeout_ms,
        );
        let vector = VectorDocumentScheduler::new(
            Arc::clone(&store),
            Arc::clone(&runtime),
            Arc::clone(&telemetry),
            clients.embedding.clone(),
            Arc::clone(&index),
            config.scheduler.clone(),
            config.embedding.clone(),
        );

        let timing = SchedulerTiming {
            min_delay_ms: config.scheduler.min_delay_ms,
            default_interval_ms: config.scheduler.default_interval_ms,
        };
        let vlm_handle = spawn_scheduler(vlm, timing, Arc::clone(&bus));
        let ocr_handle = spawn_scheduler(Arc::clone(&ocr), timing, Arc::clone(&bus));
        let threads_handle = spawn_scheduler(threads, timing, Arc::clone(&bus));
        let activity_handle = spawn_scheduler(activity, timing, Arc::clone(&bus));
        let vector_handle = spawn_scheduler(vector, timing, Arc::clone(&bus));

        // Event wiring: persisted batches wake analysis; fresh nodes wake
        // threading and OCR; dirty vector documents wake the vector loop.
        let waker = vlm_handle.waker();
        bus.subscribe(Channel::BatchPersisted, move |_| waker.wake());
        let ocr_waker = ocr_handle.waker();
        let thread_waker = threads_handle.waker();
        bus.subscribe(Channel::NodesCreated, move |event| {
            thread_waker.wake();
            if let Event::NodesCreated { ocr_requested, .. } = event {
                if *ocr_requested > 0 {
                    ocr_waker.wake();
                }
            }
        });
        let vector_waker = vector_handle.waker();
        bus.subscribe(Channel::VectorDocumentsDirty, move |_| vector_waker.wake());

        let tz_offset_minutes = time::UtcOffset::current_local_offset()
            .map(|offset| offset.whole_minutes() as i32)
            .unwrap_or(0);
        let search = SearchPipeline::new(
            Arc::clone(&store),
            Arc::clone(&index),
            Arc::clone(&runtime),
            Arc::clone(&telemetry),
            clients.text.clone(),
            clients.embedding.clone(),
            config.search.clone(),
            config.embedding.clone(),
            config.ai.text_timeout_ms,
            tz_offset_minutes,
        );

        let backpressure = Arc::new(BackpressureController::new(
            config.backpressure.clone(),
            config.capture.base_interval_ms,
        ));

        let engine = Arc::new(Self {
            config,
            store,
            bus,
            index,
            runtime,
            telemetry,
            registry,
            ocr,
            search,
            backpressure,
            driver,
            schedulers: Mutex::new(vec![
                vlm_handle,
                ocr_handle,
                threads_handle,
                activity_handle,
                vector_handle,
            ]),
            workers: Mutex::new(Vec::new()),
        });
        engine.spawn_workers();
        info!("engine.bootstrap.complete");
        Ok(engine)
    }

    fn spawn_workers(self: &Arc<Self>) {
        let mut workers = self.workers.lock();

        // Idle-buffer flush at the batch-timeout cadence.
        let registry = Arc::clone(&self.registry);
        workers.push(spawn_worker(
            "capture-flush",
            Duration::from_millis(self.config.batching.timeout_ms),
            move || registry.flush_idle(now_ms()),
        ));

        // Backpressure checks, plus breaker-driven capture pausing.
        let engine = Arc::downgrade(self);
        let paused_by_breaker = Arc::new(AtomicBool::new(false));
        workers.push(spawn_worker(
            "backpressure",
            Duration::from_millis(self.config.backpressure.check_interval_ms),
            move || {
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                engine.backpressure_tick(&paused_by_breaker);
            },
        ));

        // Retention sweeps.
        if self.config.retention.enabled {
            let engine = Arc::downgrade(self);
            workers.push(spawn_worker(
                "retention",
                Duration::from_millis(self.config.retention.sweep_interval_ms),
                move || {
                    let Some(engine) = engine.upgrade() else {
                        return;
                    };
                    if let Err(err) = engine.sweep_retention() {
                        warn!(%err, "engine.retention.sweep_failed");
                    }
                },
            ));
        }
    }

    fn backpressure_tick(&self, paused_by_breaker: &AtomicBool) {
        match self.store.count_unfinished_batches() {
            Ok(pending) => {
                if let Some(update) = self.backpressure.evaluate(pending, now_ms()) {
                    self.registry.set_phash_threshold(update.phash_threshold);
                    if let Some(driver) = &self.driver {
                        driver.set_interval_ms(update.capture_interval_ms);
                    }
                }
            }
            Err(err) => warn!(%err, "engine.backpressure.depth_probe_failed"),
        }

        // A VLM outage pauses capture rather than piling up batches that
        // cannot be analyzed.
        if let Some(driver) = &self.driver {
            let open = self.runtime.breaker_open(Capability::Vlm);
            if open && driver.is_running() {
                if driver.stop().is_ok() {
                    paused_by_breaker.store(true, Ordering::SeqCst);
                    warn!("engine.capture.paused_on_breaker");
                }
            } else if !open && paused_by_breaker.swap(false, Ordering::SeqCst) {
                if let Err(err) = driver.start() {
                    warn!(%err, "engine.capture.resume_failed");
                }
            }
        }
    }

    /// Routes completed captures from the driver. Rejections come back in
    /// the outcomes; they are not errors.
    pub fn capture_complete(&self, inputs: Vec<CaptureInput>) -> Result<Vec<AddOutcome>> {
        let now = now_ms();
        let mut outcomes = Vec::with_capacity(inputs.len());
        for input in inputs {
            outcomes.push(self.registry.add(input, now)?);
        }
        Ok(outcomes)
    }

    /// Applies updated capture preferences.
    pub fn apply_preferences(&self, prefs: &CapturePreferences, all_displays: &[String]) {
        let keys = prefs.active_keys(all_displays);
        self.registry.set_active_sources(&keys, now_ms());
    }

    /// Runs a search with an internal cancellation token.
    pub fn search(&self, query: &str, filters: Option<SearchFilters>) -> Result<SearchResult> {
        self.search_with_cancel(query, filters, CancelToken::new())
    }

    /// Runs a search that an external caller may abort.
    pub fn search_with_cancel(
        &self,
        query: &str,
        filters: Option<SearchFilters>,
        cancel: CancelToken,
    ) -> Result<SearchResult> {
        self.search.search(query, filters, cancel)
    }

    /// All nodes of a thread, oldest first.
    pub fn get_thread(&self, thread_id: &str) -> Result<Vec<ContextNode>> {
        self.store.nodes_for_thread(thread_id, 500)
    }

    /// Screenshot evidence for a set of nodes, newest first.
    pub fn get_evidence(&self, node_ids: &[NodeId]) -> Result<Vec<ScreenshotEvidence>> {
        let nodes = self.store.nodes_by_ids(node_ids)?;
        let mut seen = rustc_hash::FxHashSet::default();
        let screenshot_ids: Vec<i64> = nodes
            .iter()
            .map(|node| node.screenshot_id)
            .filter(|id| seen.insert(*id))
            .collect();
        self.store.evidence_for_screenshots(&screenshot_ids)
    }

    /// Marks a long event's details as wanted and nudges the activity
    /// scheduler.
    pub fn request_event_details(&self, event_id: i64) -> Result<bool> {
        let requested = self.store.request_event_details(event_id)?;
        if requested {
            for handle in self.schedulers.lock().iter() {
                if handle.name() == "activity" {
                    handle.wake();
                }
            }
        }
        Ok(requested)
    }

    /// Aggregated health report.
    pub fn health(&self) -> HealthCheck {
        let mut health = HealthCheck::new();

        let (db_healthy, unfinished) = match self.store.count_unfinished_batches() {
            Ok(count) => (true, count),
            Err(_) => (false, 0),
        };
        health.add_check(Check::Database {
            healthy: db_healthy,
        });

        let level = self.backpressure.current_level();
        health.add_check(Check::PendingBatches {
            count: unfinished,
            level: BackpressureController::label(level),
            healthy: level <= 2,
        });

        let vlm_open = self.runtime.breaker_open(Capability::Vlm);
        let text_open = self.runtime.breaker_open(Capability::Text);
        let embedding_open = self.runtime.breaker_open(Capability::Embedding);
        health.add_check(Check::AiBreakers {
            vlm_open,
            text_open,
            embedding_open,
            healthy: !(vlm_open || text_open || embedding_open),
        });

        let index_stats = self.index.stats();
        health.add_check(Check::VectorIndex {
            live_vectors: index_stats.live_vectors,
            dimensions: index_stats.dimensions,
            healthy: index_stats.dimensions > 0,
        });
        health
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> Result<EngineStats> {
        Ok(EngineStats {
            screenshots: self.store.count_screenshots()?,
            batches: self.store.count_batches()?,
            unfinished_batches: self.store.count_unfinished_batches()?,
            nodes: self.store.count_nodes()?,
            threads: self.store.count_threads()?,
            activity_windows: self.store.count_windows()?,
            ocr_queue: self.ocr.queue_len(),
            vector_index: self.index.stats(),
            backpressure_level: BackpressureController::label(
                self.backpressure.current_level(),
            ),
            ai_usage: self.telemetry.totals(),
        })
    }

    /// Rebuilds the vector index from stored embeddings.
    pub fn reindex(&self, progress: impl FnMut(usize, usize)) -> Result<usize> {
        self.index.rebuild_from_store(progress)
    }

    /// Runs one retention sweep immediately, unlinking released files.
    pub fn sweep_retention(&self) -> Result<RetentionReport> {
        let report = self.store.sweep_expired_retention(now_ms())?;
        for path in &report.released_files {
            if let Err(err) = fs::remove_file(path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(%path, %err, "engine.retention.unlink_failed");
                }
            }
        }
        Ok(report)
    }

    /// The shared bus, for embedders wiring extra observers.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// The shared store, for read-only embedder access.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Stops workers and schedulers in reverse bootstrap order and flushes
    /// the vector index.
    pub fn shutdown(&self) {
        info!("engine.shutdown.begin");
        for worker in self.workers.lock().drain(..).rev() {
            worker.stop();
        }
        for handle in self.schedulers.lock().drain(..).rev() {
            handle.stop();
        }
        if let Err(err) = self.index.flush_now() {
            warn!(%err, "engine.shutdown.flush_failed");
        }
        if let Some(driver) = &self.driver {
            if driver.is_running() {
                let _ = driver.stop();
            }
        }
        info!("engine.shutdown.complete");
    }
}
