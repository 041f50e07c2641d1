//! Activity timeline scheduler.
//!
//! Maintains the fixed 20-minute window grid in three phases per cycle:
//! seeding complete windows that contain nodes, self-healing `no_data`
//! windows whose range gained nodes since, and summarizing claimed pending
//! windows through the text model. Long-event details are generated lazily
//! by a companion pass when the UI requests them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use super::core::{CycleOutcome, SchedulerJob};
use super::lanes::{split_lanes, LaneConfig};
use super::run_bounded;
use crate::ai::{
    ActivityWindowRequest, AiCallRecord, AiRuntime, AiTelemetry, CallOptions, Capability,
    DetectedEventOutput, EventDetailsRequest, TextClient,
};
use crate::config::{ActivityConfig, SchedulerConfig};
use crate::error::{MnemoraError, Result};
use crate::store::{NewActivityEvent, Store, ACTIVITY_MACHINE};
use crate::types::{align_window_start, now_ms, ActivityStats, ContextNode, WindowId};

const FETCH_LIMIT: usize = 16;
const WINDOW_NODE_LIMIT: usize = 500;
const DETAILS_BATCH_LIMIT: usize = 4;

/// Scheduler driving the `activity_windows.status` machine.
pub struct ActivityScheduler {
    store: Arc<Store>,
    runtime: Arc<AiRuntime>,
    telemetry: Arc<AiTelemetry>,
    client: Option<Arc<dyn TextClient>>,
    sched_cfg: SchedulerConfig,
    activity_cfg: ActivityConfig,
    text_timeout_ms: u64,
}

impl ActivityScheduler {
    /// Builds the scheduler. Without a text client, windows stay pending.
    pub fn new(
        store: Arc<Store>,
        runtime: Arc<AiRuntime>,
        telemetry: Arc<AiTelemetry>,
        client: Option<Arc<dyn TextClient>>,
        sched_cfg: SchedulerConfig,
        activity_cfg: ActivityConfig,
        text_timeout_ms: u64,
    ) -> Self {
        Self {
            store,
            runtime,
            telemetry,
            client,
            sched_cfg,
            activity_cfg,
            text_timeout_ms,
        }
    }

    /// Seeds every complete window between the seeding frontier and the
    /// latest complete window, skipping empty ranges.
    fn seed_windows(&self, now: i64) -> Result<usize> {
        let Some(latest) = self.store.latest_node_event_time()? else {
            return Ok(0);
        };
        let window_ms = self.activity_cfg.window_ms;
        let mut cursor = match self.store.last_seeded_window_start()? {
            Some(frontier) => frontier + window_ms,
            None => match self.store.earliest_node_event_time()? {
                Some(earliest) => align_window_start(earliest, window_ms),
                None => return Ok(0),
            },
        };

        let mut seeded = 0usize;
        while cursor + window_ms <= latest {
            let end = cursor + window_ms;
            if self.store.count_nodes_in_range(cursor, end)? > 0
                && self.store.seed_window(cursor, end, now)?
            {
                seeded += 1;
            }
            cursor = end;
        }
        if seeded > 0 {
            debug!(seeded, "sched.activity.windows_seeded");
        }
        Ok(seeded)
    }

    fn process_window(&self, window_id: WindowId, client: &Arc<dyn TextClient>) -> Result<()> {
        let window = self
            .store
            .get_window(window_id)?
            .ok_or(MnemoraError::NotFound("activity window"))?;
        let nodes = self.store.nodes_in_range(
            window.window_start,
            window.window_end,
            WINDOW_NODE_LIMIT,
        )?;
        let now = now_ms();
        if nodes.is_empty() {
            self.store.mark_window_no_data(window_id, now)?;
            return Ok(());
        }

        let request = ActivityWindowRequest {
            window_start: window.window_start,
            window_end: window.window_end,
            nodes: nodes
                .iter()
                .map(|node| {
                    (
                        node.id,
                        node.title.clone(),
                        node.summary.clone(),
                        node.thread_id.clone(),
                        node.event_time,
                    )
                })
                .collect(),
        };

        let permit = self.runtime.acquire(Capability::Text)?;
        let opts = CallOptions::with_timeout(self.text_timeout_ms);
        let started = Instant::now();
        let result = client.summarize_activity(&request, &opts);
        drop(permit);
        let duration_ms = started.elapsed().as_millis() as u64;

        let output = match result {
            Ok((output, usage)) => {
                self.runtime.record_success(Capability::Text);
                self.telemetry.record(
                    Capability::Text,
                    AiCallRecord {
                        ts: now,
                        capability: "text",
                        operation: "summarize_activity",
                        status: "ok",
                        model: String::new(),
                        duration_ms,
                        total_tokens: usage.total_tokens,
                        preview: Some(output.title.clone()),
                    },
                );
                output
            }
            Err(err) => {
                self.runtime
                    .record_failure(Capability::Text, err.is_transient());
                self.telemetry.record(
                    Capability::Text,
                    AiCallRecord {
                        ts: now,
                        capability: "text",
                        operation: "summarize_activity",
                        status: "error",
                        model: String::new(),
                        duration_ms,
                        total_tokens: None,
                        preview: Some(err.to_string()),
                    },
                );
                return Err(err);
            }
        };

        let stats = window_stats(&nodes);
        self.store.store_window_summary(
            window_id,
            &output.title,
            &output.summary,
            &output.highlights,
            &stats,
            now,
        )?;
        let events: Vec<NewActivityEvent> = output
            .events
            .into_iter()
            .map(|event| self.build_event(event, &nodes))
            .collect();
        self.store.replace_window_events(window_id, &events)?;
        self.store.complete(&ACTIVITY_MACHINE, window_id, now)?;
        debug!(
            window = window_id,
            events = events.len(),
            "sched.activity.window_summarized"
        );
        Ok(())
    }

    /// Converts a detected span into a persistable event.
    ///
    /// Thread attribution reads the member nodes' frozen thread snapshots
    /// (majority wins); the snapshot takes precedence over the node's
    /// current thread when the two disagree.
    fn build_event(&self, event: DetectedEventOutput, nodes: &[ContextNode]) -> NewActivityEvent {
        let by_id: FxHashMap<i64, &ContextNode> =
            nodes.iter().map(|node| (node.id, node)).collect();
        let mut votes: FxHashMap<&str, usize> = FxHashMap::default();
        for node_id in &event.node_ids {
            let Some(node) = by_id.get(node_id) else {
                continue;
            };
            let snapshot_thread = node
                .thread_snapshot
                .as_ref()
                .map(|snapshot| snapshot.thread_id.as_str())
                .or(node.thread_id.as_deref());
            if let Some(thread_id) = snapshot_thread {
                *votes.entry(thread_id).or_default() += 1;
            }
        }
        let thread_id = votes
            .into_iter()
            .max_by_key(|(_, count)| *count)
            .map(|(thread_id, _)| thread_id.to_string());

        let duration = event.end_ts.saturating_sub(event.start_ts);
        NewActivityEvent {
            title: event.title,
            kind: event.kind,
            start_ts: event.start_ts,
            end_ts: event.end_ts,
            is_long: duration >= self.activity_cfg.long_event_threshold_ms,
            thread_id,
            node_ids: event.node_ids,
        }
    }

    /// Generates details text for events the UI asked about.
    fn process_pending_details(&self, client: &Arc<dyn TextClient>) -> Result<usize> {
        let pending = self.store.pending_event_details(DETAILS_BATCH_LIMIT)?;
        let mut generated = 0usize;
        for event in pending {
            let nodes = self.store.nodes_by_ids(&event.node_ids)?;
            let request = EventDetailsRequest {
                title: event.title.clone(),
                start_ts: event.start_ts,
                end_ts: event.end_ts,
                node_summaries: nodes.iter().map(|node| node.summary.clone()).collect(),
            };
            let permit = self.runtime.acquire(Capability::Text)?;
            let opts = CallOptions::with_timeout(self.text_timeout_ms);
            let result = client.event_details(&request, &opts);
            drop(permit);
            match result {
                Ok((details, _usage)) => {
                    self.runtime.record_success(Capability::Text);
                    self.store.store_event_details(event.id, Some(&details))?;
                    generated += 1;
                }
                Err(err) => {
                    self.runtime
                        .record_failure(Capability::Text, err.is_transient());
                    warn!(event = event.id, %err, "sched.activity.details_failed");
                    self.store.store_event_details(event.id, None)?;
                }
            }
        }
        Ok(generated)
    }
}

fn window_stats(nodes: &[ContextNode]) -> ActivityStats {
    let mut threads = std::collections::BTreeSet::new();
    let mut apps = std::collections::BTreeSet::new();
    for node in nodes {
        if let Some(thread_id) = &node.thread_id {
            threads.insert(thread_id.clone());
        }
        if !node.app_context.is_empty() {
            apps.insert(node.app_context.clone());
        }
    }
    ActivityStats {
        node_count: nodes.len() as u32,
        thread_count: threads.len() as u32,
        app_count: apps.len() as u32,
    }
}

impl SchedulerJob for ActivityScheduler {
    fn name(&self) -> &'static str {
        "activity"
    }

    fn run_cycle(&self) -> Result<CycleOutcome> {
        let now = now_ms();
        self.seed_windows(now)?;
        self.store.heal_no_data_windows(now)?;
        self.store.sweep_stale_running(
            &ACTIVITY_MACHINE,
            self.sched_cfg.stale_running_threshold_ms,
            now,
        )?;

        let Some(client) = self.client.clone() else {
            return Ok(CycleOutcome::default());
        };

        let candidates = self.store.fetch_claimable(
            &ACTIVITY_MACHINE,
            self.sched_cfg.max_attempts,
            now,
            FETCH_LIMIT,
        )?;
        let ordered = split_lanes(
            candidates,
            now,
            LaneConfig {
                recovery_age_ms: self.sched_cfg.lane_recovery_age_ms,
                weight_realtime: self.sched_cfg.lane_weight_realtime,
                weight_recovery: self.sched_cfg.lane_weight_recovery,
            },
        );
        let worked = AtomicUsize::new(0);
        run_bounded(
            ordered,
            self.activity_cfg.summary_concurrency,
            |candidate| {
                let claim = self.store.try_claim(
                    &ACTIVITY_MACHINE,
                    candidate.id,
                    self.sched_cfg.max_attempts,
                    now_ms(),
                );
                match claim {
                    Ok(true) => {}
                    Ok(false) => return,
                    Err(err) => {
                        warn!(window = candidate.id, %err, "sched.activity.claim_failed");
                        return;
                    }
                }
                worked.fetch_add(1, Ordering::Relaxed);
                if let Err(err) = self.process_window(candidate.id, &client) {
                    let finished = now_ms();
                    let update = if err.is_cancelled() {
                        self.store
                            .release_claim(&ACTIVITY_MACHINE, candidate.id, finished)
                    } else {
                        warn!(window = candidate.id, %err, "sched.activity.window_failed");
                        self.store.fail(
                            &ACTIVITY_MACHINE,
                            candidate.id,
                            self.sched_cfg.max_attempts,
                            self.sched_cfg.retry_delay_ms,
                            finished,
                        )
                    };
                    if let Err(err) = update {
                        warn!(window = candidate.id, %err, "sched.activity.status_update_failed");
                    }
                }
            },
        );

        let details = self.process_pending_details(&client)?;
        Ok(CycleOutcome {
            worked: worked.into_inner() + details,
        })
    }

    fn earliest_next_run(&self, now_ms: i64) -> Result<Option<i64>> {
        self.store
            .earliest_next_run(&ACTIVITY_MACHINE, self.sched_cfg.max_attempts, now_ms)
    }
}
