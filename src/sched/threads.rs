//! Thread assignment scheduler.
//!
//! Batches newly analyzed nodes and submits them to the text model together
//! with the currently active threads (and one recent fallback when nothing
//! is active). The returned plan is applied in one transaction: new threads
//! first, then updates, then assignments with frozen thread snapshots.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use super::core::{CycleOutcome, SchedulerJob};
use crate::ai::{
    AiCallRecord, AiRuntime, AiTelemetry, CallOptions, Capability, TextClient,
    ThreadAssignmentRequest, ThreadOffer,
};
use crate::config::ThreadConfig;
use crate::error::Result;
use crate::store::{NodeThreadAssignment, Store, ThreadPlan, ThreadUpdate};
use crate::types::{now_ms, ContextNode, Milestone, Thread, ThreadStatus};

const ASSIGN_BATCH_LIMIT: usize = 16;

/// Scheduler assigning nodes to activity threads.
pub struct ThreadScheduler {
    store: Arc<Store>,
    runtime: Arc<AiRuntime>,
    telemetry: Arc<AiTelemetry>,
    client: Option<Arc<dyn TextClient>>,
    config: ThreadConfig,
    text_timeout_ms: u64,
}

impl ThreadScheduler {
    /// Builds the scheduler. Without a text client, nodes stay unassigned.
    pub fn new(
        store: Arc<Store>,
        runtime: Arc<AiRuntime>,
        telemetry: Arc<AiTelemetry>,
        client: Option<Arc<dyn TextClient>>,
        config: ThreadConfig,
        text_timeout_ms: u64,
    ) -> Self {
        Self {
            store,
            runtime,
            telemetry,
            client,
            config,
            text_timeout_ms,
        }
    }

    fn thread_offers(&self, now: i64) -> Result<Vec<ThreadOffer>> {
        let mut threads = self.store.active_threads(
            now,
            self.config.inactive_gap_ms,
            self.config.max_active_threads,
        )?;
        if threads.is_empty() {
            threads = self
                .store
                .recent_threads(self.config.fallback_recent_threads)?;
        }
        let mut offers = Vec::with_capacity(threads.len());
        for thread in threads {
            let recent = self
                .store
                .recent_nodes_for_thread(&thread.thread_id, self.config.recent_nodes_per_thread)?;
            offers.push(ThreadOffer {
                thread_id: thread.thread_id,
                title: thread.title,
                summary: thread.summary,
                recent_node_titles: recent.into_iter().map(|node| node.title).collect(),
            });
        }
        Ok(offers)
    }

    fn assign(&self, client: &Arc<dyn TextClient>, nodes: Vec<ContextNode>) -> Result<usize> {
        let now = now_ms();
        let offers = self.thread_offers(now)?;
        let request = ThreadAssignmentRequest {
            nodes: nodes
                .iter()
                .enumerate()
                .map(|(i, node)| (i, node.title.clone(), node.summary.clone(), node.event_time))
                .collect(),
            threads: offers,
        };

        let permit = self.runtime.acquire(Capability::Text)?;
        let opts = CallOptions::with_timeout(self.text_timeout_ms);
        let started = Instant::now();
        let result = client.assign_threads(&request, &opts);
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
                        operation: "assign_threads",
                        status: "ok",
                        model: String::new(),
                        duration_ms,
                        total_tokens: usage.total_tokens,
                        preview: None,
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
                        operation: "assign_threads",
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

        let mut plan = ThreadPlan {
            new_threads: output
                .new_threads
                .into_iter()
                .map(|new| Thread {
                    thread_id: new.thread_id,
                    title: new.title,
                    summary: new.summary,
                    current_phase: None,
                    current_focus: None,
                    milestones: Vec::new(),
                    last_event_ts: 0,
                    status: ThreadStatus::Active,
                })
                .collect(),
            updates: output
                .thread_updates
                .into_iter()
                .map(|update| {
                    (
                        update.thread_id.clone(),
                        ThreadUpdate {
                            title: update.title,
                            summary: update.summary,
                            current_phase: update.current_phase,
                            current_focus: update.current_focus,
                            new_milestones: update
                                .new_milestones
                                .into_iter()
                                .map(|title| Milestone { title, ts: now })
                                .collect(),
                        },
                    )
                })
                .collect(),
            assignments: Vec::new(),
        };
        for assignment in output.assignments {
            let Some(node) = nodes.get(assignment.node_index) else {
                warn!(
                    node_index = assignment.node_index,
                    "sched.threads.assignment_out_of_range"
                );
                continue;
            };
            plan.assignments.push(NodeThreadAssignment {
                node_id: node.id,
                event_time: node.event_time,
                thread_id: assignment.thread_id,
            });
        }

        let assigned = self.store.apply_thread_plan(&plan, now)?;
        debug!(
            nodes = nodes.len(),
            assigned,
            new_threads = plan.new_threads.len(),
            "sched.threads.plan_applied"
        );
        Ok(assigned)
    }
}

impl SchedulerJob for ThreadScheduler {
    fn name(&self) -> &'static str {
        "threads"
    }

    fn run_cycle(&self) -> Result<CycleOutcome> {
        let Some(client) = self.client.clone() else {
            return Ok(CycleOutcome::default());
        };
        let nodes = self.store.unassigned_nodes(ASSIGN_BATCH_LIMIT)?;
        if nodes.is_empty() {
            return Ok(CycleOutcome::default());
        }
        let worked = self.assign(&client, nodes)?;
        Ok(CycleOutcome { worked })
    }
}
