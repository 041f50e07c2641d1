//! Thread row operations.
//!
//! Thread activity status is recomputed lazily: reads first demote rows
//! whose gap since the last node exceeded the threshold, then query.

use rusqlite::{params, OptionalExtension, Row};
use tracing::warn;

use super::{parse_json_list, Store};
use crate::error::Result;
use crate::types::{Milestone, NodeId, Thread, ThreadSnapshot, ThreadStatus};

const THREAD_COLUMNS: &str =
    "thread_id, title, summary, current_phase, current_focus, milestones, last_event_ts, status";

fn row_to_thread(row: &Row<'_>) -> rusqlite::Result<Thread> {
    let status_raw: String = row.get(7)?;
    Ok(Thread {
        thread_id: row.get(0)?,
        title: row.get(1)?,
        summary: row.get(2)?,
        current_phase: row.get(3)?,
        current_focus: row.get(4)?,
        milestones: parse_json_list(row.get(5)?, "threads.milestones"),
        last_event_ts: row.get(6)?,
        status: ThreadStatus::parse(&status_raw).unwrap_or(ThreadStatus::Active),
    })
}

/// Mutable fields of a thread update produced by the assignment model.
#[derive(Debug, Clone, Default)]
pub struct ThreadUpdate {
    /// New title, when the model renamed the thread.
    pub title: Option<String>,
    /// New rolling summary.
    pub summary: Option<String>,
    /// New phase.
    pub current_phase: Option<String>,
    /// New focus.
    pub current_focus: Option<String>,
    /// Milestones to append.
    pub new_milestones: Vec<Milestone>,
}

/// One node-to-thread decision ready to persist.
#[derive(Debug, Clone)]
pub struct NodeThreadAssignment {
    /// The node being assigned.
    pub node_id: NodeId,
    /// Its event time, advancing the thread frontier.
    pub event_time: i64,
    /// The chosen thread.
    pub thread_id: String,
}

/// The full outcome of one assignment-model call.
#[derive(Debug, Clone, Default)]
pub struct ThreadPlan {
    /// Threads to create first.
    pub new_threads: Vec<Thread>,
    /// Updates to existing threads, applied second.
    pub updates: Vec<(String, ThreadUpdate)>,
    /// Node assignments, applied last.
    pub assignments: Vec<NodeThreadAssignment>,
}

impl Store {
    /// Applies an assignment plan in one transaction: new threads, then
    /// updates, then assignments.
    ///
    /// Each assigned node freezes a [`ThreadSnapshot`] of its thread as it
    /// stood at assignment time; long-event detection later reads the
    /// snapshot instead of the live row. Assignments naming unknown
    /// threads are skipped with a warning.
    pub fn apply_thread_plan(&self, plan: &ThreadPlan, now_ms: i64) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            for thread in &plan.new_threads {
                tx.execute(
                    "INSERT INTO threads (thread_id, title, summary, current_phase, \
                     current_focus, milestones, last_event_ts, status) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'active') \
                     ON CONFLICT(thread_id) DO NOTHING",
                    params![
                        thread.thread_id,
                        thread.title,
                        thread.summary,
                        thread.current_phase,
                        thread.current_focus,
                        serde_json::to_string(&thread.milestones)?,
                        thread.last_event_ts,
                    ],
                )?;
            }

            for (thread_id, update) in &plan.updates {
                let existing: Option<(String, String, Option<String>, Option<String>, Option<String>)> =
                    tx.query_row(
                        "SELECT title, summary, current_phase, current_focus, milestones \
                         FROM threads WHERE thread_id = ?1",
                        params![thread_id],
                        |row| {
                            Ok((
                                row.get(0)?,
                                row.get(1)?,
                                row.get(2)?,
                                row.get(3)?,
                                row.get(4)?,
                            ))
                        },
                    )
                    .optional()?;
                let Some((title, summary, phase, focus, milestones_raw)) = existing else {
                    warn!(%thread_id, "store.thread_plan.update_unknown_thread");
                    continue;
                };
                let mut milestones: Vec<Milestone> =
                    parse_json_list(milestones_raw, "threads.milestones");
                milestones.extend(update.new_milestones.iter().cloned());
                tx.execute(
                    "UPDATE threads SET title = ?2, summary = ?3, current_phase = ?4, \
                     current_focus = ?5, milestones = ?6 WHERE thread_id = ?1",
                    params![
                        thread_id,
                        update.title.as_ref().unwrap_or(&title),
                        update.summary.as_ref().unwrap_or(&summary),
                        update.current_phase.as_ref().or(phase.as_ref()),
                        update.current_focus.as_ref().or(focus.as_ref()),
                        serde_json::to_string(&milestones)?,
                    ],
                )?;
            }

            let mut assigned = 0usize;
            for assignment in &plan.assignments {
                let thread: Option<(String, Option<String>, Option<String>, i64)> = tx
                    .query_row(
                        "SELECT title, current_phase, current_focus, last_event_ts \
                         FROM threads WHERE thread_id = ?1",
                        params![assignment.thread_id],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                    )
                    .optional()?;
                let Some((title, phase, focus, last_event_ts)) = thread else {
                    warn!(
                        thread_id = %assignment.thread_id,
                        node = assignment.node_id,
                        "store.thread_plan.assignment_unknown_thread"
                    );
                    continue;
                };
                let snapshot = ThreadSnapshot {
                    thread_id: assignment.thread_id.clone(),
                    title,
                    current_phase: phase,
                    current_focus: focus,
                    last_event_ts,
                };
                tx.execute(
                    "UPDATE context_nodes SET thread_id = ?2, thread_snapshot = ?3, \
                     updated_at = ?4 WHERE id = ?1",
                    params![
                        assignment.node_id,
                        assignment.thread_id,
                        serde_json::to_string(&snapshot)?,
                        now_ms,
                    ],
                )?;
                tx.execute(
                    "UPDATE threads SET last_event_ts = MAX(last_event_ts, ?2), \
                     status = 'active' WHERE thread_id = ?1",
                    params![assignment.thread_id, assignment.event_time],
                )?;
                assigned += 1;
            }

            tx.commit()?;
            Ok(assigned)
        })
    }

    /// Inserts a thread if its id is unused; existing rows are untouched.
    pub fn insert_thread(&self, thread: &Thread) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO threads (thread_id, title, summary, current_phase, current_focus, \
                 milestones, last_event_ts, status) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                 ON CONFLICT(thread_id) DO NOTHING",
                params![
                    thread.thread_id,
                    thread.title,
                    thread.summary,
                    thread.current_phase,
                    thread.current_focus,
                    serde_json::to_string(&thread.milestones)?,
                    thread.last_event_ts,
                    thread.status.as_str(),
                ],
            )?;
            Ok(())
        })
    }

    /// Loads one thread.
    pub fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>> {
        let sql = format!("SELECT {THREAD_COLUMNS} FROM threads WHERE thread_id = ?1");
        self.with_conn(|conn| {
            let row = conn
                .query_row(&sql, params![thread_id], row_to_thread)
                .optional()?;
            Ok(row)
        })
    }

    /// Demotes threads whose inactivity gap has passed, then returns the
    /// most recently active ones.
    pub fn active_threads(
        &self,
        now_ms: i64,
        inactive_gap_ms: u64,
        limit: usize,
    ) -> Result<Vec<Thread>> {
        self.recompute_thread_status(now_ms, inactive_gap_ms)?;
        let sql = format!(
            "SELECT {THREAD_COLUMNS} FROM threads WHERE status = 'active' \
             ORDER BY last_event_ts DESC LIMIT ?1"
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params![limit as i64], row_to_thread)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// The most recent threads regardless of status, newest first.
    pub fn recent_threads(&self, limit: usize) -> Result<Vec<Thread>> {
        let sql = format!(
            "SELECT {THREAD_COLUMNS} FROM threads ORDER BY last_event_ts DESC LIMIT ?1"
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params![limit as i64], row_to_thread)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Applies an assignment-model update to an existing thread.
    pub fn apply_thread_update(
        &self,
        thread_id: &str,
        update: &ThreadUpdate,
    ) -> Result<()> {
        let existing = match self.get_thread(thread_id)? {
            Some(thread) => thread,
            None => return Ok(()),
        };
        let mut milestones = existing.milestones;
        milestones.extend(update.new_milestones.iter().cloned());
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE threads SET title = ?2, summary = ?3, current_phase = ?4, \
                 current_focus = ?5, milestones = ?6 WHERE thread_id = ?1",
                params![
                    thread_id,
                    update.title.as_ref().unwrap_or(&existing.title),
                    update.summary.as_ref().unwrap_or(&existing.summary),
                    update
                        .current_phase
                        .as_ref()
                        .or(existing.current_phase.as_ref()),
                    update
                        .current_focus
                        .as_ref()
                        .or(existing.current_focus.as_ref()),
                    serde_json::to_string(&milestones)?,
                ],
            )?;
            Ok(())
        })
    }

    /// Advances a thread's last-event frontier (never moves backwards) and
    /// re-activates it.
    pub fn touch_thread(&self, thread_id: &str, event_ts: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE threads SET last_event_ts = MAX(last_event_ts, ?2), status = 'active' \
                 WHERE thread_id = ?1",
                params![thread_id, event_ts],
            )?;
            Ok(())
        })
    }

    /// Total thread rows.
    pub fn count_threads(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let count = conn.query_row("SELECT COUNT(*) FROM threads", [], |row| row.get(0))?;
            Ok(count)
        })
    }

    fn recompute_thread_status(&self, now_ms: i64, inactive_gap_ms: u64) -> Result<()> {
        let cutoff = now_ms - inactive_gap_ms as i64;
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE threads SET status = 'inactive' \
                 WHERE status = 'active' AND last_event_ts < ?1",
                params![cutoff],
            )?;
            Ok(())
        })
    }
}
