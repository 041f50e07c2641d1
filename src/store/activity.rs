//! Activity window and event row operations.

use rusqlite::{params, OptionalExtension, Row};

use super::{parse_json_list, parse_json_opt, Store};
use crate::error::Result;
use crate::types::{
    ActivityEvent, ActivityStats, ActivityStatus, ActivityWindow, DetailsStatus, NodeId, WindowId,
};

const WINDOW_COLUMNS: &str = "id, window_start, window_end, title, summary_text, highlights, \
     stats, status, attempts, next_run_at";

const EVENT_COLUMNS: &str = "id, window_id, title, kind, start_ts, end_ts, duration_ms, \
     is_long, thread_id, node_ids, details_status, details";

fn row_to_window(row: &Row<'_>) -> rusqlite::Result<ActivityWindow> {
    let status_raw: String = row.get(7)?;
    Ok(ActivityWindow {
        id: row.get(0)?,
        window_start: row.get(1)?,
        window_end: row.get(2)?,
        title: row.get(3)?,
        summary_text: row.get(4)?,
        highlights: parse_json_list(row.get(5)?, "activity_windows.highlights"),
        stats: parse_json_opt(row.get(6)?, "activity_windows.stats"),
        status: ActivityStatus::parse(&status_raw).unwrap_or(ActivityStatus::Pending),
        attempts: row.get(8)?,
        next_run_at: row.get(9)?,
    })
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<ActivityEvent> {
    let details_raw: String = row.get(10)?;
    Ok(ActivityEvent {
        id: row.get(0)?,
        window_id: row.get(1)?,
        title: row.get(2)?,
        kind: row.get(3)?,
        start_ts: row.get(4)?,
        end_ts: row.get(5)?,
        duration_ms: row.get(6)?,
        is_long: row.get::<_, i64>(7)? != 0,
        thread_id: row.get(8)?,
        node_ids: parse_json_list(row.get(9)?, "activity_events.node_ids"),
        details_status: DetailsStatus::parse(&details_raw).unwrap_or(DetailsStatus::NotRequested),
        details: row.get(11)?,
    })
}

/// Insert payload for an event detected by the window summarizer.
#[derive(Debug, Clone)]
pub struct NewActivityEvent {
    /// Event title.
    pub title: String,
    /// Coarse category.
    pub kind: String,
    /// Span start, epoch ms.
    pub start_ts: i64,
    /// Span end, epoch ms.
    pub end_ts: i64,
    /// Whether the span meets the long-event threshold.
    pub is_long: bool,
    /// Attributed thread.
    pub thread_id: Option<String>,
    /// Member nodes.
    pub node_ids: Vec<NodeId>,
}

impl Store {
    /// The newest seeded grid cell start, the seeding frontier.
    pub fn last_seeded_window_start(&self) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            let ts = conn.query_row("SELECT MAX(window_start) FROM activity_windows", [], |row| {
                row.get(0)
            })?;
            Ok(ts)
        })
    }

    /// Seeds one grid cell; `false` means the cell already existed.
    pub fn seed_window(&self, start: i64, end: i64, now_ms: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO activity_windows (window_start, window_end, status, updated_at) \
                 VALUES (?1, ?2, 'pending', ?3) \
                 ON CONFLICT(window_start, window_end) DO NOTHING",
                params![start, end, now_ms],
            )?;
            Ok(inserted == 1)
        })
    }

    /// Re-opens `no_data` windows whose range gained nodes since.
    pub fn heal_no_data_windows(&self, now_ms: i64) -> Result<usize> {
        self.with_conn(|conn| {
            let healed = conn.execute(
                "UPDATE activity_windows SET status = 'pending', attempts = 0, \
                 next_run_at = NULL, updated_at = ?1 \
                 WHERE status = 'no_data' AND EXISTS (\
                     SELECT 1 FROM context_nodes \
                     WHERE event_time >= window_start AND event_time < window_end)",
                params![now_ms],
            )?;
            Ok(healed)
        })
    }

    /// Loads one window.
    pub fn get_window(&self, id: WindowId) -> Result<Option<ActivityWindow>> {
        let sql = format!("SELECT {WINDOW_COLUMNS} FROM activity_windows WHERE id = ?1");
        self.with_conn(|conn| {
            let row = conn.query_row(&sql, params![id], row_to_window).optional()?;
            Ok(row)
        })
    }

    /// Stores a successful summarization.
    pub fn store_window_summary(
        &self,
        id: WindowId,
        title: &str,
        summary: &str,
        highlights: &[String],
        stats: &ActivityStats,
        now_ms: i64,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE activity_windows SET title = ?2, summary_text = ?3, highlights = ?4, \
                 stats = ?5, updated_at = ?6 WHERE id = ?1",
                params![
                    id,
                    title,
                    summary,
                    serde_json::to_string(highlights)?,
                    serde_json::to_string(stats)?,
                    now_ms,
                ],
            )?;
            Ok(())
        })
    }

    /// Parks a claimed window as `no_data`.
    pub fn mark_window_no_data(&self, id: WindowId, now_ms: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE activity_windows SET status = 'no_data', next_run_at = NULL, \
                 updated_at = ?2 WHERE id = ?1",
                params![id, now_ms],
            )?;
            Ok(())
        })
    }

    /// Replaces a window's detected events wholesale.
    ///
    /// Re-summarization regenerates the event list; replacing avoids
    /// duplicate spans from earlier attempts.
    pub fn replace_window_events(
        &self,
        window_id: WindowId,
        events: &[NewActivityEvent],
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM activity_events WHERE window_id = ?1",
                params![window_id],
            )?;
            for event in events {
                tx.execute(
                    "INSERT INTO activity_events (window_id, title, kind, start_ts, end_ts, \
                     duration_ms, is_long, thread_id, node_ids, details_status) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'not_requested')",
                    params![
                        window_id,
                        event.title,
                        event.kind,
                        event.start_ts,
                        event.end_ts,
                        event.end_ts - event.start_ts,
                        event.is_long as i64,
                        event.thread_id,
                        serde_json::to_string(&event.node_ids)?,
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Events of a window, span order.
    pub fn events_for_window(&self, window_id: WindowId) -> Result<Vec<ActivityEvent>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM activity_events WHERE window_id = ?1 \
             ORDER BY start_ts ASC"
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params![window_id], row_to_event)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Marks a long event's details as wanted by the UI.
    pub fn request_event_details(&self, event_id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE activity_events SET details_status = 'pending' \
                 WHERE id = ?1 AND details_status IN ('not_requested', 'failed')",
                params![event_id],
            )?;
            Ok(changed == 1)
        })
    }

    /// Events whose details generation is wanted.
    pub fn pending_event_details(&self, limit: usize) -> Result<Vec<ActivityEvent>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM activity_events WHERE details_status = 'pending' \
             ORDER BY id ASC LIMIT ?1"
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params![limit as i64], row_to_event)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Stores generated details text, or records the failure.
    pub fn store_event_details(&self, event_id: i64, details: Option<&str>) -> Result<()> {
        self.with_conn(|conn| {
            match details {
                Some(text) => conn.execute(
                    "UPDATE activity_events SET details = ?2, details_status = 'succeeded' \
                     WHERE id = ?1",
                    params![event_id, text],
                )?,
                None => conn.execute(
                    "UPDATE activity_events SET details_status = 'failed' WHERE id = ?1",
                    params![event_id],
                )?,
            };
            Ok(())
        })
    }

    /// Total seeded windows.
    pub fn count_windows(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let count =
                conn.query_row("SELECT COUNT(*) FROM activity_windows", [], |row| row.get(0))?;
            Ok(count)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewContextNode, NewScreenshot};
    use crate::types::{NodeKind, SourceKey};

    fn seed_node_at(store: &Store, ts: i64) {
        let sid = store
            .insert_screenshot(&NewScreenshot::for_test(SourceKey::screen("1"), ts), ts)
            .unwrap();
        let batch = store
            .create_and_persist_batch(&SourceKey::screen("1"), &[sid], ts)
            .unwrap();
        store
            .upsert_node(
                &NewContextNode {
                    batch_id: batch.batch.id,
                    screenshot_id: sid,
                    kind: NodeKind::Event,
                    title: "t".into(),
                    summary: "s".into(),
                    app_context: String::new(),
                    knowledge: None,
                    state_snapshot: None,
                    ui_text_snippets: vec![],
                    keywords: vec![],
                    entities: vec![],
                    importance: 5,
                    confidence: 5,
                    event_time: ts,
                },
                ts,
            )
            .unwrap();
    }

    #[test]
    fn seeding_is_conflict_free() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.seed_window(0, 1_200_000, 1).unwrap());
        assert!(!store.seed_window(0, 1_200_000, 2).unwrap());
        assert_eq!(store.count_windows().unwrap(), 1);
        assert_eq!(store.last_seeded_window_start().unwrap(), Some(0));
    }

    #[test]
    fn no_data_heals_once_nodes_arrive() {
        let store = Store::open_in_memory().unwrap();
        store.seed_window(0, 1_200_000, 1).unwrap();
        let id = 1;
        store.mark_window_no_data(id, 2).unwrap();
        assert_eq!(store.heal_no_data_windows(3).unwrap(), 0);

        seed_node_at(&store, 600_000);
        assert_eq!(store.heal_no_data_windows(4).unwrap(), 1);
        let window = store.get_window(id).unwrap().unwrap();
        assert_eq!(window.status, ActivityStatus::Pending);
        assert_eq!(window.attempts, 0);
    }

    #[test]
    fn event_replacement_and_details_lifecycle() {
        let store = Store::open_in_memory().unwrap();
        store.seed_window(0, 1_200_000, 1).unwrap();
        let events = vec![NewActivityEvent {
            title: "long build".into(),
            kind: "build".into(),
            start_ts: 0,
            end_ts: 1_600_000,
            is_long: true,
            thread_id: Some("thr_1".into()),
            node_ids: vec![1, 2],
        }];
        store.replace_window_events(1, &events).unwrap();
        store.replace_window_events(1, &events).unwrap();
        let stored = store.events_for_window(1).unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].is_long);
        assert_eq!(stored[0].duration_ms, 1_600_000);

        let event_id = stored[0].id;
        assert!(store.request_event_details(event_id).unwrap());
        // Already pending: request is a no-op.
        assert!(!store.request_event_details(event_id).unwrap());
        assert_eq!(store.pending_event_details(10).unwrap().len(), 1);
        store
            .store_event_details(event_id, Some("details text"))
            .unwrap();
        let after = store.events_for_window(1).unwrap();
        assert_eq!(after[0].details_status, DetailsStatus::Succeeded);
        assert_eq!(after[0].details.as_deref(), Some("details text"));
    }
}
