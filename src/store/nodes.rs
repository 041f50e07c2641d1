//! Context-node row operations.

use rusqlite::{params, OptionalExtension, Row};
use rustc_hash::FxHashMap;

use super::{parse_json_list, parse_json_opt, Store};
use crate::error::{MnemoraError, Result};
use crate::types::{
    BatchDbId, ContextNode, EntityRef, Knowledge, NodeId, NodeKind, ScreenshotId, StateSnapshot,
    ThreadSnapshot,
};

/// Insert payload for a normalized VLM node.
#[derive(Debug, Clone)]
pub struct NewContextNode {
    /// Owning batch row.
    pub batch_id: BatchDbId,
    /// The screenshot this node describes.
    pub screenshot_id: ScreenshotId,
    /// Derived node kind.
    pub kind: NodeKind,
    /// Normalized title.
    pub title: String,
    /// Normalized summary.
    pub summary: String,
    /// Canonicalized application context.
    pub app_context: String,
    /// Knowledge payload.
    pub knowledge: Option<Knowledge>,
    /// State-snapshot payload.
    pub state_snapshot: Option<StateSnapshot>,
    /// UI text snippets.
    pub ui_text_snippets: Vec<String>,
    /// Keywords.
    pub keywords: Vec<String>,
    /// Entities.
    pub entities: Vec<EntityRef>,
    /// Importance, already clamped.
    pub importance: u8,
    /// Confidence, already clamped.
    pub confidence: u8,
    /// When the described moment happened, epoch ms.
    pub event_time: i64,
}

const NODE_COLUMNS: &str = "id, batch_id, screenshot_id, kind, thread_id, title, summary, \
     app_context, knowledge, state_snapshot, ui_text_snippets, keywords, entities, importance, \
     confidence, event_time, ocr_text, thread_snapshot, created_at, updated_at";

fn row_to_node(row: &Row<'_>) -> rusqlite::Result<ContextNode> {
    let kind_raw: String = row.get(3)?;
    Ok(ContextNode {
        id: row.get(0)?,
        batch_id: row.get(1)?,
        screenshot_id: row.get(2)?,
        kind: NodeKind::parse(&kind_raw).unwrap_or(NodeKind::Event),
        thread_id: row.get(4)?,
        title: row.get(5)?,
        summary: row.get(6)?,
        app_context: row.get(7)?,
        knowledge: parse_json_opt(row.get(8)?, "context_nodes.knowledge"),
        state_snapshot: parse_json_opt(row.get(9)?, "context_nodes.state_snapshot"),
        ui_text_snippets: parse_json_list(row.get(10)?, "context_nodes.ui_text_snippets"),
        keywords: parse_json_list(row.get(11)?, "context_nodes.keywords"),
        entities: parse_json_list(row.get(12)?, "context_nodes.entities"),
        importance: row.get::<_, i64>(13)?.clamp(0, 10) as u8,
        confidence: row.get::<_, i64>(14)?.clamp(0, 10) as u8,
        event_time: row.get(15)?,
        ocr_text: row.get(16)?,
        thread_snapshot: parse_json_opt(row.get(17)?, "context_nodes.thread_snapshot"),
        created_at: row.get(18)?,
        updated_at: row.get(19)?,
    })
}

impl Store {
    /// Upserts the context node for a screenshot.
    ///
    /// Exactly one node exists per screenshot; re-analysis of a batch
    /// replaces the node content in place, keeping the row id stable.
    pub fn upsert_node(&self, new: &NewContextNode, now_ms: i64) -> Result<NodeId> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO context_nodes (batch_id, screenshot_id, kind, title, summary, \
                 app_context, knowledge, state_snapshot, ui_text_snippets, keywords, entities, \
                 importance, confidence, event_time, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15) \
                 ON CONFLICT(screenshot_id) DO UPDATE SET \
                 batch_id = excluded.batch_id, kind = excluded.kind, title = excluded.title, \
                 summary = excluded.summary, app_context = excluded.app_context, \
                 knowledge = excluded.knowledge, state_snapshot = excluded.state_snapshot, \
                 ui_text_snippets = excluded.ui_text_snippets, keywords = excluded.keywords, \
                 entities = excluded.entities, importance = excluded.importance, \
                 confidence = excluded.confidence, event_time = excluded.event_time, \
                 updated_at = excluded.updated_at",
                params![
                    new.batch_id,
                    new.screenshot_id,
                    new.kind.as_str(),
                    new.title,
                    new.summary,
                    new.app_context,
                    new.knowledge
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    new.state_snapshot
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    serde_json::to_string(&new.ui_text_snippets)?,
                    serde_json::to_string(&new.keywords)?,
                    serde_json::to_string(&new.entities)?,
                    new.importance,
                    new.confidence,
                    new.event_time,
                    now_ms,
                ],
            )?;
            let id = conn.query_row(
                "SELECT id FROM context_nodes WHERE screenshot_id = ?1",
                params![new.screenshot_id],
                |row| row.get(0),
            )?;
            Ok(id)
        })
    }

    /// Loads one node.
    pub fn get_node(&self, id: NodeId) -> Result<Option<ContextNode>> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM context_nodes WHERE id = ?1");
        self.with_conn(|conn| {
            let row = conn.query_row(&sql, params![id], row_to_node).optional()?;
            Ok(row)
        })
    }

    /// Loads a set of nodes in unspecified order.
    pub fn nodes_by_ids(&self, ids: &[NodeId]) -> Result<Vec<ContextNode>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql =
            format!("SELECT {NODE_COLUMNS} FROM context_nodes WHERE id IN ({placeholders})");
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(ids.iter()), row_to_node)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// The node describing a screenshot, if analysis produced one.
    pub fn node_by_screenshot(&self, screenshot_id: ScreenshotId) -> Result<Option<ContextNode>> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM context_nodes WHERE screenshot_id = ?1");
        self.with_conn(|conn| {
            let row = conn
                .query_row(&sql, params![screenshot_id], row_to_node)
                .optional()?;
            Ok(row)
        })
    }

    /// Most recent node event time, the activity seeding frontier.
    pub fn latest_node_event_time(&self) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            let ts = conn.query_row("SELECT MAX(event_time) FROM context_nodes", [], |row| {
                row.get(0)
            })?;
            Ok(ts)
        })
    }

    /// Oldest node event time, where activity seeding starts from scratch.
    pub fn earliest_node_event_time(&self) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            let ts = conn.query_row("SELECT MIN(event_time) FROM context_nodes", [], |row| {
                row.get(0)
            })?;
            Ok(ts)
        })
    }

    /// Number of nodes with `event_time` in `[start, end)`.
    pub fn count_nodes_in_range(&self, start: i64, end: i64) -> Result<u64> {
        self.with_conn(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM context_nodes WHERE event_time >= ?1 AND event_time < ?2",
                params![start, end],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    /// Nodes with `event_time` in `[start, end)`, oldest first.
    pub fn nodes_in_range(&self, start: i64, end: i64, limit: usize) -> Result<Vec<ContextNode>> {
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM context_nodes \
             WHERE event_time >= ?1 AND event_time < ?2 ORDER BY event_time ASC LIMIT ?3"
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params![start, end, limit as i64], row_to_node)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Nodes not yet assigned to a thread, oldest first.
    pub fn unassigned_nodes(&self, limit: usize) -> Result<Vec<ContextNode>> {
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM context_nodes WHERE thread_id IS NULL \
             ORDER BY created_at ASC LIMIT ?1"
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params![limit as i64], row_to_node)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Records a thread assignment along with the frozen thread snapshot.
    pub fn assign_node_thread(
        &self,
        node_id: NodeId,
        thread_id: &str,
        snapshot: &ThreadSnapshot,
        now_ms: i64,
    ) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE context_nodes SET thread_id = ?2, thread_snapshot = ?3, updated_at = ?4 \
                 WHERE id = ?1",
                params![node_id, thread_id, serde_json::to_string(snapshot)?, now_ms],
            )?;
            if changed == 0 {
                return Err(MnemoraError::NotFound("context node"));
            }
            Ok(())
        })
    }

    /// Stores OCR output on the node record.
    pub fn set_node_ocr_text(&self, node_id: NodeId, text: &str, now_ms: i64) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE context_nodes SET ocr_text = ?2, updated_at = ?3 WHERE id = ?1",
                params![node_id, text, now_ms],
            )?;
            if changed == 0 {
                return Err(MnemoraError::NotFound("context node"));
            }
            Ok(())
        })
    }

    /// All nodes of a thread, oldest first.
    pub fn nodes_for_thread(&self, thread_id: &str, limit: usize) -> Result<Vec<ContextNode>> {
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM context_nodes WHERE thread_id = ?1 \
             ORDER BY event_time ASC LIMIT ?2"
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params![thread_id, limit as i64], row_to_node)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// The most recent nodes of a thread, newest first.
    pub fn recent_nodes_for_thread(&self, thread_id: &str, limit: usize) -> Result<Vec<ContextNode>> {
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM context_nodes WHERE thread_id = ?1 \
             ORDER BY event_time DESC LIMIT ?2"
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params![thread_id, limit as i64], row_to_node)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Thread neighbors around a pivot's event time: up to `before`
    /// preceding and `after` following nodes.
    pub fn thread_neighbors(
        &self,
        thread_id: &str,
        event_time: i64,
        before: usize,
        after: usize,
    ) -> Result<Vec<ContextNode>> {
        let before_sql = format!(
            "SELECT {NODE_COLUMNS} FROM context_nodes \
             WHERE thread_id = ?1 AND event_time < ?2 ORDER BY event_time DESC LIMIT ?3"
        );
        let after_sql = format!(
            "SELECT {NODE_COLUMNS} FROM context_nodes \
             WHERE thread_id = ?1 AND event_time > ?2 ORDER BY event_time ASC LIMIT ?3"
        );
        self.with_conn(|conn| {
            let mut out = Vec::new();
            let mut stmt = conn.prepare_cached(&before_sql)?;
            let rows = stmt.query_map(params![thread_id, event_time, before as i64], row_to_node)?;
            for row in rows {
                out.push(row?);
            }
            let mut stmt = conn.prepare_cached(&after_sql)?;
            let rows = stmt.query_map(params![thread_id, event_time, after as i64], row_to_node)?;
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Nodes within a symmetric time window around a pivot.
    pub fn temporal_neighbors(
        &self,
        event_time: i64,
        window_ms: i64,
        limit: usize,
    ) -> Result<Vec<ContextNode>> {
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM context_nodes \
             WHERE event_time >= ?1 AND event_time <= ?2 ORDER BY event_time ASC LIMIT ?3"
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(
                params![event_time - window_ms, event_time + window_ms, limit as i64],
                row_to_node,
            )?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Keyword search: OR of `LIKE %term%` across the JSON-serialized text
    /// columns. Terms arrive pre-tokenized and capped by the caller.
    pub fn keyword_search_nodes(&self, terms: &[String], limit: usize) -> Result<Vec<ContextNode>> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let mut clauses = Vec::with_capacity(terms.len());
        let mut args: Vec<String> = Vec::with_capacity(terms.len());
        for (i, term) in terms.iter().enumerate() {
            let idx = i + 1;
            clauses.push(format!(
                "(title LIKE ?{idx} OR summary LIKE ?{idx} OR keywords LIKE ?{idx} \
                 OR entities LIKE ?{idx})"
            ));
            args.push(format!("%{}%", term.replace('%', "").replace('_', "")));
        }
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM context_nodes WHERE {} \
             ORDER BY event_time DESC LIMIT {limit}",
            clauses.join(" OR "),
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), row_to_node)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// App hints of the screenshots backing a set of nodes.
    pub fn app_hints_for_screenshots(
        &self,
        ids: &[ScreenshotId],
    ) -> Result<FxHashMap<ScreenshotId, Option<String>>> {
        if ids.is_empty() {
            return Ok(FxHashMap::default());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("SELECT id, app_hint FROM screenshots WHERE id IN ({placeholders})");
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(ids.iter()), |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?))
            })?;
            let mut out = FxHashMap::default();
            for row in rows {
                let (id, hint) = row?;
                out.insert(id, hint);
            }
            Ok(out)
        })
    }

    /// Total context-node rows.
    pub fn count_nodes(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let count =
                conn.query_row("SELECT COUNT(*) FROM context_nodes", [], |row| row.get(0))?;
            Ok(count)
        })
    }
}
