//! Embedded relational store.
//!
//! All persistent state apart from the vector index file lives in a single
//! SQLite database. One writer connection sits behind a mutex; SQLite's WAL
//! mode keeps readers cheap. JSON-bearing columns are parsed defensively
//! exactly once, on row load - a malformed column degrades to an empty value
//! with a warning instead of poisoning the row.

mod activity;
mod batches;
mod fts;
mod machine;
mod nodes;
mod screenshots;
mod threads;
mod vector_docs;

pub use activity::NewActivityEvent;
pub use batches::{batch_content_id, BatchPersistOutcome};
pub use machine::{ClaimCandidate, MachineSpec};
pub use nodes::NewContextNode;
pub use screenshots::{NewScreenshot, RetentionReport, ScreenshotEvidence};
pub use threads::{NodeThreadAssignment, ThreadPlan, ThreadUpdate};

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::Result;

/// Claim/retry state machine over `batches.vlm_status`.
pub const BATCH_VLM_MACHINE: MachineSpec = MachineSpec {
    table: "batches",
    status: "vlm_status",
    attempts: "vlm_attempts",
    next_run_at: "vlm_next_run_at",
    updated_at: "updated_at",
    age: "created_at",
    extra_predicate: None,
};

/// Claim/retry state machine over `vector_documents.embedding_status`.
pub const EMBEDDING_MACHINE: MachineSpec = MachineSpec {
    table: "vector_documents",
    status: "embedding_status",
    attempts: "embedding_attempts",
    next_run_at: "embedding_next_run_at",
    updated_at: "updated_at",
    age: "updated_at",
    extra_predicate: None,
};

/// Claim/retry state machine over `vector_documents.index_status`.
///
/// Index work only makes sense once an embedding exists.
pub const INDEX_MACHINE: MachineSpec = MachineSpec {
    table: "vector_documents",
    status: "index_status",
    attempts: "index_attempts",
    next_run_at: "index_next_run_at",
    updated_at: "updated_at",
    age: "updated_at",
    extra_predicate: Some("embedding_status = 'succeeded'"),
};

/// Claim/retry state machine over `activity_windows.status`.
pub const ACTIVITY_MACHINE: MachineSpec = MachineSpec {
    table: "activity_windows",
    status: "status",
    attempts: "attempts",
    next_run_at: "next_run_at",
    updated_at: "updated_at",
    age: "window_start",
    extra_predicate: None,
};

/// Handle to the embedded relational store.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Opens (creating if needed) the database at `path` and applies the
    /// schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::from_connection(conn)
    }

    /// An in-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.apply_schema()?;
        Ok(store)
    }

    fn apply_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(SCHEMA)?;
        debug!("store.schema.applied");
        Ok(())
    }

    /// Runs a closure with the connection locked.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Runs a closure with a mutable connection (needed for transactions).
    pub(crate) fn with_conn_mut<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock();
        f(&mut conn)
    }
}

/// Parses a JSON list column, degrading to empty on damage.
pub(crate) fn parse_json_list<T: DeserializeOwned>(raw: Option<String>, context: &str) -> Vec<T> {
    match raw {
        None => Vec::new(),
        Some(text) if text.is_empty() => Vec::new(),
        Some(text) => serde_json::from_str(&text).unwrap_or_else(|err| {
            warn!(%context, %err, "store.json_column.damaged");
            Vec::new()
        }),
    }
}

/// Parses an optional JSON object column, degrading to `None` on damage.
pub(crate) fn parse_json_opt<T: DeserializeOwned>(raw: Option<String>, context: &str) -> Option<T> {
    let text = raw?;
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str(&text) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(%context, %err, "store.json_column.damaged");
            None
        }
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS screenshots (
    id INTEGER PRIMARY KEY,
    source_key TEXT NOT NULL,
    ts INTEGER NOT NULL,
    phash TEXT NOT NULL,
    file_path TEXT,
    app_hint TEXT,
    window_title TEXT,
    width INTEGER,
    height INTEGER,
    storage_state TEXT NOT NULL DEFAULT 'ephemeral',
    retention_expires_at INTEGER,
    batch_id INTEGER REFERENCES batches(id),
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_screenshots_source_ts ON screenshots(source_key, ts);
CREATE INDEX IF NOT EXISTS idx_screenshots_batch ON screenshots(batch_id);
CREATE INDEX IF NOT EXISTS idx_screenshots_retention
    ON screenshots(retention_expires_at) WHERE storage_state != 'deleted';

CREATE TABLE IF NOT EXISTS batches (
    id INTEGER PRIMARY KEY,
    batch_id TEXT NOT NULL UNIQUE,
    source_key TEXT NOT NULL,
    screenshot_ids TEXT NOT NULL,
    ts_start INTEGER NOT NULL,
    ts_end INTEGER NOT NULL,
    vlm_status TEXT NOT NULL DEFAULT 'pending',
    vlm_attempts INTEGER NOT NULL DEFAULT 0,
    vlm_next_run_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_batches_status ON batches(vlm_status, vlm_next_run_at);

CREATE TABLE IF NOT EXISTS context_nodes (
    id INTEGER PRIMARY KEY,
    batch_id INTEGER NOT NULL REFERENCES batches(id),
    screenshot_id INTEGER NOT NULL UNIQUE REFERENCES screenshots(id),
    kind TEXT NOT NULL,
    thread_id TEXT,
    title TEXT NOT NULL,
    summary TEXT NOT NULL,
    app_context TEXT NOT NULL DEFAULT '',
    knowledge TEXT,
    state_snapshot TEXT,
    ui_text_snippets TEXT NOT NULL DEFAULT '[]',
    keywords TEXT NOT NULL DEFAULT '[]',
    entities TEXT NOT NULL DEFAULT '[]',
    importance INTEGER NOT NULL DEFAULT 0,
    confidence INTEGER NOT NULL DEFAULT 0,
    event_time INTEGER NOT NULL,
    ocr_text TEXT,
    thread_snapshot TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_nodes_thread_time ON context_nodes(thread_id, event_time);
CREATE INDEX IF NOT EXISTS idx_nodes_event_time ON context_nodes(event_time);
CREATE INDEX IF NOT EXISTS idx_nodes_batch ON context_nodes(batch_id);

CREATE TABLE IF NOT EXISTS threads (
    thread_id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    summary TEXT NOT NULL DEFAULT '',
    current_phase TEXT,
    current_focus TEXT,
    milestones TEXT NOT NULL DEFAULT '[]',
    last_event_ts INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'active'
);

CREATE TABLE IF NOT EXISTS activity_windows (
    id INTEGER PRIMARY KEY,
    window_start INTEGER NOT NULL,
    window_end INTEGER NOT NULL,
    title TEXT,
    summary_text TEXT NOT NULL DEFAULT '',
    highlights TEXT NOT NULL DEFAULT '[]',
    stats TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    next_run_at INTEGER,
    updated_at INTEGER NOT NULL,
    UNIQUE(window_start, window_end)
);
CREATE INDEX IF NOT EXISTS idx_activity_status ON activity_windows(status, next_run_at);

CREATE TABLE IF NOT EXISTS activity_events (
    id INTEGER PRIMARY KEY,
    window_id INTEGER NOT NULL REFERENCES activity_windows(id) ON DELETE CASCADE,
    title TEXT NOT NULL,
    kind TEXT NOT NULL,
    start_ts INTEGER NOT NULL,
    end_ts INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL,
    is_long INTEGER NOT NULL DEFAULT 0,
    thread_id TEXT,
    node_ids TEXT NOT NULL DEFAULT '[]',
    details_status TEXT NOT NULL DEFAULT 'not_requested',
    details TEXT
);
CREATE INDEX IF NOT EXISTS idx_activity_events_window ON activity_events(window_id);

CREATE TABLE IF NOT EXISTS vector_documents (
    id INTEGER PRIMARY KEY,
    ref_id INTEGER NOT NULL UNIQUE REFERENCES context_nodes(id),
    embedding BLOB,
    embedding_status TEXT NOT NULL DEFAULT 'pending',
    embedding_attempts INTEGER NOT NULL DEFAULT 0,
    embedding_next_run_at INTEGER,
    index_status TEXT NOT NULL DEFAULT 'pending',
    index_attempts INTEGER NOT NULL DEFAULT 0,
    index_next_run_at INTEGER,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_vector_embedding_status
    ON vector_documents(embedding_status, embedding_next_run_at);
CREATE INDEX IF NOT EXISTS idx_vector_index_status
    ON vector_documents(index_status, index_next_run_at);

CREATE VIRTUAL TABLE IF NOT EXISTS screenshots_fts USING fts5(
    ocr_text,
    ui_text,
    tokenize = 'unicode61'
);
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_applies_twice() {
        let store = Store::open_in_memory().unwrap();
        // Idempotent: reapplying must not error.
        store.apply_schema().unwrap();
    }

    #[test]
    fn damaged_json_degrades_with_fallback() {
        let list: Vec<String> = parse_json_list(Some("not json".into()), "test");
        assert!(list.is_empty());
        let opt: Option<Vec<String>> = parse_json_opt(Some("{broken".into()), "test");
        assert!(opt.is_none());
        let ok: Vec<String> = parse_json_list(Some("[\"a\"]".into()), "test");
        assert_eq!(ok, vec!["a".to_string()]);
    }
}
