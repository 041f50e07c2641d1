//! Batch row operations, including the transactional batch builder.

use rusqlite::{params, OptionalExtension, Transaction};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{parse_json_list, Store};
use crate::error::{MnemoraError, Result};
use crate::types::{Batch, BatchDbId, ScreenshotId, SourceKey, VlmStatus};

/// Result of persisting a ready batch.
#[derive(Debug, Clone)]
pub struct BatchPersistOutcome {
    /// The owning batch row (new or reused).
    pub batch: Batch,
    /// Whether an identical batch row already existed.
    pub reused: bool,
}

/// Content-addresses a batch from its identifying fields.
///
/// The digest input is the canonical JSON of the fields in declaration
/// order, so the id is stable across processes and restarts.
pub fn batch_content_id(
    source_key: &SourceKey,
    ts_start: i64,
    ts_end: i64,
    screenshot_ids: &[ScreenshotId],
) -> String {
    #[derive(serde::Serialize)]
    struct Fingerprint<'a> {
        source_key: &'a str,
        ts_start: i64,
        ts_end: i64,
        screenshot_ids: &'a [ScreenshotId],
    }
    let canonical = serde_json::to_string(&Fingerprint {
        source_key: source_key.as_str(),
        ts_start,
        ts_end,
        screenshot_ids,
    })
    .unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    format!("batch_{}", &hex::encode(digest)[..24])
}

fn load_batch(tx: &Transaction<'_>, id: BatchDbId) -> Result<Option<Batch>> {
    let row = tx
        .query_row(
            "SELECT id, batch_id, source_key, screenshot_ids, ts_start, ts_end, vlm_status, \
             vlm_attempts, vlm_next_run_at, created_at, updated_at FROM batches WHERE id = ?1",
            params![id],
            map_batch_row,
        )
        .optional()?;
    Ok(row)
}

fn map_batch_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Batch> {
    let source_raw: String = row.get(2)?;
    let ids_raw: Option<String> = row.get(3)?;
    let status_raw: String = row.get(6)?;
    Ok(Batch {
        id: row.get(0)?,
        batch_id: row.get(1)?,
        source_key: SourceKey::parse(&source_raw).unwrap_or_else(|| SourceKey::screen("unknown")),
        screenshot_ids: parse_json_list(ids_raw, "batches.screenshot_ids"),
        ts_start: row.get(4)?,
        ts_end: row.get(5)?,
        vlm_status: VlmStatus::parse(&status_raw).unwrap_or(VlmStatus::Pending),
        vlm_attempts: row.get(7)?,
        vlm_next_run_at: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

impl Store {
    /// Creates (or reuses) the batch row owning the given screenshots.
    ///
    /// Runs as a single transaction with these guarantees:
    /// at most one batch per content fingerprint, at most one batch per
    /// screenshot, idempotent on retry. A screenshot already owned by a
    /// *different* batch fails the whole transaction.
    pub fn create_and_persist_batch(
        &self,
        source_key: &SourceKey,
        screenshot_ids: &[ScreenshotId],
        now_ms: i64,
    ) -> Result<BatchPersistOutcome> {
        if screenshot_ids.is_empty() {
            return Err(MnemoraError::InvalidArgument(
                "batch requires at least one screenshot".into(),
            ));
        }
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            // Resolve member timestamps and current ownership up front.
            let mut members: Vec<(ScreenshotId, i64, Option<BatchDbId>)> = Vec::new();
            for &id in screenshot_ids {
                let row = tx
                    .query_row(
                        "SELECT ts, batch_id FROM screenshots WHERE id = ?1",
                        params![id],
                        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<i64>>(1)?)),
                    )
                    .optional()?;
                match row {
                    Some((ts, owner)) => members.push((id, ts, owner)),
                    None => return Err(MnemoraError::NotFound("screenshot")),
                }
            }
            members.sort_by_key(|(id, ts, _)| (*ts, *id));

            let ordered_ids: Vec<ScreenshotId> = members.iter().map(|(id, _, _)| *id).collect();
            let ts_start = members.first().map(|(_, ts, _)| *ts).unwrap_or(0);
            let ts_end = members.last().map(|(_, ts, _)| *ts).unwrap_or(0);
            let content_id = batch_content_id(source_key, ts_start, ts_end, &ordered_ids);

            let inserted = tx.execute(
                "INSERT INTO batches (batch_id, source_key, screenshot_ids, ts_start, ts_end, \
                 vlm_status, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?6) \
                 ON CONFLICT(batch_id) DO NOTHING",
                params![
                    content_id,
                    source_key.as_str(),
                    serde_json::to_string(&ordered_ids)?,
                    ts_start,
                    ts_end,
                    now_ms,
                ],
            )?;
            let reused = inserted == 0;
            let batch_db_id: BatchDbId = tx.query_row(
                "SELECT id FROM batches WHERE batch_id = ?1",
                params![content_id],
                |row| row.get(0),
            )?;

            // Ownership check: a member assigned to a different row is a
            // hard conflict, and the transaction rolls back untouched.
            for (id, _, owner) in &members {
                if let Some(existing) = owner {
                    if *existing != batch_db_id {
                        return Err(MnemoraError::Conflict(format!(
                            "screenshot {id} assigned to batch {existing}"
                        )));
                    }
                }
            }

            for (id, _, owner) in &members {
                if owner.is_none() {
                    tx.execute(
                        "UPDATE screenshots SET batch_id = ?1, storage_state = 'persisted', \
                         updated_at = ?2 WHERE id = ?3 AND batch_id IS NULL",
                        params![batch_db_id, now_ms, id],
                    )?;
                }
            }

            let batch = load_batch(&tx, batch_db_id)?
                .ok_or(MnemoraError::NotFound("batch"))?;
            tx.commit()?;
            debug!(
                batch_id = %batch.batch_id,
                source_key = %source_key,
                members = ordered_ids.len(),
                reused,
                "store.batch.persisted"
            );
            Ok(BatchPersistOutcome { batch, reused })
        })
    }

    /// Loads one batch row.
    pub fn get_batch(&self, id: BatchDbId) -> Result<Option<Batch>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, batch_id, source_key, screenshot_ids, ts_start, ts_end, \
                     vlm_status, vlm_attempts, vlm_next_run_at, created_at, updated_at \
                     FROM batches WHERE id = ?1",
                    params![id],
                    map_batch_row,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Looks a batch up by its content-addressed id.
    pub fn get_batch_by_content_id(&self, content_id: &str) -> Result<Option<Batch>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, batch_id, source_key, screenshot_ids, ts_start, ts_end, \
                     vlm_status, vlm_attempts, vlm_next_run_at, created_at, updated_at \
                     FROM batches WHERE batch_id = ?1",
                    params![content_id],
                    map_batch_row,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Pending plus running batch count; the backpressure signal.
    pub fn count_unfinished_batches(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM batches WHERE vlm_status IN ('pending', 'running', 'failed')",
                [],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    /// Total batch rows.
    pub fn count_batches(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let count = conn.query_row("SELECT COUNT(*) FROM batches", [], |row| row.get(0))?;
            Ok(count)
        })
    }
}
