//! Screenshot row operations.

use rusqlite::{params, Row};
use serde::Serialize;
use tracing::info;

use super::Store;
use crate::error::Result;
use crate::phash::PHash;
use crate::types::{Screenshot, ScreenshotId, SourceKey, StorageState};

/// Insert payload for an accepted capture.
#[derive(Debug, Clone)]
pub struct NewScreenshot {
    /// Capture source.
    pub source_key: SourceKey,
    /// Capture timestamp, epoch ms.
    pub ts: i64,
    /// Perceptual hash.
    pub phash: PHash,
    /// Image file location.
    pub file_path: Option<String>,
    /// Best-effort owning application name.
    pub app_hint: Option<String>,
    /// Window title at capture time.
    pub window_title: Option<String>,
    /// Pixel width.
    pub width: Option<u32>,
    /// Pixel height.
    pub height: Option<u32>,
    /// Retention horizon, epoch ms.
    pub retention_expires_at: Option<i64>,
}

impl NewScreenshot {
    /// Minimal payload for tests.
    #[doc(hidden)]
    pub fn for_test(source_key: SourceKey, ts: i64) -> Self {
        Self {
            source_key,
            ts,
            phash: PHash::from_bits(ts as u64),
            file_path: None,
            app_hint: None,
            window_title: None,
            width: None,
            height: None,
            retention_expires_at: None,
        }
    }
}

/// Evidence row handed to the UI alongside search results.
#[derive(Debug, Clone, Serialize)]
pub struct ScreenshotEvidence {
    /// Screenshot row id.
    pub screenshot_id: ScreenshotId,
    /// Capture timestamp, epoch ms.
    pub ts: i64,
    /// Best-effort owning application name.
    pub app_hint: Option<String>,
    /// Window title at capture time.
    pub window_title: Option<String>,
}

/// Outcome of one retention sweep.
#[derive(Debug, Clone, Serialize)]
pub struct RetentionReport {
    /// Rows whose horizon was checked.
    pub scanned: u64,
    /// Rows tombstoned this sweep.
    pub tombstoned: u64,
    /// Image files released for deletion.
    pub released_files: Vec<String>,
    /// Sweep duration.
    pub duration_ms: f64,
}

fn row_to_screenshot(row: &Row<'_>) -> rusqlite::Result<Screenshot> {
    let source_raw: String = row.get(1)?;
    let phash_raw: String = row.get(3)?;
    let state_raw: String = row.get(9)?;
    Ok(Screenshot {
        id: row.get(0)?,
        source_key: SourceKey::parse(&source_raw)
            .unwrap_or_else(|| SourceKey::screen("unknown")),
        ts: row.get(2)?,
        phash: PHash::from_hex(&phash_raw).unwrap_or_else(|_| PHash::from_bits(0)),
        file_path: row.get(4)?,
        app_hint: row.get(5)?,
        window_title: row.get(6)?,
        width: row.get(7)?,
        height: row.get(8)?,
        storage_state: StorageState::parse(&state_raw).unwrap_or(StorageState::Ephemeral),
        retention_expires_at: row.get(10)?,
        batch_id: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

const SCREENSHOT_COLUMNS: &str = "id, source_key, ts, phash, file_path, app_hint, window_title, \
     width, height, storage_state, retention_expires_at, batch_id, created_at, updated_at";

impl Store {
    /// Persists an accepted capture and returns its row id.
    pub fn insert_screenshot(&self, new: &NewScreenshot, now_ms: i64) -> Result<ScreenshotId> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO screenshots (source_key, ts, phash, file_path, app_hint, \
                 window_title, width, height, storage_state, retention_expires_at, \
                 created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'ephemeral', ?9, ?10, ?10)",
                params![
                    new.source_key.as_str(),
                    new.ts,
                    new.phash.to_hex(),
                    new.file_path,
                    new.app_hint,
                    new.window_title,
                    new.width,
                    new.height,
                    new.retention_expires_at,
                    now_ms,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Loads one screenshot.
    pub fn get_screenshot(&self, id: ScreenshotId) -> Result<Option<Screenshot>> {
        let sql = format!("SELECT {SCREENSHOT_COLUMNS} FROM screenshots WHERE id = ?1");
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let mut rows = stmt.query_map(params![id], row_to_screenshot)?;
            match rows.next() {
                Some(row) => Ok(Some(row?)),
                None => Ok(None),
            }
        })
    }

    /// Loads a set of screenshots, capture order preserved.
    pub fn screenshots_by_ids(&self, ids: &[ScreenshotId]) -> Result<Vec<Screenshot>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT {SCREENSHOT_COLUMNS} FROM screenshots WHERE id IN ({placeholders}) \
             ORDER BY ts ASC"
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(ids.iter()), row_to_screenshot)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Evidence payloads for the given screenshots, newest first.
    ///
    /// Tombstoned rows are skipped: their pixels are gone.
    pub fn evidence_for_screenshots(
        &self,
        ids: &[ScreenshotId],
    ) -> Result<Vec<ScreenshotEvidence>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT id, ts, app_hint, window_title FROM screenshots \
             WHERE id IN ({placeholders}) AND storage_state != 'deleted' ORDER BY ts DESC"
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(ids.iter()), |row| {
                Ok(ScreenshotEvidence {
                    screenshot_id: row.get(0)?,
                    ts: row.get(1)?,
                    app_hint: row.get(2)?,
                    window_title: row.get(3)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Total screenshot rows (including tombstones).
    pub fn count_screenshots(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let count =
                conn.query_row("SELECT COUNT(*) FROM screenshots", [], |row| row.get(0))?;
            Ok(count)
        })
    }

    /// Tombstones screenshots whose retention horizon has passed.
    ///
    /// The row survives (searches keep their joins); the file path is
    /// released to the caller for unlinking and the FTS row is dropped.
    pub fn sweep_expired_retention(&self, now_ms: i64) -> Result<RetentionReport> {
        let start = std::time::Instant::now();
        let (scanned, expired): (u64, Vec<(ScreenshotId, Option<String>)>) =
            self.with_conn(|conn| {
                let scanned: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM screenshots \
                     WHERE retention_expires_at IS NOT NULL AND storage_state != 'deleted'",
                    [],
                    |row| row.get(0),
                )?;
                let mut stmt = conn.prepare_cached(
                    "SELECT id, file_path FROM screenshots \
                     WHERE retention_expires_at IS NOT NULL AND retention_expires_at <= ?1 \
                     AND storage_state != 'deleted'",
                )?;
                let rows = stmt.query_map(params![now_ms], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?))
                })?;
                let mut expired = Vec::new();
                for row in rows {
                    expired.push(row?);
                }
                Ok((scanned, expired))
            })?;

        let mut released_files = Vec::new();
        for (id, file_path) in &expired {
            self.with_conn(|conn| {
                conn.execute(
                    "UPDATE screenshots SET storage_state = 'deleted', file_path = NULL, \
                     updated_at = ?2 WHERE id = ?1",
                    params![id, now_ms],
                )?;
                Ok(())
            })?;
            self.delete_fts_row(*id)?;
            if let Some(path) = file_path {
                released_files.push(path.clone());
            }
        }

        let report = RetentionReport {
            scanned,
            tombstoned: expired.len() as u64,
            released_files,
            duration_ms: start.elapsed().as_secs_f64() * 1_000.0,
        };
        if report.tombstoned > 0 {
            info!(
                scanned = report.scanned,
                tombstoned = report.tombstoned,
                duration_ms = report.duration_ms,
                "store.retention.swept"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_load_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let new = NewScreenshot {
            source_key: SourceKey::window("42"),
            ts: 5_000,
            phash: PHash::from_hex("00ff00ff00ff00ff").unwrap(),
            file_path: Some("/tmp/shot.png".into()),
            app_hint: Some("vscode".into()),
            window_title: Some("main.rs".into()),
            width: Some(1920),
            height: Some(1080),
            retention_expires_at: Some(100_000),
        };
        let id = store.insert_screenshot(&new, 5_001).unwrap();
        let loaded = store.get_screenshot(id).unwrap().unwrap();
        assert_eq!(loaded.source_key, new.source_key);
        assert_eq!(loaded.phash, new.phash);
        assert_eq!(loaded.storage_state, StorageState::Ephemeral);
        assert_eq!(loaded.batch_id, None);
        assert_eq!(loaded.created_at, 5_001);
    }

    #[test]
    fn retention_sweep_tombstones_and_releases_files() {
        let store = Store::open_in_memory().unwrap();
        let mut fresh = NewScreenshot::for_test(SourceKey::screen("1"), 1_000);
        fresh.retention_expires_at = Some(10_000);
        fresh.file_path = Some("/tmp/a.png".into());
        let expired_id = store.insert_screenshot(&fresh, 1_000).unwrap();

        let mut keep = NewScreenshot::for_test(SourceKey::screen("1"), 2_000);
        keep.retention_expires_at = Some(99_000);
        let kept_id = store.insert_screenshot(&keep, 2_000).unwrap();

        let report = store.sweep_expired_retention(50_000).unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.tombstoned, 1);
        assert_eq!(report.released_files, vec!["/tmp/a.png".to_string()]);

        let gone = store.get_screenshot(expired_id).unwrap().unwrap();
        assert_eq!(gone.storage_state, StorageState::Deleted);
        assert_eq!(gone.file_path, None);
        let kept = store.get_screenshot(kept_id).unwrap().unwrap();
        assert_eq!(kept.storage_state, StorageState::Ephemeral);

        // Evidence skips tombstones.
        let evidence = store
            .evidence_for_screenshots(&[expired_id, kept_id])
            .unwrap();
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].screenshot_id, kept_id);
    }
}
