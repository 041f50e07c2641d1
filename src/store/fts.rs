//! Full-text index over screenshot OCR output and UI snippets.
//!
//! An FTS5 virtual table keyed by screenshot rowid, BM25-scored. The
//! unicode61 tokenizer handles Latin scripts well; CJK recall is weaker,
//! which the LIKE-based keyword path compensates for.

use rusqlite::params;

use super::Store;
use crate::error::Result;
use crate::types::ScreenshotId;

/// Builds a sanitized FTS5 MATCH expression from free text.
///
/// Quoting and operator punctuation are stripped, remaining tokens are
/// quoted and AND-joined. Returns `None` when nothing searchable remains.
pub(crate) fn sanitize_match_query(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();
    let tokens: Vec<String> = cleaned
        .split_whitespace()
        .filter(|token| token.chars().count() > 1)
        .map(|token| format!("\"{token}\""))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" AND "))
    }
}

impl Store {
    /// Replaces the FTS row for a screenshot.
    pub fn upsert_fts_row(
        &self,
        screenshot_id: ScreenshotId,
        ocr_text: &str,
        ui_text: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM screenshots_fts WHERE rowid = ?1",
                params![screenshot_id],
            )?;
            conn.execute(
                "INSERT INTO screenshots_fts (rowid, ocr_text, ui_text) VALUES (?1, ?2, ?3)",
                params![screenshot_id, ocr_text, ui_text],
            )?;
            Ok(())
        })
    }

    /// Drops the FTS row for a screenshot.
    pub fn delete_fts_row(&self, screenshot_id: ScreenshotId) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM screenshots_fts WHERE rowid = ?1",
                params![screenshot_id],
            )?;
            Ok(())
        })
    }

    /// BM25-ranked screenshots matching the raw query, best first.
    pub fn fts_search(&self, raw_query: &str, limit: usize) -> Result<Vec<(ScreenshotId, f64)>> {
        let Some(match_expr) = sanitize_match_query(raw_query) else {
            return Ok(Vec::new());
        };
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT rowid, bm25(screenshots_fts) FROM screenshots_fts \
                 WHERE screenshots_fts MATCH ?1 ORDER BY bm25(screenshots_fts) ASC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![match_expr, limit as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }
}
