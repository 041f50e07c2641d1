//! Generic claim/retry state machine over a status column.
//!
//! Every scheduler drives the same row lifecycle: `pending` or `failed` rows
//! are claimed into `running` with a compare-and-swap UPDATE, then finished
//! into `succeeded`, `failed` (with backoff), or `failed_permanent`. The SQL
//! is assembled from a [`MachineSpec`] so the batch, vector-document, and
//! activity machines share one implementation.

use rusqlite::params;

use super::Store;
use crate::error::Result;

/// Column layout of one claim/retry machine.
#[derive(Debug, Clone, Copy)]
pub struct MachineSpec {
    /// Table the machine lives in.
    pub table: &'static str,
    /// Status column.
    pub status: &'static str,
    /// Attempts column.
    pub attempts: &'static str,
    /// Backoff gate column.
    pub next_run_at: &'static str,
    /// Row freshness column used for stale recovery.
    pub updated_at: &'static str,
    /// Column used as the row's age for lane splitting.
    pub age: &'static str,
    /// Extra claim precondition ANDed into fetch and claim.
    pub extra_predicate: Option<&'static str>,
}

impl MachineSpec {
    fn claimable_where(&self) -> String {
        let mut clause = format!(
            "{status} IN ('pending', 'failed') AND {attempts} < ?1 \
             AND ({next_run} IS NULL OR {next_run} <= ?2)",
            status = self.status,
            attempts = self.attempts,
            next_run = self.next_run_at,
        );
        if let Some(extra) = self.extra_predicate {
            clause.push_str(" AND ");
            clause.push_str(extra);
        }
        clause
    }
}

/// A row eligible for claiming, with the fields lane splitting needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimCandidate {
    /// Row id.
    pub id: i64,
    /// Attempts so far.
    pub attempts: u32,
    /// Row age reference, epoch ms.
    pub age_ts: i64,
}

impl Store {
    /// Fetches rows eligible for claiming, oldest first.
    pub fn fetch_claimable(
        &self,
        spec: &MachineSpec,
        max_attempts: u32,
        now_ms: i64,
        limit: usize,
    ) -> Result<Vec<ClaimCandidate>> {
        let sql = format!(
            "SELECT id, {attempts}, {age} FROM {table} WHERE {clause} ORDER BY {age} ASC LIMIT ?3",
            attempts = spec.attempts,
            age = spec.age,
            table = spec.table,
            clause = spec.claimable_where(),
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params![max_attempts, now_ms, limit as i64], |row| {
                Ok(ClaimCandidate {
                    id: row.get(0)?,
                    attempts: row.get(1)?,
                    age_ts: row.get(2)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Attempts the CAS claim; `false` means another worker won the row.
    pub fn try_claim(
        &self,
        spec: &MachineSpec,
        id: i64,
        max_attempts: u32,
        now_ms: i64,
    ) -> Result<bool> {
        let sql = format!(
            "UPDATE {table} SET {status} = 'running', {attempts} = {attempts} + 1, \
             {next_run} = NULL, {updated} = ?4 WHERE id = ?3 AND {clause}",
            table = spec.table,
            status = spec.status,
            attempts = spec.attempts,
            next_run = spec.next_run_at,
            updated = spec.updated_at,
            clause = spec.claimable_where(),
        );
        self.with_conn(|conn| {
            let changed = conn.execute(&sql, params![max_attempts, now_ms, id, now_ms])?;
            Ok(changed == 1)
        })
    }

    /// Marks a claimed row succeeded.
    pub fn complete(&self, spec: &MachineSpec, id: i64, now_ms: i64) -> Result<()> {
        let sql = format!(
            "UPDATE {table} SET {status} = 'succeeded', {next_run} = NULL, {updated} = ?2 \
             WHERE id = ?1",
            table = spec.table,
            status = spec.status,
            next_run = spec.next_run_at,
            updated = spec.updated_at,
        );
        self.with_conn(|conn| {
            conn.execute(&sql, params![id, now_ms])?;
            Ok(())
        })
    }

    /// Applies the retry policy to a claimed row that errored.
    ///
    /// Attempts were already bumped by the claim; at or past `max_attempts`
    /// the row parks as `failed_permanent` with no retry gate.
    pub fn fail(
        &self,
        spec: &MachineSpec,
        id: i64,
        max_attempts: u32,
        retry_delay_ms: u64,
        now_ms: i64,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {table} SET \
             {status} = CASE WHEN {attempts} >= ?2 THEN 'failed_permanent' ELSE 'failed' END, \
             {next_run} = CASE WHEN {attempts} >= ?2 THEN NULL ELSE ?3 END, \
             {updated} = ?4 WHERE id = ?1",
            table = spec.table,
            status = spec.status,
            attempts = spec.attempts,
            next_run = spec.next_run_at,
            updated = spec.updated_at,
        );
        self.with_conn(|conn| {
            conn.execute(
                &sql,
                params![id, max_attempts, now_ms + retry_delay_ms as i64, now_ms],
            )?;
            Ok(())
        })
    }

    /// Reverts a claimed row to `pending` without consuming the attempt,
    /// used when work is abandoned rather than failed (external abort).
    pub fn release_claim(&self, spec: &MachineSpec, id: i64, now_ms: i64) -> Result<()> {
        let sql = format!(
            "UPDATE {table} SET {status} = 'pending', {attempts} = MAX({attempts} - 1, 0), \
             {next_run} = NULL, {updated} = ?2 WHERE id = ?1 AND {status} = 'running'",
            table = spec.table,
            status = spec.status,
            attempts = spec.attempts,
            next_run = spec.next_run_at,
            updated = spec.updated_at,
        );
        self.with_conn(|conn| {
            conn.execute(&sql, params![id, now_ms])?;
            Ok(())
        })
    }

    /// Returns rows stuck in `running` to `pending`; recovers crashes.
    pub fn sweep_stale_running(
        &self,
        spec: &MachineSpec,
        stale_threshold_ms: u64,
        now_ms: i64,
    ) -> Result<usize> {
        let cutoff = now_ms - stale_threshold_ms as i64;
        let sql = format!(
            "UPDATE {table} SET {status} = 'pending', {next_run} = NULL, {updated} = ?2 \
             WHERE {status} = 'running' AND {updated} < ?1",
            table = spec.table,
            status = spec.status,
            next_run = spec.next_run_at,
            updated = spec.updated_at,
        );
        self.with_conn(|conn| {
            let swept = conn.execute(&sql, params![cutoff, now_ms])?;
            Ok(swept)
        })
    }

    /// The earliest future retry gate across claimable rows, if any.
    pub fn earliest_next_run(
        &self,
        spec: &MachineSpec,
        max_attempts: u32,
        now_ms: i64,
    ) -> Result<Option<i64>> {
        let sql = format!(
            "SELECT MIN({next_run}) FROM {table} \
             WHERE {status} IN ('pending', 'failed') AND {attempts} < ?1 AND {next_run} > ?2",
            next_run = spec.next_run_at,
            table = spec.table,
            status = spec.status,
            attempts = spec.attempts,
        );
        self.with_conn(|conn| {
            let earliest: Option<i64> =
                conn.query_row(&sql, params![max_attempts, now_ms], |row| row.get(0))?;
            Ok(earliest)
        })
    }

    /// Count of rows currently in the given status.
    pub fn count_in_status(&self, spec: &MachineSpec, status: &str) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {table} WHERE {column} = ?1",
            table = spec.table,
            column = spec.status,
        );
        self.with_conn(|conn| {
            let count: u64 = conn.query_row(&sql, params![status], |row| row.get(0))?;
            Ok(count)
        })
    }
}
