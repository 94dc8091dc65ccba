use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::model::{ChangeRecord, Page, ProcessingStatus};
use crate::sqlite::{decode_snapshot, from_millis, opt_from_millis, to_millis, SqliteStore};

/// Durable log of captured mutations with a mutable processing status.
///
/// Status writers only act on records currently in PROCESSING and report
/// whether a row changed, so repeating a call is a harmless no-op.
pub trait ChangeRecordStore: Send + Sync {
    /// PENDING and RETRY records, oldest `captured_at` first.
    ///
    /// Records queued behind a PROCESSING record of the same entity are left
    /// out. Rows that cannot be decoded are moved to FAILED with the decode
    /// error and skipped.
    fn fetch_unprocessed(&self, limit: usize) -> Result<Vec<ChangeRecord>>;

    /// Atomically moves a PENDING/RETRY record to PROCESSING and bumps its
    /// attempt count. Returns `false` when another claimant got there first.
    fn claim(&self, id: i64) -> Result<bool>;

    fn mark_success(&self, id: i64) -> Result<bool>;

    fn mark_failed(&self, id: i64, error: &str) -> Result<bool>;

    /// Releases a claimed record for a later run. Leaves `processed_at` unset.
    fn mark_retry(&self, id: i64, error: &str) -> Result<bool>;

    fn find(&self, id: i64) -> Result<Option<ChangeRecord>>;

    /// Records not yet in a terminal state, including PROCESSING ones.
    fn count_unprocessed(&self) -> Result<u64>;

    fn count_failed(&self) -> Result<u64>;

    /// `captured_at` of the oldest record not yet in a terminal state.
    fn oldest_unprocessed_at(&self) -> Result<Option<DateTime<Utc>>>;

    fn oldest_unprocessed_age(&self) -> Result<Option<Duration>> {
        Ok(self
            .oldest_unprocessed_at()?
            .map(|captured_at| Utc::now() - captured_at))
    }

    /// Paged listing of PENDING/RETRY/PROCESSING records, optionally for one table.
    fn list_unprocessed(
        &self,
        page: usize,
        size: usize,
        table: Option<&str>,
    ) -> Result<Page<ChangeRecord>>;

    /// Records left in PROCESSING since before `claimed_before`.
    fn count_stuck(&self, claimed_before: DateTime<Utc>) -> Result<u64>;

    /// Re-arms stuck PROCESSING records back to RETRY. Operator action only.
    fn rearm_stuck(&self, claimed_before: DateTime<Utc>) -> Result<u64>;

    /// Mean seconds between capture and processing for records processed since `since`.
    fn average_processing_lag(&self, since: DateTime<Utc>) -> Result<Option<f64>>;
}

const RECORD_COLUMNS: &str = "id, entity_type, op, entity_id, prior_snapshot, new_snapshot, captured_at, \
     source_tag, status, processed_at, error_detail, attempt_count, claimed_at";

fn record_from_row(row: &Row<'_>) -> Result<ChangeRecord> {
    let op: String = row.get(2)?;
    let status: String = row.get(8)?;
    Ok(ChangeRecord {
        id: row.get(0)?,
        entity_type: row.get(1)?,
        operation: op.parse()?,
        entity_id: row.get(3)?,
        prior_snapshot: decode_snapshot(row.get(4)?)?,
        new_snapshot: decode_snapshot(row.get(5)?)?,
        captured_at: from_millis(row.get(6)?)?,
        source_tag: row.get(7)?,
        status: status.parse()?,
        processed_at: opt_from_millis(row.get(9)?)?,
        error_detail: row.get(10)?,
        attempt_count: row.get(11)?,
        claimed_at: opt_from_millis(row.get(12)?)?,
    })
}

/// One page of claimable records in capture order, plus the ids of rows that
/// could not be decoded. A record is held back while an earlier record of
/// the same entity is still PROCESSING.
fn select_claimable(
    conn: &Connection,
    limit: usize,
) -> Result<(Vec<ChangeRecord>, Vec<(i64, String)>)> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RECORD_COLUMNS}
         FROM change_log c
         WHERE c.status IN ('PENDING', 'RETRY')
           AND NOT EXISTS (
               SELECT 1 FROM change_log p
               WHERE p.entity_id = c.entity_id
                 AND p.status = 'PROCESSING'
                 AND (p.captured_at < c.captured_at
                      OR (p.captured_at = c.captured_at AND p.id < c.id)))
         ORDER BY c.captured_at ASC, c.id ASC
         LIMIT ?1"
    ))?;
    let mut rows = stmt.query([limit as i64])?;
    let mut records = Vec::new();
    let mut undecodable = Vec::new();
    while let Some(row) = rows.next()? {
        let id: i64 = row.get(0)?;
        match record_from_row(row) {
            Ok(record) => records.push(record),
            Err(e) => undecodable.push((id, e.to_string())),
        }
    }
    Ok((records, undecodable))
}

impl ChangeRecordStore for SqliteStore {
    fn fetch_unprocessed(&self, limit: usize) -> Result<Vec<ChangeRecord>> {
        let conn = self.conn()?;
        loop {
            let (records, undecodable) = select_claimable(&conn, limit)?;
            if undecodable.is_empty() {
                return Ok(records);
            }
            // Each pass fails at least one row, so the loop ends.
            for (id, reason) in undecodable {
                tracing::warn!(record_id = id, "Failing undecodable change: {}", reason);
                conn.execute(
                    "UPDATE change_log
                     SET status = 'FAILED', processed_at = ?2, error_detail = ?3
                     WHERE id = ?1 AND status IN ('PENDING', 'RETRY')",
                    params![id, to_millis(Utc::now()), format!("undecodable record: {reason}")],
                )?;
            }
        }
    }

    fn claim(&self, id: i64) -> Result<bool> {
        let updated = self.conn()?.execute(
            "UPDATE change_log
             SET status = 'PROCESSING', attempt_count = attempt_count + 1, claimed_at = ?2
             WHERE id = ?1 AND status IN ('PENDING', 'RETRY')",
            params![id, to_millis(Utc::now())],
        )?;
        Ok(updated == 1)
    }

    fn mark_success(&self, id: i64) -> Result<bool> {
        let updated = self.conn()?.execute(
            "UPDATE change_log
             SET status = 'SUCCESS', processed_at = ?2, error_detail = NULL
             WHERE id = ?1 AND status = 'PROCESSING'",
            params![id, to_millis(Utc::now())],
        )?;
        Ok(updated == 1)
    }

    fn mark_failed(&self, id: i64, error: &str) -> Result<bool> {
        let updated = self.conn()?.execute(
            "UPDATE change_log
             SET status = 'FAILED', processed_at = ?2, error_detail = ?3
             WHERE id = ?1 AND status = 'PROCESSING'",
            params![id, to_millis(Utc::now()), error],
        )?;
        Ok(updated == 1)
    }

    fn mark_retry(&self, id: i64, error: &str) -> Result<bool> {
        let updated = self.conn()?.execute(
            "UPDATE change_log
             SET status = 'RETRY', error_detail = ?2, claimed_at = NULL
             WHERE id = ?1 AND status = 'PROCESSING'",
            params![id, error],
        )?;
        Ok(updated == 1)
    }

    fn find(&self, id: i64) -> Result<Option<ChangeRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM change_log WHERE id = ?1"
        ))?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(record_from_row(row)?)),
            None => Ok(None),
        }
    }

    fn count_unprocessed(&self) -> Result<u64> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM change_log WHERE status IN ('PENDING', 'RETRY', 'PROCESSING')",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn count_failed(&self) -> Result<u64> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM change_log WHERE status = ?1",
            [ProcessingStatus::Failed.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn oldest_unprocessed_at(&self) -> Result<Option<DateTime<Utc>>> {
        let millis: Option<i64> = self
            .conn()?
            .query_row(
                "SELECT MIN(captured_at) FROM change_log
                 WHERE status IN ('PENDING', 'RETRY', 'PROCESSING')",
                [],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten();
        opt_from_millis(millis)
    }

    fn list_unprocessed(
        &self,
        page: usize,
        size: usize,
        table: Option<&str>,
    ) -> Result<Page<ChangeRecord>> {
        let size = size.max(1);
        let conn = self.conn()?;
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM change_log
             WHERE status IN ('PENDING', 'RETRY', 'PROCESSING')
               AND (?1 IS NULL OR entity_type = ?1)",
            params![table],
            |row| row.get(0),
        )?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS}
             FROM change_log
             WHERE status IN ('PENDING', 'RETRY', 'PROCESSING')
               AND (?1 IS NULL OR entity_type = ?1)
             ORDER BY captured_at ASC, id ASC
             LIMIT ?2 OFFSET ?3"
        ))?;
        let mut rows = stmt.query(params![table, size as i64, (page * size) as i64])?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(record_from_row(row)?);
        }
        Ok(Page {
            items,
            page,
            size,
            total: total as u64,
        })
    }

    fn count_stuck(&self, claimed_before: DateTime<Utc>) -> Result<u64> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM change_log WHERE status = 'PROCESSING' AND claimed_at < ?1",
            [to_millis(claimed_before)],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn rearm_stuck(&self, claimed_before: DateTime<Utc>) -> Result<u64> {
        let updated = self.conn()?.execute(
            "UPDATE change_log
             SET status = 'RETRY', claimed_at = NULL,
                 error_detail = 're-armed after being stuck in PROCESSING'
             WHERE status = 'PROCESSING' AND claimed_at < ?1",
            [to_millis(claimed_before)],
        )?;
        if updated > 0 {
            tracing::warn!(count = updated, "re-armed stuck change records");
        }
        Ok(updated as u64)
    }

    fn average_processing_lag(&self, since: DateTime<Utc>) -> Result<Option<f64>> {
        let avg_millis: Option<f64> = self.conn()?.query_row(
            "SELECT AVG(processed_at - captured_at) FROM change_log
             WHERE status = 'SUCCESS' AND processed_at >= ?1",
            [to_millis(since)],
            |row| row.get(0),
        )?;
        Ok(avg_millis.map(|millis| millis / 1000.0))
    }
}
