use chrono::Utc;
use rusqlite::{params, Row};

use crate::error::{Result, StoreError};
use crate::model::{Conflict, NewConflict, ResolutionChoice, Snapshot};
use crate::sqlite::{decode_snapshot, encode_snapshot, from_millis, opt_from_millis, to_millis, SqliteStore};

/// Holds detected divergences. At most one OPEN conflict exists per key.
pub trait ConflictStore: Send + Sync {
    /// Inserts an OPEN conflict, or refreshes the snapshots of the one already
    /// open for the same key.
    fn upsert_open(&self, conflict: &NewConflict) -> Result<Conflict>;

    fn find_open(&self, key: &str) -> Result<Option<Conflict>>;

    /// Most recent conflict for `key` in any status.
    fn latest(&self, key: &str) -> Result<Option<Conflict>>;

    fn list_open(&self) -> Result<Vec<Conflict>>;

    fn count_open(&self) -> Result<u64>;

    /// Moves an OPEN conflict to RESOLVED. A `None` choice records an
    /// automatic clear. Returns `false` if the conflict was not OPEN.
    fn mark_resolved(
        &self,
        id: i64,
        choice: Option<ResolutionChoice>,
        merged: Option<&Snapshot>,
    ) -> Result<bool>;
}

const CONFLICT_COLUMNS: &str = "id, conflict_key, entity_id, source_a, source_b, source_a_snapshot, source_b_snapshot, \
     differing_fields, detected_at, status, resolution_choice, resolved_at, merged_snapshot";

fn conflict_from_row(row: &Row<'_>) -> Result<Conflict> {
    let fields: String = row.get(7)?;
    let status: String = row.get(9)?;
    let choice: Option<String> = row.get(10)?;
    Ok(Conflict {
        id: row.get(0)?,
        key: row.get(1)?,
        entity_id: row.get(2)?,
        source_a: row.get(3)?,
        source_b: row.get(4)?,
        source_a_snapshot: decode_snapshot(row.get(5)?)?,
        source_b_snapshot: decode_snapshot(row.get(6)?)?,
        differing_fields: serde_json::from_str(&fields)?,
        detected_at: from_millis(row.get(8)?)?,
        status: status.parse()?,
        resolution_choice: choice.map(|c| c.parse()).transpose()?,
        resolved_at: opt_from_millis(row.get(11)?)?,
        merged_snapshot: decode_snapshot(row.get(12)?)?,
    })
}

impl SqliteStore {
    fn query_conflicts(&self, filter: &str, key: Option<&str>) -> Result<Vec<Conflict>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts {filter}"
        ))?;
        let mut rows = match key {
            Some(key) => stmt.query([key])?,
            None => stmt.query([])?,
        };
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(conflict_from_row(row)?);
        }
        Ok(out)
    }
}

impl ConflictStore for SqliteStore {
    fn upsert_open(&self, conflict: &NewConflict) -> Result<Conflict> {
        {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            let fields = serde_json::to_string(&conflict.differing_fields)?;
            let refreshed = tx.execute(
                "UPDATE sync_conflicts
                 SET source_a = ?2, source_b = ?3, source_a_snapshot = ?4,
                     source_b_snapshot = ?5, differing_fields = ?6, entity_id = ?7
                 WHERE conflict_key = ?1 AND status = 'OPEN'",
                params![
                    conflict.key,
                    conflict.source_a,
                    conflict.source_b,
                    encode_snapshot(conflict.source_a_snapshot.as_ref())?,
                    encode_snapshot(conflict.source_b_snapshot.as_ref())?,
                    fields,
                    conflict.entity_id,
                ],
            )?;
            if refreshed == 0 {
                tx.execute(
                    "INSERT INTO sync_conflicts(conflict_key, entity_id, source_a, source_b,
                         source_a_snapshot, source_b_snapshot, differing_fields, detected_at, status)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'OPEN')",
                    params![
                        conflict.key,
                        conflict.entity_id,
                        conflict.source_a,
                        conflict.source_b,
                        encode_snapshot(conflict.source_a_snapshot.as_ref())?,
                        encode_snapshot(conflict.source_b_snapshot.as_ref())?,
                        fields,
                        to_millis(Utc::now()),
                    ],
                )?;
            }
            tx.commit()?;
        }
        self.find_open(&conflict.key)?.ok_or_else(|| {
            StoreError::InvalidData(format!("open conflict for {} vanished", conflict.key))
        })
    }

    fn find_open(&self, key: &str) -> Result<Option<Conflict>> {
        Ok(self
            .query_conflicts(
                "WHERE conflict_key = ?1 AND status = 'OPEN'",
                Some(key),
            )?
            .into_iter()
            .next())
    }

    fn latest(&self, key: &str) -> Result<Option<Conflict>> {
        Ok(self
            .query_conflicts(
                "WHERE conflict_key = ?1 ORDER BY id DESC LIMIT 1",
                Some(key),
            )?
            .into_iter()
            .next())
    }

    fn list_open(&self) -> Result<Vec<Conflict>> {
        self.query_conflicts("WHERE status = 'OPEN' ORDER BY detected_at ASC, id ASC", None)
    }

    fn count_open(&self) -> Result<u64> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM sync_conflicts WHERE status = 'OPEN'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn mark_resolved(
        &self,
        id: i64,
        choice: Option<ResolutionChoice>,
        merged: Option<&Snapshot>,
    ) -> Result<bool> {
        let updated = self.conn()?.execute(
            "UPDATE sync_conflicts
             SET status = 'RESOLVED', resolution_choice = ?2, resolved_at = ?3, merged_snapshot = ?4
             WHERE id = ?1 AND status = 'OPEN'",
            params![
                id,
                choice.map(|c| c.as_str()),
                to_millis(Utc::now()),
                encode_snapshot(merged)?,
            ],
        )?;
        Ok(updated == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResolutionStatus;
    use serde_json::json;

    fn detected(key: &str, a: &str, b: &str) -> NewConflict {
        NewConflict {
            key: key.to_string(),
            entity_id: "7".to_string(),
            source_a: "canonical".to_string(),
            source_b: "backing-store".to_string(),
            source_a_snapshot: Some(serde_json::from_value(json!({ "status": a })).unwrap()),
            source_b_snapshot: Some(serde_json::from_value(json!({ "status": b })).unwrap()),
            differing_fields: vec!["status".to_string()],
        }
    }

    #[test]
    fn redetection_updates_open_conflict_in_place() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = store
            .upsert_open(&detected("+1234567890", "ACTIVE", "SUSPENDED"))
            .unwrap();
        let second = store
            .upsert_open(&detected("+1234567890", "ACTIVE", "BARRED"))
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.detected_at, second.detected_at);
        assert_eq!(store.count_open().unwrap(), 1);
        assert_eq!(
            second.source_b_snapshot.unwrap()["status"],
            json!("BARRED")
        );
    }

    #[test]
    fn resolved_conflicts_are_retained_and_new_ones_reopen() {
        let store = SqliteStore::open_in_memory().unwrap();
        let open = store
            .upsert_open(&detected("+1", "ACTIVE", "SUSPENDED"))
            .unwrap();

        assert!(store
            .mark_resolved(open.id, Some(ResolutionChoice::UseB), None)
            .unwrap());
        assert!(!store
            .mark_resolved(open.id, Some(ResolutionChoice::UseA), None)
            .unwrap());

        let resolved = store.latest("+1").unwrap().unwrap();
        assert_eq!(resolved.status, ResolutionStatus::Resolved);
        assert_eq!(resolved.resolution_choice, Some(ResolutionChoice::UseB));
        assert!(store.find_open("+1").unwrap().is_none());

        let reopened = store
            .upsert_open(&detected("+1", "ACTIVE", "BARRED"))
            .unwrap();
        assert_ne!(reopened.id, open.id);
        assert_eq!(store.latest("+1").unwrap().unwrap().id, reopened.id);
        assert_eq!(store.list_open().unwrap().len(), 1);
    }
}
