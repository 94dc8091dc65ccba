use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::error::Result;
use crate::model::Snapshot;
use crate::sqlite::{decode_snapshot, to_millis, SqliteStore};

/// Canonical subscriber values as the owning service sees them, keyed by the
/// backing-store entity id. The MSISDN lives inside the snapshot and may
/// change or be absent from a given change record.
pub trait SubscriberStore: Send + Sync {
    fn get(&self, entity_id: &str) -> Result<Option<Snapshot>>;

    /// Replaces the stored value for `entity_id`.
    fn upsert(&self, entity_id: &str, snapshot: &Snapshot) -> Result<()>;

    fn remove(&self, entity_id: &str) -> Result<bool>;
}

impl SubscriberStore for SqliteStore {
    fn get(&self, entity_id: &str) -> Result<Option<Snapshot>> {
        let raw: Option<String> = self
            .conn()?
            .query_row(
                "SELECT data FROM subscriptions WHERE entity_id = ?1",
                [entity_id],
                |row| row.get(0),
            )
            .optional()?;
        decode_snapshot(raw)
    }

    fn upsert(&self, entity_id: &str, snapshot: &Snapshot) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO subscriptions(entity_id, data, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(entity_id) DO UPDATE SET
                data = excluded.data,
                updated_at = excluded.updated_at",
            params![entity_id, serde_json::to_string(snapshot)?, to_millis(Utc::now())],
        )?;
        Ok(())
    }

    fn remove(&self, entity_id: &str) -> Result<bool> {
        let deleted = self
            .conn()?
            .execute("DELETE FROM subscriptions WHERE entity_id = ?1", [entity_id])?;
        Ok(deleted == 1)
    }
}
