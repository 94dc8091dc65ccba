// ABOUTME: Field-level divergence check between two views of one subscriber
// ABOUTME: Compares impi, impu and status, tolerating fields absent on both sides

use serde_json::Value;
use sync_store::{NewConflict, Snapshot};

/// Fields whose disagreement constitutes a conflict.
pub const COMPARED_FIELDS: [&str; 3] = ["impi", "impu", "status"];

/// One named source's current value for a key. `None` means the source
/// holds no record for the key.
#[derive(Debug, Clone, Copy)]
pub struct SourceView<'a> {
    pub name: &'a str,
    pub snapshot: Option<&'a Snapshot>,
}

impl<'a> SourceView<'a> {
    pub fn new(name: &'a str, snapshot: Option<&'a Snapshot>) -> Self {
        Self { name, snapshot }
    }
}

#[derive(Debug, Clone)]
pub struct ConflictDetector {
    fields: Vec<String>,
}

impl Default for ConflictDetector {
    fn default() -> Self {
        Self::with_fields(COMPARED_FIELDS)
    }
}

impl ConflictDetector {
    pub fn with_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the divergence between `a` and `b` for `key` (held canonically
    /// under `entity_id`), or `None` when they agree on every compared field.
    pub fn detect(
        &self,
        key: &str,
        entity_id: &str,
        a: SourceView<'_>,
        b: SourceView<'_>,
    ) -> Option<NewConflict> {
        let differing_fields: Vec<String> = self
            .fields
            .iter()
            .filter(|field| {
                let left = a.snapshot.and_then(|s| comparable(s, field));
                let right = b.snapshot.and_then(|s| comparable(s, field));
                left != right
            })
            .cloned()
            .collect();

        if differing_fields.is_empty() {
            return None;
        }

        Some(NewConflict {
            key: key.to_string(),
            entity_id: entity_id.to_string(),
            source_a: a.name.to_string(),
            source_b: b.name.to_string(),
            source_a_snapshot: a.snapshot.cloned(),
            source_b_snapshot: b.snapshot.cloned(),
            differing_fields,
        })
    }
}

/// Normalized value of a field; null and missing compare equal.
fn comparable(snapshot: &Snapshot, field: &str) -> Option<String> {
    match snapshot.get(field)? {
        Value::Null => None,
        Value::String(s) => Some(s.trim().to_string()),
        other => Some(other.to_string()),
    }
}
