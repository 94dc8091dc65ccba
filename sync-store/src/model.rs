use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

/// Open column map captured from the backing store. Values are scalar JSON.
pub type Snapshot = BTreeMap<String, Value>;

/// Snapshot field holding the subscriber's logical key.
pub const MSISDN_FIELD: &str = "msisdn";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOperation {
    #[serde(rename = "INSERT", alias = "CREATE")]
    Create,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
}

impl ChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Create => "INSERT",
            ChangeOperation::Update => "UPDATE",
            ChangeOperation::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeOperation {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "INSERT" | "CREATE" => Ok(ChangeOperation::Create),
            "UPDATE" => Ok(ChangeOperation::Update),
            "DELETE" => Ok(ChangeOperation::Delete),
            other => Err(StoreError::InvalidData(format!("unknown change op: {other}"))),
        }
    }
}

/// Processing state of a captured change.
///
/// PENDING and RETRY records are claimable. A claim moves them to PROCESSING,
/// from where they end in SUCCESS, FAILED or back in RETRY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Success,
    Failed,
    Retry,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "PENDING",
            ProcessingStatus::Processing => "PROCESSING",
            ProcessingStatus::Success => "SUCCESS",
            ProcessingStatus::Failed => "FAILED",
            ProcessingStatus::Retry => "RETRY",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingStatus::Success | ProcessingStatus::Failed)
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "PENDING" => Ok(ProcessingStatus::Pending),
            "PROCESSING" => Ok(ProcessingStatus::Processing),
            "SUCCESS" => Ok(ProcessingStatus::Success),
            "FAILED" => Ok(ProcessingStatus::Failed),
            "RETRY" => Ok(ProcessingStatus::Retry),
            other => Err(StoreError::InvalidData(format!(
                "unknown processing status: {other}"
            ))),
        }
    }
}

/// A change as written by the capture producer, before it receives an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChange {
    pub entity_type: String,
    pub operation: ChangeOperation,
    pub entity_id: String,
    pub prior_snapshot: Option<Snapshot>,
    pub new_snapshot: Option<Snapshot>,
    pub captured_at: DateTime<Utc>,
    pub source_tag: String,
}

impl NewChange {
    /// Convenience constructor for an external-database capture, stamped now.
    pub fn external(
        entity_type: impl Into<String>,
        operation: ChangeOperation,
        entity_id: impl Into<String>,
        prior_snapshot: Option<Snapshot>,
        new_snapshot: Option<Snapshot>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            operation,
            entity_id: entity_id.into(),
            prior_snapshot,
            new_snapshot,
            captured_at: Utc::now(),
            source_tag: "EXTERNAL_DB".to_string(),
        }
    }

    pub fn captured_at(mut self, captured_at: DateTime<Utc>) -> Self {
        self.captured_at = captured_at;
        self
    }
}

/// One captured mutation in the change log.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub id: i64,
    pub entity_type: String,
    pub operation: ChangeOperation,
    pub entity_id: String,
    pub prior_snapshot: Option<Snapshot>,
    pub new_snapshot: Option<Snapshot>,
    pub captured_at: DateTime<Utc>,
    pub source_tag: String,
    pub status: ProcessingStatus,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_detail: Option<String>,
    pub attempt_count: u32,
    pub claimed_at: Option<DateTime<Utc>>,
}

impl ChangeRecord {
    /// MSISDN carried by the new snapshot, else by the prior one.
    pub fn msisdn(&self) -> Option<String> {
        [&self.new_snapshot, &self.prior_snapshot]
            .into_iter()
            .flatten()
            .find_map(snapshot_msisdn)
    }

    /// Logical subscriber key: the record's MSISDN, else the one already held
    /// in `canonical` for this entity, else the entity id.
    pub fn subscriber_key(&self, canonical: Option<&Snapshot>) -> String {
        self.msisdn()
            .or_else(|| canonical.and_then(snapshot_msisdn))
            .unwrap_or_else(|| self.entity_id.clone())
    }

    /// Checks that the operation agrees with the snapshots present.
    pub fn validate(&self) -> Result<(), String> {
        match (
            self.operation,
            self.prior_snapshot.is_some(),
            self.new_snapshot.is_some(),
        ) {
            (_, false, false) => Err("record carries neither prior nor new snapshot".to_string()),
            (ChangeOperation::Create, _, false) => {
                Err("INSERT record is missing its new snapshot".to_string())
            }
            (ChangeOperation::Delete, false, _) => {
                Err("DELETE record is missing its prior snapshot".to_string())
            }
            _ => Ok(()),
        }
    }
}

pub fn snapshot_msisdn(snapshot: &Snapshot) -> Option<String> {
    snapshot.get(MSISDN_FIELD).and_then(scalar_to_string)
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Change-record shape returned by read APIs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecordWire {
    pub id: i64,
    pub table_name: String,
    pub operation: ChangeOperation,
    pub entity_id: String,
    pub old_data: Option<Snapshot>,
    pub new_data: Option<Snapshot>,
    pub changed_at: DateTime<Utc>,
    pub change_source: String,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub sync_status: ProcessingStatus,
    pub error_message: Option<String>,
}

impl From<&ChangeRecord> for ChangeRecordWire {
    fn from(record: &ChangeRecord) -> Self {
        Self {
            id: record.id,
            table_name: record.entity_type.clone(),
            operation: record.operation,
            entity_id: record.entity_id.clone(),
            old_data: record.prior_snapshot.clone(),
            new_data: record.new_snapshot.clone(),
            changed_at: record.captured_at,
            change_source: record.source_tag.clone(),
            processed: record.status.is_terminal(),
            processed_at: record.processed_at,
            sync_status: record.status,
            error_message: record.error_detail.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResolutionStatus {
    Open,
    Resolved,
}

impl ResolutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStatus::Open => "OPEN",
            ResolutionStatus::Resolved => "RESOLVED",
        }
    }
}

impl FromStr for ResolutionStatus {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "OPEN" => Ok(ResolutionStatus::Open),
            "RESOLVED" => Ok(ResolutionStatus::Resolved),
            other => Err(StoreError::InvalidData(format!(
                "unknown resolution status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionChoice {
    UseA,
    UseB,
    Merge,
}

impl ResolutionChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionChoice::UseA => "USE_A",
            ResolutionChoice::UseB => "USE_B",
            ResolutionChoice::Merge => "MERGE",
        }
    }
}

impl fmt::Display for ResolutionChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionChoice {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().replace('-', "_").as_str() {
            "USE_A" | "A" => Ok(ResolutionChoice::UseA),
            "USE_B" | "B" => Ok(ResolutionChoice::UseB),
            "MERGE" => Ok(ResolutionChoice::Merge),
            other => Err(StoreError::InvalidData(format!(
                "unknown resolution choice: {other}"
            ))),
        }
    }
}

/// A divergence found by the detector, not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewConflict {
    pub key: String,
    /// Entity whose canonical value a resolution rewrites.
    pub entity_id: String,
    pub source_a: String,
    pub source_b: String,
    pub source_a_snapshot: Option<Snapshot>,
    pub source_b_snapshot: Option<Snapshot>,
    pub differing_fields: Vec<String>,
}

/// A persisted divergence between two named sources for one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: i64,
    pub key: String,
    pub entity_id: String,
    pub source_a: String,
    pub source_b: String,
    pub source_a_snapshot: Option<Snapshot>,
    pub source_b_snapshot: Option<Snapshot>,
    pub differing_fields: Vec<String>,
    pub detected_at: DateTime<Utc>,
    pub status: ResolutionStatus,
    pub resolution_choice: Option<ResolutionChoice>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub merged_snapshot: Option<Snapshot>,
}

impl Conflict {
    pub fn is_open(&self) -> bool {
        self.status == ResolutionStatus::Open
    }
}

/// One page of a paged listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub size: usize,
    pub total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(value: Value) -> Snapshot {
        serde_json::from_value(value).unwrap()
    }

    fn record(
        operation: ChangeOperation,
        prior: Option<Snapshot>,
        new: Option<Snapshot>,
    ) -> ChangeRecord {
        ChangeRecord {
            id: 1,
            entity_type: "subscription".into(),
            operation,
            entity_id: "42".into(),
            prior_snapshot: prior,
            new_snapshot: new,
            captured_at: Utc::now(),
            source_tag: "EXTERNAL_DB".into(),
            status: ProcessingStatus::Pending,
            processed_at: None,
            error_detail: None,
            attempt_count: 0,
            claimed_at: None,
        }
    }

    #[test]
    fn subscriber_key_prefers_msisdn() {
        let rec = record(
            ChangeOperation::Update,
            Some(snapshot(json!({"msisdn": "+100"}))),
            Some(snapshot(json!({"msisdn": "+200", "status": "ACTIVE"}))),
        );
        assert_eq!(rec.subscriber_key(None), "+200");

        let rec = record(
            ChangeOperation::Update,
            None,
            Some(snapshot(json!({"status": "ACTIVE"}))),
        );
        assert_eq!(rec.msisdn(), None);
        assert_eq!(rec.subscriber_key(None), "42");

        let canonical = snapshot(json!({"msisdn": "+300", "status": "ACTIVE"}));
        assert_eq!(rec.subscriber_key(Some(&canonical)), "+300");
    }

    #[test]
    fn validate_rejects_inconsistent_records() {
        assert!(record(ChangeOperation::Update, None, None).validate().is_err());
        assert!(record(ChangeOperation::Create, Some(Snapshot::new()), None)
            .validate()
            .is_err());
        assert!(record(ChangeOperation::Delete, None, Some(Snapshot::new()))
            .validate()
            .is_err());
        assert!(record(ChangeOperation::Update, None, Some(Snapshot::new()))
            .validate()
            .is_ok());
    }

    #[test]
    fn operation_parses_wire_and_legacy_names() {
        assert_eq!(
            "insert".parse::<ChangeOperation>().unwrap(),
            ChangeOperation::Create
        );
        assert_eq!(
            "CREATE".parse::<ChangeOperation>().unwrap(),
            ChangeOperation::Create
        );
        assert!("upsert".parse::<ChangeOperation>().is_err());
    }

    #[test]
    fn wire_shape_uses_camel_case() {
        let rec = record(
            ChangeOperation::Update,
            None,
            Some(snapshot(json!({"status": "SUSPENDED"}))),
        );
        let wire = serde_json::to_value(ChangeRecordWire::from(&rec)).unwrap();
        assert_eq!(wire["tableName"], "subscription");
        assert_eq!(wire["operation"], "UPDATE");
        assert_eq!(wire["syncStatus"], "PENDING");
        assert_eq!(wire["processed"], false);
        assert_eq!(wire["newData"]["status"], "SUSPENDED");
        assert!(wire["oldData"].is_null());
    }

    #[test]
    fn resolution_choice_parses_loosely() {
        assert_eq!(
            "use-b".parse::<ResolutionChoice>().unwrap(),
            ResolutionChoice::UseB
        );
        assert_eq!(
            "merge".parse::<ResolutionChoice>().unwrap(),
            ResolutionChoice::Merge
        );
    }
}
