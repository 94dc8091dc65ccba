// ABOUTME: One synchronization pass: claim pending records, detect conflicts,
// ABOUTME: replay effects onto the canonical store, notify, and record outcomes

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde::Serialize;
use sync_store::{
    ChangeOperation, ChangeRecord, ChangeRecordStore, ConflictStore, Snapshot, SubscriberStore,
};

use crate::config::validate_batch_size;
use crate::detector::{ConflictDetector, SourceView};
use crate::dispatcher::{CacheKeys, NotificationDispatcher};
use crate::error::{Result, SyncError};
use crate::mirror::SnapshotSource;

/// Name recorded for the canonical side of a conflict.
pub const CANONICAL_SOURCE: &str = "canonical";
/// Name recorded when the record's prior snapshot is the second source.
pub const BACKING_STORE_SOURCE: &str = "backing-store";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Attempts after which a transient failure becomes FAILED.
    pub max_attempts: u32,
    /// Concurrent lanes per run; records are partitioned by entity id.
    /// Lanes are polled on the calling task and store calls block it, so
    /// lanes only overlap while awaiting webhook delivery.
    pub worker_lanes: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            worker_lanes: 1,
        }
    }
}

/// Summary of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,
    pub changes_processed: u64,
    pub successful_changes: u64,
    pub failed_changes: u64,
    pub retried_changes: u64,
    /// Records left for a later run: claimed elsewhere, released by an
    /// operator mid-run, or queued behind an unfinished earlier change of
    /// the same entity.
    pub skipped_changes: u64,
    pub conflicts_detected: u64,
    pub webhook_failures: u64,
    pub cancelled: bool,
    pub message: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum RecordOutcome {
    Succeeded { conflict: bool, webhook_failures: usize },
    Failed,
    Retried,
    Skipped,
}

#[derive(Debug, Default)]
struct LaneTally {
    processed: u64,
    succeeded: u64,
    failed: u64,
    retried: u64,
    skipped: u64,
    conflicts: u64,
    webhook_failures: u64,
    cancelled: bool,
}

impl LaneTally {
    fn add(&mut self, outcome: RecordOutcome) {
        match outcome {
            RecordOutcome::Succeeded {
                conflict,
                webhook_failures,
            } => {
                self.processed += 1;
                self.succeeded += 1;
                self.conflicts += u64::from(conflict);
                self.webhook_failures += webhook_failures as u64;
            }
            RecordOutcome::Failed => {
                self.processed += 1;
                self.failed += 1;
            }
            RecordOutcome::Retried => {
                self.processed += 1;
                self.retried += 1;
            }
            RecordOutcome::Skipped => self.skipped += 1,
        }
    }

    fn merge(&mut self, other: LaneTally) {
        self.processed += other.processed;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.retried += other.retried;
        self.skipped += other.skipped;
        self.conflicts += other.conflicts;
        self.webhook_failures += other.webhook_failures;
        self.cancelled |= other.cancelled;
    }
}

pub struct SyncOrchestrator {
    changes: Arc<dyn ChangeRecordStore>,
    conflicts: Arc<dyn ConflictStore>,
    subscribers: Arc<dyn SubscriberStore>,
    mirror: Option<Arc<dyn SnapshotSource>>,
    detector: ConflictDetector,
    dispatcher: Arc<NotificationDispatcher>,
    config: OrchestratorConfig,
}

impl SyncOrchestrator {
    pub fn new(
        changes: Arc<dyn ChangeRecordStore>,
        conflicts: Arc<dyn ConflictStore>,
        subscribers: Arc<dyn SubscriberStore>,
        dispatcher: Arc<NotificationDispatcher>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            changes,
            conflicts,
            subscribers,
            mirror: None,
            detector: ConflictDetector::default(),
            dispatcher,
            config,
        }
    }

    /// Use `mirror` as the second conflict-detection source.
    pub fn with_mirror(mut self, mirror: Arc<dyn SnapshotSource>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn with_detector(mut self, detector: ConflictDetector) -> Self {
        self.detector = detector;
        self
    }

    /// Process up to `batch_size` pending records, oldest capture first.
    ///
    /// `cancel` is checked between records; a record that has been claimed
    /// always runs to its outcome. Per-record failures are classified and
    /// counted, never returned. Only an invalid batch size or a failed fetch
    /// is an error.
    pub async fn run(&self, batch_size: usize, cancel: &AtomicBool) -> Result<SyncResult> {
        validate_batch_size(batch_size)?;
        let started = Instant::now();

        let batch = self.changes.fetch_unprocessed(batch_size)?;
        if batch.is_empty() {
            return Ok(SyncResult {
                success: true,
                message: "No pending changes".to_string(),
                duration_ms: started.elapsed().as_millis() as u64,
                ..SyncResult::default()
            });
        }
        tracing::debug!("Fetched {} pending changes", batch.len());

        let tally = if self.config.worker_lanes <= 1 {
            self.process_lane(batch, cancel).await
        } else {
            let lanes = partition_by_entity(batch, self.config.worker_lanes);
            let mut tally = LaneTally::default();
            for lane in join_all(lanes.into_iter().map(|lane| self.process_lane(lane, cancel))).await {
                tally.merge(lane);
            }
            tally
        };

        let mut message = format!(
            "Processed {} changes: {} succeeded, {} failed, {} retried",
            tally.processed, tally.succeeded, tally.failed, tally.retried
        );
        if tally.cancelled {
            message.push_str(" (cancelled)");
        }

        Ok(SyncResult {
            success: tally.failed == 0,
            changes_processed: tally.processed,
            successful_changes: tally.succeeded,
            failed_changes: tally.failed,
            retried_changes: tally.retried,
            skipped_changes: tally.skipped,
            conflicts_detected: tally.conflicts,
            webhook_failures: tally.webhook_failures,
            cancelled: tally.cancelled,
            message,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn process_lane(&self, records: Vec<ChangeRecord>, cancel: &AtomicBool) -> LaneTally {
        let mut tally = LaneTally::default();
        // Entities with an earlier change left unfinished in this run.
        let mut held: HashSet<String> = HashSet::new();
        for record in records {
            if cancel.load(Ordering::SeqCst) {
                tally.cancelled = true;
                break;
            }
            if held.contains(&record.entity_id) {
                tracing::debug!(
                    record_id = record.id,
                    entity_id = %record.entity_id,
                    "change held behind an unfinished earlier change"
                );
                tally.add(RecordOutcome::Skipped);
                continue;
            }
            let entity_id = record.entity_id.clone();
            let outcome = self.process_record(record).await;
            if matches!(outcome, RecordOutcome::Retried | RecordOutcome::Skipped) {
                held.insert(entity_id);
            }
            tally.add(outcome);
        }
        tally
    }

    async fn process_record(&self, record: ChangeRecord) -> RecordOutcome {
        match self.changes.claim(record.id) {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(record_id = record.id, "change already claimed elsewhere");
                return RecordOutcome::Skipped;
            }
            Err(e) => {
                // The record is left as fetched.
                tracing::error!(record_id = record.id, "Failed to claim change: {}", e);
                return RecordOutcome::Skipped;
            }
        }
        let attempts = record.attempt_count + 1;

        if let Err(reason) = record.validate() {
            tracing::warn!(record_id = record.id, "Malformed change: {}", reason);
            if let Err(e) = self.changes.mark_failed(record.id, &reason) {
                tracing::error!(record_id = record.id, "Failed to mark change failed: {}", e);
            }
            return RecordOutcome::Failed;
        }

        let (conflict, keys) = match self.apply(&record) {
            Ok(applied) => applied,
            Err(e) => {
                tracing::error!(record_id = record.id, "Failed to apply change: {}", e);
                return self.release(&record, attempts, &e);
            }
        };

        let report = self.dispatcher.dispatch(&record, &keys).await;

        match self.changes.mark_success(record.id) {
            Ok(false) => {
                tracing::warn!(
                    record_id = record.id,
                    "Change left PROCESSING before it could be marked successful"
                );
                RecordOutcome::Skipped
            }
            Ok(true) => {
                tracing::debug!(
                    record_id = record.id,
                    entity_id = %record.entity_id,
                    operation = %record.operation,
                    "change synchronized"
                );
                RecordOutcome::Succeeded {
                    conflict,
                    webhook_failures: report.failed.len(),
                }
            }
            Err(e) => {
                tracing::error!(record_id = record.id, "Failed to mark change successful: {}", e);
                self.release(&record, attempts, &SyncError::from(e))
            }
        }
    }

    /// Conflict detection followed by replay onto the canonical store, which
    /// is keyed by entity id. Conflicts are keyed by MSISDN. Returns whether a
    /// conflict was recorded and the keys the change is visible under.
    fn apply(&self, record: &ChangeRecord) -> Result<(bool, CacheKeys)> {
        let canonical = self.subscribers.get(&record.entity_id)?;
        let keys = CacheKeys::for_record(record, canonical.as_ref());
        let conflict = self.detect(&keys.subscriber_key, record, canonical.as_ref())?;

        match record.operation {
            ChangeOperation::Create | ChangeOperation::Update => {
                if let Some(new) = &record.new_snapshot {
                    let mut merged: Snapshot = canonical.unwrap_or_default();
                    merged.extend(new.iter().map(|(k, v)| (k.clone(), v.clone())));
                    self.subscribers.upsert(&record.entity_id, &merged)?;
                }
            }
            ChangeOperation::Delete => {
                self.subscribers.remove(&record.entity_id)?;
            }
        }
        Ok((conflict, keys))
    }

    fn detect(&self, key: &str, record: &ChangeRecord, canonical: Option<&Snapshot>) -> Result<bool> {
        let (source_b, other) = match &self.mirror {
            Some(mirror) => (mirror.name(), mirror.snapshot(key)?),
            None => match &record.prior_snapshot {
                Some(prior) => (BACKING_STORE_SOURCE, Some(prior.clone())),
                None => return Ok(false),
            },
        };

        let found = self.detector.detect(
            key,
            &record.entity_id,
            SourceView::new(CANONICAL_SOURCE, canonical),
            SourceView::new(source_b, other.as_ref()),
        );
        match found {
            Some(conflict) => {
                let stored = self.conflicts.upsert_open(&conflict)?;
                tracing::warn!(
                    key,
                    conflict_id = stored.id,
                    fields = ?stored.differing_fields,
                    "conflict detected"
                );
                Ok(true)
            }
            None => {
                if let Some(open) = self.conflicts.find_open(key)? {
                    if self.conflicts.mark_resolved(open.id, None, None)? {
                        tracing::info!(key, conflict_id = open.id, "conflict cleared, sources agree");
                    }
                }
                Ok(false)
            }
        }
    }

    /// Hand a record back after a transient failure: RETRY while attempts
    /// remain, FAILED once they are used up.
    fn release(&self, record: &ChangeRecord, attempts: u32, error: &SyncError) -> RecordOutcome {
        let detail = error.to_string();
        if attempts < self.config.max_attempts {
            if let Err(e) = self.changes.mark_retry(record.id, &detail) {
                tracing::error!(record_id = record.id, "Failed to mark change for retry: {}", e);
            }
            RecordOutcome::Retried
        } else {
            tracing::warn!(
                record_id = record.id,
                attempts,
                "Giving up on change after {} attempts",
                attempts
            );
            if let Err(e) = self.changes.mark_failed(record.id, &detail) {
                tracing::error!(record_id = record.id, "Failed to mark change failed: {}", e);
            }
            RecordOutcome::Failed
        }
    }
}

/// Split a batch into lanes so that every record of one entity lands in the
/// same lane, keeping capture order within each lane.
fn partition_by_entity(batch: Vec<ChangeRecord>, lanes: usize) -> Vec<Vec<ChangeRecord>> {
    let mut partitioned: Vec<Vec<ChangeRecord>> = (0..lanes).map(|_| Vec::new()).collect();
    for record in batch {
        let mut hasher = DefaultHasher::new();
        record.entity_id.hash(&mut hasher);
        let lane = (hasher.finish() % lanes as u64) as usize;
        partitioned[lane].push(record);
    }
    partitioned.retain(|lane| !lane.is_empty());
    partitioned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheRegistry;
    use crate::dispatcher::WebhookClient;
    use chrono::{Duration, Utc};
    use serde_json::json;
    use sync_store::{NewChange, ProcessingStatus, SqliteStore, StoreError};

    fn snapshot(value: serde_json::Value) -> Snapshot {
        serde_json::from_value(value).unwrap()
    }

    fn orchestrator(store: &Arc<SqliteStore>, config: OrchestratorConfig) -> SyncOrchestrator {
        let dispatcher = NotificationDispatcher::new(
            Vec::new(),
            Arc::new(CacheRegistry::default()),
            WebhookClient::new(Vec::new()).unwrap(),
        );
        SyncOrchestrator::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(dispatcher),
            config,
        )
    }

    /// Canonical store whose reads fail, to exercise the retry path.
    struct Unreachable;

    impl SubscriberStore for Unreachable {
        fn get(&self, _: &str) -> sync_store::Result<Option<Snapshot>> {
            Err(StoreError::Unavailable("canonical store offline".into()))
        }
        fn upsert(&self, _: &str, _: &Snapshot) -> sync_store::Result<()> {
            Err(StoreError::Unavailable("canonical store offline".into()))
        }
        fn remove(&self, _: &str) -> sync_store::Result<bool> {
            Err(StoreError::Unavailable("canonical store offline".into()))
        }
    }

    /// Canonical store whose first read fails.
    struct FailsFirstRead {
        inner: Arc<SqliteStore>,
        failed: AtomicBool,
    }

    impl SubscriberStore for FailsFirstRead {
        fn get(&self, entity_id: &str) -> sync_store::Result<Option<Snapshot>> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(StoreError::Unavailable("canonical store restarting".into()));
            }
            self.inner.get(entity_id)
        }
        fn upsert(&self, entity_id: &str, snapshot: &Snapshot) -> sync_store::Result<()> {
            self.inner.upsert(entity_id, snapshot)
        }
        fn remove(&self, entity_id: &str) -> sync_store::Result<bool> {
            self.inner.remove(entity_id)
        }
    }

    /// Change log that can refuse claims, or release a record behind the
    /// orchestrator's back just before it is marked successful.
    struct Interfering {
        inner: Arc<SqliteStore>,
        fail_claims: bool,
        release_before_success: bool,
    }

    impl ChangeRecordStore for Interfering {
        fn fetch_unprocessed(&self, limit: usize) -> sync_store::Result<Vec<ChangeRecord>> {
            self.inner.fetch_unprocessed(limit)
        }
        fn claim(&self, id: i64) -> sync_store::Result<bool> {
            if self.fail_claims {
                return Err(StoreError::Unavailable("database is locked".into()));
            }
            self.inner.claim(id)
        }
        fn mark_success(&self, id: i64) -> sync_store::Result<bool> {
            if self.release_before_success {
                self.inner.mark_retry(id, "released by operator")?;
            }
            self.inner.mark_success(id)
        }
        fn mark_failed(&self, id: i64, error: &str) -> sync_store::Result<bool> {
            self.inner.mark_failed(id, error)
        }
        fn mark_retry(&self, id: i64, error: &str) -> sync_store::Result<bool> {
            self.inner.mark_retry(id, error)
        }
        fn find(&self, id: i64) -> sync_store::Result<Option<ChangeRecord>> {
            self.inner.find(id)
        }
        fn count_unprocessed(&self) -> sync_store::Result<u64> {
            self.inner.count_unprocessed()
        }
        fn count_failed(&self) -> sync_store::Result<u64> {
            self.inner.count_failed()
        }
        fn oldest_unprocessed_at(&self) -> sync_store::Result<Option<chrono::DateTime<Utc>>> {
            self.inner.oldest_unprocessed_at()
        }
        fn list_unprocessed(
            &self,
            page: usize,
            size: usize,
            table: Option<&str>,
        ) -> sync_store::Result<sync_store::Page<ChangeRecord>> {
            self.inner.list_unprocessed(page, size, table)
        }
        fn count_stuck(&self, claimed_before: chrono::DateTime<Utc>) -> sync_store::Result<u64> {
            self.inner.count_stuck(claimed_before)
        }
        fn rearm_stuck(&self, claimed_before: chrono::DateTime<Utc>) -> sync_store::Result<u64> {
            self.inner.rearm_stuck(claimed_before)
        }
        fn average_processing_lag(
            &self,
            since: chrono::DateTime<Utc>,
        ) -> sync_store::Result<Option<f64>> {
            self.inner.average_processing_lag(since)
        }
    }

    fn with_changes(store: &Arc<SqliteStore>, changes: Interfering) -> SyncOrchestrator {
        let dispatcher = NotificationDispatcher::new(
            Vec::new(),
            Arc::new(CacheRegistry::default()),
            WebhookClient::new(Vec::new()).unwrap(),
        );
        SyncOrchestrator::new(
            Arc::new(changes),
            store.clone(),
            store.clone(),
            Arc::new(dispatcher),
            OrchestratorConfig::default(),
        )
    }

    #[test]
    fn partition_keeps_entities_together_and_ordered() {
        let store = SqliteStore::open_in_memory().unwrap();
        let base = Utc::now() - Duration::minutes(1);
        for (offset, entity) in ["a", "b", "a", "c", "a", "b"].iter().enumerate() {
            store
                .record_change(
                    &NewChange::external(
                        "subscription",
                        ChangeOperation::Update,
                        *entity,
                        None,
                        Some(snapshot(json!({ "seq": offset }))),
                    )
                    .captured_at(base + Duration::seconds(offset as i64)),
                )
                .unwrap();
        }
        let batch = store.fetch_unprocessed(10).unwrap();

        let lanes = partition_by_entity(batch, 3);
        for lane in &lanes {
            for entity in ["a", "b", "c"] {
                let seqs: Vec<i64> = lane
                    .iter()
                    .filter(|r| r.entity_id == entity)
                    .map(|r| r.new_snapshot.as_ref().unwrap()["seq"].as_i64().unwrap())
                    .collect();
                let mut sorted = seqs.clone();
                sorted.sort();
                assert_eq!(seqs, sorted);
            }
        }
        let holders = lanes
            .iter()
            .filter(|lane| lane.iter().any(|r| r.entity_id == "a"))
            .count();
        assert_eq!(holders, 1);
        assert_eq!(lanes.iter().map(Vec::len).sum::<usize>(), 6);
    }

    #[tokio::test]
    async fn rejects_out_of_range_batch_size() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let cancel = AtomicBool::new(false);
        let result = orchestrator(&store, OrchestratorConfig::default())
            .run(0, &cancel)
            .await;
        assert!(matches!(result, Err(SyncError::InvalidBatchSize(0))));
    }

    #[tokio::test]
    async fn empty_queue_is_a_successful_noop() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let cancel = AtomicBool::new(false);
        let result = orchestrator(&store, OrchestratorConfig::default())
            .run(10, &cancel)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.changes_processed, 0);
    }

    #[tokio::test]
    async fn delete_removes_canonical_value() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let current = snapshot(json!({"msisdn": "+1", "status": "ACTIVE"}));
        store.upsert("9", &current).unwrap();
        store
            .record_change(&NewChange::external(
                "subscription",
                ChangeOperation::Delete,
                "9",
                Some(current),
                None,
            ))
            .unwrap();

        let cancel = AtomicBool::new(false);
        let result = orchestrator(&store, OrchestratorConfig::default())
            .run(10, &cancel)
            .await
            .unwrap();
        assert_eq!(result.successful_changes, 1);
        assert_eq!(result.conflicts_detected, 0);
        assert!(store.get("9").unwrap().is_none());
    }

    #[tokio::test]
    async fn transient_failures_retry_then_fail() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let id = store
            .record_change(&NewChange::external(
                "subscription",
                ChangeOperation::Update,
                "5",
                None,
                Some(snapshot(json!({"status": "ACTIVE"}))),
            ))
            .unwrap();

        let dispatcher = NotificationDispatcher::new(
            Vec::new(),
            Arc::new(CacheRegistry::default()),
            WebhookClient::new(Vec::new()).unwrap(),
        );
        let orchestrator = SyncOrchestrator::new(
            store.clone(),
            store.clone(),
            Arc::new(Unreachable),
            Arc::new(dispatcher),
            OrchestratorConfig {
                max_attempts: 2,
                worker_lanes: 1,
            },
        );
        let cancel = AtomicBool::new(false);

        let first = orchestrator.run(10, &cancel).await.unwrap();
        assert_eq!(first.retried_changes, 1);
        let record = store.find(id).unwrap().unwrap();
        assert_eq!(record.status, ProcessingStatus::Retry);
        assert!(record.error_detail.unwrap().contains("offline"));

        let second = orchestrator.run(10, &cancel).await.unwrap();
        assert_eq!(second.failed_changes, 1);
        assert!(!second.success);
        let record = store.find(id).unwrap().unwrap();
        assert_eq!(record.status, ProcessingStatus::Failed);
        assert_eq!(record.attempt_count, 2);

        let third = orchestrator.run(10, &cancel).await.unwrap();
        assert_eq!(third.changes_processed, 0);
    }

    #[tokio::test]
    async fn cancellation_stops_between_records() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        for entity in ["1", "2"] {
            store
                .record_change(&NewChange::external(
                    "subscription",
                    ChangeOperation::Update,
                    entity,
                    None,
                    Some(snapshot(json!({"status": "ACTIVE"}))),
                ))
                .unwrap();
        }
        let cancel = AtomicBool::new(true);
        let result = orchestrator(&store, OrchestratorConfig::default())
            .run(10, &cancel)
            .await
            .unwrap();
        assert!(result.cancelled);
        assert_eq!(result.changes_processed, 0);
        assert_eq!(store.count_unprocessed().unwrap(), 2);
    }

    #[tokio::test]
    async fn retried_change_holds_back_later_changes_of_its_entity() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let t = Utc::now() - Duration::seconds(10);
        store
            .record_change(
                &NewChange::external(
                    "subscription",
                    ChangeOperation::Update,
                    "7",
                    None,
                    Some(snapshot(json!({"status": "ACTIVE"}))),
                )
                .captured_at(t),
            )
            .unwrap();
        let later = store
            .record_change(
                &NewChange::external(
                    "subscription",
                    ChangeOperation::Update,
                    "7",
                    None,
                    Some(snapshot(json!({"status": "SUSPENDED"}))),
                )
                .captured_at(t + Duration::seconds(1)),
            )
            .unwrap();

        let dispatcher = NotificationDispatcher::new(
            Vec::new(),
            Arc::new(CacheRegistry::default()),
            WebhookClient::new(Vec::new()).unwrap(),
        );
        let orchestrator = SyncOrchestrator::new(
            store.clone(),
            store.clone(),
            Arc::new(FailsFirstRead {
                inner: store.clone(),
                failed: AtomicBool::new(false),
            }),
            Arc::new(dispatcher),
            OrchestratorConfig::default(),
        );
        let cancel = AtomicBool::new(false);

        let first = orchestrator.run(10, &cancel).await.unwrap();
        assert_eq!(first.retried_changes, 1);
        assert_eq!(first.skipped_changes, 1);
        assert_eq!(first.successful_changes, 0);
        let held = store.find(later).unwrap().unwrap();
        assert_eq!(held.status, ProcessingStatus::Pending);
        assert_eq!(held.attempt_count, 0);
        assert!(store.get("7").unwrap().is_none());

        let second = orchestrator.run(10, &cancel).await.unwrap();
        assert_eq!(second.successful_changes, 2);
        assert_eq!(store.get("7").unwrap().unwrap()["status"], json!("SUSPENDED"));
    }

    #[tokio::test]
    async fn claim_error_leaves_record_untouched() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let id = store
            .record_change(&NewChange::external(
                "subscription",
                ChangeOperation::Update,
                "5",
                None,
                Some(snapshot(json!({"status": "ACTIVE"}))),
            ))
            .unwrap();
        let orchestrator = with_changes(
            &store,
            Interfering {
                inner: store.clone(),
                fail_claims: true,
                release_before_success: false,
            },
        );
        let cancel = AtomicBool::new(false);

        let result = orchestrator.run(10, &cancel).await.unwrap();
        assert!(result.success);
        assert_eq!(result.changes_processed, 0);
        assert_eq!(result.skipped_changes, 1);

        let record = store.find(id).unwrap().unwrap();
        assert_eq!(record.status, ProcessingStatus::Pending);
        assert_eq!(record.attempt_count, 0);
        assert!(record.error_detail.is_none());
    }

    #[tokio::test]
    async fn record_released_mid_run_is_not_counted_successful() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let id = store
            .record_change(&NewChange::external(
                "subscription",
                ChangeOperation::Update,
                "5",
                None,
                Some(snapshot(json!({"status": "ACTIVE"}))),
            ))
            .unwrap();
        let cancel = AtomicBool::new(false);

        let released = with_changes(
            &store,
            Interfering {
                inner: store.clone(),
                fail_claims: false,
                release_before_success: true,
            },
        )
        .run(10, &cancel)
        .await
        .unwrap();
        assert_eq!(released.successful_changes, 0);
        assert_eq!(released.skipped_changes, 1);
        assert_eq!(store.find(id).unwrap().unwrap().status, ProcessingStatus::Retry);

        let replayed = orchestrator(&store, OrchestratorConfig::default())
            .run(10, &cancel)
            .await
            .unwrap();
        assert_eq!(replayed.successful_changes, 1);
        assert_eq!(store.find(id).unwrap().unwrap().status, ProcessingStatus::Success);
    }
}
