// ABOUTME: Administrative facade over the scheduler, stores and dispatcher
// ABOUTME: Backs both the gRPC admin service and the one-shot CLI commands

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sync_store::{
    ChangeRecordStore, ChangeRecordWire, Conflict, ConflictStore, Page, ResolutionChoice, Snapshot,
};

use crate::dispatcher::{NotificationDispatcher, WebhookTestResult};
use crate::error::{Result, SyncError};
use crate::orchestrator::SyncResult;
use crate::resolution::{ConflictResolutionService, ResolveAllReport, ResolveOutcome};
use crate::scheduler::{ChangeNotification, SyncScheduler};

const LAG_WINDOW_SECS: i64 = 3600;
pub const MAX_PAGE_SIZE: usize = 500;

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub max_unprocessed: u64,
    pub max_lag: Duration,
    /// PROCESSING longer than this counts as stuck.
    pub stuck_after: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_unprocessed: 1000,
            max_lag: Duration::from_secs(300),
            stuck_after: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub enabled: bool,
    pub in_progress: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub unprocessed_count: u64,
    pub failed_count: u64,
    pub stuck_count: u64,
    pub open_conflicts: u64,
    pub processing_lag_seconds: f64,
    /// Seconds since the oldest unprocessed record was captured.
    pub oldest_unprocessed_age: Option<i64>,
    pub run_count: u64,
    pub cumulative_processed: u64,
    pub cumulative_failed: u64,
    pub webhook_failures: u64,
    pub healthy: bool,
}

pub struct AdminService {
    scheduler: Arc<SyncScheduler>,
    changes: Arc<dyn ChangeRecordStore>,
    conflicts: Arc<dyn ConflictStore>,
    resolver: ConflictResolutionService,
    dispatcher: Arc<NotificationDispatcher>,
    health: HealthThresholds,
}

impl AdminService {
    pub fn new(
        scheduler: Arc<SyncScheduler>,
        changes: Arc<dyn ChangeRecordStore>,
        conflicts: Arc<dyn ConflictStore>,
        resolver: ConflictResolutionService,
        dispatcher: Arc<NotificationDispatcher>,
        health: HealthThresholds,
    ) -> Self {
        Self {
            scheduler,
            changes,
            conflicts,
            resolver,
            dispatcher,
            health,
        }
    }

    pub fn scheduler(&self) -> &Arc<SyncScheduler> {
        &self.scheduler
    }

    pub async fn trigger_sync(&self, batch_size: usize) -> Result<SyncResult> {
        self.scheduler.trigger_manual(batch_size).await
    }

    pub fn status(&self) -> Result<SyncStatus> {
        let stats = self.scheduler.statistics();
        let now = Utc::now();
        let stuck_before = now - chrono::Duration::seconds(self.health.stuck_after.as_secs() as i64);

        let unprocessed_count = self.changes.count_unprocessed()?;
        let stuck_count = self.changes.count_stuck(stuck_before)?;
        let oldest_unprocessed_age = self
            .changes
            .oldest_unprocessed_age()?
            .map(|age| age.num_seconds().max(0));
        let processing_lag_seconds = self
            .changes
            .average_processing_lag(now - chrono::Duration::seconds(LAG_WINDOW_SECS))?
            .unwrap_or(0.0);

        let healthy = unprocessed_count <= self.health.max_unprocessed
            && oldest_unprocessed_age.map_or(true, |age| age as u64 <= self.health.max_lag.as_secs())
            && stuck_count == 0;

        Ok(SyncStatus {
            enabled: stats.enabled,
            in_progress: stats.in_progress,
            last_sync_time: stats.last_run_completed_at,
            last_error: stats.last_error,
            unprocessed_count,
            failed_count: self.changes.count_failed()?,
            stuck_count,
            open_conflicts: self.conflicts.count_open()?,
            processing_lag_seconds,
            oldest_unprocessed_age,
            run_count: stats.run_count,
            cumulative_processed: stats.cumulative_processed,
            cumulative_failed: stats.cumulative_failed,
            webhook_failures: stats.webhook_failures,
            healthy,
        })
    }

    pub fn invalidate_cache(&self, cache: &str, key: Option<&str>) -> Result<()> {
        if cache.trim().is_empty() {
            return Err(SyncError::Config("cache name is required".into()));
        }
        self.dispatcher.invalidate(cache, key);
        tracing::info!(cache, key = ?key, "cache invalidated by operator");
        Ok(())
    }

    pub fn toggle_scheduler(&self, enabled: bool) {
        self.scheduler.set_enabled(enabled);
    }

    /// One page of unprocessed changes. Pages count from 0.
    pub fn list_unprocessed(
        &self,
        page: usize,
        size: usize,
        table: Option<&str>,
    ) -> Result<Page<ChangeRecordWire>> {
        let size = size.clamp(1, MAX_PAGE_SIZE);
        let listed = self.changes.list_unprocessed(page, size, table)?;
        Ok(Page {
            items: listed.items.iter().map(ChangeRecordWire::from).collect(),
            page: listed.page,
            size: listed.size,
            total: listed.total,
        })
    }

    /// Probe `url`, or every configured endpoint when `None`.
    pub async fn test_webhook(&self, url: Option<&str>) -> Vec<WebhookTestResult> {
        match url {
            Some(url) => vec![self.dispatcher.test_endpoint(url).await],
            None => self.dispatcher.test_all().await,
        }
    }

    pub fn list_conflicts(&self) -> Result<Vec<Conflict>> {
        self.resolver.list_open()
    }

    pub fn resolve_conflict(
        &self,
        key: &str,
        choice: ResolutionChoice,
        merged: Option<Snapshot>,
    ) -> Result<ResolveOutcome> {
        self.resolver.resolve(key, choice, merged)
    }

    pub fn resolve_all_conflicts(&self, choice: ResolutionChoice) -> Result<ResolveAllReport> {
        self.resolver.resolve_all(choice)
    }

    /// Move records stuck in PROCESSING back to RETRY.
    pub fn rearm_stuck(&self) -> Result<u64> {
        let before = Utc::now() - chrono::Duration::seconds(self.health.stuck_after.as_secs() as i64);
        Ok(self.changes.rearm_stuck(before)?)
    }

    /// Queue a push hint. Returns false when the hint was dropped because the
    /// buffer is full.
    pub fn notify_change(&self, notification: ChangeNotification) -> bool {
        self.scheduler.notifier().try_send(notification).is_ok()
    }
}
