// ABOUTME: Drives the orchestrator on a timer, on push notifications and on demand
// ABOUTME: Enforces single-flight runs and keeps process-wide run statistics

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};

use crate::error::{Result, SyncError};
use crate::orchestrator::{SyncOrchestrator, SyncResult};

const NOTIFICATION_BUFFER: usize = 256;

/// Push hint from the capture producer. Carries no data the run needs; it
/// only asks for an early run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    pub operation: String,
    pub entity_id: String,
    pub table: String,
}

impl ChangeNotification {
    pub fn parse(payload: &str) -> Result<Self> {
        serde_json::from_str(payload)
            .map_err(|e| SyncError::Config(format!("invalid change notification: {}", e)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTrigger {
    Timer,
    Notification,
    Manual,
}

impl RunTrigger {
    fn as_str(&self) -> &'static str {
        match self {
            RunTrigger::Timer => "timer",
            RunTrigger::Notification => "notification",
            RunTrigger::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone)]
struct SchedulerState {
    enabled: bool,
    in_progress: bool,
    last_run_started_at: Option<DateTime<Utc>>,
    last_run_completed_at: Option<DateTime<Utc>>,
    run_count: u64,
    cumulative_processed: u64,
    cumulative_failed: u64,
    cumulative_webhook_failures: u64,
    last_error: Option<String>,
    last_result: Option<SyncResult>,
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self {
            enabled: true,
            in_progress: false,
            last_run_started_at: None,
            last_run_completed_at: None,
            run_count: 0,
            cumulative_processed: 0,
            cumulative_failed: 0,
            cumulative_webhook_failures: 0,
            last_error: None,
            last_result: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatistics {
    pub enabled: bool,
    pub in_progress: bool,
    pub run_count: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_completed_at: Option<DateTime<Utc>>,
    pub cumulative_processed: u64,
    pub cumulative_failed: u64,
    pub webhook_failures: u64,
    pub last_error: Option<String>,
    pub last_result: Option<SyncResult>,
}

/// Clears `in_progress` when a run ends, however it ends.
struct RunGuard<'a> {
    state: &'a Mutex<SchedulerState>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.in_progress = false;
        state.last_run_completed_at = Some(Utc::now());
    }
}

pub struct SyncScheduler {
    orchestrator: Arc<SyncOrchestrator>,
    state: Mutex<SchedulerState>,
    poll_interval: Duration,
    batch_size: usize,
    cancel: AtomicBool,
    notify_tx: mpsc::Sender<ChangeNotification>,
    notify_rx: Mutex<Option<mpsc::Receiver<ChangeNotification>>>,
}

impl SyncScheduler {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, poll_interval: Duration, batch_size: usize) -> Self {
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFICATION_BUFFER);
        Self {
            orchestrator,
            state: Mutex::new(SchedulerState::default()),
            poll_interval,
            batch_size,
            cancel: AtomicBool::new(false),
            notify_tx,
            notify_rx: Mutex::new(Some(notify_rx)),
        }
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state().enabled = enabled;
        tracing::info!(enabled, "scheduler toggled");
    }

    pub fn is_enabled(&self) -> bool {
        self.state().enabled
    }

    /// Batch size used by automatic runs.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn is_running(&self) -> bool {
        self.state().in_progress
    }

    pub fn statistics(&self) -> SchedulerStatistics {
        let state = self.state();
        SchedulerStatistics {
            enabled: state.enabled,
            in_progress: state.in_progress,
            run_count: state.run_count,
            last_run_at: state.last_run_started_at,
            last_run_completed_at: state.last_run_completed_at,
            cumulative_processed: state.cumulative_processed,
            cumulative_failed: state.cumulative_failed,
            webhook_failures: state.cumulative_webhook_failures,
            last_error: state.last_error.clone(),
            last_result: state.last_result.clone(),
        }
    }

    /// Sender for push hints. A full buffer drops the hint; the poll timer
    /// still picks the change up.
    pub fn notifier(&self) -> mpsc::Sender<ChangeNotification> {
        self.notify_tx.clone()
    }

    /// Ask an active run to stop after its current record.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Operator-initiated run. Ignores the enabled flag; rejects overlap.
    pub async fn trigger_manual(&self, batch_size: usize) -> Result<SyncResult> {
        crate::config::validate_batch_size(batch_size)?;
        let guard = self.begin()?;
        self.execute(guard, RunTrigger::Manual, batch_size).await
    }

    /// Automatic run from the timer or a notification. Returns `None` when
    /// skipped because the scheduler is disabled or a run is active.
    pub async fn tick(&self, trigger: RunTrigger) -> Option<Result<SyncResult>> {
        if !self.is_enabled() {
            tracing::debug!(trigger = trigger.as_str(), "scheduler disabled, skipping run");
            return None;
        }
        let guard = match self.begin() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!(trigger = trigger.as_str(), "run already in progress, skipping");
                return None;
            }
        };
        Some(self.execute(guard, trigger, self.batch_size).await)
    }

    fn begin(&self) -> Result<RunGuard<'_>> {
        let mut state = self.state();
        if state.in_progress {
            return Err(SyncError::AlreadyInProgress);
        }
        state.in_progress = true;
        state.last_run_started_at = Some(Utc::now());
        Ok(RunGuard { state: &self.state })
    }

    async fn execute(
        &self,
        guard: RunGuard<'_>,
        trigger: RunTrigger,
        batch_size: usize,
    ) -> Result<SyncResult> {
        let result = self.orchestrator.run(batch_size, &self.cancel).await;

        {
            let mut state = self.state();
            state.run_count += 1;
            match &result {
                Ok(summary) => {
                    state.cumulative_processed += summary.changes_processed;
                    state.cumulative_failed += summary.failed_changes;
                    state.cumulative_webhook_failures += summary.webhook_failures;
                    state.last_error = None;
                    state.last_result = Some(summary.clone());
                }
                Err(e) => state.last_error = Some(e.to_string()),
            }
        }
        drop(guard);

        match &result {
            Ok(summary) if summary.changes_processed > 0 || summary.skipped_changes > 0 => {
                tracing::info!(
                    trigger = trigger.as_str(),
                    processed = summary.changes_processed,
                    succeeded = summary.successful_changes,
                    failed = summary.failed_changes,
                    retried = summary.retried_changes,
                    conflicts = summary.conflicts_detected,
                    duration_ms = summary.duration_ms,
                    "sync run completed"
                );
            }
            Ok(_) => tracing::debug!(trigger = trigger.as_str(), "sync run found nothing to do"),
            Err(e) => tracing::error!(trigger = trigger.as_str(), "Sync run failed: {}", e),
        }
        result
    }

    /// Run until `shutdown` fires. Timer ticks and notifications both go
    /// through the single-flight guard. On shutdown an active run is asked
    /// to stop between records and is awaited.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut notifications = self
            .notify_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.cancel.store(false, Ordering::SeqCst);

        tracing::info!(
            "Starting SyncScheduler with poll_interval={:?}, batch_size={}",
            self.poll_interval,
            self.batch_size
        );

        loop {
            let trigger = tokio::select! {
                biased; // Check shutdown first

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping SyncScheduler");
                    break;
                }
                _ = ticker.tick() => RunTrigger::Timer,
                received = async {
                    match notifications.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending::<Option<ChangeNotification>>().await,
                    }
                } => {
                    if let Some(hint) = received {
                        tracing::debug!(entity_id = %hint.entity_id, table = %hint.table, "change notification received");
                    }
                    // Hints queued so far are covered by this run.
                    if let Some(rx) = notifications.as_mut() {
                        while rx.try_recv().is_ok() {}
                    }
                    RunTrigger::Notification
                }
            };

            let run = self.tick(trigger);
            tokio::pin!(run);
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received during sync run, finishing current record");
                    self.cancel();
                    let _ = (&mut run).await;
                    break;
                }
                _ = &mut run => {}
            }
        }

        // Hand the receiver back so a later run() keeps listening.
        if let Some(rx) = notifications {
            *self.notify_rx.lock().unwrap_or_else(PoisonError::into_inner) = Some(rx);
        }
        Ok(())
    }
}
