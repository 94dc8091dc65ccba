// ABOUTME: Operator-driven resolution of open conflicts
// ABOUTME: Writes the chosen value back to the conflicting entity and marks the conflict resolved

use std::sync::Arc;

use serde::Serialize;
use sync_store::{Conflict, ConflictStore, ResolutionChoice, Snapshot, SubscriberStore};

use crate::error::{Result, SyncError};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveOutcome {
    pub key: String,
    pub conflict_id: i64,
    /// True when the conflict was already resolved and nothing changed.
    pub already_resolved: bool,
    pub canonical: Option<Snapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveAllReport {
    pub resolved: u64,
    /// (key, error) for conflicts that could not be resolved.
    pub failures: Vec<(String, String)>,
}

pub struct ConflictResolutionService {
    conflicts: Arc<dyn ConflictStore>,
    subscribers: Arc<dyn SubscriberStore>,
}

impl ConflictResolutionService {
    pub fn new(conflicts: Arc<dyn ConflictStore>, subscribers: Arc<dyn SubscriberStore>) -> Self {
        Self {
            conflicts,
            subscribers,
        }
    }

    /// Resolve the open conflict for `key` (an MSISDN). The chosen value is
    /// written to the entity the conflict was detected on. `merged` is
    /// required for MERGE and rejected otherwise. Resolving an
    /// already-resolved key succeeds without touching anything.
    pub fn resolve(
        &self,
        key: &str,
        choice: ResolutionChoice,
        merged: Option<Snapshot>,
    ) -> Result<ResolveOutcome> {
        match (choice, &merged) {
            (ResolutionChoice::Merge, None) => {
                return Err(SyncError::InvalidResolution(
                    "MERGE requires a merged snapshot".into(),
                ))
            }
            (ResolutionChoice::UseA | ResolutionChoice::UseB, Some(_)) => {
                return Err(SyncError::InvalidResolution(format!(
                    "{} does not take a merged snapshot",
                    choice
                )))
            }
            _ => {}
        }

        let open = match self.conflicts.find_open(key)? {
            Some(open) => open,
            None => {
                return match self.conflicts.latest(key)? {
                    Some(resolved) => Ok(already_resolved(resolved)),
                    None => Err(SyncError::ConflictNotFound(key.to_string())),
                }
            }
        };

        let canonical = match choice {
            ResolutionChoice::UseA => open.source_a_snapshot.clone(),
            ResolutionChoice::UseB => open.source_b_snapshot.clone(),
            ResolutionChoice::Merge => merged.clone(),
        };
        match &canonical {
            Some(snapshot) => self.subscribers.upsert(&open.entity_id, snapshot)?,
            None => {
                self.subscribers.remove(&open.entity_id)?;
            }
        }

        if !self
            .conflicts
            .mark_resolved(open.id, Some(choice), merged.as_ref())?
        {
            // Another resolver got there first; its decision stands.
            let latest = self.conflicts.latest(key)?.unwrap_or(open);
            return Ok(already_resolved(latest));
        }

        tracing::info!(
            key,
            entity_id = %open.entity_id,
            conflict_id = open.id,
            choice = %choice,
            "conflict resolved"
        );
        Ok(ResolveOutcome {
            key: key.to_string(),
            conflict_id: open.id,
            already_resolved: false,
            canonical,
        })
    }

    /// Apply USE_A or USE_B to every open conflict. A failure on one key is
    /// reported and does not stop the others.
    pub fn resolve_all(&self, choice: ResolutionChoice) -> Result<ResolveAllReport> {
        if choice == ResolutionChoice::Merge {
            return Err(SyncError::InvalidResolution(
                "MERGE cannot be applied in bulk".into(),
            ));
        }

        let mut report = ResolveAllReport::default();
        for conflict in self.conflicts.list_open()? {
            match self.resolve(&conflict.key, choice, None) {
                Ok(outcome) if !outcome.already_resolved => report.resolved += 1,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(key = %conflict.key, "Failed to resolve conflict: {}", e);
                    report.failures.push((conflict.key, e.to_string()));
                }
            }
        }
        tracing::info!(
            resolved = report.resolved,
            failed = report.failures.len(),
            choice = %choice,
            "bulk conflict resolution finished"
        );
        Ok(report)
    }

    pub fn list_open(&self) -> Result<Vec<Conflict>> {
        Ok(self.conflicts.list_open()?)
    }
}

fn already_resolved(conflict: Conflict) -> ResolveOutcome {
    let canonical = match conflict.resolution_choice {
        Some(ResolutionChoice::UseA) => conflict.source_a_snapshot,
        Some(ResolutionChoice::UseB) => conflict.source_b_snapshot,
        Some(ResolutionChoice::Merge) => conflict.merged_snapshot,
        None => None,
    };
    ResolveOutcome {
        key: conflict.key,
        conflict_id: conflict.id,
        already_resolved: true,
        canonical,
    }
}
