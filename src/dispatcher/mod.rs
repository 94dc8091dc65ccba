// ABOUTME: Side-effect delivery for one claimed change record
// ABOUTME: Issues cache invalidations, then fans the envelope out to webhooks

pub mod webhook;

use std::sync::Arc;

use sync_store::{snapshot_msisdn, ChangeRecord, Snapshot};

use crate::cache::CacheInvalidator;
use crate::config::{CacheKey, CacheTarget};

pub use webhook::{ChangeEnvelope, DeliveryOutcome, WebhookClient, WebhookTestResult};

/// What dispatching one record did. Failures here never fail the record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    pub invalidated: usize,
    pub delivered: usize,
    /// (endpoint, error) for every endpoint that exhausted its retries.
    pub failed: Vec<(String, String)>,
}

/// Keys under which one change is visible to downstream caches.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheKeys {
    pub entity_id: String,
    /// MSISDN the entity is known by after the change, else its entity id.
    pub subscriber_key: String,
    /// MSISDN the entity was known by before the change, when it differs.
    pub previous_subscriber_key: Option<String>,
}

impl CacheKeys {
    /// `canonical` is the entity's value before the change is applied.
    pub fn for_record(record: &ChangeRecord, canonical: Option<&Snapshot>) -> Self {
        let subscriber_key = record.subscriber_key(canonical);
        let previous_subscriber_key =
            canonical.and_then(snapshot_msisdn).filter(|prev| *prev != subscriber_key);
        Self {
            entity_id: record.entity_id.clone(),
            subscriber_key,
            previous_subscriber_key,
        }
    }
}

pub struct NotificationDispatcher {
    caches: Vec<CacheTarget>,
    invalidator: Arc<dyn CacheInvalidator>,
    webhooks: WebhookClient,
}

impl NotificationDispatcher {
    pub fn new(
        caches: Vec<CacheTarget>,
        invalidator: Arc<dyn CacheInvalidator>,
        webhooks: WebhookClient,
    ) -> Self {
        Self {
            caches,
            invalidator,
            webhooks,
        }
    }

    pub async fn dispatch(&self, record: &ChangeRecord, keys: &CacheKeys) -> DispatchReport {
        let mut report = DispatchReport::default();

        for cache in &self.caches {
            match cache.key_by {
                CacheKey::Msisdn => {
                    self.invalidator.invalidate(&cache.name, &keys.subscriber_key);
                    report.invalidated += 1;
                    if let Some(previous) = &keys.previous_subscriber_key {
                        self.invalidator.invalidate(&cache.name, previous);
                        report.invalidated += 1;
                    }
                }
                CacheKey::EntityId => {
                    self.invalidator.invalidate(&cache.name, &keys.entity_id);
                    report.invalidated += 1;
                }
            }
        }

        let envelope = ChangeEnvelope::from(record);
        for outcome in self.webhooks.deliver_all(&envelope).await {
            match outcome.error {
                None => report.delivered += 1,
                Some(error) => report.failed.push((outcome.endpoint, error)),
            }
        }

        tracing::debug!(
            record_id = record.id,
            invalidated = report.invalidated,
            delivered = report.delivered,
            failed = report.failed.len(),
            "dispatched change"
        );
        report
    }

    /// Admin-driven invalidation. `None` clears the whole cache.
    pub fn invalidate(&self, cache: &str, key: Option<&str>) {
        match key {
            Some(key) => self.invalidator.invalidate(cache, key),
            None => self.invalidator.invalidate_all(cache),
        }
    }

    pub async fn test_endpoint(&self, url: &str) -> WebhookTestResult {
        self.webhooks.test_endpoint(url).await
    }

    pub async fn test_all(&self) -> Vec<WebhookTestResult> {
        self.webhooks.test_all().await
    }
}
