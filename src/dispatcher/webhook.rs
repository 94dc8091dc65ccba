// ABOUTME: HTTP client posting change envelopes to configured webhook endpoints
// ABOUTME: Per-endpoint timeout and bounded retries, plus an on-demand probe

use chrono::{DateTime, Utc};
use futures::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use sync_store::{ChangeOperation, ChangeRecord};

use crate::config::WebhookEndpoint;
use crate::error::Result;
use crate::utils::{redact_url, retry_with_backoff};

const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound payload for one processed change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEnvelope {
    pub operation: ChangeOperation,
    pub entity_id: String,
    pub table: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&ChangeRecord> for ChangeEnvelope {
    fn from(record: &ChangeRecord) -> Self {
        Self {
            operation: record.operation,
            entity_id: record.entity_id.clone(),
            table: record.entity_type.clone(),
            timestamp: record.captured_at,
        }
    }
}

/// Result of delivering one envelope to one endpoint, after retries.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryOutcome {
    pub endpoint: String,
    pub attempts: u32,
    pub error: Option<String>,
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookTestResult {
    pub endpoint: String,
    pub success: bool,
    pub response_time_ms: u64,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

pub struct WebhookClient {
    client: Client,
    endpoints: Vec<WebhookEndpoint>,
    retry_delay: Duration,
}

impl WebhookClient {
    pub fn new(endpoints: Vec<WebhookEndpoint>) -> Result<Self> {
        // Timeouts are applied per request from each endpoint's config.
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            endpoints,
            retry_delay: DEFAULT_RETRY_DELAY,
        })
    }

    /// Override the initial backoff between retries.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn endpoints(&self) -> &[WebhookEndpoint] {
        &self.endpoints
    }

    /// Deliver to every enabled endpoint concurrently. One endpoint's failure
    /// never affects another's delivery.
    pub async fn deliver_all(&self, envelope: &ChangeEnvelope) -> Vec<DeliveryOutcome> {
        let deliveries = self
            .endpoints
            .iter()
            .filter(|endpoint| endpoint.enabled)
            .map(|endpoint| self.deliver(endpoint, envelope));
        join_all(deliveries).await
    }

    async fn deliver(&self, endpoint: &WebhookEndpoint, envelope: &ChangeEnvelope) -> DeliveryOutcome {
        let mut attempts = 0u32;
        let result = retry_with_backoff(
            || {
                attempts += 1;
                self.post_once(endpoint, envelope)
            },
            endpoint.max_retries,
            self.retry_delay,
        )
        .await;

        let shown = redact_url(&endpoint.url);
        match result {
            Ok(()) => {
                tracing::debug!(endpoint = %shown, attempts, entity_id = %envelope.entity_id, "webhook delivered");
                DeliveryOutcome {
                    endpoint: endpoint.url.clone(),
                    attempts,
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!(endpoint = %shown, attempts, entity_id = %envelope.entity_id, "webhook delivery failed: {}", e);
                DeliveryOutcome {
                    endpoint: endpoint.url.clone(),
                    attempts,
                    error: Some(e),
                }
            }
        }
    }

    async fn post_once(
        &self,
        endpoint: &WebhookEndpoint,
        envelope: &ChangeEnvelope,
    ) -> std::result::Result<(), String> {
        let response = self
            .client
            .post(&endpoint.url)
            .timeout(endpoint.timeout())
            .json(envelope)
            .send()
            .await
            .map_err(|e| describe(&e))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(format!("endpoint answered HTTP {}", status.as_u16()))
        }
    }

    /// Probe one URL with a test envelope, outside the batch pipeline. No retries.
    pub async fn test_endpoint(&self, url: &str) -> WebhookTestResult {
        let timeout = self
            .endpoints
            .iter()
            .find(|endpoint| endpoint.url == url)
            .map(WebhookEndpoint::timeout)
            .unwrap_or(PROBE_TIMEOUT);
        let probe = serde_json::json!({
            "operation": "TEST",
            "entityId": "webhook-test",
            "table": "webhook_test",
            "timestamp": Utc::now(),
        });

        let started = Instant::now();
        let sent = self
            .client
            .post(url)
            .timeout(timeout)
            .json(&probe)
            .send()
            .await;
        let response_time_ms = started.elapsed().as_millis() as u64;

        match sent {
            Ok(response) => {
                let status = response.status();
                WebhookTestResult {
                    endpoint: url.to_string(),
                    success: status.is_success(),
                    response_time_ms,
                    status_code: Some(status.as_u16()),
                    error: (!status.is_success())
                        .then(|| format!("endpoint answered HTTP {}", status.as_u16())),
                }
            }
            Err(e) => WebhookTestResult {
                endpoint: url.to_string(),
                success: false,
                response_time_ms,
                status_code: None,
                error: Some(describe(&e)),
            },
        }
    }

    /// Probe every configured endpoint, enabled or not.
    pub async fn test_all(&self) -> Vec<WebhookTestResult> {
        join_all(
            self.endpoints
                .iter()
                .map(|endpoint| self.test_endpoint(&endpoint.url)),
        )
        .await
    }
}

fn describe(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        "request timed out".to_string()
    } else if error.is_connect() {
        "connection failed".to_string()
    } else {
        error.to_string()
    }
}
