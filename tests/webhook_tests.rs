// ABOUTME: Webhook delivery against loopback HTTP endpoints
// ABOUTME: Checks envelope shape, retries, timeout isolation and the probe

mod common;

use std::time::{Duration, Instant};

use common::{engine, status_update, Responder};
use serde_json::json;
use subscriber_sync::config::{SyncConfig, WebhookEndpoint};
use subscriber_sync::dispatcher::{ChangeEnvelope, WebhookClient};
use subscriber_sync::store::{ChangeOperation, ChangeRecordStore, SqliteStore};

fn envelope(entity_id: &str) -> ChangeEnvelope {
    let store = SqliteStore::open_in_memory().unwrap();
    let id = store.record_change(&status_update(entity_id, "ACTIVE")).unwrap();
    ChangeEnvelope::from(&store.find(id).unwrap().unwrap())
}

fn endpoint(url: &str, timeout_ms: u64, max_retries: u32) -> WebhookEndpoint {
    WebhookEndpoint {
        timeout_ms,
        max_retries,
        ..WebhookEndpoint::new(url)
    }
}

#[tokio::test]
async fn processed_change_posts_envelope() {
    let hook = Responder::start(200, Duration::ZERO).await;
    let config = SyncConfig {
        webhooks: vec![WebhookEndpoint::new(hook.url.clone())],
        ..SyncConfig::default()
    };
    let (_dir, engine) = engine(config);
    engine.store.record_change(&status_update("42", "SUSPENDED")).unwrap();

    let result = engine.admin.trigger_sync(10).await.unwrap();
    assert_eq!(result.successful_changes, 1);
    assert_eq!(result.webhook_failures, 0);

    let bodies = hook.bodies();
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["operation"], json!("UPDATE"));
    assert_eq!(bodies[0]["entityId"], json!("42"));
    assert_eq!(bodies[0]["table"], json!("subscription"));
    assert!(bodies[0]["timestamp"].is_string());
}

#[tokio::test]
async fn failing_endpoint_is_retried_and_does_not_block_others() {
    let good = Responder::start(200, Duration::ZERO).await;
    let bad = Responder::start(500, Duration::ZERO).await;
    let client = WebhookClient::new(vec![
        endpoint(&good.url, 1000, 2),
        endpoint(&bad.url, 1000, 2),
    ])
    .unwrap()
    .with_retry_delay(Duration::from_millis(10));

    let outcomes = client.deliver_all(&envelope("7")).await;

    assert_eq!(outcomes.len(), 2);
    assert!(outcomes[0].is_success());
    assert_eq!(outcomes[0].attempts, 1);
    assert!(!outcomes[1].is_success());
    assert_eq!(outcomes[1].attempts, 3);
    assert!(outcomes[1].error.as_deref().unwrap().contains("500"));
    assert_eq!(good.hits(), 1);
    assert_eq!(bad.hits(), 3);
}

#[tokio::test]
async fn slow_endpoint_times_out_without_delaying_fast_one() {
    let fast = Responder::start(200, Duration::ZERO).await;
    let slow = Responder::start(200, Duration::from_secs(5)).await;
    let client = WebhookClient::new(vec![endpoint(&slow.url, 200, 0), endpoint(&fast.url, 1000, 0)])
        .unwrap();

    let started = Instant::now();
    let outcomes = client.deliver_all(&envelope("8")).await;

    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(!outcomes[0].is_success());
    assert_eq!(outcomes[0].attempts, 1);
    assert!(outcomes[1].is_success());
}

#[tokio::test]
async fn disabled_endpoint_is_skipped() {
    let hook = Responder::start(200, Duration::ZERO).await;
    let client = WebhookClient::new(vec![WebhookEndpoint {
        enabled: false,
        ..WebhookEndpoint::new(hook.url.clone())
    }])
    .unwrap();

    assert!(client.deliver_all(&envelope("9")).await.is_empty());
    assert_eq!(hook.hits(), 0);
}

#[tokio::test]
async fn delivery_failure_still_marks_change_successful() {
    let bad = Responder::start(503, Duration::ZERO).await;
    let config = SyncConfig {
        webhooks: vec![endpoint(&bad.url, 1000, 0)],
        ..SyncConfig::default()
    };
    let (_dir, engine) = engine(config);
    let id = engine.store.record_change(&status_update("11", "ACTIVE")).unwrap();

    let result = engine.admin.trigger_sync(10).await.unwrap();

    assert_eq!(result.successful_changes, 1);
    assert_eq!(result.webhook_failures, 1);
    assert_eq!(
        engine.store.find(id).unwrap().unwrap().status,
        subscriber_sync::store::ProcessingStatus::Success
    );
    assert_eq!(engine.admin.status().unwrap().webhook_failures, 1);
}

#[tokio::test]
async fn probe_reports_status_and_latency() {
    let hook = Responder::start(200, Duration::ZERO).await;
    let client = WebhookClient::new(Vec::new()).unwrap();

    let ok = client.test_endpoint(&hook.url).await;
    assert!(ok.success);
    assert_eq!(ok.status_code, Some(200));
    assert!(ok.error.is_none());

    let body = &hook.bodies()[0];
    assert_eq!(body["operation"], json!("TEST"));
    assert_eq!(body["entityId"], json!("webhook-test"));
    assert_eq!(body["table"], json!("webhook_test"));

    let rejecting = Responder::start(404, Duration::ZERO).await;
    let rejected = client.test_endpoint(&rejecting.url).await;
    assert!(!rejected.success);
    assert_eq!(rejected.status_code, Some(404));

    // Nothing listens on a port that was bound and released.
    let closed = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        format!("http://{}/hook", listener.local_addr().unwrap())
    };
    let unreachable = client.test_endpoint(&closed).await;
    assert!(!unreachable.success);
    assert!(unreachable.status_code.is_none());
    assert!(unreachable.error.is_some());
}

#[test]
fn envelope_uses_capture_time() {
    let captured = chrono::Utc::now() - chrono::Duration::hours(2);
    let store = SqliteStore::open_in_memory().unwrap();
    let id = store
        .record_change(&status_update("12", "ACTIVE").captured_at(captured))
        .unwrap();
    let record = store.find(id).unwrap().unwrap();

    let env = ChangeEnvelope::from(&record);
    assert_eq!(env.operation, ChangeOperation::Update);
    assert_eq!(env.entity_id, "12");
    assert_eq!(env.table, "subscription");
    assert_eq!(env.timestamp, record.captured_at);
    assert!((env.timestamp - captured).num_milliseconds().abs() < 1);
}
