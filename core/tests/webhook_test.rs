//! Webhook dispatcher tests
//!
//! Signature gating at the intake boundary, default handler snapshot
//! writes, and the cache-invalidation fan-out.

use chrono::Utc;
use scry_core::schedule::CacheInvalidator;
use scry_core::secrets::SecretString;
use scry_core::snapshots::{MemorySnapshotStore, SnapshotStore};
use scry_core::webhook::{WebhookDispatcher, WebhookError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct RecordingInvalidator {
    kinds: Mutex<Vec<String>>,
}

impl RecordingInvalidator {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            kinds: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<String> {
        self.kinds.lock().unwrap().clone()
    }
}

impl CacheInvalidator for RecordingInvalidator {
    fn invalidate(&self, kind: &str) {
        self.kinds.lock().unwrap().push(kind.to_string());
    }
}

const SECRET: &str = "whsec_dispatcher_test";

fn subscription_created_body() -> Vec<u8> {
    serde_json::json!({
        "id": "evt_sub_created",
        "type": "customer.subscription.created",
        "livemode": false,
        "data": {
            "object": {
                "id": "sub_99",
                "status": "active",
                "created": 1_700_000_000,
                "customer": "cus_99",
                "items": {
                    "data": [
                        {
                            "quantity": 2,
                            "price": {
                                "unit_amount": 2900,
                                "recurring": {"interval": "month", "interval_count": 1}
                            }
                        }
                    ]
                }
            }
        }
    })
    .to_string()
    .into_bytes()
}

#[tokio::test]
async fn valid_event_runs_handlers_and_invalidates_revenue_caches() {
    let invalidator = RecordingInvalidator::new();
    let store: Arc<dyn SnapshotStore> = Arc::new(MemorySnapshotStore::default());
    let dispatcher = Arc::new(WebhookDispatcher::with_default_handlers(
        Some(SecretString::new(SECRET)),
        invalidator.clone(),
        store.clone(),
    ));

    let body = subscription_created_body();
    let now = Utc::now();
    let signature = WebhookDispatcher::sign(SECRET, &body, now.timestamp());

    let event_id = dispatcher.ingest(&signature, &body, now).unwrap();
    assert_eq!(event_id, "evt_sub_created");

    // Processing is asynchronous; give the spawned task a moment.
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(invalidator.seen(), vec!["revenue".to_string()]);

    let record = store.latest_revenue("test").await.expect("snapshot saved");
    assert!((record.new_mrr - 58.0).abs() < 1e-9, "2 x $29/month");

    let log = dispatcher.event_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].id, "evt_sub_created");
    assert!(log[0].success);
}

#[tokio::test]
async fn customer_events_invalidate_customer_caches() {
    let invalidator = RecordingInvalidator::new();
    let store: Arc<dyn SnapshotStore> = Arc::new(MemorySnapshotStore::default());
    let dispatcher = Arc::new(WebhookDispatcher::with_default_handlers(
        Some(SecretString::new(SECRET)),
        invalidator.clone(),
        store.clone(),
    ));

    let body = serde_json::json!({
        "id": "evt_cus_created",
        "type": "customer.created",
        "livemode": true,
        "data": {"object": {"id": "cus_7", "created": 1_700_000_000}}
    })
    .to_string()
    .into_bytes();
    let now = Utc::now();
    let signature = WebhookDispatcher::sign(SECRET, &body, now.timestamp());

    dispatcher.ingest(&signature, &body, now).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(invalidator.seen(), vec!["customers".to_string()]);
    let record = store.latest_customers("live").await.expect("snapshot saved");
    assert_eq!(record.new, 1);
}

#[tokio::test]
async fn bad_signature_leaves_the_event_log_untouched() {
    let invalidator = RecordingInvalidator::new();
    let dispatcher = Arc::new(WebhookDispatcher::new(
        Some(SecretString::new(SECRET)),
        invalidator.clone(),
    ));

    let body = subscription_created_body();
    let now = Utc::now();

    let forged = WebhookDispatcher::sign("whsec_wrong", &body, now.timestamp());
    let result = dispatcher.ingest(&forged, &body, now);
    assert!(matches!(result, Err(WebhookError::Signature)));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(dispatcher.event_log().is_empty());
    assert!(invalidator.seen().is_empty());
}

#[tokio::test]
async fn unparseable_payloads_are_rejected_after_verification() {
    let dispatcher = Arc::new(WebhookDispatcher::new(
        Some(SecretString::new(SECRET)),
        RecordingInvalidator::new(),
    ));

    let body = b"this is not json".to_vec();
    let now = Utc::now();
    let signature = WebhookDispatcher::sign(SECRET, &body, now.timestamp());

    let result = dispatcher.ingest(&signature, &body, now);
    assert!(matches!(result, Err(WebhookError::Payload(_))));
}
