// Webhook dispatcher
//
// Verifies provider signatures, acknowledges immediately, and fans events
// out to registered handlers on a detached deadline. Completed events mark
// the matching widget caches stale through the injected invalidator.

use crate::schedule::CacheInvalidator;
use crate::secrets::SecretString;
use crate::snapshots::{CustomerRecord, RevenueRecord, SnapshotStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-scry-signature";
const SIGNATURE_TOLERANCE_SECS: i64 = 5 * 60;
const HANDLER_DEADLINE: Duration = Duration::from_secs(30);
const MAX_EVENT_LOG: usize = 100;

#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("signature verification failed")]
    Signature,

    #[error("unparseable event payload: {0}")]
    Payload(String),
}

/// Parsed provider event.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub livemode: bool,
    #[serde(default)]
    pub data: EventData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventData {
    #[serde(default)]
    pub object: serde_json::Value,
}

impl ProviderEvent {
    pub fn mode(&self) -> &'static str {
        if self.livemode {
            "live"
        } else {
            "test"
        }
    }
}

/// One entry in the bounded processed-event log.
#[derive(Debug, Clone, Serialize)]
pub struct EventLogEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub processed: DateTime<Utc>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Handler invoked for a matching event type.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &ProviderEvent) -> Result<(), String>;
}

pub struct WebhookDispatcher {
    secret: Option<SecretString>,
    handlers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
    log: Mutex<VecDeque<EventLogEntry>>,
    invalidator: Arc<dyn CacheInvalidator>,
}

impl WebhookDispatcher {
    pub fn new(secret: Option<SecretString>, invalidator: Arc<dyn CacheInvalidator>) -> Self {
        Self {
            secret,
            handlers: RwLock::new(HashMap::new()),
            log: Mutex::new(VecDeque::with_capacity(MAX_EVENT_LOG)),
            invalidator,
        }
    }

    /// Dispatcher with the default billing-event handlers registered.
    pub fn with_default_handlers(
        secret: Option<SecretString>,
        invalidator: Arc<dyn CacheInvalidator>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        let dispatcher = Self::new(secret, invalidator);
        let handler = Arc::new(BillingEventHandler { store });
        for event_type in [
            "customer.subscription.created",
            "customer.subscription.updated",
            "customer.subscription.deleted",
            "customer.created",
            "customer.deleted",
            "invoice.payment_succeeded",
            "invoice.payment_failed",
        ] {
            dispatcher.register(event_type, handler.clone());
        }
        dispatcher
    }

    pub fn register(&self, event_type: &str, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .expect("handler lock poisoned")
            .entry(event_type.to_string())
            .or_default()
            .push(handler);
    }

    /// Verify `t=<unix>,v1=<hex hmac>` over `"<t>.<body>"`.
    pub fn verify_signature(&self, header: &str, body: &[u8], now: DateTime<Utc>) -> bool {
        let Some(secret) = &self.secret else {
            return false;
        };

        let mut timestamp: Option<i64> = None;
        let mut signature: Option<String> = None;
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => signature = Some(value.to_string()),
                _ => {}
            }
        }
        let (Some(timestamp), Some(signature)) = (timestamp, signature) else {
            return false;
        };

        if (now.timestamp() - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            return false;
        }

        let mut mac = HmacSha256::new_from_slice(secret.expose().as_bytes())
            .expect("hmac accepts any key length");
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);

        let Ok(expected) = decode_hex(&signature) else {
            return false;
        };
        mac.verify_slice(&expected).is_ok()
    }

    /// Sign a payload the way a provider would. Used by operators and tests
    /// to produce valid intake requests.
    pub fn sign(secret: &str, body: &[u8], timestamp: i64) -> String {
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        let hex: String = mac
            .finalize()
            .into_bytes()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        format!("t={timestamp},v1={hex}")
    }

    /// Verify and accept an intake request. On success the event id is
    /// returned immediately and processing continues in the background.
    pub fn ingest(
        self: &Arc<Self>,
        header: &str,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<String, WebhookError> {
        if !self.verify_signature(header, body, now) {
            // Expected adversarial input, not an operator error.
            warn!(target: "webhook", "webhook signature verification failed");
            return Err(WebhookError::Signature);
        }

        let event: ProviderEvent =
            serde_json::from_slice(body).map_err(|e| WebhookError::Payload(e.to_string()))?;

        info!(
            target: "webhook",
            event_id = %event.id,
            event_type = %event.event_type,
            livemode = event.livemode,
            "received provider webhook"
        );

        let dispatcher = Arc::clone(self);
        let event_id = event.id.clone();
        tokio::spawn(async move {
            dispatcher.process_event(event).await;
        });

        Ok(event_id)
    }

    async fn process_event(&self, event: ProviderEvent) {
        let handlers = {
            let registry = self.handlers.read().expect("handler lock poisoned");
            registry.get(&event.event_type).cloned().unwrap_or_default()
        };

        if handlers.is_empty() {
            debug!(target: "webhook", event_type = %event.event_type, "no handlers for event type");
            return;
        }

        let mut entry = EventLogEntry {
            id: event.id.clone(),
            event_type: event.event_type.clone(),
            processed: Utc::now(),
            success: true,
            error: None,
        };

        for handler in handlers {
            let outcome = tokio::time::timeout(HANDLER_DEADLINE, handler.handle(&event)).await;
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(reason)) => Some(reason),
                Err(_) => Some("handler deadline exceeded".to_string()),
            };
            if let Some(reason) = failure {
                entry.success = false;
                entry.error = Some(reason.clone());
                error!(
                    target: "webhook",
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %reason,
                    "webhook handler failed"
                );
            }
        }

        if let Some(kind) = widget_kind_for_event(&event.event_type) {
            self.invalidator.invalidate(kind);
        }

        entry.processed = Utc::now();
        let mut log = self.log.lock().expect("event log lock poisoned");
        log.push_back(entry);
        while log.len() > MAX_EVENT_LOG {
            log.pop_front();
        }
    }

    pub fn event_log(&self) -> Vec<EventLogEntry> {
        self.log
            .lock()
            .expect("event log lock poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

/// Which widget kind an event type invalidates.
fn widget_kind_for_event(event_type: &str) -> Option<&'static str> {
    match event_type {
        "customer.subscription.created"
        | "customer.subscription.updated"
        | "customer.subscription.deleted"
        | "invoice.payment_succeeded"
        | "invoice.payment_failed" => Some("revenue"),
        "customer.created" | "customer.updated" | "customer.deleted" => Some("customers"),
        _ => None,
    }
}

fn decode_hex(raw: &str) -> Result<Vec<u8>, ()> {
    if raw.len() % 2 != 0 {
        return Err(());
    }
    (0..raw.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&raw[i..i + 2], 16).map_err(|_| ()))
        .collect()
}

/// Default handler: records billing events into the snapshot store.
struct BillingEventHandler {
    store: Arc<dyn SnapshotStore>,
}

#[async_trait]
impl EventHandler for BillingEventHandler {
    async fn handle(&self, event: &ProviderEvent) -> Result<(), String> {
        match event.event_type.as_str() {
            "customer.subscription.created" | "customer.subscription.deleted" => {
                let subscription: crate::billing::Subscription =
                    serde_json::from_value(event.data.object.clone())
                        .map_err(|e| format!("unparseable subscription payload: {e}"))?;
                let mrr = crate::billing::subscription_mrr(&subscription);

                let mut record = RevenueRecord {
                    timestamp: Utc::now(),
                    mode: event.mode().to_string(),
                    ..Default::default()
                };
                if event.event_type.ends_with("created") {
                    record.new_mrr = mrr;
                } else {
                    record.churned_mrr = mrr;
                }
                self.store.save_revenue(record).await;
            }
            "customer.created" | "customer.deleted" => {
                let mut record = CustomerRecord {
                    timestamp: Utc::now(),
                    mode: event.mode().to_string(),
                    ..Default::default()
                };
                if event.event_type.ends_with("created") {
                    record.new = 1;
                } else {
                    record.churned = 1;
                }
                self.store.save_customers(record).await;
            }
            "customer.subscription.updated"
            | "invoice.payment_succeeded"
            | "invoice.payment_failed" => {
                debug!(
                    target: "webhook",
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "billing event acknowledged"
                );
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopInvalidator;
    impl CacheInvalidator for NoopInvalidator {
        fn invalidate(&self, _kind: &str) {}
    }

    fn dispatcher(secret: &str) -> Arc<WebhookDispatcher> {
        Arc::new(WebhookDispatcher::new(
            Some(SecretString::new(secret)),
            Arc::new(NoopInvalidator),
        ))
    }

    #[test]
    fn accepts_valid_signature() {
        let d = dispatcher("whsec_test");
        let body = br#"{"id":"evt_1","type":"noop"}"#;
        let now = Utc::now();
        let header = WebhookDispatcher::sign("whsec_test", body, now.timestamp());
        assert!(d.verify_signature(&header, body, now));
    }

    #[test]
    fn rejects_bad_signature_and_stale_timestamp() {
        let d = dispatcher("whsec_test");
        let body = br#"{"id":"evt_1","type":"noop"}"#;
        let now = Utc::now();

        let wrong_secret = WebhookDispatcher::sign("whsec_other", body, now.timestamp());
        assert!(!d.verify_signature(&wrong_secret, body, now));

        let stale = WebhookDispatcher::sign("whsec_test", body, now.timestamp() - 600);
        assert!(!d.verify_signature(&stale, body, now));

        assert!(!d.verify_signature("garbage", body, now));
    }

    #[test]
    fn missing_secret_rejects_everything() {
        let d = Arc::new(WebhookDispatcher::new(None, Arc::new(NoopInvalidator)));
        let body = b"{}";
        let header = WebhookDispatcher::sign("whsec_test", body, Utc::now().timestamp());
        assert!(!d.verify_signature(&header, body, Utc::now()));
    }

    #[test]
    fn event_type_maps_to_widget_kind() {
        assert_eq!(
            widget_kind_for_event("customer.subscription.created"),
            Some("revenue")
        );
        assert_eq!(widget_kind_for_event("invoice.payment_failed"), Some("revenue"));
        assert_eq!(widget_kind_for_event("customer.created"), Some("customers"));
        assert_eq!(widget_kind_for_event("balance.available"), None);
    }
}
