// Historical snapshot store
//
// Bounded append-only rings of typed metric records, keyed by (kind, mode).
// Seeds trend charts and supplies previous-period values for derived
// metrics. In-memory by default; the trait leaves room for a durable
// implementation as long as per-(kind, mode) FIFO ordering is preserved.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

pub const DEFAULT_MAX_HISTORY: usize = 100;

/// One revenue observation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RevenueRecord {
    pub timestamp: DateTime<Utc>,
    pub mrr: f64,
    pub arr: f64,
    pub growth_rate: Option<f64>,
    pub new_mrr: f64,
    pub churned_mrr: f64,
    pub mode: String,
}

/// One customer-metrics observation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CustomerRecord {
    pub timestamp: DateTime<Utc>,
    pub total: u64,
    pub new: u64,
    pub churned: u64,
    pub churn_rate: f64,
    pub active: u64,
    pub mode: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct StoreStats {
    pub revenue_records: usize,
    pub customer_records: usize,
    pub modes: usize,
}

/// Append-only history of metric snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save_revenue(&self, record: RevenueRecord);
    async fn save_customers(&self, record: CustomerRecord);

    async fn latest_revenue(&self, mode: &str) -> Option<RevenueRecord>;
    async fn latest_customers(&self, mode: &str) -> Option<CustomerRecord>;

    /// Records with `start <= timestamp <= end`, oldest first.
    async fn revenue_range(
        &self,
        mode: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<RevenueRecord>;

    async fn customers_range(
        &self,
        mode: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<CustomerRecord>;

    /// Drop records older than `now - retention`.
    async fn cleanup(&self, retention: Duration);

    async fn stats(&self) -> StoreStats;
}

/// Default in-memory store.
pub struct MemorySnapshotStore {
    revenue: RwLock<HashMap<String, Vec<RevenueRecord>>>,
    customers: RwLock<HashMap<String, Vec<CustomerRecord>>>,
    max_history: usize,
}

impl MemorySnapshotStore {
    pub fn new(max_history: usize) -> Self {
        Self {
            revenue: RwLock::new(HashMap::new()),
            customers: RwLock::new(HashMap::new()),
            max_history,
        }
    }
}

impl Default for MemorySnapshotStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY)
    }
}

fn push_bounded<T>(ring: &mut Vec<T>, record: T, max: usize) {
    ring.push(record);
    if ring.len() > max {
        let excess = ring.len() - max;
        ring.drain(..excess);
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save_revenue(&self, record: RevenueRecord) {
        let mut revenue = self.revenue.write().await;
        let ring = revenue.entry(record.mode.clone()).or_default();
        push_bounded(ring, record, self.max_history);
    }

    async fn save_customers(&self, record: CustomerRecord) {
        let mut customers = self.customers.write().await;
        let ring = customers.entry(record.mode.clone()).or_default();
        push_bounded(ring, record, self.max_history);
    }

    async fn latest_revenue(&self, mode: &str) -> Option<RevenueRecord> {
        self.revenue.read().await.get(mode)?.last().cloned()
    }

    async fn latest_customers(&self, mode: &str) -> Option<CustomerRecord> {
        self.customers.read().await.get(mode)?.last().cloned()
    }

    async fn revenue_range(
        &self,
        mode: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<RevenueRecord> {
        self.revenue
            .read()
            .await
            .get(mode)
            .map(|ring| {
                ring.iter()
                    .filter(|r| r.timestamp >= start && r.timestamp <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn customers_range(
        &self,
        mode: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<CustomerRecord> {
        self.customers
            .read()
            .await
            .get(mode)
            .map(|ring| {
                ring.iter()
                    .filter(|r| r.timestamp >= start && r.timestamp <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn cleanup(&self, retention: Duration) {
        let cutoff = Utc::now() - chrono::Duration::from_std(retention).unwrap_or_default();

        let mut revenue = self.revenue.write().await;
        for ring in revenue.values_mut() {
            ring.retain(|r| r.timestamp > cutoff);
        }
        drop(revenue);

        let mut customers = self.customers.write().await;
        for ring in customers.values_mut() {
            ring.retain(|r| r.timestamp > cutoff);
        }
        drop(customers);

        info!(target: "snapshots", cutoff = %cutoff, "cleaned up old snapshot records");
    }

    async fn stats(&self) -> StoreStats {
        let revenue = self.revenue.read().await;
        let customers = self.customers.read().await;
        let mut modes: std::collections::HashSet<&str> = std::collections::HashSet::new();
        modes.extend(revenue.keys().map(String::as_str));
        modes.extend(customers.keys().map(String::as_str));
        StoreStats {
            revenue_records: revenue.values().map(Vec::len).sum(),
            customer_records: customers.values().map(Vec::len).sum(),
            modes: modes.len(),
        }
    }
}
