//! Snapshot store tests
//!
//! FIFO ordering, the per-(kind, mode) bound, range semantics, and cleanup.

use chrono::{TimeZone, Utc};
use scry_core::snapshots::{
    CustomerRecord, MemorySnapshotStore, RevenueRecord, SnapshotStore,
};
use std::time::Duration;

fn revenue_at(hour: u32, mrr: f64, mode: &str) -> RevenueRecord {
    RevenueRecord {
        timestamp: Utc.with_ymd_and_hms(2025, 5, 1, hour, 0, 0).unwrap(),
        mrr,
        arr: mrr * 12.0,
        growth_rate: None,
        new_mrr: 0.0,
        churned_mrr: 0.0,
        mode: mode.to_string(),
    }
}

#[tokio::test]
async fn records_come_back_in_fifo_order() {
    let store = MemorySnapshotStore::default();
    for hour in [3, 5, 9, 12] {
        store.save_revenue(revenue_at(hour, hour as f64, "live")).await;
    }

    let range = store
        .revenue_range(
            "live",
            Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 5, 2, 0, 0, 0).unwrap(),
        )
        .await;

    assert_eq!(range.len(), 4);
    for pair in range.windows(2) {
        assert!(
            pair[0].timestamp <= pair[1].timestamp,
            "timestamps must be non-decreasing"
        );
    }
}

#[tokio::test]
async fn ring_is_bounded_and_evicts_the_oldest() {
    let store = MemorySnapshotStore::new(3);
    for hour in 0..6 {
        store.save_revenue(revenue_at(hour, hour as f64, "live")).await;
    }

    let range = store
        .revenue_range(
            "live",
            Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 5, 2, 0, 0, 0).unwrap(),
        )
        .await;

    assert_eq!(range.len(), 3);
    assert_eq!(range[0].mrr, 3.0, "oldest records are evicted first");
    assert_eq!(range[2].mrr, 5.0);
}

#[tokio::test]
async fn modes_are_isolated() {
    let store = MemorySnapshotStore::default();
    store.save_revenue(revenue_at(1, 100.0, "live")).await;
    store.save_revenue(revenue_at(2, 5.0, "test")).await;

    assert_eq!(store.latest_revenue("live").await.unwrap().mrr, 100.0);
    assert_eq!(store.latest_revenue("test").await.unwrap().mrr, 5.0);
    assert!(store.latest_revenue("sandbox").await.is_none());
}

#[tokio::test]
async fn range_bounds_are_inclusive() {
    let store = MemorySnapshotStore::default();
    store.save_revenue(revenue_at(6, 1.0, "live")).await;
    store.save_revenue(revenue_at(12, 2.0, "live")).await;
    store.save_revenue(revenue_at(18, 3.0, "live")).await;

    let range = store
        .revenue_range(
            "live",
            Utc.with_ymd_and_hms(2025, 5, 1, 6, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap(),
        )
        .await;

    assert_eq!(range.len(), 2);
    assert_eq!(range[0].mrr, 1.0);
    assert_eq!(range[1].mrr, 2.0);
}

#[tokio::test]
async fn cleanup_drops_records_past_retention() {
    let store = MemorySnapshotStore::default();

    let mut old = revenue_at(0, 1.0, "live");
    old.timestamp = Utc::now() - chrono::Duration::days(120);
    store.save_revenue(old).await;

    let mut recent = revenue_at(0, 2.0, "live");
    recent.timestamp = Utc::now() - chrono::Duration::days(2);
    store.save_revenue(recent).await;

    store.cleanup(Duration::from_secs(30 * 24 * 60 * 60)).await;

    let stats = store.stats().await;
    assert_eq!(stats.revenue_records, 1);
    assert_eq!(store.latest_revenue("live").await.unwrap().mrr, 2.0);
}

#[tokio::test]
async fn customer_records_round_trip() {
    let store = MemorySnapshotStore::default();
    store
        .save_customers(CustomerRecord {
            timestamp: Utc::now(),
            total: 120,
            new: 8,
            churned: 3,
            churn_rate: 2.5,
            active: 97,
            mode: "live".to_string(),
        })
        .await;

    let latest = store.latest_customers("live").await.unwrap();
    assert_eq!(latest.total, 120);
    assert_eq!(latest.active, 97);

    let stats = store.stats().await;
    assert_eq!(stats.customer_records, 1);
    assert_eq!(stats.modes, 1);
}
