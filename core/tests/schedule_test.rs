//! Scheduler tests
//!
//! The single-flight refresh invariant, cache invalidation, and the error
//! notice rendered for failed widgets.

use async_trait::async_trait;
use chrono::Utc;
use scry_core::schedule::{RefreshContext, WidgetCell};
use scry_core::secrets::SecretStore;
use scry_core::snapshots::MemorySnapshotStore;
use scry_core::upstream::ClientPool;
use scry_core::widgets::{CachePolicy, Widget, WidgetBase};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn test_cx() -> Arc<RefreshContext> {
    Arc::new(RefreshContext {
        pool: Arc::new(ClientPool::new()),
        store: Arc::new(MemorySnapshotStore::default()),
        secrets: Arc::new(SecretStore::with_master_key(
            "integration-test-master-key-00000",
            false,
        )),
        http: reqwest::Client::new(),
    })
}

struct CountingWidget {
    base: WidgetBase,
    refreshes: Arc<AtomicUsize>,
    delay: Duration,
    fail: bool,
}

impl CountingWidget {
    fn cell(delay: Duration, fail: bool) -> (Arc<WidgetCell>, Arc<AtomicUsize>) {
        let refreshes = Arc::new(AtomicUsize::new(0));
        let mut base = WidgetBase::new(1, "probe");
        base.title = "Counter".to_string();
        base.with_cache(CachePolicy::After(Duration::from_secs(3600)));
        let widget = CountingWidget {
            base,
            refreshes: refreshes.clone(),
            delay,
            fail,
        };
        (Arc::new(WidgetCell::new(Box::new(widget))), refreshes)
    }
}

#[async_trait]
impl Widget for CountingWidget {
    fn base(&self) -> &WidgetBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut WidgetBase {
        &mut self.base
    }

    async fn refresh(&mut self, _cx: &RefreshContext) {
        tokio::time::sleep(self.delay).await;
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            self.base.set_error("upstream went away");
        } else {
            self.base.clear_error();
        }
    }

    fn render(&self) -> String {
        format!("<p>refreshes: {}</p>", self.refreshes.load(Ordering::SeqCst))
    }
}

// =============================================================================
// Single-flight
// =============================================================================

#[tokio::test]
async fn concurrent_callers_coalesce_onto_one_refresh() {
    let (cell, refreshes) = CountingWidget::cell(Duration::from_millis(100), false);
    let cx = test_cx();

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let cell = cell.clone();
            let cx = cx.clone();
            tokio::spawn(async move { cell.ensure_fresh(&cx).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(
        refreshes.load(Ordering::SeqCst),
        1,
        "exactly one refresh may run for concurrent stale requests"
    );
}

#[tokio::test]
async fn fresh_widgets_are_not_refreshed_again() {
    let (cell, refreshes) = CountingWidget::cell(Duration::ZERO, false);
    let cx = test_cx();

    cell.ensure_fresh(&cx).await;
    cell.ensure_fresh(&cx).await;
    cell.ensure_fresh(&cx).await;

    assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    assert!(!cell.refresh_due(Utc::now()).await);
}

#[tokio::test]
async fn invalidation_forces_the_next_refresh() {
    let (cell, refreshes) = CountingWidget::cell(Duration::ZERO, false);
    let cx = test_cx();

    cell.ensure_fresh(&cx).await;
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);

    cell.invalidate();
    assert!(cell.refresh_due(Utc::now()).await);

    cell.ensure_fresh(&cx).await;
    assert_eq!(refreshes.load(Ordering::SeqCst), 2);
    assert!(
        !cell.refresh_due(Utc::now()).await,
        "a refresh clears the invalidation flag"
    );
}

// =============================================================================
// Rendering
// =============================================================================

#[tokio::test]
async fn render_wraps_the_fragment_in_widget_chrome() {
    let (cell, _) = CountingWidget::cell(Duration::ZERO, false);
    let cx = test_cx();
    cell.ensure_fresh(&cx).await;

    let html = cell.render().await;
    assert!(html.contains("data-widget-id=\"1\""));
    assert!(html.contains("Counter"));
    assert!(html.contains("refreshes: 1"));
}

#[tokio::test]
async fn failed_widgets_render_the_error_notice() {
    let (cell, refreshes) = CountingWidget::cell(Duration::ZERO, true);
    let cx = test_cx();
    cell.ensure_fresh(&cx).await;

    assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    let html = cell.render().await;
    assert!(html.contains("temporarily unavailable"));
    assert!(html.contains("upstream went away"));
    assert!(
        !html.contains("refreshes: 1"),
        "the error notice replaces the widget body"
    );
}

#[tokio::test]
async fn render_is_stable_between_refreshes() {
    let (cell, _) = CountingWidget::cell(Duration::ZERO, false);
    let cx = test_cx();
    cell.ensure_fresh(&cx).await;

    let first = cell.render().await;
    let second = cell.render().await;
    assert_eq!(first, second, "render must be pure between refreshes");
}
