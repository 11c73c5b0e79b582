// Refresh scheduler and widget cache
//
// Each widget instance lives in a cell whose async mutex serializes
// refreshes: the first stale caller refreshes, concurrent callers block on
// the same mutex and re-check freshness once inside, so at most one refresh
// runs per widget at any instant. Invalidation flips a flag read outside
// the lock so the webhook path never waits on a refresh.

pub use crate::widgets::RefreshContext;

use crate::widgets::{error_notice, escape_html, Widget};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

/// Deadline for all refreshes fanned out by one page render.
pub const PAGE_DEADLINE: Duration = Duration::from_secs(10);

/// Narrow capability handed to the webhook dispatcher so it can mark
/// widget caches stale without holding the scheduler itself.
pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self, kind: &str);
}

/// A scheduled widget instance: the widget plus its refresh bookkeeping.
pub struct WidgetCell {
    pub id: u64,
    pub kind: String,
    inner: Mutex<Box<dyn Widget>>,
    force_stale: AtomicBool,
}

impl WidgetCell {
    pub fn new(widget: Box<dyn Widget>) -> Self {
        Self {
            id: widget.base().id,
            kind: widget.base().kind.to_string(),
            inner: Mutex::new(widget),
            force_stale: AtomicBool::new(false),
        }
    }

    /// Whether this widget wants a refresh, without taking the widget lock.
    pub async fn refresh_due(&self, now: DateTime<Utc>) -> bool {
        if self.force_stale.load(Ordering::Acquire) {
            return true;
        }
        self.inner.lock().await.base().refresh_due(now)
    }

    /// Mark the cache stale; the next render triggers a refresh.
    pub fn invalidate(&self) {
        self.force_stale.store(true, Ordering::Release);
    }

    /// Refresh if due. Concurrent callers coalesce: whoever wins the lock
    /// refreshes, the rest find the widget fresh when the lock frees up.
    pub async fn ensure_fresh(&self, cx: &RefreshContext) {
        let now = Utc::now();
        let forced = self.force_stale.load(Ordering::Acquire);

        let mut widget = self.inner.lock().await;
        if !forced && !widget.base().refresh_due(now) {
            return;
        }
        // Re-check under the lock: an in-flight refresh we waited on may
        // have satisfied this request already.
        let now = Utc::now();
        if !self.force_stale.load(Ordering::Acquire) && !widget.base().refresh_due(now) {
            return;
        }

        widget.refresh(cx).await;
        widget.base_mut().mark_refreshed(Utc::now());
        self.force_stale.store(false, Ordering::Release);
    }

    /// Render the widget's fragment, wrapped in the shared chrome. Shows
    /// the consistent error notice when the last refresh failed.
    pub async fn render(&self) -> String {
        let widget = self.inner.lock().await;
        let base = widget.base();

        let title = match &base.title_url {
            Some(url) => format!(
                "<a href=\"{}\">{}</a>",
                escape_html(url),
                escape_html(&base.title)
            ),
            None => escape_html(&base.title),
        };
        let body = match &base.error {
            Some(reason) => error_notice(reason),
            None => widget.render(),
        };

        format!(
            "<section class=\"widget widget-{}\" data-widget-id=\"{}\"><header class=\"widget-header\">{title}</header><div class=\"widget-body\">{body}</div></section>",
            base.kind, base.id
        )
    }

    pub async fn handle_api(
        &self,
        path: &str,
        query: &HashMap<String, String>,
    ) -> Option<serde_json::Value> {
        self.inner.lock().await.handle_api(path, query).await
    }
}

/// Refresh every stale widget of a page concurrently, bounded by the page
/// deadline. Fresh widgets are untouched; slow refreshes are abandoned at
/// the deadline and their widgets render last known state.
pub async fn refresh_stale(cells: &[Arc<WidgetCell>], cx: &Arc<RefreshContext>) {
    let now = Utc::now();

    let mut stale = Vec::new();
    for cell in cells {
        if cell.refresh_due(now).await {
            stale.push(Arc::clone(cell));
        }
    }
    if stale.is_empty() {
        return;
    }

    let refreshes = stale.into_iter().map(|cell| {
        let cx = Arc::clone(cx);
        async move {
            if tokio::time::timeout(PAGE_DEADLINE, cell.ensure_fresh(&cx))
                .await
                .is_err()
            {
                warn!(
                    target: "schedule",
                    widget_id = cell.id,
                    kind = %cell.kind,
                    "widget refresh hit the page deadline"
                );
            }
        }
    });
    join_all(refreshes).await;
}
