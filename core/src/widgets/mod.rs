// Widget runtime
//
// Every widget type implements the same lifecycle: configured from its YAML
// node, initialized with defaults, refreshed when its cache policy says so,
// and rendered to an HTML fragment from in-memory state only. The closed
// type set lives here and doubles as the config validator's source of truth.

mod customers;
mod feed;
mod forge;
mod host;
mod html;
mod json;
mod probe;
mod revenue;

pub use customers::CustomersWidget;
pub use feed::FeedWidget;
pub use forge::ReleasesWidget;
pub use host::HostWidget;
pub use html::HtmlWidget;
pub use json::JsonWidget;
pub use probe::ProbeWidget;
pub use revenue::RevenueWidget;

use crate::config::ConfigError;
use crate::secrets::SecretStore;
use crate::snapshots::SnapshotStore;
use crate::upstream::ClientPool;
use async_trait::async_trait;
use chrono::{DateTime, DurationRound, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// The closed set of widget type tags accepted in configuration.
pub const WIDGET_TYPES: &[&str] = &[
    "probe",
    "host",
    "feed",
    "releases",
    "json",
    "html",
    "revenue",
    "customers",
];

/// Shared services a widget may use while refreshing.
pub struct RefreshContext {
    pub pool: Arc<ClientPool>,
    pub store: Arc<dyn SnapshotStore>,
    pub secrets: Arc<SecretStore>,
    /// Shared outbound client for plain fetches (probes, feeds).
    pub http: reqwest::Client,
}

/// When a widget's cached data goes stale.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CachePolicy {
    /// Static content, never refreshed.
    Never,
    /// Refresh once the last refresh is at least this old.
    After(Duration),
    /// Refresh at the next top of the hour.
    HourTop,
}

/// State common to all widget instances.
pub struct WidgetBase {
    pub id: u64,
    pub kind: &'static str,
    pub title: String,
    pub title_url: Option<String>,
    pub cache: CachePolicy,
    pub last_refresh: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl WidgetBase {
    pub fn new(id: u64, kind: &'static str) -> Self {
        Self {
            id,
            kind,
            title: String::new(),
            title_url: None,
            cache: CachePolicy::Never,
            last_refresh: None,
            error: None,
        }
    }

    /// Fill in the type's default title unless configuration set one.
    pub fn default_title(&mut self, title: &str) {
        if self.title.is_empty() {
            self.title = title.to_string();
        }
    }

    pub fn with_cache(&mut self, cache: CachePolicy) {
        self.cache = cache;
    }

    /// Whether the cache policy calls for a refresh at `now`.
    pub fn refresh_due(&self, now: DateTime<Utc>) -> bool {
        match self.cache {
            CachePolicy::Never => false,
            CachePolicy::After(age) => match self.last_refresh {
                Some(last) => {
                    let age = chrono::Duration::from_std(age).unwrap_or(chrono::Duration::MAX);
                    now - last >= age
                }
                None => true,
            },
            CachePolicy::HourTop => match self.last_refresh {
                Some(last) => {
                    let hour_start = now
                        .duration_trunc(chrono::Duration::hours(1))
                        .unwrap_or(now);
                    last < hour_start
                }
                None => true,
            },
        }
    }

    pub fn mark_refreshed(&mut self, now: DateTime<Utc>) {
        self.last_refresh = Some(now);
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }
}

/// A unit of dashboard content with its own refresh policy and renderer.
#[async_trait]
pub trait Widget: Send + Sync {
    fn base(&self) -> &WidgetBase;
    fn base_mut(&mut self) -> &mut WidgetBase;

    /// Fetch upstream data and update internal state. Failures are captured
    /// on the base error field; last good state is kept where possible.
    async fn refresh(&mut self, cx: &RefreshContext);

    /// Pure function over current state. Must not block on I/O.
    fn render(&self) -> String;

    /// Optional widget-scoped AJAX surface under `/api/widgets/{id}/...`.
    async fn handle_api(
        &self,
        _path: &str,
        _query: &HashMap<String, String>,
    ) -> Option<serde_json::Value> {
        None
    }
}

/// Construct a widget from its config node. `kind` must be a member of
/// [`WIDGET_TYPES`]; `options` is the widget's YAML mapping minus the
/// common keys.
pub fn build_widget(
    kind: &str,
    id: u64,
    title: Option<String>,
    title_url: Option<String>,
    cache_override: Option<Duration>,
    options: serde_yaml::Value,
) -> Result<Box<dyn Widget>, ConfigError> {
    let mut widget: Box<dyn Widget> = match kind {
        "probe" => Box::new(ProbeWidget::from_config(id, options)?),
        "host" => Box::new(HostWidget::from_config(id, options)?),
        "feed" => Box::new(FeedWidget::from_config(id, options)?),
        "releases" => Box::new(ReleasesWidget::from_config(id, options)?),
        "json" => Box::new(JsonWidget::from_config(id, options)?),
        "html" => Box::new(HtmlWidget::from_config(id, options)?),
        "revenue" => Box::new(RevenueWidget::from_config(id, options)?),
        "customers" => Box::new(CustomersWidget::from_config(id, options)?),
        other => {
            return Err(ConfigError::Invalid(format!(
                "unknown widget type '{other}' (expected one of {})",
                WIDGET_TYPES.join(", ")
            )))
        }
    };

    let base = widget.base_mut();
    if let Some(title) = title {
        base.title = title;
    }
    if let Some(url) = title_url {
        base.title_url = Some(url);
    }
    // The policy itself is fixed per type; config may only tune the duration.
    if let Some(age) = cache_override {
        if matches!(base.cache, CachePolicy::After(_)) {
            base.cache = CachePolicy::After(age);
        }
    }

    Ok(widget)
}

/// Minimal HTML escaping for text interpolated into fragments.
pub(crate) fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Consistent inline notice for a widget whose refresh failed.
pub(crate) fn error_notice(reason: &str) -> String {
    format!(
        "<div class=\"widget-error\"><p>Data is temporarily unavailable</p><p class=\"widget-error-reason\">{}</p></div>",
        escape_html(reason)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn never_policy_is_never_due() {
        let mut base = WidgetBase::new(1, "html");
        assert!(!base.refresh_due(Utc::now()));
        base.mark_refreshed(Utc::now());
        assert!(!base.refresh_due(Utc::now() + chrono::Duration::days(365)));
    }

    #[test]
    fn after_policy_tracks_age() {
        let mut base = WidgetBase::new(1, "probe");
        base.with_cache(CachePolicy::After(Duration::from_secs(60)));
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        assert!(base.refresh_due(t0), "unrefreshed widget is always due");
        base.mark_refreshed(t0);
        assert!(!base.refresh_due(t0 + chrono::Duration::seconds(30)));
        assert!(base.refresh_due(t0 + chrono::Duration::seconds(60)));
    }

    #[test]
    fn hour_top_policy_fires_on_the_hour() {
        let mut base = WidgetBase::new(1, "releases");
        base.with_cache(CachePolicy::HourTop);
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 12, 40, 0).unwrap();
        base.mark_refreshed(t0);
        assert!(!base.refresh_due(Utc.with_ymd_and_hms(2025, 3, 1, 12, 59, 59).unwrap()));
        assert!(base.refresh_due(Utc.with_ymd_and_hms(2025, 3, 1, 13, 0, 0).unwrap()));
    }

    #[test]
    fn escape_html_neutralizes_markup() {
        assert_eq!(
            escape_html("<script>\"a\" & 'b'</script>"),
            "&lt;script&gt;&quot;a&quot; &amp; &#39;b&#39;&lt;/script&gt;"
        );
    }
}
