// Syndication feed widget
//
// Fetches every configured RSS/Atom feed in parallel, merges the entries,
// and keeps the newest ones. A single broken feed degrades the merge
// instead of failing the widget.

use super::{escape_html, CachePolicy, RefreshContext, Widget, WidgetBase};
use crate::config::ConfigError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

const DEFAULT_CACHE: Duration = Duration::from_secs(12 * 60 * 60);
const DEFAULT_LIMIT: usize = 25;

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct FeedOptions {
    urls: Vec<String>,
    #[serde(default = "default_limit")]
    limit: usize,
}

#[derive(Clone)]
struct FeedItem {
    title: String,
    url: Option<String>,
    source: String,
    published: Option<DateTime<Utc>>,
}

pub struct FeedWidget {
    base: WidgetBase,
    urls: Vec<String>,
    limit: usize,
    items: Vec<FeedItem>,
}

impl FeedWidget {
    pub fn from_config(id: u64, options: serde_yaml::Value) -> Result<Self, ConfigError> {
        let options: FeedOptions = serde_yaml::from_value(options)
            .map_err(|e| ConfigError::Invalid(format!("feed widget: {e}")))?;

        if options.urls.is_empty() {
            return Err(ConfigError::Invalid(
                "feed widget: at least one feed url is required".to_string(),
            ));
        }
        for url in &options.urls {
            reqwest::Url::parse(url)
                .map_err(|e| ConfigError::Invalid(format!("feed widget: invalid url {url}: {e}")))?;
        }

        let mut base = WidgetBase::new(id, "feed");
        base.default_title("Feed");
        base.with_cache(CachePolicy::After(DEFAULT_CACHE));

        Ok(Self {
            base,
            urls: options.urls,
            limit: options.limit,
            items: Vec::new(),
        })
    }
}

async fn fetch_feed(http: &reqwest::Client, url: &str) -> Result<Vec<FeedItem>, String> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| format!("request failed: {e}"))?;
    if !response.status().is_success() {
        return Err(format!("feed returned status {}", response.status()));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| format!("reading body failed: {e}"))?;

    let feed = feed_rs::parser::parse(&bytes[..]).map_err(|e| format!("parse failed: {e}"))?;
    let source = feed
        .title
        .map(|t| t.content)
        .unwrap_or_else(|| url.to_string());

    Ok(feed
        .entries
        .into_iter()
        .map(|entry| FeedItem {
            title: entry
                .title
                .map(|t| t.content)
                .unwrap_or_else(|| "(untitled)".to_string()),
            url: entry.links.first().map(|l| l.href.clone()),
            source: source.clone(),
            published: entry.published.or(entry.updated),
        })
        .collect())
}

#[async_trait]
impl Widget for FeedWidget {
    fn base(&self) -> &WidgetBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut WidgetBase {
        &mut self.base
    }

    async fn refresh(&mut self, cx: &RefreshContext) {
        let fetches = self.urls.iter().map(|url| {
            let http = cx.http.clone();
            let url = url.clone();
            async move { (url.clone(), fetch_feed(&http, &url).await) }
        });

        let mut merged: Vec<FeedItem> = Vec::new();
        let mut failures = 0usize;
        for (url, result) in join_all(fetches).await {
            match result {
                Ok(items) => merged.extend(items),
                Err(reason) => {
                    failures += 1;
                    warn!(target: "widgets", url = %url, reason = %reason, "feed fetch failed");
                }
            }
        }

        if failures == self.urls.len() {
            self.base.set_error("all feeds failed to load");
            return;
        }

        // Newest first; undated entries sink to the bottom.
        merged.sort_by(|a, b| b.published.cmp(&a.published));
        merged.truncate(self.limit);
        self.items = merged;
        self.base.clear_error();
    }

    fn render(&self) -> String {
        let mut out = String::from("<ul class=\"feed-items\">");
        for item in &self.items {
            out.push_str("<li class=\"feed-item\">");
            match &item.url {
                Some(url) => out.push_str(&format!(
                    "<a href=\"{}\">{}</a>",
                    escape_html(url),
                    escape_html(&item.title)
                )),
                None => out.push_str(&escape_html(&item.title)),
            }
            out.push_str(&format!(
                "<span class=\"feed-source\">{}</span>",
                escape_html(&item.source)
            ));
            if let Some(published) = item.published {
                out.push_str(&format!(
                    "<time datetime=\"{}\">{}</time>",
                    published.to_rfc3339(),
                    published.format("%b %e")
                ));
            }
            out.push_str("</li>");
        }
        out.push_str("</ul>");
        out
    }
}
