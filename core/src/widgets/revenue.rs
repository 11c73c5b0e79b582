// Revenue widget
//
// Monthly recurring revenue and derived figures from the payment provider's
// subscription list, with trend history seeded from the snapshot store.
// All provider calls go through the upstream fabric.

use super::{escape_html, CachePolicy, RefreshContext, Widget, WidgetBase};
use crate::billing::{self, BillingClient, SubscriptionFilter};
use crate::config::ConfigError;
use crate::secrets::SecretString;
use crate::snapshots::RevenueRecord;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::time::Duration;
use tracing::error;

const DEFAULT_CACHE: Duration = Duration::from_secs(60 * 60);
const DEFAULT_PROVIDER_URL: &str = "https://api.stripe.com";
const TREND_MONTHS: i64 = 6;
const TREND_POINTS: usize = 6;

fn default_mode() -> String {
    "live".to_string()
}

fn default_provider_url() -> String {
    DEFAULT_PROVIDER_URL.to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct RevenueOptions {
    api_key: String,
    #[serde(default = "default_mode")]
    mode: String,
    #[serde(default = "default_provider_url")]
    provider_url: String,
}

pub struct RevenueWidget {
    base: WidgetBase,
    api_key: String,
    mode: String,
    provider_url: String,

    current_mrr: f64,
    previous_mrr: f64,
    growth_rate: Option<f64>,
    arr: f64,
    new_mrr: f64,
    churned_mrr: f64,
    net_new_mrr: f64,
    trend: Vec<(String, f64)>,
}

impl RevenueWidget {
    pub fn from_config(id: u64, options: serde_yaml::Value) -> Result<Self, ConfigError> {
        let options: RevenueOptions = serde_yaml::from_value(options)
            .map_err(|e| ConfigError::Invalid(format!("revenue widget: {e}")))?;

        if options.api_key.is_empty() {
            return Err(ConfigError::Invalid(
                "revenue widget: api-key is required".to_string(),
            ));
        }
        if options.mode != "live" && options.mode != "test" {
            return Err(ConfigError::Invalid(format!(
                "revenue widget: mode must be 'live' or 'test', got '{}'",
                options.mode
            )));
        }

        let mut base = WidgetBase::new(id, "revenue");
        base.default_title("Revenue");
        base.with_cache(CachePolicy::After(DEFAULT_CACHE));

        Ok(Self {
            base,
            api_key: options.api_key,
            mode: options.mode,
            provider_url: options.provider_url,
            current_mrr: 0.0,
            previous_mrr: 0.0,
            growth_rate: None,
            arr: 0.0,
            new_mrr: 0.0,
            churned_mrr: 0.0,
            net_new_mrr: 0.0,
            trend: Vec::new(),
        })
    }

    fn load_trend(&mut self, history: &[RevenueRecord]) {
        // Snapshot history only; with nothing stored the series stays empty
        // rather than being synthesized from the current value.
        let start = history.len().saturating_sub(TREND_POINTS);
        self.trend = history[start..]
            .iter()
            .map(|record| (record.timestamp.format("%b").to_string(), record.mrr))
            .collect();
    }
}

#[async_trait]
impl Widget for RevenueWidget {
    fn base(&self) -> &WidgetBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut WidgetBase {
        &mut self.base
    }

    async fn refresh(&mut self, cx: &RefreshContext) {
        let api_key = match cx.secrets.decrypt_if_needed(&self.api_key) {
            Ok(key) => key,
            Err(e) => {
                self.base.set_error(format!("failed to decrypt API key: {e}"));
                return;
            }
        };

        let handle = match cx.pool.handle("billing", &api_key, &self.mode) {
            Ok(handle) => handle,
            Err(e) => {
                self.base.set_error(e.to_string());
                return;
            }
        };
        let client = BillingClient::new(&self.provider_url, SecretString::new(api_key));

        let now = Utc::now();
        let history = cx
            .store
            .revenue_range(&self.mode, now - chrono::Duration::days(TREND_MONTHS * 31), now)
            .await;
        self.load_trend(&history);

        // Previous-period value before this refresh writes a new snapshot.
        let previous = cx.store.latest_revenue(&self.mode).await;

        let active = SubscriptionFilter {
            status: Some("active"),
            ..Default::default()
        };
        let subscriptions = match handle
            .execute("list_active_subscriptions", || {
                client.list_subscriptions(&active)
            })
            .await
        {
            Ok(subs) => subs,
            Err(e) => {
                self.base.set_error(e.to_string());
                return;
            }
        };

        self.current_mrr = billing::total_mrr(&subscriptions);
        self.arr = self.current_mrr * 12.0;

        let previous_mrr = previous.map(|p| p.mrr).unwrap_or(self.previous_mrr);
        self.growth_rate = if previous_mrr > 0.0 {
            Some((self.current_mrr - previous_mrr) / previous_mrr * 100.0)
        } else {
            None
        };

        let month_start = billing::start_of_month_utc(now).timestamp();

        let created_filter = SubscriptionFilter {
            status: Some("active"),
            created_gte: Some(month_start),
            ..Default::default()
        };
        match handle
            .execute("list_new_subscriptions", || {
                client.list_subscriptions(&created_filter)
            })
            .await
        {
            Ok(subs) => self.new_mrr = billing::total_mrr(&subs),
            Err(e) => error!(target: "widgets", error = %e, "failed to calculate new MRR"),
        }

        let canceled_filter = SubscriptionFilter {
            status: Some("canceled"),
            canceled_at_gte: Some(month_start),
            ..Default::default()
        };
        match handle
            .execute("list_churned_subscriptions", || {
                client.list_subscriptions(&canceled_filter)
            })
            .await
        {
            Ok(subs) => self.churned_mrr = billing::total_mrr(&subs),
            Err(e) => error!(target: "widgets", error = %e, "failed to calculate churned MRR"),
        }

        self.net_new_mrr = self.new_mrr - self.churned_mrr;

        cx.store
            .save_revenue(RevenueRecord {
                timestamp: now,
                mrr: self.current_mrr,
                arr: self.arr,
                growth_rate: self.growth_rate,
                new_mrr: self.new_mrr,
                churned_mrr: self.churned_mrr,
                mode: self.mode.clone(),
            })
            .await;

        self.previous_mrr = self.current_mrr;
        self.base.clear_error();
    }

    fn render(&self) -> String {
        let mut out = String::from("<div class=\"revenue\">");
        out.push_str(&format!(
            "<div class=\"stat stat-primary\"><span>MRR</span><span>${:.2}</span></div>",
            self.current_mrr
        ));
        out.push_str(&format!(
            "<div class=\"stat\"><span>ARR</span><span>${:.2}</span></div>",
            self.arr
        ));
        match self.growth_rate {
            Some(rate) => out.push_str(&format!(
                "<div class=\"stat\"><span>Growth</span><span>{rate:+.1}%</span></div>"
            )),
            None => out.push_str("<div class=\"stat\"><span>Growth</span><span>—</span></div>"),
        }
        out.push_str(&format!(
            "<div class=\"stat\"><span>New MRR</span><span>${:.2}</span></div>",
            self.new_mrr
        ));
        out.push_str(&format!(
            "<div class=\"stat\"><span>Churned MRR</span><span>${:.2}</span></div>",
            self.churned_mrr
        ));
        out.push_str(&format!(
            "<div class=\"stat\"><span>Net new MRR</span><span>${:+.2}</span></div>",
            self.net_new_mrr
        ));
        if !self.trend.is_empty() {
            out.push_str("<ul class=\"trend\">");
            for (label, value) in &self.trend {
                out.push_str(&format!(
                    "<li data-value=\"{value:.2}\">{}</li>",
                    escape_html(label)
                ));
            }
            out.push_str("</ul>");
        }
        out.push_str("</div>");
        out
    }
}
