// Customer metrics widget
//
// Customer counts, churn, and LTV from the payment provider's customer and
// subscription lists. Customer totals come from full cursor-paginated
// enumeration rather than a provider count endpoint.

use super::{escape_html, CachePolicy, RefreshContext, Widget, WidgetBase};
use crate::billing::{self, BillingClient, SubscriptionFilter};
use crate::config::ConfigError;
use crate::secrets::SecretString;
use crate::snapshots::CustomerRecord;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::error;

const DEFAULT_CACHE: Duration = Duration::from_secs(60 * 60);
const TREND_MONTHS: i64 = 6;
const TREND_POINTS: usize = 6;

fn default_mode() -> String {
    "live".to_string()
}

fn default_provider_url() -> String {
    "https://api.stripe.com".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct CustomersOptions {
    api_key: String,
    #[serde(default = "default_mode")]
    mode: String,
    #[serde(default = "default_provider_url")]
    provider_url: String,
    /// Operator-supplied customer acquisition cost; enables the LTV:CAC
    /// ratio. Falls back to the SCRY_CAC environment variable.
    #[serde(default)]
    cac: Option<f64>,
}

pub struct CustomersWidget {
    base: WidgetBase,
    api_key: String,
    mode: String,
    provider_url: String,
    cac_override: Option<f64>,

    total: u64,
    active: u64,
    new: u64,
    churned: u64,
    churn_rate: f64,
    ltv: Option<f64>,
    cac: Option<f64>,
    ltv_to_cac: Option<f64>,
    trend: Vec<(String, u64)>,
}

impl CustomersWidget {
    pub fn from_config(id: u64, options: serde_yaml::Value) -> Result<Self, ConfigError> {
        let options: CustomersOptions = serde_yaml::from_value(options)
            .map_err(|e| ConfigError::Invalid(format!("customers widget: {e}")))?;

        if options.api_key.is_empty() {
            return Err(ConfigError::Invalid(
                "customers widget: api-key is required".to_string(),
            ));
        }
        if options.mode != "live" && options.mode != "test" {
            return Err(ConfigError::Invalid(format!(
                "customers widget: mode must be 'live' or 'test', got '{}'",
                options.mode
            )));
        }

        let mut base = WidgetBase::new(id, "customers");
        base.default_title("Customer Metrics");
        base.with_cache(CachePolicy::After(DEFAULT_CACHE));

        Ok(Self {
            base,
            api_key: options.api_key,
            mode: options.mode,
            provider_url: options.provider_url,
            cac_override: options.cac,
            total: 0,
            active: 0,
            new: 0,
            churned: 0,
            churn_rate: 0.0,
            ltv: None,
            cac: None,
            ltv_to_cac: None,
            trend: Vec::new(),
        })
    }

    fn resolve_cac(&self) -> Option<f64> {
        if let Some(cac) = self.cac_override {
            return (cac > 0.0).then_some(cac);
        }
        std::env::var("SCRY_CAC")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|cac| *cac > 0.0)
    }
}

fn distinct_customers(subscriptions: &[billing::Subscription]) -> u64 {
    subscriptions
        .iter()
        .filter_map(|s| s.customer.as_deref())
        .collect::<HashSet<_>>()
        .len() as u64
}

#[async_trait]
impl Widget for CustomersWidget {
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
            .customers_range(&self.mode, now - chrono::Duration::days(TREND_MONTHS * 31), now)
            .await;
        let start = history.len().saturating_sub(TREND_POINTS);
        self.trend = history[start..]
            .iter()
            .map(|record| (record.timestamp.format("%b").to_string(), record.total))
            .collect();

        let customers = match handle
            .execute("list_customers", || client.list_customers(None))
            .await
        {
            Ok(customers) => customers,
            Err(e) => {
                self.base.set_error(e.to_string());
                return;
            }
        };
        self.total = customers.len() as u64;

        let active_filter = SubscriptionFilter {
            status: Some("active"),
            ..Default::default()
        };
        let active_subs = match handle
            .execute("list_active_subscriptions", || {
                client.list_subscriptions(&active_filter)
            })
            .await
        {
            Ok(subs) => {
                self.active = distinct_customers(&subs);
                Some(subs)
            }
            Err(e) => {
                error!(target: "widgets", error = %e, "failed to list active subscriptions");
                None
            }
        };

        let month_start = billing::start_of_month_utc(now).timestamp();

        match handle
            .execute("list_new_customers", || {
                client.list_customers(Some(month_start))
            })
            .await
        {
            Ok(customers) => self.new = customers.len() as u64,
            Err(e) => error!(target: "widgets", error = %e, "failed to list new customers"),
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
            Ok(subs) => self.churned = distinct_customers(&subs),
            Err(e) => error!(target: "widgets", error = %e, "failed to list churned subscriptions"),
        }

        self.churn_rate = if self.total > 0 {
            self.churned as f64 / self.total as f64 * 100.0
        } else {
            0.0
        };

        // LTV = average monthly revenue per active customer / monthly churn.
        self.ltv = None;
        if self.active > 0 && self.churn_rate > 0.0 {
            let mrr = match cx.store.latest_revenue(&self.mode).await {
                Some(snapshot) if snapshot.mrr > 0.0 => Some(snapshot.mrr),
                _ => active_subs.as_deref().map(billing::total_mrr),
            };
            if let Some(mrr) = mrr.filter(|mrr| *mrr > 0.0) {
                let arpa = mrr / self.active as f64;
                self.ltv = Some(arpa / (self.churn_rate / 100.0));
            }
        }

        self.cac = self.resolve_cac();
        self.ltv_to_cac = match (self.ltv, self.cac) {
            (Some(ltv), Some(cac)) => Some(ltv / cac),
            _ => None,
        };

        cx.store
            .save_customers(CustomerRecord {
                timestamp: now,
                total: self.total,
                new: self.new,
                churned: self.churned,
                churn_rate: self.churn_rate,
                active: self.active,
                mode: self.mode.clone(),
            })
            .await;

        self.base.clear_error();
    }

    fn render(&self) -> String {
        let mut out = String::from("<div class=\"customers\">");
        out.push_str(&format!(
            "<div class=\"stat stat-primary\"><span>Customers</span><span>{}</span></div>",
            self.total
        ));
        out.push_str(&format!(
            "<div class=\"stat\"><span>Active</span><span>{}</span></div>",
            self.active
        ));
        out.push_str(&format!(
            "<div class=\"stat\"><span>New this month</span><span>{}</span></div>",
            self.new
        ));
        out.push_str(&format!(
            "<div class=\"stat\"><span>Churned</span><span>{}</span></div>",
            self.churned
        ));
        out.push_str(&format!(
            "<div class=\"stat\"><span>Churn rate</span><span>{:.1}%</span></div>",
            self.churn_rate
        ));
        match self.ltv {
            Some(ltv) => out.push_str(&format!(
                "<div class=\"stat\"><span>LTV</span><span>${ltv:.2}</span></div>"
            )),
            None => out.push_str("<div class=\"stat\"><span>LTV</span><span>—</span></div>"),
        }
        match self.ltv_to_cac {
            Some(ratio) => out.push_str(&format!(
                "<div class=\"stat\"><span>LTV:CAC</span><span>{ratio:.1}x</span></div>"
            )),
            None => out.push_str("<div class=\"stat\"><span>LTV:CAC</span><span>—</span></div>"),
        }
        if !self.trend.is_empty() {
            out.push_str("<ul class=\"trend\">");
            for (label, value) in &self.trend {
                out.push_str(&format!(
                    "<li data-value=\"{value}\">{}</li>",
                    escape_html(label)
                ));
            }
            out.push_str("</ul>");
        }
        out.push_str("</div>");
        out
    }
}
