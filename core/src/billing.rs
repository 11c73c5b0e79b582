// Billing provider client
//
// Typed REST access to the payment provider's subscription and customer
// lists, with explicit cursor pagination. Calls return `CallError` so the
// upstream fabric can classify failures for retry. Also home to the
// monthly-revenue normalization shared by the revenue widget and the
// webhook handlers.

use crate::secrets::SecretString;
use crate::upstream::CallError;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

const PAGE_LIMIT: usize = 100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

fn default_quantity() -> u64 {
    1
}

fn default_interval_count() -> i64 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct Recurring {
    pub interval: String,
    #[serde(default = "default_interval_count")]
    pub interval_count: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Price {
    pub unit_amount: i64,
    pub recurring: Option<Recurring>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItem {
    #[serde(default = "default_quantity")]
    pub quantity: u64,
    pub price: Option<Price>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemList {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub status: String,
    pub created: i64,
    pub canceled_at: Option<i64>,
    pub customer: Option<String>,
    #[serde(default)]
    pub items: ItemList,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Customer {
    pub id: String,
    pub created: i64,
}

#[derive(Debug, Deserialize)]
struct ListPage<T> {
    data: Vec<T>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(rename = "type")]
    kind: String,
    message: Option<String>,
}

/// Filters for subscription listing, mapped to the provider's
/// `status` / `created[gte]` / `canceled_at[gte]` query parameters.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub status: Option<&'static str>,
    pub created_gte: Option<i64>,
    pub canceled_at_gte: Option<i64>,
}

pub struct BillingClient {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
}

impl BillingClient {
    pub fn new(base_url: &str, api_key: SecretString) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    async fn get_page<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<ListPage<T>, CallError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .http
            .get(&url)
            .bearer_auth(self.api_key.expose())
            .query(query)
            .send()
            .await
            .map_err(|e| CallError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if let Ok(parsed) = serde_json::from_str::<ApiErrorBody>(&body) {
                return Err(CallError::Provider {
                    status: Some(status.as_u16()),
                    kind: parsed.error.kind,
                    message: parsed.error.message.unwrap_or_default(),
                });
            }
            return Err(CallError::Status {
                status: status.as_u16(),
                message: body.chars().take(200).collect(),
            });
        }

        response
            .json::<ListPage<T>>()
            .await
            .map_err(|e| CallError::Transport(format!("invalid response body: {e}")))
    }

    async fn list_all<T: DeserializeOwned>(
        &self,
        path: &str,
        base_query: Vec<(String, String)>,
        id_of: impl Fn(&T) -> &str,
    ) -> Result<Vec<T>, CallError> {
        let mut results: Vec<T> = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut query = base_query.clone();
            query.push(("limit".to_string(), PAGE_LIMIT.to_string()));
            if let Some(after) = &cursor {
                query.push(("starting_after".to_string(), after.clone()));
            }

            let page: ListPage<T> = self.get_page(path, &query).await?;
            let has_more = page.has_more;
            cursor = page.data.last().map(|item| id_of(item).to_string());
            results.extend(page.data);

            if !has_more || cursor.is_none() {
                return Ok(results);
            }
        }
    }

    /// All subscriptions matching the filter, across every page.
    pub async fn list_subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> Result<Vec<Subscription>, CallError> {
        let mut query = Vec::new();
        if let Some(status) = filter.status {
            query.push(("status".to_string(), status.to_string()));
        }
        if let Some(ts) = filter.created_gte {
            query.push(("created[gte]".to_string(), ts.to_string()));
        }
        if let Some(ts) = filter.canceled_at_gte {
            query.push(("canceled_at[gte]".to_string(), ts.to_string()));
        }
        self.list_all("/v1/subscriptions", query, |s: &Subscription| s.id.as_str())
            .await
    }

    /// All customers, optionally restricted to `created >= created_gte`.
    pub async fn list_customers(
        &self,
        created_gte: Option<i64>,
    ) -> Result<Vec<Customer>, CallError> {
        let mut query = Vec::new();
        if let Some(ts) = created_gte {
            query.push(("created[gte]".to_string(), ts.to_string()));
        }
        self.list_all("/v1/customers", query, |c: &Customer| c.id.as_str())
            .await
    }
}

// ---------------------------------------------------------------------------
// Monthly-revenue normalization
// ---------------------------------------------------------------------------

/// Monthly-normalized contribution of one subscription item, in major units.
///
/// `None` when the item has no recurring price or an unknown interval;
/// unknown intervals are logged and excluded from totals.
pub fn monthly_amount(item: &SubscriptionItem) -> Option<f64> {
    let price = item.price.as_ref()?;
    let recurring = price.recurring.as_ref()?;
    let amount = price.unit_amount as f64 / 100.0;
    let count = recurring.interval_count.max(1) as f64;

    let per_month = match recurring.interval.as_str() {
        "month" => amount / count,
        "year" => amount / (12.0 * count),
        "week" => amount * 4.33 / count,
        "day" => amount * 30.0 / count,
        other => {
            warn!(target: "billing", interval = %other, "unknown billing interval, skipping item");
            return None;
        }
    };

    Some(per_month * item.quantity as f64)
}

/// Monthly-normalized revenue of a whole subscription.
pub fn subscription_mrr(subscription: &Subscription) -> f64 {
    subscription
        .items
        .data
        .iter()
        .filter_map(monthly_amount)
        .sum()
}

/// Total MRR over a set of subscriptions.
pub fn total_mrr(subscriptions: &[Subscription]) -> f64 {
    subscriptions.iter().map(subscription_mrr).sum()
}

/// Start of the current calendar month in UTC.
pub fn start_of_month_utc(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .expect("first of month is always a valid timestamp")
}
