// Generic JSON API widget
//
// Fetches one URL and extracts configured values with dotted path
// expressions ("result.items.0.name"). Numeric segments index arrays.

use super::{escape_html, CachePolicy, RefreshContext, Widget, WidgetBase};
use crate::config::ConfigError;
use crate::upstream::CallError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_CACHE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct JsonFieldSpec {
    label: String,
    path: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct JsonOptions {
    url: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    fields: Vec<JsonFieldSpec>,
}

pub struct JsonWidget {
    base: WidgetBase,
    url: String,
    headers: HashMap<String, String>,
    fields: Vec<(String, String)>,
    values: Vec<(String, String)>,
}

impl JsonWidget {
    pub fn from_config(id: u64, options: serde_yaml::Value) -> Result<Self, ConfigError> {
        let options: JsonOptions = serde_yaml::from_value(options)
            .map_err(|e| ConfigError::Invalid(format!("json widget: {e}")))?;

        reqwest::Url::parse(&options.url)
            .map_err(|e| ConfigError::Invalid(format!("json widget: invalid url: {e}")))?;
        if options.fields.is_empty() {
            return Err(ConfigError::Invalid(
                "json widget: at least one field is required".to_string(),
            ));
        }

        let mut base = WidgetBase::new(id, "json");
        base.default_title("API");
        base.with_cache(CachePolicy::After(DEFAULT_CACHE));

        Ok(Self {
            base,
            url: options.url,
            headers: options.headers,
            fields: options
                .fields
                .into_iter()
                .map(|f| (f.label, f.path))
                .collect(),
            values: Vec::new(),
        })
    }
}

/// Walk a dotted path through a JSON document.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(display_value)
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

#[async_trait]
impl Widget for JsonWidget {
    fn base(&self) -> &WidgetBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut WidgetBase {
        &mut self.base
    }

    async fn refresh(&mut self, cx: &RefreshContext) {
        let handle = match cx.pool.handle("json-api", &self.url, "live") {
            Ok(handle) => handle,
            Err(e) => {
                self.base.set_error(e.to_string());
                return;
            }
        };

        let http = cx.http.clone();
        let url = self.url.clone();
        let headers = self.headers.clone();

        let result = handle
            .execute("fetch_json", || {
                let http = http.clone();
                let url = url.clone();
                let headers = headers.clone();
                async move {
                    let mut request = http.get(&url);
                    for (name, value) in &headers {
                        request = request.header(name, value);
                    }
                    let response = request
                        .send()
                        .await
                        .map_err(|e| CallError::Transport(e.to_string()))?;
                    let status = response.status();
                    if !status.is_success() {
                        return Err(CallError::Status {
                            status: status.as_u16(),
                            message: "JSON API request failed".to_string(),
                        });
                    }
                    response
                        .json::<Value>()
                        .await
                        .map_err(|e| CallError::Transport(format!("invalid response body: {e}")))
                }
            })
            .await;

        let document = match result {
            Ok(document) => document,
            Err(e) => {
                self.base.set_error(e.to_string());
                return;
            }
        };

        self.values = self
            .fields
            .iter()
            .map(|(label, path)| {
                let rendered = lookup(&document, path)
                    .map(display_value)
                    .unwrap_or_else(|| "—".to_string());
                (label.clone(), rendered)
            })
            .collect();
        self.base.clear_error();
    }

    fn render(&self) -> String {
        let mut out = String::from("<dl class=\"json-fields\">");
        for (label, value) in &self.values {
            out.push_str(&format!(
                "<dt>{}</dt><dd>{}</dd>",
                escape_html(label),
                escape_html(value)
            ));
        }
        out.push_str("</dl>");
        out
    }
}
